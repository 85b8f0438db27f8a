//! In-process target model.
//!
//! Entities are declared up front with their fields. Writes enforce the
//! same rules a real model would: unknown and read-only fields are
//! rejected, required fields must be present on create, and key lookups
//! must match at most one record.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::config::MemoryTargetConfig;
use crate::core::{EntityId, FieldInfo, Record, TargetMode, TargetModel, Value};
use crate::error::{ImportError, Result};

#[derive(Debug, Default)]
struct Entity {
    fields: Vec<FieldInfo>,
    records: Vec<(u64, Record)>,
    next_id: u64,
}

/// Shared in-memory model store.
#[derive(Debug, Clone, Default)]
pub struct MemoryTarget {
    entities: Arc<Mutex<BTreeMap<String, Entity>>>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &MemoryTargetConfig) -> Self {
        let target = Self::new();
        for (name, fields) in &config.entities {
            target.add_entity(name, fields.clone());
        }
        target
    }

    /// Declare an entity, replacing any records it had.
    pub fn add_entity(&self, name: &str, fields: Vec<FieldInfo>) {
        if let Ok(mut entities) = self.entities.lock() {
            entities.insert(
                name.to_string(),
                Entity {
                    fields,
                    records: Vec::new(),
                    next_id: 1,
                },
            );
        }
    }

    /// Builder form of [`add_entity`](Self::add_entity).
    pub fn with_entity(self, name: &str, fields: Vec<FieldInfo>) -> Self {
        self.add_entity(name, fields);
        self
    }

    /// Stored records of an entity in creation order.
    pub fn records(&self, entity: &str) -> Vec<Record> {
        self.entities
            .lock()
            .ok()
            .and_then(|e| {
                e.get(entity)
                    .map(|e| e.records.iter().map(|(_, r)| r.clone()).collect())
            })
            .unwrap_or_default()
    }

    pub fn count(&self, entity: &str) -> usize {
        self.records(entity).len()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, Entity>>> {
        self.entities
            .lock()
            .map_err(|_| ImportError::State("memory target lock poisoned".into()))
    }
}

fn check_fields(name: &str, entity: &Entity, values: &Record) -> Result<()> {
    for (field, _) in values.iter() {
        let info = entity
            .fields
            .iter()
            .find(|f| f.name == field)
            .ok_or_else(|| ImportError::Write(format!("{} has no field {}", name, field)))?;
        if info.readonly {
            return Err(ImportError::Write(format!(
                "field {}.{} is read-only",
                name, field
            )));
        }
    }
    Ok(())
}

fn create(name: &str, entity: &mut Entity, values: &Record) -> Result<EntityId> {
    for field in entity.fields.iter().filter(|f| f.required) {
        if values.get(&field.name).map_or(true, Value::is_null) {
            return Err(ImportError::Write(format!(
                "required field {}.{} is missing",
                name, field.name
            )));
        }
    }
    let id = entity.next_id;
    entity.next_id += 1;
    entity.records.push((id, values.clone()));
    Ok(EntityId(id.to_string()))
}

#[async_trait]
impl TargetModel for MemoryTarget {
    async fn list_fields(&self, entity: &str) -> Result<Vec<FieldInfo>> {
        let entities = self.lock()?;
        entities
            .get(entity)
            .map(|e| e.fields.clone())
            .ok_or_else(|| ImportError::NotFound(format!("entity {}", entity)))
    }

    async fn write(
        &self,
        entity: &str,
        mode: TargetMode,
        key: Option<(&str, &Value)>,
        values: &Record,
    ) -> Result<EntityId> {
        let mut entities = self.lock()?;
        let store = entities
            .get_mut(entity)
            .ok_or_else(|| ImportError::NotFound(format!("entity {}", entity)))?;
        check_fields(entity, store, values)?;

        if mode == TargetMode::CreateOnly {
            return create(entity, store, values);
        }

        let (field, value) =
            key.ok_or_else(|| ImportError::Write(format!("{} requires a key field", mode)))?;
        let matches: Vec<usize> = store
            .records
            .iter()
            .enumerate()
            .filter(|(_, (_, r))| r.get(field) == Some(value))
            .map(|(i, _)| i)
            .collect();

        match matches.as_slice() {
            [idx] => {
                let (id, record) = &mut store.records[*idx];
                for (name, v) in values.iter() {
                    record.insert(name, v.clone());
                }
                Ok(EntityId(id.to_string()))
            }
            [] if mode.may_create() => create(entity, store, values),
            [] => Err(ImportError::Write(format!(
                "no {} record with {} = {}",
                entity, field, value
            ))),
            _ => Err(ImportError::Write(format!(
                "more than one {} record has {} = {}",
                entity, field, value
            ))),
        }
    }

    fn kind(&self) -> &str {
        "memory"
    }
}
