//! Mappings from one source table to one target entity.

mod resolver;
mod typemap;

pub use resolver::{GeneratedRules, MappingResolver, MappingTestReport, SampleFailure, SampleRow};
pub use typemap::infer_transform;

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::{ColumnInfo, FieldInfo, Record, SourceRow, TargetMode, Value};
use crate::error::{ImportError, Result};
use crate::transform::{TransformEngine, TransformKind};

/// One source column feeding one target field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    pub source_field: String,
    pub target_field: String,
    #[serde(default)]
    pub transform: TransformKind,
}

impl FieldRule {
    pub fn new(
        source_field: impl Into<String>,
        target_field: impl Into<String>,
        transform: TransformKind,
    ) -> Self {
        Self {
            source_field: source_field.into(),
            target_field: target_field.into(),
            transform,
        }
    }

    pub fn direct(source_field: impl Into<String>, target_field: impl Into<String>) -> Self {
        Self::new(source_field, target_field, TransformKind::Direct)
    }
}

impl fmt::Display for FieldRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} ({})",
            self.source_field, self.target_field, self.transform
        )
    }
}

/// Live schema data fetched for a mapping.
#[derive(Debug, Clone, Default)]
pub struct MappingCache {
    pub source_columns: Option<Vec<ColumnInfo>>,
    pub target_fields: Option<Vec<FieldInfo>>,

    /// Last fetch failure, cleared on success.
    pub error: Option<String>,
}

/// Import mapping configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mapping {
    /// Mapping name.
    pub name: String,

    /// Eligible connections, tried in order.
    pub connections: Vec<String>,

    /// Source schema (default: "dbo").
    #[serde(default = "default_source_schema")]
    pub source_schema: String,

    /// Source table.
    pub source_table: String,

    /// Row filter in the source dialect, without `WHERE`.
    #[serde(default)]
    pub source_filter: Option<String>,

    /// Column ordering the keyset read (default: the primary key).
    #[serde(default)]
    pub order_key: Option<String>,

    /// Target entity, e.g. `res.partner`.
    pub target_entity: String,

    /// Write mode (default: create_only).
    #[serde(default)]
    pub target_mode: TargetMode,

    /// Target field matching existing records in the update modes.
    #[serde(default)]
    pub key_field: Option<String>,

    /// Rows per source page (default: 100).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Record failing rows and continue instead of stopping the job.
    #[serde(default)]
    pub skip_errors: bool,

    /// Field rules in application order.
    #[serde(default)]
    pub rules: Vec<FieldRule>,

    /// Inactive mappings cannot be started (default: true).
    #[serde(default = "default_true")]
    pub active: bool,

    #[serde(skip)]
    pub cache: MappingCache,
}

fn default_source_schema() -> String {
    "dbo".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_true() -> bool {
    true
}

impl Mapping {
    pub fn new(
        name: impl Into<String>,
        connection: impl Into<String>,
        source_table: impl Into<String>,
        target_entity: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            connections: vec![connection.into()],
            source_schema: default_source_schema(),
            source_table: source_table.into(),
            source_filter: None,
            order_key: None,
            target_entity: target_entity.into(),
            target_mode: TargetMode::default(),
            key_field: None,
            batch_size: default_batch_size(),
            skip_errors: false,
            rules: Vec::new(),
            active: true,
            cache: MappingCache::default(),
        }
    }

    pub fn with_rules(mut self, rules: Vec<FieldRule>) -> Self {
        self.rules = rules;
        self
    }

    /// Source table as `schema.table`.
    pub fn source_name(&self) -> String {
        format!("{}.{}", self.source_schema, self.source_table)
    }

    /// Freeze the configuration a job runs with.
    pub fn snapshot(&self) -> MappingSnapshot {
        MappingSnapshot {
            name: self.name.clone(),
            connections: self.connections.clone(),
            source_schema: self.source_schema.clone(),
            source_table: self.source_table.clone(),
            source_filter: self.source_filter.clone(),
            order_key: self.order_key.clone(),
            target_entity: self.target_entity.clone(),
            target_mode: self.target_mode,
            key_field: self.key_field.clone(),
            batch_size: self.batch_size,
            skip_errors: self.skip_errors,
            rules: self.rules.clone(),
        }
    }

    /// Check the rules against source columns and target fields.
    pub fn check(&self, columns: &[ColumnInfo], fields: &[FieldInfo]) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.rules.is_empty() {
            issues.push(ValidationIssue::new(
                None,
                IssueKind::NoRules,
                format!("mapping {} has no field rules", self.name),
            ));
        }

        let mut targets = HashSet::new();
        for (idx, rule) in self.rules.iter().enumerate() {
            if !columns.iter().any(|c| c.name == rule.source_field) {
                issues.push(ValidationIssue::new(
                    Some(idx),
                    IssueKind::UnknownSourceField,
                    format!(
                        "source column {} does not exist in {}",
                        rule.source_field,
                        self.source_name()
                    ),
                ));
            }

            match fields.iter().find(|f| f.name == rule.target_field) {
                None => issues.push(ValidationIssue::new(
                    Some(idx),
                    IssueKind::UnknownTargetField,
                    format!(
                        "target field {} does not exist in {}",
                        rule.target_field, self.target_entity
                    ),
                )),
                Some(field) if !field.is_writable() => issues.push(ValidationIssue::new(
                    Some(idx),
                    IssueKind::ReadonlyTargetField,
                    format!(
                        "target field {}.{} is read-only",
                        self.target_entity, rule.target_field
                    ),
                )),
                Some(_) => {}
            }

            if !targets.insert(rule.target_field.as_str()) {
                issues.push(ValidationIssue::new(
                    Some(idx),
                    IssueKind::DuplicateTargetField,
                    format!("target field {} is mapped more than once", rule.target_field),
                ));
            }
        }

        if let Some(key) = &self.key_field {
            if self.target_mode.needs_key() && !targets.contains(key.as_str()) {
                issues.push(ValidationIssue::new(
                    None,
                    IssueKind::KeyFieldUnmapped,
                    format!("key field {} is not the target of any rule", key),
                ));
            }
        }

        if self.target_mode.may_create() {
            for field in fields.iter().filter(|f| f.required && f.is_writable()) {
                if !targets.contains(field.name.as_str()) {
                    issues.push(ValidationIssue::new(
                        None,
                        IssueKind::RequiredFieldUnmapped,
                        format!("required field {} is not mapped", field.name),
                    ));
                }
            }
        }

        issues
    }

    /// Issues that prevent a job from starting.
    pub fn blocking<'a>(&self, issues: &'a [ValidationIssue]) -> Vec<&'a ValidationIssue> {
        issues
            .iter()
            .filter(|i| i.kind != IssueKind::RequiredFieldUnmapped || !self.skip_errors)
            .collect()
    }
}

/// Kind of mapping inconsistency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    NoRules,
    UnknownSourceField,
    UnknownTargetField,
    ReadonlyTargetField,
    DuplicateTargetField,
    KeyFieldUnmapped,
    RequiredFieldUnmapped,
}

/// One mapping validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Index of the offending rule, if the issue concerns one.
    pub rule_index: Option<usize>,
    pub kind: IssueKind,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(rule_index: Option<usize>, kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            rule_index,
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rule_index {
            Some(idx) => write!(f, "rule {}: {}", idx + 1, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Mapping configuration captured when a job starts.
///
/// Later edits to the mapping never reach a job that holds a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingSnapshot {
    pub name: String,
    pub connections: Vec<String>,
    pub source_schema: String,
    pub source_table: String,
    pub source_filter: Option<String>,
    pub order_key: Option<String>,
    pub target_entity: String,
    pub target_mode: TargetMode,
    pub key_field: Option<String>,
    pub batch_size: usize,
    pub skip_errors: bool,
    pub rules: Vec<FieldRule>,
}

impl MappingSnapshot {
    /// SHA256 of the snapshot's JSON form.
    pub fn hash(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Distinct source columns the rules read, in rule order.
    pub fn source_columns(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.rules
            .iter()
            .filter(|r| seen.insert(r.source_field.as_str()))
            .map(|r| r.source_field.clone())
            .collect()
    }

    /// Apply every rule to one source row.
    pub fn transform_row(&self, engine: &TransformEngine, row: &SourceRow) -> Result<Record> {
        let mut record = Record::new();
        for rule in &self.rules {
            let raw = row.get(&rule.source_field).unwrap_or(&Value::Null);
            let value = engine.apply(rule.transform, &rule.target_field, raw)?;
            record.insert(rule.target_field.clone(), value);
        }
        Ok(record)
    }

    /// Key for the update modes, taken from the transformed record.
    pub fn write_key<'a>(&'a self, record: &'a Record) -> Result<Option<(&'a str, &'a Value)>> {
        if !self.target_mode.needs_key() {
            return Ok(None);
        }
        let field = self.key_field.as_deref().ok_or_else(|| {
            ImportError::Precondition(format!(
                "mapping {} uses {} without a key field",
                self.name, self.target_mode
            ))
        })?;
        match record.get(field) {
            Some(value) if !value.is_null() => Ok(Some((field, value))),
            _ => Err(ImportError::Write(format!("key field {} is empty", field))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FieldType, KeyValue};

    fn mapping() -> Mapping {
        Mapping::new("customers", "legacy", "Customers", "res.partner").with_rules(vec![
            FieldRule::direct("CustomerName", "name"),
            FieldRule::new("IsActive", "active", TransformKind::Bool),
        ])
    }

    fn columns() -> Vec<ColumnInfo> {
        vec![
            ColumnInfo::new("Id", "int"),
            ColumnInfo::new("CustomerName", "nvarchar"),
            ColumnInfo::new("IsActive", "varchar"),
        ]
    }

    fn fields() -> Vec<FieldInfo> {
        vec![
            FieldInfo::new("id", FieldType::Integer, false).readonly(),
            FieldInfo::new("name", FieldType::Char, true),
            FieldInfo::new("active", FieldType::Boolean, false),
            FieldInfo::new("ref", FieldType::Char, false),
        ]
    }

    #[test]
    fn test_check_valid_mapping() {
        assert!(mapping().check(&columns(), &fields()).is_empty());
    }

    #[test]
    fn test_check_reports_each_problem() {
        let mut m = mapping();
        m.rules.push(FieldRule::direct("Missing", "ref"));
        m.rules.push(FieldRule::direct("Id", "id"));
        m.rules.push(FieldRule::direct("CustomerName", "name"));
        m.rules.push(FieldRule::direct("Id", "color"));

        let kinds: Vec<_> = m
            .check(&columns(), &fields())
            .into_iter()
            .map(|i| (i.rule_index, i.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (Some(2), IssueKind::UnknownSourceField),
                (Some(3), IssueKind::ReadonlyTargetField),
                (Some(4), IssueKind::DuplicateTargetField),
                (Some(5), IssueKind::UnknownTargetField),
            ]
        );
    }

    #[test]
    fn test_required_fields_depend_on_mode_and_skip_errors() {
        let mut m = mapping();
        m.rules.remove(0);
        let issues = m.check(&columns(), &fields());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::RequiredFieldUnmapped);
        assert_eq!(m.blocking(&issues).len(), 1);

        m.skip_errors = true;
        assert!(m.blocking(&issues).is_empty());

        m.target_mode = TargetMode::UpdateOnly;
        m.key_field = Some("active".to_string());
        assert!(m.check(&columns(), &fields()).is_empty());
    }

    #[test]
    fn test_key_field_must_be_mapped() {
        let mut m = mapping();
        m.target_mode = TargetMode::UpdateOrCreate;
        m.key_field = Some("ref".to_string());
        let issues = m.check(&columns(), &fields());
        assert_eq!(issues[0].kind, IssueKind::KeyFieldUnmapped);
    }

    #[test]
    fn test_snapshot_is_independent_of_later_edits() {
        let mut m = mapping();
        let snapshot = m.snapshot();
        let hash = snapshot.hash();
        m.skip_errors = true;
        m.rules.clear();
        assert_eq!(snapshot.rules.len(), 2);
        assert!(!snapshot.skip_errors);
        assert_eq!(snapshot.hash(), hash);
        assert_ne!(m.snapshot().hash(), hash);
    }

    #[test]
    fn test_transform_row_and_key() {
        let mut m = mapping();
        m.rules.push(FieldRule::new("Id", "ref", TransformKind::String));
        m.target_mode = TargetMode::UpdateOrCreate;
        m.key_field = Some("ref".to_string());
        let snapshot = m.snapshot();
        let engine = TransformEngine::default();

        let row = SourceRow {
            key: KeyValue::Int(7),
            values: vec![
                ("Id".to_string(), Value::Int(7)),
                ("CustomerName".to_string(), "Acme".into()),
                ("IsActive".to_string(), "Y".into()),
            ],
        };
        let record = snapshot.transform_row(&engine, &row).unwrap();
        assert_eq!(record.get("active"), Some(&Value::Bool(true)));
        assert_eq!(
            snapshot.write_key(&record).unwrap(),
            Some(("ref", &Value::from("7")))
        );

        let bad = SourceRow {
            values: vec![("IsActive".to_string(), "Maybe".into())],
            ..row
        };
        let err = snapshot.transform_row(&engine, &bad).unwrap_err();
        assert!(matches!(err, ImportError::Transform { .. }));
    }

    #[test]
    fn test_source_columns_are_distinct() {
        let mut m = mapping();
        m.rules.push(FieldRule::new("CustomerName", "ref", TransformKind::String));
        assert_eq!(
            m.snapshot().source_columns(),
            vec!["CustomerName".to_string(), "IsActive".to_string()]
        );
    }
}
