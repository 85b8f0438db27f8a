//! Mapping resolution against live source and target schemas.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{infer_transform, FieldRule, Mapping, ValidationIssue};
use crate::connection::ConnectionManager;
use crate::core::{ColumnInfo, FieldInfo, KeyValue, LegacyTable, ReadOptions, Record, TargetModel};
use crate::error::{ImportError, Result};
use crate::inspect::{resolve_order_key, SchemaInspector};
use crate::transform::TransformEngine;

/// Rules proposed by [`MappingResolver::generate_default_mapping`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneratedRules {
    pub rules: Vec<FieldRule>,

    /// Required target fields no source column matched.
    pub unmapped_required: Vec<String>,
}

/// One transformed sample row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleRow {
    pub key: KeyValue,
    pub values: Record,
}

/// The first sample row that failed to transform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleFailure {
    pub key: KeyValue,
    pub message: String,
}

/// Outcome of a dry run over a few source rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingTestReport {
    pub mapping: String,
    pub source: String,
    pub target_entity: String,
    pub rules: Vec<FieldRule>,
    pub samples: Vec<SampleRow>,
    pub failure: Option<SampleFailure>,

    /// Non-blocking validation findings.
    pub warnings: Vec<ValidationIssue>,
}

impl MappingTestReport {
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }

    /// Rules, then sample data, then the failure if any.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Mapping {}: {} -> {}",
            self.mapping, self.source, self.target_entity
        );
        for rule in &self.rules {
            let _ = writeln!(out, "  {}", rule);
        }
        for warning in &self.warnings {
            let _ = writeln!(out, "Warning: {}", warning);
        }

        let _ = writeln!(out, "\nSample data ({} rows):", self.samples.len());
        for sample in &self.samples {
            let values: Vec<String> = sample
                .values
                .iter()
                .map(|(field, value)| format!("{}={}", field, value))
                .collect();
            let _ = writeln!(out, "  [{}] {}", sample.key, values.join(", "));
        }

        match &self.failure {
            Some(failure) => {
                let _ = writeln!(out, "\nFailed at row {}: {}", failure.key, failure.message);
            }
            None => {
                let _ = writeln!(out, "\nMapping test passed.");
            }
        }
        out
    }
}

/// Checks mappings against the source and target schemas.
pub struct MappingResolver {
    connections: Arc<ConnectionManager>,
    inspector: SchemaInspector,
    target: Arc<dyn TargetModel>,
    engine: TransformEngine,
    sample_size: usize,
}

impl MappingResolver {
    pub fn new(
        connections: Arc<ConnectionManager>,
        target: Arc<dyn TargetModel>,
        engine: TransformEngine,
        sample_size: usize,
    ) -> Self {
        Self {
            inspector: SchemaInspector::new(connections.clone()),
            connections,
            target,
            engine,
            sample_size: sample_size.max(1),
        }
    }

    /// Columns of the mapping's source table, cached on the mapping.
    pub async fn fetch_source_columns(&self, mapping: &mut Mapping) -> Result<Vec<ColumnInfo>> {
        let result = self.load_source_columns(mapping).await;
        match &result {
            Ok(columns) => {
                mapping.cache.source_columns = Some(columns.clone());
                mapping.cache.error = None;
            }
            Err(e) => mapping.cache.error = Some(e.summary()),
        }
        result
    }

    /// Fields of the mapping's target entity, cached on the mapping.
    pub async fn fetch_target_fields(&self, mapping: &mut Mapping) -> Result<Vec<FieldInfo>> {
        let result = self.target.list_fields(&mapping.target_entity).await;
        match &result {
            Ok(fields) => {
                mapping.cache.target_fields = Some(fields.clone());
                mapping.cache.error = None;
            }
            Err(e) => mapping.cache.error = Some(e.summary()),
        }
        result
    }

    /// Propose one rule per writable target field with a same-named source
    /// column, and replace the mapping's rules with them.
    ///
    /// Names match exactly first, then ignoring case, then ignoring case and
    /// underscores.
    pub async fn generate_default_mapping(&self, mapping: &mut Mapping) -> Result<GeneratedRules> {
        let (columns, fields) = self.schemas(mapping).await?;

        let mut generated = GeneratedRules::default();
        let mut used_targets = HashSet::new();
        for field in fields.iter().filter(|f| f.is_writable()) {
            if !used_targets.insert(field.name.as_str()) {
                continue;
            }
            match match_column(&columns, &field.name) {
                Some(col) => generated.rules.push(FieldRule::new(
                    col.name.clone(),
                    field.name.clone(),
                    infer_transform(&col.declared_type, &field.field_type),
                )),
                None if field.required => generated.unmapped_required.push(field.name.clone()),
                None => {}
            }
        }

        info!(
            "Generated {} field rules for mapping {}",
            generated.rules.len(),
            mapping.name
        );
        if !generated.unmapped_required.is_empty() {
            warn!(
                "Mapping {}: required fields without a source column: {}",
                mapping.name,
                generated.unmapped_required.join(", ")
            );
        }

        mapping.rules = generated.rules.clone();
        Ok(generated)
    }

    /// Validate the rules against the (cached) schemas.
    pub async fn validate(&self, mapping: &mut Mapping) -> Result<Vec<ValidationIssue>> {
        let (columns, fields) = self.schemas(mapping).await?;
        let issues = mapping.check(&columns, &fields);
        debug!("Mapping {} has {} validation issues", mapping.name, issues.len());
        Ok(issues)
    }

    /// Fail with `Validation` when the mapping has blocking issues; return
    /// the rest as warnings.
    pub async fn ensure_valid(&self, mapping: &mut Mapping) -> Result<Vec<ValidationIssue>> {
        let issues = self.validate(mapping).await?;
        let blocking: Vec<_> = mapping.blocking(&issues).into_iter().cloned().collect();
        if !blocking.is_empty() {
            return Err(ImportError::Validation(blocking));
        }
        Ok(issues)
    }

    /// Transform the first rows of the source table without writing.
    pub async fn test_mapping(&self, mapping: &mut Mapping) -> Result<MappingTestReport> {
        let warnings = self.ensure_valid(mapping).await?;
        let snapshot = mapping.snapshot();

        let (_, session) = self
            .connections
            .resolve_for(&snapshot.name, &snapshot.connections)
            .await?;
        let key_column = resolve_order_key(
            session.as_ref(),
            &snapshot.source_schema,
            &snapshot.source_table,
            snapshot.order_key.as_deref(),
        )
        .await?;

        let mut rx = session.read_rows(ReadOptions {
            schema: snapshot.source_schema.clone(),
            table: snapshot.source_table.clone(),
            columns: snapshot.source_columns(),
            key_column,
            filter: snapshot.source_filter.clone(),
            batch_size: self.sample_size,
            ..Default::default()
        });
        let rows = match rx.recv().await {
            Some(batch) => batch?,
            None => Vec::new(),
        };
        drop(rx);

        let mut report = MappingTestReport {
            mapping: snapshot.name.clone(),
            source: mapping.source_name(),
            target_entity: snapshot.target_entity.clone(),
            rules: snapshot.rules.clone(),
            samples: Vec::new(),
            failure: None,
            warnings,
        };
        for row in rows.into_iter().take(self.sample_size) {
            match snapshot.transform_row(&self.engine, &row) {
                Ok(values) => report.samples.push(SampleRow {
                    key: row.key,
                    values,
                }),
                Err(e) => {
                    report.failure = Some(SampleFailure {
                        key: row.key,
                        message: e.summary(),
                    });
                    break;
                }
            }
        }

        info!(
            "Mapping test {}: {} sample rows, {}",
            snapshot.name,
            report.samples.len(),
            if report.passed() { "passed" } else { "failed" }
        );
        Ok(report)
    }

    async fn load_source_columns(&self, mapping: &Mapping) -> Result<Vec<ColumnInfo>> {
        let (conn, _) = self
            .connections
            .resolve_for(&mapping.name, &mapping.connections)
            .await?;
        let table = LegacyTable::new(conn.as_str(), &mapping.source_schema, &mapping.source_table);
        self.inspector.fetch_columns(&conn, &table).await
    }

    async fn schemas(&self, mapping: &mut Mapping) -> Result<(Vec<ColumnInfo>, Vec<FieldInfo>)> {
        let columns = match mapping.cache.source_columns.clone() {
            Some(columns) => columns,
            None => self.fetch_source_columns(mapping).await?,
        };
        let fields = match mapping.cache.target_fields.clone() {
            Some(fields) => fields,
            None => self.fetch_target_fields(mapping).await?,
        };
        Ok((columns, fields))
    }
}

fn match_column<'a>(columns: &'a [ColumnInfo], field: &str) -> Option<&'a ColumnInfo> {
    let squash = |s: &str| s.replace('_', "").to_lowercase();
    columns
        .iter()
        .find(|c| c.name == field)
        .or_else(|| columns.iter().find(|c| c.name.eq_ignore_ascii_case(field)))
        .or_else(|| columns.iter().find(|c| squash(&c.name) == squash(field)))
}
