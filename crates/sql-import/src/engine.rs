//! Wiring of connections, target, resolver and executor from a config.

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::core::{SourceFactory, TargetModel};
use crate::error::Result;
use crate::job::{FileJobStore, ImportJobExecutor, JobStore};
use crate::mapping::{Mapping, MappingResolver};
use crate::source::MssqlSourceFactory;
use crate::target::build_target;
use crate::transform::TransformEngine;

/// The import engine for one configuration.
pub struct ImportEngine {
    config: Config,
    connections: Arc<ConnectionManager>,
    target: Arc<dyn TargetModel>,
    resolver: Arc<MappingResolver>,
    executor: ImportJobExecutor,
}

impl ImportEngine {
    /// SQL Server sources, the configured target and file-backed jobs.
    pub async fn new(config: Config) -> Result<Self> {
        let target = build_target(&config.target).await?;
        let store = Arc::new(FileJobStore::new(&config.settings.state_dir)?);
        info!(
            "Import engine ready: {} connections, {} mappings, {} target",
            config.connections.len(),
            config.mappings.len(),
            target.kind()
        );
        Self::with_parts(config, Arc::new(MssqlSourceFactory), target, store)
    }

    /// Assemble an engine from explicit parts.
    pub fn with_parts(
        config: Config,
        factory: Arc<dyn SourceFactory>,
        target: Arc<dyn TargetModel>,
        store: Arc<dyn JobStore>,
    ) -> Result<Self> {
        let connections = Arc::new(ConnectionManager::from_config(&config, factory)?);
        let engine = TransformEngine::new(config.settings.transform_context()?);
        let resolver = Arc::new(MappingResolver::new(
            connections.clone(),
            target.clone(),
            engine,
            config.settings.sample_size,
        ));
        let executor = ImportJobExecutor::new(
            connections.clone(),
            resolver.clone(),
            target.clone(),
            engine,
            store,
        );
        Ok(Self {
            config,
            connections,
            target,
            resolver,
            executor,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn target(&self) -> &Arc<dyn TargetModel> {
        &self.target
    }

    pub fn resolver(&self) -> &MappingResolver {
        &self.resolver
    }

    pub fn executor(&self) -> &ImportJobExecutor {
        &self.executor
    }

    /// A working copy of a configured mapping.
    pub fn mapping(&self, name: &str) -> Result<Mapping> {
        self.config.mapping(name).cloned()
    }

    /// Create a job for a mapping and start it.
    pub async fn start_mapping(&self, name: &str) -> Result<String> {
        let mut mapping = self.mapping(name)?;
        let id = self.executor.create_job(&mapping).await?;
        self.executor.action_start(&id, &mut mapping).await?;
        Ok(id)
    }

    /// Close pooled source sessions.
    pub async fn close(&self) {
        self.connections.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ColumnInfo, Value};
    use crate::job::{JobState, MemoryJobStore};
    use crate::source::MemorySource;
    use crate::target::MemoryTarget;

    const YAML: &str = r#"
target:
  type: memory
  entities:
    res.partner:
      - { name: name, field_type: char, required: true }
      - { name: active, field_type: boolean, required: false }
connections:
  - name: legacy
    server: db1
    port: 1433
    database: legacy
    username: sa
    password: secret
mappings:
  - name: customers
    connections: [legacy]
    source_table: Customers
    target_entity: res.partner
    skip_errors: true
    rules:
      - { source_field: CustomerName, target_field: name }
      - { source_field: IsActive, target_field: active, transform: bool }
"#;

    #[tokio::test]
    async fn test_customers_scenario_from_config() {
        let config = Config::from_yaml(YAML).unwrap();

        let source = MemorySource::new("Microsoft SQL Server 2019");
        source.add_table(
            "dbo",
            "Customers",
            vec![
                ColumnInfo::new("Id", "int"),
                ColumnInfo::new("CustomerName", "nvarchar"),
                ColumnInfo::new("IsActive", "varchar"),
            ],
            Some("Id"),
        );
        for (id, name, active) in [(1, "Acme", "Y"), (2, "Globex", "0"), (3, "Initech", "Maybe")] {
            source.insert_row(
                "dbo",
                "Customers",
                vec![
                    ("Id", Value::Int(id)),
                    ("CustomerName", name.into()),
                    ("IsActive", active.into()),
                ],
            );
        }

        let target = MemoryTarget::from_config(match &config.target {
            crate::config::TargetConfig::Memory(mem) => mem,
            _ => unreachable!(),
        });
        let engine = ImportEngine::with_parts(
            config,
            Arc::new(source),
            Arc::new(target.clone()),
            Arc::new(MemoryJobStore::new()),
        )
        .unwrap();

        assert!(engine.connections().test_connection("legacy").await.connected);
        let tables = engine.connections().fetch_tables("legacy").await.unwrap();
        assert_eq!(tables, vec![("dbo".to_string(), "Customers".to_string())]);

        let id = engine.start_mapping("customers").await.unwrap();
        let job = engine.executor().wait(&id).await.unwrap();
        assert_eq!(job.state, JobState::Done);
        assert_eq!(job.total_records, 3);
        assert_eq!(job.imported_records, 2);
        assert_eq!(job.failed_records, 1);
        assert!(job.log_text().contains("Row 3"));
        assert_eq!(target.count("res.partner"), 2);
    }
}
