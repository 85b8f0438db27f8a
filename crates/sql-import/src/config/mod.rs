//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::transform::TransformContext;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Compute a SHA256 hash of the configuration.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl Settings {
    /// Transform context for the configured source offset.
    pub fn transform_context(&self) -> Result<TransformContext> {
        TransformContext::with_offset_minutes(self.source_utc_offset_minutes)
    }
}

impl PostgresTargetConfig {
    /// Build a connection string for tokio-postgres.
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.host, self.port, self.database, self.user, self.password
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TargetMode;
    use crate::transform::TransformKind;

    const YAML: &str = r#"
settings:
  source_utc_offset_minutes: 60
target:
  type: memory
  entities:
    res.partner:
      - { name: name, field_type: char, required: true }
      - { name: active, field_type: boolean, required: false }
connections:
  - name: legacy
    server: db1
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

    #[test]
    fn test_from_yaml_applies_defaults() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.settings.sample_size, 10);
        assert_eq!(config.settings.state_dir, ".sql-import/jobs");

        let conn = config.connection("legacy").unwrap();
        assert_eq!(conn.port, 1433);
        assert_eq!(conn.timeout_secs, 30);

        let mapping = config.mapping("customers").unwrap();
        assert_eq!(mapping.source_schema, "dbo");
        assert_eq!(mapping.batch_size, 100);
        assert_eq!(mapping.target_mode, TargetMode::CreateOnly);
        assert!(mapping.active);
        assert_eq!(mapping.rules[0].transform, TransformKind::Direct);
        assert_eq!(mapping.rules[1].transform, TransformKind::Bool);

        assert_eq!(config.target.kind(), "memory");
    }

    #[test]
    fn test_transform_context_from_settings() {
        let config = Config::from_yaml(YAML).unwrap();
        let ctx = config.settings.transform_context().unwrap();
        assert_eq!(ctx.source_offset.local_minus_utc(), 3600);
    }

    #[test]
    fn test_hash_is_stable_and_sensitive() {
        let a = Config::from_yaml(YAML).unwrap();
        let b = Config::from_yaml(YAML).unwrap();
        assert_eq!(a.hash(), b.hash());

        let c = Config::from_yaml(&YAML.replace("Customers", "Clients")).unwrap();
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sql-import.yaml");
        std::fs::write(&path, YAML).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.mappings.len(), 1);
    }

    #[test]
    fn test_unknown_mapping_lookup_fails() {
        let config = Config::from_yaml(YAML).unwrap();
        assert!(config.mapping("vendors").is_err());
    }
}
