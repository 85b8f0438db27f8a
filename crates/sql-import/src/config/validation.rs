//! Configuration validation.

use std::collections::HashSet;

use super::{Config, TargetConfig};
use crate::core::identifier::{validate_filter, validate_identifier};
use crate::error::{ImportError, Result};

/// Validate the configuration.
///
/// Checks what can be checked without talking to a database. Rule
/// consistency against live schemas is the mapping resolver's job.
pub fn validate(config: &Config) -> Result<()> {
    if config.settings.sample_size == 0 {
        return Err(ImportError::Config(
            "settings.sample_size must be at least 1".into(),
        ));
    }
    if config.settings.source_utc_offset_minutes.abs() >= 24 * 60 {
        return Err(ImportError::Config(format!(
            "settings.source_utc_offset_minutes must be within +/-1439, got {}",
            config.settings.source_utc_offset_minutes
        )));
    }

    if let TargetConfig::Postgres(pg) = &config.target {
        if pg.host.is_empty() {
            return Err(ImportError::Config("target.host is required".into()));
        }
        if pg.database.is_empty() {
            return Err(ImportError::Config("target.database is required".into()));
        }
        if pg.user.is_empty() {
            return Err(ImportError::Config("target.user is required".into()));
        }
        if pg.max_connections == 0 {
            return Err(ImportError::Config(
                "target.max_connections must be at least 1".into(),
            ));
        }
    }

    let mut names = HashSet::new();
    for conn in &config.connections {
        if conn.name.is_empty() {
            return Err(ImportError::Config("connections[].name is required".into()));
        }
        if !names.insert(conn.name.as_str()) {
            return Err(ImportError::Config(format!(
                "duplicate connection name '{}'",
                conn.name
            )));
        }
        if conn.server.is_empty() {
            return Err(ImportError::Config(format!(
                "connections[{}].server is required",
                conn.name
            )));
        }
        if conn.database.is_empty() {
            return Err(ImportError::Config(format!(
                "connections[{}].database is required",
                conn.name
            )));
        }
        if conn.username.is_empty() {
            return Err(ImportError::Config(format!(
                "connections[{}].username is required",
                conn.name
            )));
        }
        if conn.password.is_some() && conn.password_env.is_some() {
            return Err(ImportError::Config(format!(
                "connections[{}]: set either password or password_env, not both",
                conn.name
            )));
        }
        if conn.timeout_secs == 0 {
            return Err(ImportError::Config(format!(
                "connections[{}].timeout_secs must be at least 1",
                conn.name
            )));
        }
    }

    let mut mapping_names = HashSet::new();
    for mapping in &config.mappings {
        let ctx = |msg: &str| ImportError::Config(format!("mappings[{}]: {}", mapping.name, msg));

        if mapping.name.is_empty() {
            return Err(ImportError::Config("mappings[].name is required".into()));
        }
        if !mapping_names.insert(mapping.name.as_str()) {
            return Err(ImportError::Config(format!(
                "duplicate mapping name '{}'",
                mapping.name
            )));
        }
        if mapping.connections.is_empty() {
            return Err(ctx("at least one connection is required"));
        }
        for conn in &mapping.connections {
            if !names.contains(conn.as_str()) {
                return Err(ctx(&format!("unknown connection '{}'", conn)));
            }
        }
        validate_identifier(&mapping.source_schema)?;
        validate_identifier(&mapping.source_table)?;
        if let Some(key) = &mapping.order_key {
            validate_identifier(key)?;
        }
        if mapping.target_entity.is_empty() {
            return Err(ctx("target_entity is required"));
        }
        if mapping.batch_size == 0 {
            return Err(ctx("batch_size must be at least 1"));
        }
        if let Some(filter) = &mapping.source_filter {
            validate_filter(filter).map_err(|e| ctx(&e.to_string()))?;
        }
        if mapping.target_mode.needs_key() && mapping.key_field.is_none() {
            return Err(ctx(&format!(
                "key_field is required for target_mode {}",
                mapping.target_mode
            )));
        }
    }

    Ok(())
}
