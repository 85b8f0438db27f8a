//! Target models.
//!
//! - [`PgTarget`]: PostgreSQL tables via deadpool-postgres
//! - [`MemoryTarget`]: in-process entities for dry runs and tests

mod memory;
mod postgres;

use std::sync::Arc;

pub use memory::MemoryTarget;
pub use postgres::PgTarget;

use crate::config::TargetConfig;
use crate::core::TargetModel;
use crate::error::Result;

/// Build the target model named by the configuration.
pub async fn build_target(config: &TargetConfig) -> Result<Arc<dyn TargetModel>> {
    match config {
        TargetConfig::Postgres(pg) => Ok(Arc::new(PgTarget::connect(pg).await?)),
        TargetConfig::Memory(mem) => Ok(Arc::new(MemoryTarget::from_config(mem))),
    }
}
