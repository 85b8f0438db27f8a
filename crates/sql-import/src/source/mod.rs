//! Source drivers.
//!
//! - [`MssqlSource`]: SQL Server over Tiberius with a bb8 pool
//! - [`MemorySource`]: in-process tables for dry runs and tests

mod memory;
mod mssql;

pub use memory::MemorySource;
pub use mssql::{MssqlSource, MssqlSourceFactory};
