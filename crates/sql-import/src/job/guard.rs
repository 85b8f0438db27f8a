//! At most one running job per mapping.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{ImportError, Result};

/// Registry of mappings with a running job.
#[derive(Debug, Clone, Default)]
pub struct MappingLeases {
    running: Arc<Mutex<HashSet<String>>>,
}

impl MappingLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a mapping; fails with `Precondition` when another job holds it.
    ///
    /// Check and insert happen under one lock, so concurrent claims for the
    /// same mapping cannot both succeed.
    pub fn acquire(&self, mapping: &str) -> Result<MappingLease> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if !running.insert(mapping.to_string()) {
            return Err(ImportError::Precondition(format!(
                "another job on mapping '{}' is running",
                mapping
            )));
        }
        Ok(MappingLease {
            mapping: mapping.to_string(),
            running: self.running.clone(),
        })
    }

    pub fn is_held(&self, mapping: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(mapping)
    }
}

/// Releases the mapping when dropped.
#[derive(Debug)]
pub struct MappingLease {
    mapping: String,
    running: Arc<Mutex<HashSet<String>>>,
}

impl MappingLease {
    pub fn mapping(&self) -> &str {
        &self.mapping
    }
}

impl Drop for MappingLease {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.mapping);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_claim_fails_until_release() {
        let leases = MappingLeases::new();
        let lease = leases.acquire("customers").unwrap();
        assert!(matches!(
            leases.acquire("customers"),
            Err(ImportError::Precondition(_))
        ));
        assert!(leases.acquire("vendors").is_ok());

        drop(lease);
        assert!(!leases.is_held("customers"));
        assert!(leases.acquire("customers").is_ok());
    }
}
