//! Tenant/domain registry lookup: an external collaborator per SPEC_FULL.md
//! §1. `Registry` is the trait boundary; `InMemoryRegistry` is the default,
//! non-durable implementation used for self-hosted builds and tests.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantStatus {
    Active,
    Blocked,
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRecord {
    pub tenant_id: i64,
    pub status: TenantStatus,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry backend unreachable: {0}")]
    Unreachable(String),
}

/// A keyed read returning a small JSON-shaped record, per SPEC_FULL.md §1.
/// Implementations may return an empty `Vec` for "no record"; a missing key
/// and an empty list are explicitly equivalent per §3.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn lookup(&self, host: &str) -> Result<Vec<DomainRecord>, RegistryError>;
}

#[derive(Default)]
pub struct InMemoryRegistry {
    records: RwLock<HashMap<String, Vec<DomainRecord>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, host: &str, records: Vec<DomainRecord>) {
        self.records
            .write()
            .expect("registry lock poisoned")
            .insert(host.to_ascii_lowercase(), records);
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn lookup(&self, host: &str) -> Result<Vec<DomainRecord>, RegistryError> {
        Ok(self
            .records
            .read()
            .expect("registry lock poisoned")
            .get(host)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_key_and_empty_list_are_equivalent() {
        let registry = InMemoryRegistry::new();
        assert_eq!(registry.lookup("nowhere.com").await.unwrap(), Vec::new());

        registry.insert("empty.com", vec![]);
        assert_eq!(registry.lookup("empty.com").await.unwrap(), Vec::new());
    }

    #[tokio::test]
    async fn returns_inserted_records() {
        let registry = InMemoryRegistry::new();
        registry.insert(
            "example.com",
            vec![DomainRecord {
                tenant_id: 7,
                status: TenantStatus::Active,
            }],
        );
        let records = registry.lookup("example.com").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tenant_id, 7);
    }
}
