//! Port for the persistent work-unit store, plus an in-memory
//! implementation used by tests and single-process deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use gridqueue_model::WorkUnit;

use crate::error::Result;

/// Durable storage for work units, keyed by their identity digest.
///
/// The backing store is assumed to provide at least last-writer-wins
/// semantics per unit; this crate avoids conflicting concurrent writes by
/// construction instead of locking.
#[async_trait]
pub trait UnitStore: Send + Sync {
    /// Upserts a unit under its identity.
    async fn put(&self, unit: WorkUnit) -> Result<()>;

    async fn get(&self, identity: &str) -> Result<Option<WorkUnit>>;

    /// All units belonging to a request.
    async fn query(&self, request_name: &str) -> Result<Vec<WorkUnit>>;

    /// Removes every unit of a request. Irreversible; gated by the
    /// synchronization loop on local and remote terminal confirmation.
    async fn delete(&self, request_name: &str) -> Result<()>;
}

/// Mutex-guarded map store.
#[derive(Debug, Default)]
pub struct MemoryUnitStore {
    units: Mutex<HashMap<String, WorkUnit>>,
}

impl MemoryUnitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.units.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.units.lock().await.is_empty()
    }
}

#[async_trait]
impl UnitStore for MemoryUnitStore {
    async fn put(&self, unit: WorkUnit) -> Result<()> {
        let mut units = self.units.lock().await;
        units.insert(unit.identity(), unit);
        Ok(())
    }

    async fn get(&self, identity: &str) -> Result<Option<WorkUnit>> {
        Ok(self.units.lock().await.get(identity).cloned())
    }

    async fn query(&self, request_name: &str) -> Result<Vec<WorkUnit>> {
        Ok(self
            .units
            .lock()
            .await
            .values()
            .filter(|unit| unit.request_name == request_name)
            .cloned()
            .collect())
    }

    async fn delete(&self, request_name: &str) -> Result<()> {
        let mut units = self.units.lock().await;
        units.retain(|_, unit| unit.request_name != request_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(request: &str, block: &str) -> WorkUnit {
        WorkUnit::builder(request)
            .input(block, Default::default())
            .build()
    }

    #[tokio::test]
    async fn put_is_an_upsert_keyed_by_identity() {
        let store = MemoryUnitStore::new();
        let first = unit("req-1", "/A/B/RAW#b1");
        let identity = first.identity();
        store.put(first.clone()).await.unwrap();
        store.put(first).await.unwrap();
        assert_eq!(store.len().await, 1);
        assert!(store.get(&identity).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn query_and_delete_group_by_request() {
        let store = MemoryUnitStore::new();
        store.put(unit("req-1", "/A/B/RAW#b1")).await.unwrap();
        store.put(unit("req-1", "/A/B/RAW#b2")).await.unwrap();
        store.put(unit("req-2", "/C/D/RAW#b1")).await.unwrap();

        assert_eq!(store.query("req-1").await.unwrap().len(), 2);
        store.delete("req-1").await.unwrap();
        assert!(store.query("req-1").await.unwrap().is_empty());
        assert_eq!(store.query("req-2").await.unwrap().len(), 1);
    }
}
