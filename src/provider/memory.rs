//! In-process provider adapter.
//!
//! Backs the engine's isolated tests and the CLI simulator: ids are
//! allocated sequentially per kind, attributes are held in memory, and
//! failures can be scripted per mutating call.

use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::{ProviderAdapter, ProviderError};
use crate::core::state::relock;
use crate::core::types::AttributeMap;

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    records: IndexMap<String, AttributeMap>,
    mutating_calls: u32,
    scripted_failures: VecDeque<ProviderError>,
}

/// A fake control plane for one resource kind.
#[derive(Debug)]
pub struct MemoryAdapter {
    kind: String,
    inner: Mutex<Inner>,
}

impl MemoryAdapter {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Script the next mutating call to fail with `error`.
    pub fn fail_next(&self, error: ProviderError) {
        relock(self.inner.lock()).scripted_failures.push_back(error);
    }

    /// Script the next `n` mutating calls to fail with clones of `error`.
    pub fn fail_times(&self, n: u32, error: &ProviderError) {
        let mut inner = relock(self.inner.lock());
        for _ in 0..n {
            inner.scripted_failures.push_back(error.clone());
        }
    }

    /// Mutating calls observed so far (create/update/delete, including
    /// scripted failures).
    pub fn mutating_calls(&self) -> u32 {
        relock(self.inner.lock()).mutating_calls
    }

    pub fn len(&self) -> usize {
        relock(self.inner.lock()).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, provider_id: &str) -> bool {
        relock(self.inner.lock()).records.contains_key(provider_id)
    }

    pub fn attributes(&self, provider_id: &str) -> Option<AttributeMap> {
        relock(self.inner.lock()).records.get(provider_id).cloned()
    }
}

fn take_failure(inner: &mut Inner) -> Option<ProviderError> {
    inner.mutating_calls += 1;
    inner.scripted_failures.pop_front()
}

#[async_trait]
impl ProviderAdapter for MemoryAdapter {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn create(&self, attributes: &AttributeMap) -> Result<String, ProviderError> {
        let mut inner = relock(self.inner.lock());
        if let Some(error) = take_failure(&mut inner) {
            return Err(error);
        }
        inner.next_id += 1;
        let id = format!("{}-{:04}", self.kind, inner.next_id);
        inner.records.insert(id.clone(), attributes.clone());
        Ok(id)
    }

    async fn read(&self, provider_id: &str) -> Result<Option<AttributeMap>, ProviderError> {
        Ok(relock(self.inner.lock()).records.get(provider_id).cloned())
    }

    async fn update(
        &self,
        provider_id: &str,
        attributes: &AttributeMap,
    ) -> Result<(), ProviderError> {
        let mut inner = relock(self.inner.lock());
        if let Some(error) = take_failure(&mut inner) {
            return Err(error);
        }
        match inner.records.get_mut(provider_id) {
            Some(existing) => {
                *existing = attributes.clone();
                Ok(())
            }
            None => Err(ProviderError::NotFound(provider_id.to_string())),
        }
    }

    async fn delete(&self, provider_id: &str) -> Result<(), ProviderError> {
        let mut inner = relock(self.inner.lock());
        if let Some(error) = take_failure(&mut inner) {
            return Err(error);
        }
        // Destroying an already-absent resource succeeds, so a crashed run
        // that deleted remotely but lost the state write can re-enter.
        inner.records.shift_remove(provider_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Value;

    fn attrs(cidr: &str) -> AttributeMap {
        AttributeMap::from_iter([("cidr".to_string(), Value::from(cidr))])
    }

    #[tokio::test]
    async fn test_create_allocates_sequential_ids() {
        let adapter = MemoryAdapter::new("network");
        let a = adapter.create(&attrs("10.0.0.0/16")).await.unwrap();
        let b = adapter.create(&attrs("10.1.0.0/16")).await.unwrap();
        assert_eq!(a, "network-0001");
        assert_eq!(b, "network-0002");
        assert_eq!(adapter.len(), 2);
    }

    #[tokio::test]
    async fn test_read_back_created_attributes() {
        let adapter = MemoryAdapter::new("network");
        let id = adapter.create(&attrs("10.0.0.0/16")).await.unwrap();
        let live = adapter.read(&id).await.unwrap().unwrap();
        assert_eq!(live["cidr"], Value::from("10.0.0.0/16"));
        assert!(adapter.read("network-9999").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_replaces_attributes() {
        let adapter = MemoryAdapter::new("network");
        let id = adapter.create(&attrs("10.0.0.0/16")).await.unwrap();
        adapter.update(&id, &attrs("10.9.0.0/16")).await.unwrap();
        assert_eq!(
            adapter.attributes(&id).unwrap()["cidr"],
            Value::from("10.9.0.0/16")
        );
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let adapter = MemoryAdapter::new("network");
        let err = adapter.update("network-0001", &attrs("x")).await.unwrap_err();
        assert_eq!(err, ProviderError::NotFound("network-0001".to_string()));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let adapter = MemoryAdapter::new("network");
        let id = adapter.create(&attrs("10.0.0.0/16")).await.unwrap();
        adapter.delete(&id).await.unwrap();
        adapter.delete(&id).await.unwrap();
        assert!(adapter.is_empty());
    }

    #[tokio::test]
    async fn test_scripted_failures_fire_in_order() {
        let adapter = MemoryAdapter::new("network");
        adapter.fail_times(2, &ProviderError::Transient("rate limited".into()));

        assert!(adapter.create(&attrs("a")).await.is_err());
        assert!(adapter.create(&attrs("b")).await.is_err());
        assert!(adapter.create(&attrs("c")).await.is_ok());
        assert_eq!(adapter.mutating_calls(), 3);
    }

    #[tokio::test]
    async fn test_reads_do_not_consume_failures() {
        let adapter = MemoryAdapter::new("network");
        adapter.fail_next(ProviderError::Permanent("quota".into()));
        assert!(adapter.read("network-0001").await.is_ok());
        assert!(adapter.create(&attrs("a")).await.is_err());
    }
}
