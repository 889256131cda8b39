//! Provider adapter boundary.
//!
//! The engine is adapter-agnostic: one `ProviderAdapter` per resource kind
//! performs the real create/read/update/delete calls, and tags every
//! failure transient or permanent so the executor knows whether to retry.

pub mod memory;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::core::types::AttributeMap;

/// Failure reported by an adapter, tagged for retry classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Timeouts, rate limits — retried with backoff.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// The provider rejected the operation; retrying cannot help.
    #[error("permanent provider failure: {0}")]
    Permanent(String),

    /// The provider has no resource with the given id.
    #[error("provider has no resource with id '{0}'")]
    NotFound(String),

    /// No adapter is registered for the resource kind.
    #[error("no provider adapter registered for kind '{0}'")]
    UnknownKind(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Capability set the engine depends on, per resource kind.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Resource kind this adapter serves.
    fn kind(&self) -> &str;

    /// Create a resource; returns the provider-assigned id.
    async fn create(&self, attributes: &AttributeMap) -> Result<String, ProviderError>;

    /// Read a resource's live attributes. `Ok(None)` when it no longer
    /// exists.
    async fn read(&self, provider_id: &str) -> Result<Option<AttributeMap>, ProviderError>;

    /// Update a resource in place.
    async fn update(
        &self,
        provider_id: &str,
        attributes: &AttributeMap,
    ) -> Result<(), ProviderError>;

    /// Destroy a resource. Destroying an already-absent resource succeeds.
    async fn delete(&self, provider_id: &str) -> Result<(), ProviderError>;
}

/// Registry of adapters keyed by resource kind.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: FxHashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.kind().to_string(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}
