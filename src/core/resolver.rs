//! Reference resolution — substituting `ResourceRef` values with concrete
//! provider ids and applied attributes.
//!
//! Resolution is a lookup pass over a context of known resources, never
//! runtime string evaluation. The planner resolves leniently (unknown
//! targets become pending placeholders, finalized at apply time); the
//! executor resolves strictly once every dependency has completed.

use rustc_hash::FxHashMap;

use super::types::{AttributeMap, ResourceKey, ResourceRef, StateRecord, Value};

/// Attribute values available for reference, per resource.
///
/// Each entry holds the resource's applied attributes plus the synthetic
/// `id` attribute carrying the provider id.
#[derive(Debug, Clone, Default)]
pub struct ResolutionContext {
    values: FxHashMap<ResourceKey, AttributeMap>,
}

impl ResolutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the context from a state record.
    pub fn seed_record(&mut self, record: &StateRecord) {
        self.bind(record.key.clone(), &record.provider_id, &record.last_applied);
    }

    /// Bind a resource's resolved attributes and provider id, replacing any
    /// previously seeded values.
    pub fn bind(&mut self, key: ResourceKey, provider_id: &str, attributes: &AttributeMap) {
        let mut attrs = attributes.clone();
        attrs.insert("id".to_string(), Value::String(provider_id.to_string()));
        self.values.insert(key, attrs);
    }

    pub fn forget(&mut self, key: &ResourceKey) {
        self.values.remove(key);
    }

    /// Look up a reference target. `None` if the resource or attribute is
    /// unknown.
    pub fn lookup(&self, target: &ResourceRef) -> Option<&Value> {
        self.values.get(&target.key())?.get(&target.attribute)
    }

    /// Lenient resolution: unknown targets become `~pending(...)` string
    /// placeholders so a fingerprint can still be computed at plan time.
    pub fn resolve(&self, value: &Value) -> Value {
        match value {
            Value::Reference { target } => match self.lookup(target) {
                Some(resolved) => resolved.clone(),
                None => pending_placeholder(target),
            },
            Value::List(items) => Value::List(items.iter().map(|v| self.resolve(v)).collect()),
            Value::Map(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    pub fn resolve_attributes(&self, attributes: &AttributeMap) -> AttributeMap {
        attributes
            .iter()
            .map(|(k, v)| (k.clone(), self.resolve(v)))
            .collect()
    }

    /// Strict resolution: the first unresolved reference is returned as an
    /// error. Used at apply time, when every dependency has completed.
    pub fn resolve_strict(&self, value: &Value) -> Result<Value, ResourceRef> {
        match value {
            Value::Reference { target } => match self.lookup(target) {
                Some(resolved) => Ok(resolved.clone()),
                None => Err(target.clone()),
            },
            Value::List(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|v| self.resolve_strict(v))
                    .collect::<Result<_, _>>()?,
            )),
            Value::Map(map) => Ok(Value::Map(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), self.resolve_strict(v)?)))
                    .collect::<Result<_, _>>()?,
            )),
            other => Ok(other.clone()),
        }
    }

    pub fn resolve_attributes_strict(
        &self,
        attributes: &AttributeMap,
    ) -> Result<AttributeMap, ResourceRef> {
        attributes
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.resolve_strict(v)?)))
            .collect()
    }
}

fn pending_placeholder(target: &ResourceRef) -> Value {
    Value::String(format!("~pending({})", target))
}
