//! Core data model — resources, references, values, plans, state records.
//!
//! Everything the planner emits is immutable once built; the executor only
//! reads plan items and writes `ApplyResult`s.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use super::error::ConfigError;

/// Attribute map of a resource, declaration order preserved.
pub type AttributeMap = IndexMap<String, Value>;

// ============================================================================
// Identity
// ============================================================================

/// Unique identity of a resource within a declaration: `(kind, name)`.
///
/// Serialized as the string `"kind.name"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceKey {
    pub kind: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

impl FromStr for ResourceKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(2, '.');
        match (parts.next(), parts.next()) {
            (Some(kind), Some(name)) if !kind.is_empty() && !name.is_empty() => {
                Ok(Self::new(kind, name))
            }
            _ => Err(format!("invalid resource key '{}', expected 'kind.name'", s)),
        }
    }
}

impl TryFrom<String> for ResourceKey {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ResourceKey> for String {
    fn from(key: ResourceKey) -> Self {
        key.to_string()
    }
}

/// A weak link to another resource's attribute: `kind.name.attribute`.
///
/// Resolved by lookup against the declaration and state; never owns the
/// target. The attribute `"id"` always resolves to the provider id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceRef {
    pub kind: String,
    pub name: String,
    pub attribute: String,
}

impl ResourceRef {
    pub fn new(
        kind: impl Into<String>,
        name: impl Into<String>,
        attribute: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            attribute: attribute.into(),
        }
    }

    /// Identity of the referenced resource.
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.kind.clone(), self.name.clone())
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.kind, self.name, self.attribute)
    }
}

impl FromStr for ResourceRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(kind), Some(name), Some(attribute))
                if !kind.is_empty() && !name.is_empty() && !attribute.is_empty() =>
            {
                Ok(Self::new(kind, name, attribute))
            }
            _ => Err(format!(
                "invalid resource reference '{}', expected 'kind.name.attribute'",
                s
            )),
        }
    }
}

impl TryFrom<String> for ResourceRef {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ResourceRef> for String {
    fn from(r: ResourceRef) -> Self {
        r.to_string()
    }
}

// ============================================================================
// Values
// ============================================================================

/// An attribute value — scalar, list, map, or a reference to another
/// resource's attribute.
///
/// References are written `{"$ref": "kind.name.attribute"}` in declarations
/// and substituted with concrete values during resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Reference {
        #[serde(rename = "$ref")]
        target: ResourceRef,
    },
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
}

impl Value {
    pub fn reference(target: ResourceRef) -> Self {
        Self::Reference { target }
    }

    pub fn as_reference(&self) -> Option<&ResourceRef> {
        match self {
            Self::Reference { target } => Some(target),
            _ => None,
        }
    }

    /// All references contained in this value, depth-first.
    pub fn references(&self) -> Vec<&ResourceRef> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a ResourceRef>) {
        match self {
            Self::Reference { target } => out.push(target),
            Self::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Map(map) => {
                for item in map.values() {
                    item.collect_references(out);
                }
            }
            _ => {}
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

// ============================================================================
// Declaration
// ============================================================================

/// Desired state of a single resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub kind: String,
    pub name: String,

    #[serde(default)]
    pub attributes: AttributeMap,

    /// Explicit ordering hints, applied in addition to implicit reference
    /// edges.
    #[serde(default)]
    pub depends_on: Vec<ResourceKey>,
}

impl ResourceSpec {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            attributes: AttributeMap::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn depends(mut self, key: ResourceKey) -> Self {
        self.depends_on.push(key);
        self
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.kind.clone(), self.name.clone())
    }

    /// Keys this resource must be applied after: implicit attribute
    /// references plus explicit `depends_on`, deduplicated.
    pub fn dependency_keys(&self) -> Vec<ResourceKey> {
        let mut keys: Vec<ResourceKey> = self
            .attributes
            .values()
            .flat_map(Value::references)
            .map(ResourceRef::key)
            .collect();
        keys.extend(self.depends_on.iter().cloned());
        keys.sort();
        keys.dedup();
        keys
    }
}

/// A full normalized declaration: the engine's input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Declaration {
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,

    /// Named values extracted from final resource attributes after apply.
    #[serde(default)]
    pub outputs: IndexMap<String, ResourceRef>,
}

impl Declaration {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        serde_yaml_ng::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml_ng::from_str(yaml).map_err(|e| ConfigError::Parse {
            path: "<inline>".into(),
            message: e.to_string(),
        })
    }

    /// Check that every declared output targets a declared resource.
    /// Resource-level problems (duplicates, unresolved references, cycles)
    /// are detected at graph build.
    pub fn validate_outputs(&self) -> Result<(), ConfigError> {
        for (name, target) in &self.outputs {
            if !self.resources.iter().any(|r| r.key() == target.key()) {
                return Err(ConfigError::UnresolvedOutput {
                    name: name.clone(),
                    target: target.key(),
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// State
// ============================================================================

/// Durable record of the last successful apply of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub key: ResourceKey,

    /// Identity assigned by the provider at create time.
    pub provider_id: String,

    /// BLAKE3 fingerprint of the fully-resolved attributes at apply time.
    pub fingerprint: String,

    /// The resolved attributes that were applied.
    pub last_applied: AttributeMap,

    /// Dependency keys at apply time; orphan deletes are ordered over these
    /// once the declaration no longer contains the resource.
    #[serde(default)]
    pub dependencies: Vec<ResourceKey>,

    pub applied_at: String,
}

// ============================================================================
// Plan
// ============================================================================

/// Action to take on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Create,
    Update,
    Delete,
    NoOp,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
            Self::NoOp => write!(f, "NO-OP"),
        }
    }
}

/// A single planned operation. Immutable once emitted.
#[derive(Debug, Clone)]
pub struct PlanItem {
    pub key: ResourceKey,
    pub action: PlanAction,

    /// Human-readable classification rationale.
    pub reason: String,

    /// Desired spec; present for Create/Update/NoOp.
    pub spec: Option<ResourceSpec>,

    /// Last-known state; present for Update/Delete/NoOp.
    pub record: Option<StateRecord>,

    /// Plan keys that must reach terminal success before this item may
    /// start: dependency keys for Create/Update, recorded dependent keys
    /// for Delete.
    pub waits_on: Vec<ResourceKey>,
}

/// Summary counts over a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub to_create: u32,
    pub to_update: u32,
    pub to_delete: u32,
    pub unchanged: u32,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete, {} unchanged",
            self.to_create, self.to_update, self.to_delete, self.unchanged
        )
    }
}

/// Ordered execution plan: a valid linearization of the dependency graph.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub items: Vec<PlanItem>,

    /// Resources whose state record is unreadable. Excluded from `items`,
    /// failed at apply, never auto-deleted; dependents are skipped.
    pub quarantined: Vec<(ResourceKey, String)>,
}

impl Plan {
    pub fn get(&self, key: &ResourceKey) -> Option<&PlanItem> {
        self.items.iter().find(|item| &item.key == key)
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for item in &self.items {
            match item.action {
                PlanAction::Create => summary.to_create += 1,
                PlanAction::Update => summary.to_update += 1,
                PlanAction::Delete => summary.to_delete += 1,
                PlanAction::NoOp => summary.unchanged += 1,
            }
        }
        summary
    }

    /// True if the plan contains any mutating operation.
    pub fn has_changes(&self) -> bool {
        self.items
            .iter()
            .any(|item| item.action != PlanAction::NoOp)
    }
}

// ============================================================================
// Apply results
// ============================================================================

/// Terminal outcome of one resource during an apply run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    Success,
    NoOp,
    Failed,
    Skipped,
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::NoOp => write!(f, "NO-OP"),
            Self::Failed => write!(f, "FAILED"),
            Self::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// The authoritative record of what happened to one resource.
#[derive(Debug, Clone)]
pub struct ApplyResult {
    pub key: ResourceKey,

    /// Planned action; `None` for quarantined resources that never made it
    /// into the plan.
    pub action: Option<PlanAction>,

    pub outcome: ApplyOutcome,
    pub provider_id: Option<String>,
    pub error: Option<String>,
}

/// Full result of an apply run — every resource's outcome plus the
/// declared outputs that resolved.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub run_id: String,
    pub results: Vec<ApplyResult>,
    pub outputs: IndexMap<String, Value>,
    pub duration: std::time::Duration,
}

impl ApplyReport {
    pub fn count(&self, outcome: ApplyOutcome) -> u32 {
        let mut n = 0u32;
        for result in &self.results {
            if result.outcome == outcome {
                n += 1;
            }
        }
        n
    }

    /// True when no resource failed or was skipped.
    pub fn fully_converged(&self) -> bool {
        self.results.iter().all(|r| {
            matches!(r.outcome, ApplyOutcome::Success | ApplyOutcome::NoOp)
        })
    }

    pub fn result(&self, key: &ResourceKey) -> Option<&ApplyResult> {
        self.results.iter().find(|r| &r.key == key)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_key_roundtrip() {
        let key: ResourceKey = "network.main".parse().unwrap();
        assert_eq!(key.kind, "network");
        assert_eq!(key.name, "main");
        assert_eq!(key.to_string(), "network.main");
    }

    #[test]
    fn test_resource_key_rejects_malformed() {
        assert!("network".parse::<ResourceKey>().is_err());
        assert!(".main".parse::<ResourceKey>().is_err());
        assert!("network.".parse::<ResourceKey>().is_err());
    }

    #[test]
    fn test_resource_ref_roundtrip() {
        let r: ResourceRef = "network.main.id".parse().unwrap();
        assert_eq!(r.kind, "network");
        assert_eq!(r.name, "main");
        assert_eq!(r.attribute, "id");
        assert_eq!(r.key(), ResourceKey::new("network", "main"));
    }

    #[test]
    fn test_resource_ref_rejects_missing_attribute() {
        assert!("network.main".parse::<ResourceRef>().is_err());
        assert!("network.main.".parse::<ResourceRef>().is_err());
    }

    #[test]
    fn test_value_parses_reference_marker() {
        let value: Value = serde_yaml_ng::from_str(r#"{ "$ref": "network.main.id" }"#).unwrap();
        let target = value.as_reference().unwrap();
        assert_eq!(target.to_string(), "network.main.id");
    }

    #[test]
    fn test_value_plain_map_is_not_a_reference() {
        let value: Value = serde_yaml_ng::from_str("{ cidr: 10.0.0.0/16 }").unwrap();
        assert!(value.as_reference().is_none());
        assert!(matches!(value, Value::Map(_)));
    }

    #[test]
    fn test_value_scalars() {
        assert!(matches!(
            serde_yaml_ng::from_str::<Value>("true").unwrap(),
            Value::Bool(true)
        ));
        assert!(matches!(
            serde_yaml_ng::from_str::<Value>("3").unwrap(),
            Value::Integer(3)
        ));
        assert!(matches!(
            serde_yaml_ng::from_str::<Value>("3.5").unwrap(),
            Value::Float(_)
        ));
        assert!(matches!(
            serde_yaml_ng::from_str::<Value>("hello").unwrap(),
            Value::String(_)
        ));
    }

    #[test]
    fn test_value_collects_nested_references() {
        let yaml = r#"
interfaces:
  - { "$ref": "network.main.id" }
  - { "$ref": "subnet.app.id" }
"#;
        let value: Value = serde_yaml_ng::from_str(yaml).unwrap();
        let refs = value.references();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].to_string(), "network.main.id");
        assert_eq!(refs[1].to_string(), "subnet.app.id");
    }

    #[test]
    fn test_spec_dependency_keys_deduplicates() {
        let spec = ResourceSpec::new("cluster", "main")
            .attr(
                "subnet",
                Value::reference("subnet.app.id".parse().unwrap()),
            )
            .attr(
                "subnet_again",
                Value::reference("subnet.app.cidr".parse().unwrap()),
            )
            .depends(ResourceKey::new("subnet", "app"));
        assert_eq!(spec.dependency_keys(), vec![ResourceKey::new("subnet", "app")]);
    }

    #[test]
    fn test_declaration_parses_normalized_yaml() {
        let yaml = r#"
resources:
  - kind: network
    name: main
    attributes:
      cidr: 10.0.0.0/16
  - kind: subnet
    name: app
    attributes:
      network: { "$ref": "network.main.id" }
    depends_on: [network.main]
outputs:
  network_id: network.main.id
"#;
        let decl = Declaration::from_yaml(yaml).unwrap();
        assert_eq!(decl.resources.len(), 2);
        assert_eq!(decl.resources[1].depends_on, vec![ResourceKey::new("network", "main")]);
        assert_eq!(decl.outputs["network_id"].attribute, "id");
        decl.validate_outputs().unwrap();
    }

    #[test]
    fn test_declaration_rejects_unresolved_output() {
        let yaml = r#"
resources:
  - kind: network
    name: main
outputs:
  endpoint: cluster.main.endpoint
"#;
        let decl = Declaration::from_yaml(yaml).unwrap();
        assert!(decl.validate_outputs().is_err());
    }

    #[test]
    fn test_plan_action_display() {
        assert_eq!(PlanAction::Create.to_string(), "CREATE");
        assert_eq!(PlanAction::NoOp.to_string(), "NO-OP");
    }

    #[test]
    fn test_apply_outcome_display() {
        assert_eq!(ApplyOutcome::Success.to_string(), "SUCCESS");
        assert_eq!(ApplyOutcome::Skipped.to_string(), "SKIPPED");
    }

    #[test]
    fn test_plan_summary_counts() {
        let plan = Plan {
            items: vec![
                PlanItem {
                    key: ResourceKey::new("network", "main"),
                    action: PlanAction::Create,
                    reason: String::new(),
                    spec: None,
                    record: None,
                    waits_on: vec![],
                },
                PlanItem {
                    key: ResourceKey::new("subnet", "app"),
                    action: PlanAction::NoOp,
                    reason: String::new(),
                    spec: None,
                    record: None,
                    waits_on: vec![],
                },
            ],
            quarantined: vec![],
        };
        let summary = plan.summary();
        assert_eq!(summary.to_create, 1);
        assert_eq!(summary.unchanged, 1);
        assert!(plan.has_changes());
        assert_eq!(summary.to_string(), "1 to create, 0 to update, 0 to delete, 1 unchanged");
    }

    #[test]
    fn test_state_record_yaml_roundtrip() {
        let record = StateRecord {
            key: ResourceKey::new("network", "main"),
            provider_id: "network-0001".to_string(),
            fingerprint: "blake3:abc".to_string(),
            last_applied: AttributeMap::from_iter([(
                "cidr".to_string(),
                Value::from("10.0.0.0/16"),
            )]),
            dependencies: vec![],
            applied_at: "2026-08-07T12:00:00Z".to_string(),
        };
        let yaml = serde_yaml_ng::to_string(&record).unwrap();
        let parsed: StateRecord = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(parsed, record);
    }
}
