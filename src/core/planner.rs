//! Plan generation — diff desired state against the state snapshot.
//!
//! Creates and updates follow the graph's topological order; deletes of
//! orphaned records follow the reverse order of their recorded dependency
//! edges so nothing is destroyed while a dependent still exists. NoOp
//! items stay in the plan for visibility.

use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use super::fingerprint;
use super::graph::DependencyGraph;
use super::resolver::ResolutionContext;
use super::state::StateSnapshot;
use super::types::{Plan, PlanAction, PlanItem, ResourceKey, StateRecord};

/// Whether orphaned state records are destroyed in the same run as creates
/// and updates, or left for a separate destroy pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Single combined plan; deletes appended in reverse dependency order.
    #[default]
    Combined,
    /// Orphans are left in place and reported by `state` inspection only.
    Deferred,
}

/// Generate an execution plan from a built graph and a state snapshot.
pub fn plan(graph: &DependencyGraph, state: &StateSnapshot, policy: DeletePolicy) -> Plan {
    let mut ctx = ResolutionContext::new();
    let mut records: FxHashMap<ResourceKey, &StateRecord> = FxHashMap::default();
    for record in &state.records {
        ctx.seed_record(record);
        records.insert(record.key.clone(), record);
    }
    let corrupt: FxHashSet<ResourceKey> =
        state.corrupt.iter().map(|(key, _)| key.clone()).collect();

    let mut actions: FxHashMap<ResourceKey, PlanAction> = FxHashMap::default();
    let mut items = Vec::new();

    for spec in graph.in_topo_order() {
        let key = spec.key();
        if corrupt.contains(&key) {
            // Quarantined below; no plan item is emitted.
            continue;
        }

        let (action, reason, record) = match records.get(&key) {
            None => (
                PlanAction::Create,
                "not present in state".to_string(),
                None,
            ),
            Some(record) => {
                let resolved = ctx.resolve_attributes(&spec.attributes);
                let desired = fingerprint::fingerprint(&resolved);
                if desired == record.fingerprint {
                    (
                        PlanAction::NoOp,
                        "fingerprint unchanged".to_string(),
                        Some((*record).clone()),
                    )
                } else {
                    (
                        PlanAction::Update,
                        format!(
                            "fingerprint drift ({} -> {})",
                            short_hash(&record.fingerprint),
                            short_hash(&desired)
                        ),
                        Some((*record).clone()),
                    )
                }
            }
        };
        actions.insert(key.clone(), action);

        // Prerequisites: dependencies that still need work, plus corrupt
        // dependencies (which fail at apply and skip this item). A NoOp
        // needs no work, so it waits on nothing and nothing can skip it.
        let waits_on: Vec<ResourceKey> = if action == PlanAction::NoOp {
            Vec::new()
        } else {
            graph
                .dependency_keys(&key)
                .into_iter()
                .filter(|dep| {
                    corrupt.contains(dep)
                        || matches!(
                            actions.get(dep),
                            Some(PlanAction::Create | PlanAction::Update)
                        )
                })
                .collect()
        };

        items.push(PlanItem {
            key,
            action,
            reason,
            spec: Some(spec.clone()),
            record,
            waits_on,
        });
    }

    if policy == DeletePolicy::Combined {
        items.extend(plan_deletes(graph, state, &corrupt));
    }

    Plan {
        items,
        quarantined: state.corrupt.clone(),
    }
}

/// Delete items for records no longer declared, ordered dependent-first
/// over the dependency edges recorded at apply time.
fn plan_deletes(
    graph: &DependencyGraph,
    state: &StateSnapshot,
    corrupt: &FxHashSet<ResourceKey>,
) -> Vec<PlanItem> {
    let mut orphans: Vec<&StateRecord> = state
        .records
        .iter()
        .filter(|r| !graph.contains(&r.key) && !corrupt.contains(&r.key))
        .collect();
    orphans.sort_by(|a, b| a.key.cmp(&b.key));

    let index: FxHashMap<&ResourceKey, usize> = orphans
        .iter()
        .enumerate()
        .map(|(i, r)| (&r.key, i))
        .collect();

    // Edge dependent -> dependency: the dependent is deleted first.
    let n = orphans.len();
    let mut delete_after: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut blockers: Vec<usize> = vec![0; n];
    for (i, record) in orphans.iter().enumerate() {
        for dep in &record.dependencies {
            if let Some(&j) = index.get(dep) {
                delete_after[i].push(j);
                blockers[j] += 1;
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|&i| blockers[i] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(current)) = ready.pop() {
        order.push(current);
        for &dependency in &delete_after[current] {
            blockers[dependency] -= 1;
            if blockers[dependency] == 0 {
                ready.push(Reverse(dependency));
            }
        }
    }

    // Recorded edges cannot cycle for records the executor wrote; if
    // hand-edited state does, fall back to key order for the remainder.
    if order.len() != n {
        let placed: FxHashSet<usize> = order.iter().copied().collect();
        tracing::warn!("recorded dependencies contain a cycle; deleting remainder in key order");
        order.extend((0..n).filter(|i| !placed.contains(i)));
    }

    order
        .into_iter()
        .map(|i| {
            let record = orphans[i];
            // A delete waits on the deletes of everything that recorded a
            // dependency on it.
            let waits_on: Vec<ResourceKey> = orphans
                .iter()
                .filter(|other| other.dependencies.contains(&record.key))
                .map(|other| other.key.clone())
                .collect();
            PlanItem {
                key: record.key.clone(),
                action: PlanAction::Delete,
                reason: "no longer declared".to_string(),
                spec: None,
                record: Some(record.clone()),
                waits_on,
            }
        })
        .collect()
}

fn short_hash(fingerprint: &str) -> &str {
    let hex = fingerprint.strip_prefix("blake3:").unwrap_or(fingerprint);
    &hex[..hex.len().min(12)]
}
