//! Executor — bounded-concurrency, dependency-respecting apply.
//!
//! A plan item becomes ready once every key it waits on has reached
//! terminal success; independent subgraphs run concurrently under a
//! semaphore sized to the concurrency limit, chains run strictly in
//! order. Provider ids created mid-run are bound into dependent attribute
//! maps just before the dependent starts (deferred binding). When a node
//! fails, its not-yet-started dependents are skipped transitively while
//! everything independent continues; cancellation stops scheduling but
//! lets in-flight calls finish, and never interrupts a state write after
//! the provider call has succeeded.

use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::error::{EngineError, StateError};
use super::fingerprint;
use super::resolver::ResolutionContext;
use super::state::StateStore;
use super::types::{
    ApplyOutcome, ApplyReport, ApplyResult, AttributeMap, Plan, PlanAction, PlanItem, ResourceKey,
    ResourceRef, ResourceSpec, StateRecord, Value,
};
use crate::journal::{self, Journal, RunEvent};
use crate::provider::{AdapterSet, ProviderAdapter, ProviderError};

/// Default bound on concurrent provider operations.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Bounded exponential backoff for transient provider failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Runs plans against a set of provider adapters, persisting state
/// per-resource as operations succeed.
pub struct Executor {
    adapters: AdapterSet,
    state: Arc<dyn StateStore>,
    concurrency: usize,
    retry: RetryPolicy,
    journal: Option<Arc<Journal>>,
}

impl Executor {
    pub fn new(adapters: AdapterSet, state: Arc<dyn StateStore>) -> Self {
        Self {
            adapters,
            state,
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            journal: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(Arc::new(journal));
        self
    }

    /// Apply a plan. The report enumerates every resource's outcome; a
    /// failure never hides unrelated successes.
    pub async fn apply(
        &self,
        plan: &Plan,
        outputs: &IndexMap<String, ResourceRef>,
        cancel: CancellationToken,
    ) -> Result<ApplyReport, EngineError> {
        let started = Instant::now();
        let run_id = journal::generate_run_id();
        info!(run_id = %run_id, resources = plan.items.len(), "apply started");
        self.journal(RunEvent::RunStarted {
            run_id: run_id.clone(),
            resources: plan.items.len() as u32,
        });

        let n = plan.items.len();
        let mut results: Vec<Option<ApplyResult>> = vec![None; n];

        let mut remaining: Vec<usize> = Vec::with_capacity(n);
        let mut dependents: FxHashMap<ResourceKey, Vec<usize>> = FxHashMap::default();
        for (i, item) in plan.items.iter().enumerate() {
            remaining.push(item.waits_on.len());
            for waited in &item.waits_on {
                dependents.entry(waited.clone()).or_default().push(i);
            }
        }

        let mut ctx = ResolutionContext::new();
        for item in &plan.items {
            if let Some(record) = &item.record {
                ctx.seed_record(record);
            }
        }

        // Quarantined records fail up front; their dependents are skipped.
        let mut quarantine_results: Vec<ApplyResult> = Vec::new();
        for (key, message) in &plan.quarantined {
            let error = StateError::Corrupt {
                key: key.clone(),
                message: message.clone(),
            };
            error!(resource = %key, "state record quarantined; operator intervention required");
            quarantine_results.push(ApplyResult {
                key: key.clone(),
                action: None,
                outcome: ApplyOutcome::Failed,
                provider_id: None,
                error: Some(error.to_string()),
            });
            self.skip_dependents(key, plan, &dependents, &mut results);
        }

        // NoOps are terminal immediately; nothing waits on a NoOp.
        for (i, item) in plan.items.iter().enumerate() {
            if results[i].is_none() && item.action == PlanAction::NoOp {
                results[i] = Some(ApplyResult {
                    key: item.key.clone(),
                    action: Some(PlanAction::NoOp),
                    outcome: ApplyOutcome::NoOp,
                    provider_id: item.record.as_ref().map(|r| r.provider_id.clone()),
                    error: None,
                });
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, TaskOutput)>();
        let mut inflight = 0usize;
        let mut queue: VecDeque<usize> = (0..n)
            .filter(|&i| results[i].is_none() && remaining[i] == 0)
            .collect();

        loop {
            while let Some(i) = queue.pop_front() {
                if results[i].is_some() {
                    continue;
                }
                let item = &plan.items[i];

                if cancel.is_cancelled() {
                    warn!(resource = %item.key, "run cancelled; not started");
                    self.journal(RunEvent::ResourceSkipped {
                        key: item.key.clone(),
                        reason: "run cancelled".to_string(),
                    });
                    results[i] = Some(skipped(item, "run cancelled"));
                    continue;
                }

                let Some(adapter) = self.adapters.get(&item.key.kind) else {
                    let error = ProviderError::UnknownKind(item.key.kind.clone());
                    self.fail_item(i, item, error.to_string(), plan, &dependents, &mut results);
                    continue;
                };

                // Deferred binding: references resolve now, after every
                // dependency has completed and bound its id.
                let attributes = match resolve_item(&ctx, item) {
                    Ok(attributes) => attributes,
                    Err(unresolved) => {
                        let error =
                            format!("unresolved reference {} at apply time", unresolved);
                        self.fail_item(i, item, error, plan, &dependents, &mut results);
                        continue;
                    }
                };

                let input = TaskInput {
                    key: item.key.clone(),
                    action: item.action,
                    attributes,
                    existing_id: item.record.as_ref().map(|r| r.provider_id.clone()),
                    dependencies: item
                        .spec
                        .as_ref()
                        .map(ResourceSpec::dependency_keys)
                        .unwrap_or_default(),
                };

                inflight += 1;
                let state = Arc::clone(&self.state);
                let retry = self.retry;
                let task_journal = self.journal.clone();
                let task_tx = tx.clone();
                let task_semaphore = Arc::clone(&semaphore);
                let task_cancel = cancel.clone();
                tokio::spawn(async move {
                    let _permit = task_semaphore
                        .acquire_owned()
                        .await
                        .expect("semaphore closed");
                    let output = run_operation(
                        input,
                        adapter,
                        state,
                        retry,
                        task_journal,
                        task_cancel,
                    )
                    .await;
                    let _ = task_tx.send((i, output));
                });
            }

            if inflight == 0 {
                break;
            }
            let Some((i, output)) = rx.recv().await else {
                break;
            };
            inflight -= 1;

            let item = &plan.items[i];
            if output.outcome == ApplyOutcome::Success {
                info!(resource = %item.key, action = %item.action, "applied");
                match item.action {
                    PlanAction::Delete => ctx.forget(&item.key),
                    _ => {
                        if let (Some(id), Some(resolved)) =
                            (&output.provider_id, &output.resolved)
                        {
                            ctx.bind(item.key.clone(), id, resolved);
                        }
                    }
                }
                results[i] = Some(ApplyResult {
                    key: item.key.clone(),
                    action: Some(item.action),
                    outcome: ApplyOutcome::Success,
                    provider_id: output.provider_id,
                    error: None,
                });
                if let Some(waiters) = dependents.get(&item.key) {
                    for &w in waiters {
                        remaining[w] = remaining[w].saturating_sub(1);
                        if remaining[w] == 0 && results[w].is_none() {
                            queue.push_back(w);
                        }
                    }
                }
            } else {
                error!(
                    resource = %item.key,
                    error = output.error.as_deref().unwrap_or("unknown"),
                    "apply failed"
                );
                results[i] = Some(ApplyResult {
                    key: item.key.clone(),
                    action: Some(item.action),
                    outcome: ApplyOutcome::Failed,
                    provider_id: output.provider_id,
                    error: output.error,
                });
                self.skip_dependents(&item.key, plan, &dependents, &mut results);
            }
        }

        // Only cancellation leaves items unreleased; failure propagation is
        // transitive and already recorded its skips.
        for (i, item) in plan.items.iter().enumerate() {
            if results[i].is_none() {
                self.journal(RunEvent::ResourceSkipped {
                    key: item.key.clone(),
                    reason: "run cancelled".to_string(),
                });
                results[i] = Some(skipped(item, "run cancelled"));
            }
        }

        let mut final_results: Vec<ApplyResult> = results.into_iter().flatten().collect();
        final_results.extend(quarantine_results);

        let mut resolved_outputs: IndexMap<String, Value> = IndexMap::new();
        for (name, target) in outputs {
            match ctx.lookup(target) {
                Some(value) => {
                    resolved_outputs.insert(name.clone(), value.clone());
                }
                None => {
                    warn!(output = %name, target = %target, "output target unresolved; omitted");
                }
            }
        }

        let report = ApplyReport {
            run_id: run_id.clone(),
            results: final_results,
            outputs: resolved_outputs,
            duration: started.elapsed(),
        };
        self.journal(RunEvent::RunCompleted {
            run_id,
            succeeded: report.count(ApplyOutcome::Success),
            unchanged: report.count(ApplyOutcome::NoOp),
            failed: report.count(ApplyOutcome::Failed),
            skipped: report.count(ApplyOutcome::Skipped),
            total_seconds: started.elapsed().as_secs_f64(),
        });
        Ok(report)
    }

    fn fail_item(
        &self,
        i: usize,
        item: &PlanItem,
        error: String,
        plan: &Plan,
        dependents: &FxHashMap<ResourceKey, Vec<usize>>,
        results: &mut [Option<ApplyResult>],
    ) {
        error!(resource = %item.key, error = %error, "cannot apply");
        self.journal(RunEvent::ResourceFailed {
            key: item.key.clone(),
            action: item.action,
            error: error.clone(),
        });
        results[i] = Some(ApplyResult {
            key: item.key.clone(),
            action: Some(item.action),
            outcome: ApplyOutcome::Failed,
            provider_id: None,
            error: Some(error),
        });
        self.skip_dependents(&item.key, plan, dependents, results);
    }

    /// Mark every not-yet-started transitive dependent of `from` skipped.
    fn skip_dependents(
        &self,
        from: &ResourceKey,
        plan: &Plan,
        dependents: &FxHashMap<ResourceKey, Vec<usize>>,
        results: &mut [Option<ApplyResult>],
    ) {
        let mut stack = vec![from.clone()];
        while let Some(key) = stack.pop() {
            let Some(waiters) = dependents.get(&key) else {
                continue;
            };
            for &i in waiters {
                if results[i].is_some() {
                    continue;
                }
                let item = &plan.items[i];
                let reason = format!("dependency {} did not complete", key);
                warn!(resource = %item.key, reason = %reason, "skipped");
                self.journal(RunEvent::ResourceSkipped {
                    key: item.key.clone(),
                    reason: reason.clone(),
                });
                results[i] = Some(ApplyResult {
                    key: item.key.clone(),
                    action: Some(item.action),
                    outcome: ApplyOutcome::Skipped,
                    provider_id: None,
                    error: Some(reason),
                });
                stack.push(item.key.clone());
            }
        }
    }

    fn journal(&self, event: RunEvent) {
        journal_event(&self.journal, event);
    }
}

/// Deletes need no attribute resolution; everything else resolves its spec
/// strictly.
fn resolve_item(ctx: &ResolutionContext, item: &PlanItem) -> Result<AttributeMap, ResourceRef> {
    match (&item.spec, item.action) {
        (_, PlanAction::Delete) | (None, _) => Ok(AttributeMap::new()),
        (Some(spec), _) => ctx.resolve_attributes_strict(&spec.attributes),
    }
}

struct TaskInput {
    key: ResourceKey,
    action: PlanAction,
    attributes: AttributeMap,
    existing_id: Option<String>,
    dependencies: Vec<ResourceKey>,
}

struct TaskOutput {
    outcome: ApplyOutcome,
    provider_id: Option<String>,
    resolved: Option<AttributeMap>,
    error: Option<String>,
}

async fn run_operation(
    input: TaskInput,
    adapter: Arc<dyn ProviderAdapter>,
    state: Arc<dyn StateStore>,
    retry: RetryPolicy,
    journal: Option<Arc<Journal>>,
    cancel: CancellationToken,
) -> TaskOutput {
    let started = Instant::now();
    journal_event(
        &journal,
        RunEvent::ResourceStarted {
            key: input.key.clone(),
            action: input.action,
        },
    );

    let call = call_with_retry(&input, adapter.as_ref(), retry, &cancel).await;
    let duration = started.elapsed().as_secs_f64();

    match call {
        Ok(new_id) => {
            let provider_id = new_id.or_else(|| input.existing_id.clone());
            // The state write and the success are one logical transaction;
            // cancellation never interrupts it at this point.
            let persisted = match input.action {
                PlanAction::Delete => state.remove(&input.key),
                _ => state.upsert(StateRecord {
                    key: input.key.clone(),
                    provider_id: provider_id.clone().unwrap_or_default(),
                    fingerprint: fingerprint::fingerprint(&input.attributes),
                    last_applied: input.attributes.clone(),
                    dependencies: input.dependencies.clone(),
                    applied_at: journal::now_rfc3339(),
                }),
            };
            match persisted {
                Ok(()) => {
                    journal_event(
                        &journal,
                        RunEvent::ResourceApplied {
                            key: input.key,
                            action: input.action,
                            provider_id: provider_id.clone(),
                            duration_seconds: duration,
                        },
                    );
                    TaskOutput {
                        outcome: ApplyOutcome::Success,
                        provider_id,
                        resolved: Some(input.attributes),
                        error: None,
                    }
                }
                Err(e) => {
                    let error = format!("provider call succeeded but state write failed: {}", e);
                    journal_event(
                        &journal,
                        RunEvent::ResourceFailed {
                            key: input.key,
                            action: input.action,
                            error: error.clone(),
                        },
                    );
                    TaskOutput {
                        outcome: ApplyOutcome::Failed,
                        provider_id,
                        resolved: None,
                        error: Some(error),
                    }
                }
            }
        }
        Err((provider_error, attempts)) => {
            let error = if attempts > 1 {
                format!("{} (after {} attempts)", provider_error, attempts)
            } else {
                provider_error.to_string()
            };
            journal_event(
                &journal,
                RunEvent::ResourceFailed {
                    key: input.key,
                    action: input.action,
                    error: error.clone(),
                },
            );
            TaskOutput {
                outcome: ApplyOutcome::Failed,
                provider_id: None,
                resolved: None,
                error: Some(error),
            }
        }
    }
}

/// Call the adapter, retrying transient failures with bounded exponential
/// backoff. Cancellation interrupts retry waits, never the call itself.
async fn call_with_retry(
    input: &TaskInput,
    adapter: &dyn ProviderAdapter,
    retry: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Option<String>, (ProviderError, u32)> {
    let mut attempt = 1u32;
    loop {
        let result = match input.action {
            PlanAction::Create => adapter.create(&input.attributes).await.map(Some),
            PlanAction::Update => {
                let id = input.existing_id.as_deref().unwrap_or_default();
                // Reconciliation read-back: the record may be stale if the
                // resource was destroyed out-of-band or a previous run
                // crashed after the provider call.
                match adapter.read(id).await {
                    Ok(Some(_)) => adapter.update(id, &input.attributes).await.map(|()| None),
                    Ok(None) => {
                        warn!(
                            resource = %input.key,
                            provider_id = id,
                            "recorded resource missing in provider; recreating"
                        );
                        adapter.create(&input.attributes).await.map(Some)
                    }
                    Err(error) => Err(error),
                }
            }
            PlanAction::Delete => {
                let id = input.existing_id.as_deref().unwrap_or_default();
                adapter.delete(id).await.map(|()| None)
            }
            // NoOps are resolved without scheduling.
            PlanAction::NoOp => return Ok(None),
        };
        match result {
            Ok(id) => return Ok(id),
            Err(error) if error.is_transient() && attempt < retry.max_attempts => {
                let delay = retry.backoff(attempt);
                warn!(
                    resource = %input.key,
                    error = %error,
                    attempt,
                    "transient provider failure; backing off"
                );
                tokio::select! {
                    () = tokio::time::sleep(delay) => attempt += 1,
                    () = cancel.cancelled() => return Err((error, attempt)),
                }
            }
            Err(error) => return Err((error, attempt)),
        }
    }
}

fn journal_event(journal: &Option<Arc<Journal>>, event: RunEvent) {
    if let Some(journal) = journal {
        if let Err(e) = journal.append(event) {
            warn!(error = %e, "journal append failed");
        }
    }
}

fn skipped(item: &PlanItem, reason: &str) -> ApplyResult {
    ApplyResult {
        key: item.key.clone(),
        action: Some(item.action),
        outcome: ApplyOutcome::Skipped,
        provider_id: None,
        error: Some(reason.to_string()),
    }
}
