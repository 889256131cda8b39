//! CLI subcommands — init, validate, plan, apply, state.
//!
//! Exit codes: 0 full success, 2 partial failure with some resources
//! applied, 1 fatal error (nothing applied).

use clap::Subcommand;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::core::error::EngineError;
use crate::core::executor::Executor;
use crate::core::graph::DependencyGraph;
use crate::core::planner::{self, DeletePolicy};
use crate::core::state::{DirStore, RunLock, StateStore};
use crate::core::types::{ApplyOutcome, Declaration, Plan};
use crate::journal::Journal;
use crate::provider::memory::MemoryAdapter;
use crate::provider::AdapterSet;

pub const EXIT_OK: i32 = 0;
pub const EXIT_PARTIAL: i32 = 2;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new conciliar project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate a declaration without touching state or providers
    Validate {
        /// Path to the declaration
        #[arg(short, long, default_value = "conciliar.yaml")]
        file: PathBuf,
    },

    /// Show the execution plan (diff desired vs recorded state, no mutation)
    Plan {
        /// Path to the declaration
        #[arg(short, long, default_value = "conciliar.yaml")]
        file: PathBuf,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Leave orphaned resources in place instead of planning deletes
        #[arg(long)]
        keep_orphans: bool,
    },

    /// Plan and execute against the in-process simulator adapters
    Apply {
        /// Path to the declaration
        #[arg(short, long, default_value = "conciliar.yaml")]
        file: PathBuf,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Leave orphaned resources in place instead of planning deletes
        #[arg(long)]
        keep_orphans: bool,

        /// Maximum concurrent provider operations
        #[arg(long, default_value_t = 10)]
        concurrency: usize,
    },

    /// Show recorded state
    State {
        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },
}

/// Dispatch a CLI command; returns the process exit code.
pub fn dispatch(cmd: Commands) -> Result<i32, EngineError> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Plan {
            file,
            state_dir,
            keep_orphans,
        } => cmd_plan(&file, &state_dir, delete_policy(keep_orphans)),
        Commands::Apply {
            file,
            state_dir,
            keep_orphans,
            concurrency,
        } => cmd_apply(&file, &state_dir, delete_policy(keep_orphans), concurrency),
        Commands::State { state_dir } => cmd_state(&state_dir),
    }
}

fn delete_policy(keep_orphans: bool) -> DeletePolicy {
    if keep_orphans {
        DeletePolicy::Deferred
    } else {
        DeletePolicy::Combined
    }
}

fn cmd_init(path: &Path) -> Result<i32, EngineError> {
    let decl_path = path.join("conciliar.yaml");
    if decl_path.exists() {
        return Err(EngineError::Config(
            crate::core::error::ConfigError::Io {
                path: decl_path,
                message: "already exists".to_string(),
            },
        ));
    }

    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir)
        .map_err(|e| crate::core::error::StateError::Io(e.to_string()))?;

    let template = r#"resources:
  - kind: network
    name: main
    attributes:
      cidr: 10.0.0.0/16

  - kind: subnet
    name: app
    attributes:
      network: { "$ref": "network.main.id" }
      cidr: 10.0.1.0/24

outputs:
  network_id: network.main.id
"#;
    std::fs::write(&decl_path, template)
        .map_err(|e| crate::core::error::StateError::Io(e.to_string()))?;

    println!("Initialized conciliar project at {}", path.display());
    println!("  Created: {}", decl_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(EXIT_OK)
}

fn cmd_validate(file: &Path) -> Result<i32, EngineError> {
    let decl = Declaration::from_path(file)?;
    decl.validate_outputs()?;
    let graph = DependencyGraph::build(decl.resources)?;
    println!(
        "OK: {} resources, {} outputs",
        graph.len(),
        decl.outputs.len()
    );
    Ok(EXIT_OK)
}

fn load_plan(
    file: &Path,
    store: &DirStore,
    policy: DeletePolicy,
) -> Result<(Declaration, Plan), EngineError> {
    let decl = Declaration::from_path(file)?;
    decl.validate_outputs()?;
    let graph = DependencyGraph::build(decl.resources.clone())?;
    let snapshot = store.snapshot()?;
    Ok((decl, planner::plan(&graph, &snapshot, policy)))
}

fn print_plan(plan: &Plan) {
    for item in &plan.items {
        println!("  {:7} {:30} {}", item.action.to_string(), item.key.to_string(), item.reason);
    }
    for (key, message) in &plan.quarantined {
        println!("  {:7} {:30} corrupt state record: {}", "!", key.to_string(), message);
    }
    println!("Plan: {}", plan.summary());
}

fn cmd_plan(file: &Path, state_dir: &Path, policy: DeletePolicy) -> Result<i32, EngineError> {
    let store = DirStore::open(state_dir)?;
    let _lock = RunLock::acquire(store.root())?;
    warn_unfinished(state_dir);

    let (_, plan) = load_plan(file, &store, policy)?;
    print_plan(&plan);
    if !plan.has_changes() && plan.quarantined.is_empty() {
        println!("No changes. Desired state matches recorded state.");
    }
    Ok(EXIT_OK)
}

fn cmd_apply(
    file: &Path,
    state_dir: &Path,
    policy: DeletePolicy,
    concurrency: usize,
) -> Result<i32, EngineError> {
    let store = DirStore::open(state_dir)?;
    let _lock = RunLock::acquire(store.root())?;
    warn_unfinished(state_dir);

    let (decl, plan) = load_plan(file, &store, policy)?;
    print_plan(&plan);
    if !plan.has_changes() && plan.quarantined.is_empty() {
        println!("No changes. Nothing to apply.");
        return Ok(EXIT_OK);
    }

    // Real cloud adapters are external collaborators; the shipped CLI runs
    // against the in-process simulator, one adapter per declared kind.
    let mut adapters = AdapterSet::new();
    for item in &plan.items {
        if adapters.get(&item.key.kind).is_none() {
            adapters.register(Arc::new(MemoryAdapter::new(item.key.kind.clone())));
        }
    }

    let store: Arc<dyn StateStore> = Arc::new(store);
    let executor = Executor::new(adapters, store)
        .with_concurrency(concurrency)
        .with_journal(Journal::new(state_dir.join("events.jsonl")));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| crate::core::error::StateError::Io(e.to_string()))?;
    let report = runtime.block_on(executor.apply(&plan, &decl.outputs, CancellationToken::new()))?;

    println!();
    for result in &report.results {
        let detail = result
            .error
            .as_deref()
            .or(result.provider_id.as_deref())
            .unwrap_or("");
        println!("  {:7} {:30} {}", result.outcome.to_string(), result.key.to_string(), detail);
    }
    println!(
        "Apply complete in {:.1}s: {} succeeded, {} unchanged, {} failed, {} skipped",
        report.duration.as_secs_f64(),
        report.count(ApplyOutcome::Success),
        report.count(ApplyOutcome::NoOp),
        report.count(ApplyOutcome::Failed),
        report.count(ApplyOutcome::Skipped),
    );

    if !report.outputs.is_empty() {
        println!("\nOutputs:");
        for (name, value) in &report.outputs {
            let rendered = serde_json::to_string(value).unwrap_or_else(|_| "?".to_string());
            println!("  {} = {}", name, rendered);
        }
    }

    if report.fully_converged() {
        Ok(EXIT_OK)
    } else {
        Ok(EXIT_PARTIAL)
    }
}

fn cmd_state(state_dir: &Path) -> Result<i32, EngineError> {
    let store = DirStore::open(state_dir)?;
    let snapshot = store.snapshot()?;

    if snapshot.records.is_empty() && snapshot.corrupt.is_empty() {
        println!("No recorded state in {}", state_dir.display());
        return Ok(EXIT_OK);
    }
    for record in &snapshot.records {
        println!(
            "  {:30} {:20} applied {}",
            record.key.to_string(),
            record.provider_id,
            record.applied_at
        );
    }
    for (key, message) in &snapshot.corrupt {
        println!("  {:30} CORRUPT: {}", key.to_string(), message);
    }
    Ok(EXIT_OK)
}

/// Surface operations a previous run started but never recorded a result
/// for — the provider may hold resources the state store does not know
/// about.
fn warn_unfinished(state_dir: &Path) {
    let path = state_dir.join("events.jsonl");
    if !path.exists() {
        return;
    }
    if let Ok(open) = Journal::unfinished(&path) {
        for key in open {
            tracing::warn!(
                resource = %key,
                "previous run was interrupted mid-operation; verify provider state"
            );
        }
    }
}
