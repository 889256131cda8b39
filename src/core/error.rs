//! Error taxonomy for the engine.
//!
//! Configuration errors abort before any provider call; state and provider
//! errors are scoped to the affected resources and surface in the final
//! report.

use std::path::PathBuf;
use thiserror::Error;

use super::types::ResourceKey;

/// Fatal declaration problems. Fully recoverable by fixing the input.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("duplicate resource declaration: {0}")]
    DuplicateResource(ResourceKey),

    #[error("resource {from} references undeclared resource {to}")]
    UnresolvedReference { from: ResourceKey, to: ResourceKey },

    #[error("dependency cycle detected: {}", join_keys(.path))]
    Cycle { path: Vec<ResourceKey> },

    #[error("output '{name}' references undeclared resource {target}")]
    UnresolvedOutput { name: String, target: ResourceKey },

    #[error("cannot read declaration {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("invalid declaration {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// State store failures.
#[derive(Debug, Clone, Error)]
pub enum StateError {
    /// Another run holds the state directory. Surfaced immediately, never
    /// retried; the user must rerun once the other run finishes.
    #[error("state directory is locked by another run (held by {holder})")]
    Locked { holder: String },

    /// A state record exists but cannot be read. Fatal for that resource
    /// only; the record is never auto-deleted.
    #[error("state record for {key} is corrupt: {message}")]
    Corrupt { key: ResourceKey, message: String },

    #[error("state i/o error: {0}")]
    Io(String),
}

/// Umbrella error for engine entry points.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),
}

fn join_keys(path: &[ResourceKey]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}
