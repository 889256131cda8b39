//! Conciliar — declarative reconciliation engine.
//!
//! Desired-state declarations in, dependency-aware plans out,
//! bounded-concurrency applies against provider adapters with durable
//! per-resource state and resumable partial failures.

pub mod cli;
pub mod core;
pub mod journal;
pub mod provider;
