//! Append-only JSONL journal of run events.
//!
//! Every mutation gets a started event before the provider call and a
//! terminal event after the state write, so a crash between provider
//! success and state write is detectable on the next run via
//! [`Journal::unfinished`].

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::core::state::relock;
use crate::core::types::{PlanAction, ResourceKey};

/// RFC 3339 UTC timestamp.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Generate a run id.
pub fn generate_run_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("r-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// One journaled event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        resources: u32,
    },
    ResourceStarted {
        key: ResourceKey,
        action: PlanAction,
    },
    ResourceApplied {
        key: ResourceKey,
        action: PlanAction,
        provider_id: Option<String>,
        duration_seconds: f64,
    },
    ResourceFailed {
        key: ResourceKey,
        action: PlanAction,
        error: String,
    },
    ResourceSkipped {
        key: ResourceKey,
        reason: String,
    },
    RunCompleted {
        run_id: String,
        succeeded: u32,
        unchanged: u32,
        failed: u32,
        skipped: u32,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: RunEvent,
}

/// Append-only event log at a fixed path.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    guard: Mutex<()>,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: RunEvent) -> std::io::Result<()> {
        let entry = TimestampedEvent {
            ts: now_rfc3339(),
            event,
        };
        let json = serde_json::to_string(&entry).map_err(std::io::Error::other)?;

        let _guard = relock(self.guard.lock());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", json)
    }

    /// Read every parseable event. Malformed lines are skipped; the journal
    /// is advisory, not the source of truth.
    pub fn read_all(path: &Path) -> std::io::Result<Vec<TimestampedEvent>> {
        let content = std::fs::read_to_string(path)?;
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    /// Keys with a started event but no terminal event — operations that
    /// may have reached the provider without a recorded result.
    pub fn unfinished(path: &Path) -> std::io::Result<Vec<ResourceKey>> {
        let mut open: Vec<ResourceKey> = Vec::new();
        for entry in Self::read_all(path)? {
            match entry.event {
                RunEvent::ResourceStarted { key, .. } => {
                    if !open.contains(&key) {
                        open.push(key);
                    }
                }
                RunEvent::ResourceApplied { key, .. }
                | RunEvent::ResourceFailed { key, .. }
                | RunEvent::ResourceSkipped { key, .. } => {
                    open.retain(|k| k != &key);
                }
                _ => {}
            }
        }
        Ok(open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_rfc3339_shape() {
        let ts = now_rfc3339();
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('T'));
    }

    #[test]
    fn test_generate_run_id_shape() {
        let id = generate_run_id();
        assert!(id.starts_with("r-"));
        assert_eq!(id.len(), 14);
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().join("events.jsonl"));

        journal
            .append(RunEvent::RunStarted {
                run_id: "r-abc".to_string(),
                resources: 3,
            })
            .unwrap();
        journal
            .append(RunEvent::ResourceStarted {
                key: ResourceKey::new("network", "main"),
                action: PlanAction::Create,
            })
            .unwrap();

        let events = Journal::read_all(journal.path()).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].event, RunEvent::RunStarted { .. }));

        let raw = std::fs::read_to_string(journal.path()).unwrap();
        assert!(raw.contains("\"event\":\"run_started\""));
        assert!(raw.contains("\"key\":\"network.main\""));
    }

    #[test]
    fn test_unfinished_reports_open_operations() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().join("events.jsonl"));

        let net = ResourceKey::new("network", "main");
        let sub = ResourceKey::new("subnet", "app");
        journal
            .append(RunEvent::ResourceStarted {
                key: net.clone(),
                action: PlanAction::Create,
            })
            .unwrap();
        journal
            .append(RunEvent::ResourceApplied {
                key: net.clone(),
                action: PlanAction::Create,
                provider_id: Some("network-0001".to_string()),
                duration_seconds: 0.1,
            })
            .unwrap();
        journal
            .append(RunEvent::ResourceStarted {
                key: sub.clone(),
                action: PlanAction::Create,
            })
            .unwrap();
        // Crash: no terminal event for subnet.app.

        let open = Journal::unfinished(journal.path()).unwrap();
        assert_eq!(open, vec![sub]);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        std::fs::write(&path, "{broken\n").unwrap();

        let journal = Journal::new(&path);
        journal
            .append(RunEvent::RunCompleted {
                run_id: "r-x".to_string(),
                succeeded: 1,
                unchanged: 0,
                failed: 0,
                skipped: 0,
                total_seconds: 1.0,
            })
            .unwrap();

        let events = Journal::read_all(&path).unwrap();
        assert_eq!(events.len(), 1);
    }
}
