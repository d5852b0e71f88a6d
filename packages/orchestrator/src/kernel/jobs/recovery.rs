//! Crash recovery and the optional file journal mirror.
//!
//! The durable store is the source of truth; recovery rehydrates in-flight
//! work from it at startup. The journal is a best-effort line-per-transition
//! mirror consulted only when the store cannot be reached, so an operator
//! still has a record of what was in flight.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::Result;
use crate::kernel::jobs::job::{JobClass, JobState, QueueName};
use crate::kernel::jobs::store::JobStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub job_id: Uuid,
    pub class: JobClass,
    pub queue: QueueName,
    pub state: JobState,
    pub at: DateTime<Utc>,
}

/// Append-only line-JSON mirror of job transitions.
pub struct JournalMirror {
    path: PathBuf,
}

impl JournalMirror {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Best-effort append; journal failures never fail the transition.
    pub fn append(&self, entry: &JournalEntry) {
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(_) => return,
        };
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(err) = result {
            tracing::warn!(error = %err, "journal append failed");
        }
    }

    /// All parseable entries, oldest first. Unparseable lines are skipped.
    pub fn read_all(&self) -> Vec<JournalEntry> {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        raw.lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub rehydrated: usize,
    pub classes: Vec<String>,
}

/// Rehydrate in-flight jobs at process start. Orphaned active jobs and
/// recent failures return to queued; each touched payload carries a
/// `_recovery` stanza. When the store is unreachable the journal (if any)
/// is surfaced in the error path by the caller.
pub async fn recover_at_startup(
    store: &Arc<dyn JobStore>,
    max_age: Duration,
) -> Result<RecoveryReport> {
    let recovered = store.recover(max_age).await?;
    let mut classes: Vec<String> = recovered
        .iter()
        .map(|job| job.class.as_str().to_string())
        .collect();
    classes.sort();
    classes.dedup();

    if !recovered.is_empty() {
        tracing::info!(
            count = recovered.len(),
            classes = ?classes,
            "recovered in-flight jobs"
        );
    }

    Ok(RecoveryReport {
        rehydrated: recovered.len(),
        classes,
    })
}
