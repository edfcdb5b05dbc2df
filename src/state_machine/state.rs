use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{Job, JobStatus};

/// Progress assumed while processing when the logs carry no marker.
const DEFAULT_PROCESSING_PROGRESS: u8 = 50;

/// A detected change of a job's status. `from` and `to` always differ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusTransition {
    pub job_id: String,
    pub from: JobStatus,
    pub to: JobStatus,
    pub timestamp: DateTime<Utc>,
}

impl StatusTransition {
    /// Compares a fresh snapshot against the last known status.
    ///
    /// Returns `None` when nothing changed, when the job already reached a
    /// terminal status, or when the snapshot would move the job backwards
    /// (`Processing → Starting`), so transitions stay monotonic per job.
    pub fn detect(last_known: JobStatus, snapshot: &Job) -> Option<Self> {
        let next = snapshot.status;
        if next == last_known || last_known.is_terminal() || rank(next) < rank(last_known) {
            return None;
        }
        Some(Self {
            job_id: snapshot.id.clone(),
            from: last_known,
            to: next,
            timestamp: Utc::now(),
        })
    }
}

fn rank(status: JobStatus) -> u8 {
    match status {
        JobStatus::Starting => 0,
        JobStatus::Processing => 1,
        JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled => 2,
    }
}

/// Progress estimate in percent for a snapshot.
///
/// `Starting`, `Failed` and `Canceled` report 0, `Succeeded` 100. While
/// processing the last `progress: N%` marker in the logs wins, else 50.
pub fn estimate_progress(job: &Job) -> u8 {
    match job.status {
        JobStatus::Starting | JobStatus::Failed | JobStatus::Canceled => 0,
        JobStatus::Succeeded => 100,
        JobStatus::Processing => job
            .logs
            .as_deref()
            .and_then(parse_log_progress)
            .unwrap_or(DEFAULT_PROCESSING_PROGRESS),
    }
}

/// Finds the most recent `progress: N%` marker, clamped to 100.
pub fn parse_log_progress(logs: &str) -> Option<u8> {
    logs.match_indices("progress:")
        .filter_map(|(idx, marker)| {
            let rest = logs[idx + marker.len()..].trim_start();
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.is_empty() || !rest[digits.len()..].starts_with('%') {
                return None;
            }
            digits.parse::<u32>().ok().map(|n| n.min(100) as u8)
        })
        .last()
}
