//! Core types for the dispatch loop.

use serde::{Deserialize, Serialize};

/// Task priority as an integer (lower = more urgent).
pub type Priority = i32;

/// Default priority applied when the caller does not specify one.
pub const PRIORITY_DEFAULT: Priority = 5;

/// Default number of attempts before a transient failure becomes permanent.
pub const MAX_RETRIES_DEFAULT: i32 = 3;

/// Lifecycle state of a task.
///
/// Transitions: pending → active → {completed | failed | blocked}, plus
/// active → pending on a retryable failure. Terminal rows are kept forever
/// for audit and dedup history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Active => "active",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
        }
    }

    /// Parse a stored status string. Unknown values map to Failed so a
    /// corrupted row can never be re-selected as pending work.
    pub fn parse(s: &str) -> TaskStatus {
        match s {
            "pending" => TaskStatus::Pending,
            "active" => TaskStatus::Active,
            "completed" => TaskStatus::Completed,
            "blocked" => TaskStatus::Blocked,
            _ => TaskStatus::Failed,
        }
    }

    /// Terminal states never transition again. Blocked is resumable and
    /// therefore not terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub subject: String,
    pub description: String,
    /// Ordered capability names; each maps to a skill-context document.
    pub skills: Vec<String>,
    pub priority: Priority,
    pub status: TaskStatus,
    /// Deterministic provenance key used for idempotent de-duplication.
    pub source: Option<String>,
    pub parent_id: Option<i64>,
    /// Defer timestamp (ms epoch); the task is invisible to dispatch until
    /// this elapses.
    pub scheduled_for: Option<i64>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub result_summary: Option<String>,
    pub result_detail: Option<String>,

    // Cost accounting
    pub cost_usd: f64,
    pub api_cost_usd: f64,
    pub tokens_in: i64,
    pub tokens_out: i64,

    pub attempt_count: i32,
    pub max_retries: i32,
}

/// Input for enqueueing a task. Defaults are applied by the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub subject: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub skills: Vec<String>,
    pub priority: Option<Priority>,
    pub source: Option<String>,
    pub parent_id: Option<i64>,
    pub scheduled_for: Option<i64>,
    pub max_retries: Option<i32>,
}

impl NewTask {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..Default::default()
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_skills(mut self, skills: Vec<String>) -> Self {
        self.skills = skills;
        self
    }
}

/// One row of the append-only cycle log: a single dispatch attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub id: i64,
    pub started_at: i64,
    pub task_id: Option<i64>,
    pub completed_at: Option<i64>,
    pub duration_ms: Option<i64>,
    pub cost_usd: Option<f64>,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    /// Skill names loaded into the worker context for this cycle.
    pub skills: Vec<String>,
    pub summary: Option<String>,
}

/// Completion fields written back onto a cycle row after the worker exits.
#[derive(Debug, Clone, Default)]
pub struct CycleCompletion {
    pub cost_usd: f64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub summary: Option<String>,
}

/// Lease record for one sensor, overwritten wholesale on every claimed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorState {
    pub name: String,
    pub last_ran: i64,
    pub last_result: String,
    pub version: i64,
    pub consecutive_failures: i64,
}

/// What a sensor's work function reports when it runs to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorOutcome {
    /// Ran successfully (may or may not have enqueued anything).
    Ok,
    /// Declined to act: nothing to do.
    Skip,
}

/// Per-sensor outcome of one scheduler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorStatus {
    Ok,
    Skipped,
    Error,
}

/// Report entry produced by the scheduler for every registered sensor,
/// every tick.
#[derive(Debug, Clone, Serialize)]
pub struct SensorReport {
    pub name: String,
    pub status: SensorStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Active,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Blocked,
        ] {
            assert_eq!(TaskStatus::parse(s.as_str()), s);
        }
    }

    #[test]
    fn unknown_status_is_failed() {
        assert_eq!(TaskStatus::parse("garbage"), TaskStatus::Failed);
    }

    #[test]
    fn blocked_is_not_terminal() {
        assert!(!TaskStatus::Blocked.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }
}
