//! Task queue operations: enqueue, selection ordering, status transitions,
//! cost accounting.

use super::{Database, now_ms};
use crate::types::{MAX_RETRIES_DEFAULT, NewTask, PRIORITY_DEFAULT, Task, TaskStatus};
use anyhow::Result;
use rusqlite::{Connection, Row, params};

pub(crate) fn parse_task_row(row: &Row) -> rusqlite::Result<Task> {
    let skills_json: String = row.get("skills")?;
    let status: String = row.get("status")?;

    Ok(Task {
        id: row.get("id")?,
        subject: row.get("subject")?,
        description: row.get("description")?,
        skills: serde_json::from_str(&skills_json).unwrap_or_default(),
        priority: row.get("priority")?,
        status: TaskStatus::parse(&status),
        source: row.get("source")?,
        parent_id: row.get("parent_id")?,
        scheduled_for: row.get("scheduled_for")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        result_summary: row.get("result_summary")?,
        result_detail: row.get("result_detail")?,
        cost_usd: row.get("cost_usd")?,
        api_cost_usd: row.get("api_cost_usd")?,
        tokens_in: row.get("tokens_in")?,
        tokens_out: row.get("tokens_out")?,
        attempt_count: row.get("attempt_count")?,
        max_retries: row.get("max_retries")?,
    })
}

fn get_task_internal(conn: &Connection, task_id: i64) -> Result<Option<Task>> {
    let mut stmt = conn.prepare("SELECT * FROM tasks WHERE id = ?1")?;

    match stmt.query_row(params![task_id], parse_task_row) {
        Ok(task) => Ok(Some(task)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl Database {
    /// Enqueue a new task, applying defaults (priority 5, status pending,
    /// max_retries 3). Returns the new task's id.
    pub fn enqueue(&self, input: NewTask) -> Result<i64> {
        let now = now_ms();
        let priority = input.priority.unwrap_or(PRIORITY_DEFAULT);
        let max_retries = input.max_retries.unwrap_or(MAX_RETRIES_DEFAULT);
        let skills_json = serde_json::to_string(&input.skills)?;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tasks (
                    subject, description, skills, priority, status, source,
                    parent_id, scheduled_for, created_at, max_retries
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    input.subject,
                    input.description,
                    skills_json,
                    priority,
                    TaskStatus::Pending.as_str(),
                    input.source,
                    input.parent_id,
                    input.scheduled_for,
                    now,
                    max_retries,
                ],
            )?;

            Ok(conn.last_insert_rowid())
        })
    }

    /// Check whether any task with this source key exists.
    ///
    /// With `active_only` the check covers pending and active tasks: the
    /// sensor-dedup case: suppress duplicates while a prior occurrence is
    /// unresolved, allow re-firing once it reaches a terminal state. Without
    /// it, any historical occurrence counts.
    pub fn exists_for_source(&self, source: &str, active_only: bool) -> Result<bool> {
        self.with_conn(|conn| {
            let exists: bool = if active_only {
                conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM tasks
                     WHERE source = ?1 AND status IN ('pending', 'active'))",
                    params![source],
                    |row| row.get(0),
                )?
            } else {
                conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM tasks WHERE source = ?1)",
                    params![source],
                    |row| row.get(0),
                )?
            };
            Ok(exists)
        })
    }

    /// List dispatchable tasks in strict dispatch order (priority ASC,
    /// id ASC), excluding tasks deferred into the future.
    pub fn list_pending(&self) -> Result<Vec<Task>> {
        let now = now_ms();
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM tasks
                 WHERE status = 'pending'
                   AND (scheduled_for IS NULL OR scheduled_for <= ?1)
                 ORDER BY priority ASC, id ASC",
            )?;

            let tasks = stmt
                .query_map(params![now], parse_task_row)?
                .filter_map(|r| r.ok())
                .collect();

            Ok(tasks)
        })
    }

    /// List active tasks. The engine's serialization means at most one row is
    /// expected here; more than one indicates a prior crash.
    pub fn list_active(&self) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM tasks WHERE status = 'active' ORDER BY id")?;

            let tasks = stmt
                .query_map([], parse_task_row)?
                .filter_map(|r| r.ok())
                .collect();

            Ok(tasks)
        })
    }

    /// Get a task by id. A miss is a normal result, not an error.
    pub fn get_task(&self, task_id: i64) -> Result<Option<Task>> {
        self.with_conn(|conn| get_task_internal(conn, task_id))
    }

    /// Transition pending → active: stamp started_at, bump attempt_count.
    pub fn mark_active(&self, task_id: i64) -> Result<()> {
        let now = now_ms();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET status = 'active', started_at = ?1,
                 attempt_count = attempt_count + 1
                 WHERE id = ?2",
                params![now, task_id],
            )?;
            Ok(())
        })
    }

    /// Terminal transition to completed, stamping completed_at.
    pub fn mark_completed(&self, task_id: i64, summary: &str, detail: Option<&str>) -> Result<()> {
        let now = now_ms();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET status = 'completed', completed_at = ?1,
                 result_summary = ?2, result_detail = ?3
                 WHERE id = ?4",
                params![now, summary, detail, task_id],
            )?;
            Ok(())
        })
    }

    /// Terminal transition to failed, stamping completed_at.
    pub fn mark_failed(&self, task_id: i64, summary: &str) -> Result<()> {
        let now = now_ms();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET status = 'failed', completed_at = ?1,
                 result_summary = ?2
                 WHERE id = ?3",
                params![now, summary, task_id],
            )?;
            Ok(())
        })
    }

    /// Semi-terminal transition to blocked. Resumable, so completed_at is
    /// not stamped.
    pub fn mark_blocked(&self, task_id: i64, reason: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET status = 'blocked', result_summary = ?1
                 WHERE id = ?2",
                params![reason, task_id],
            )?;
            Ok(())
        })
    }

    /// Retry path: active → pending with started_at cleared. attempt_count
    /// keeps its already-incremented value so max_retries counts attempts,
    /// not requeues.
    pub fn requeue(&self, task_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET status = 'pending', started_at = NULL
                 WHERE id = ?1",
                params![task_id],
            )?;
            Ok(())
        })
    }

    /// Record cost and token usage for a task.
    pub fn update_cost(
        &self,
        task_id: i64,
        cost_usd: f64,
        api_cost_usd: f64,
        tokens_in: i64,
        tokens_out: i64,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET cost_usd = ?1, api_cost_usd = ?2,
                 tokens_in = ?3, tokens_out = ?4
                 WHERE id = ?5",
                params![cost_usd, api_cost_usd, tokens_in, tokens_out, task_id],
            )?;
            Ok(())
        })
    }

    /// Count tasks per status, for the status report.
    pub fn count_by_status(&self) -> Result<Vec<(String, i64)>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status ORDER BY status")?;
            let counts = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(counts)
        })
    }
}
