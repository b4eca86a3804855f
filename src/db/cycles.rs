//! Append-only cycle log: one row per dispatch attempt.
//!
//! Rows are inserted when a cycle begins executing a task and updated once
//! with completion fields after the worker exits. They are never deleted;
//! the recent window doubles as situational context for the next worker.

use super::{Database, now_ms};
use crate::types::{CycleCompletion, CycleRecord};
use anyhow::Result;
use rusqlite::{Row, params};

fn parse_cycle_row(row: &Row) -> rusqlite::Result<CycleRecord> {
    let skills_json: String = row.get("skills")?;

    Ok(CycleRecord {
        id: row.get("id")?,
        started_at: row.get("started_at")?,
        task_id: row.get("task_id")?,
        completed_at: row.get("completed_at")?,
        duration_ms: row.get("duration_ms")?,
        cost_usd: row.get("cost_usd")?,
        tokens_in: row.get("tokens_in")?,
        tokens_out: row.get("tokens_out")?,
        skills: serde_json::from_str(&skills_json).unwrap_or_default(),
        summary: row.get("summary")?,
    })
}

impl Database {
    /// Append a cycle row at dispatch start. Returns the row id for the
    /// later completion update.
    pub fn append_cycle(&self, task_id: Option<i64>, skills: &[String]) -> Result<i64> {
        let now = now_ms();
        let skills_json = serde_json::to_string(skills)?;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cycles (started_at, task_id, skills) VALUES (?1, ?2, ?3)",
                params![now, task_id, skills_json],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Write completion fields onto a cycle row. Called exactly once per row.
    pub fn update_cycle(&self, cycle_id: i64, completion: &CycleCompletion) -> Result<()> {
        let now = now_ms();

        self.with_conn(|conn| {
            conn.execute(
                "UPDATE cycles SET completed_at = ?1,
                 duration_ms = ?1 - started_at,
                 cost_usd = ?2, tokens_in = ?3, tokens_out = ?4, summary = ?5
                 WHERE id = ?6",
                params![
                    now,
                    completion.cost_usd,
                    completion.tokens_in,
                    completion.tokens_out,
                    completion.summary,
                    cycle_id,
                ],
            )?;
            Ok(())
        })
    }

    /// Most recent cycles, newest first.
    pub fn list_recent_cycles(&self, limit: i64) -> Result<Vec<CycleRecord>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM cycles ORDER BY id DESC LIMIT ?1")?;

            let cycles = stmt
                .query_map(params![limit], parse_cycle_row)?
                .filter_map(|r| r.ok())
                .collect();

            Ok(cycles)
        })
    }
}
