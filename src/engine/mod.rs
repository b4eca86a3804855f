//! Dispatch engine: single-flight task execution.
//!
//! One cycle = lock check, crash recovery, task selection, context assembly,
//! worker execution, resolution, lock release, persistence. Strictly one
//! task per cycle; concurrency lives in the sensor layer, never here.

pub mod context;
pub mod lock;
pub mod persist;
pub mod worker;

use crate::config::Config;
use crate::db::Database;
use crate::types::{CycleCompletion, Task, TaskStatus};
use anyhow::Result;
use lock::DispatchLock;
use tracing::{info, warn};
use worker::WorkerRun;

/// How much worker output lands in a fallback summary.
const SUMMARY_MAX_CHARS: usize = 500;

/// Outcome of one dispatch cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another live process holds the dispatch lock.
    Busy,
    /// No dispatchable task.
    Idle,
    /// Worker succeeded; the engine closed the task.
    Completed { task_id: i64 },
    /// Worker resolved the task's status itself.
    SelfClosed { task_id: i64 },
    /// Transient failure; the task went back to pending.
    Requeued { task_id: i64 },
    /// Permanent failure.
    Failed { task_id: i64 },
}

pub struct Engine {
    db: Database,
    config: Config,
    lock: DispatchLock,
}

impl Engine {
    pub fn new(db: Database, config: Config) -> Self {
        let lock = DispatchLock::new(&config.lock_path);
        Self { db, config, lock }
    }

    /// Run one dispatch cycle end to end.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        if let Some(holder) = self.lock.acquire(None)? {
            info!(pid = holder.owner_pid, task = ?holder.task_id, "dispatch busy");
            return Ok(CycleOutcome::Busy);
        }

        // The lock is ours from here on; release on every path.
        let result = self.run_locked().await;
        if let Err(e) = self.lock.release() {
            warn!(error = %e, "failed to release dispatch lock");
        }

        let outcome = result?;

        if !matches!(outcome, CycleOutcome::Idle) && !self.config.commit_dirs.is_empty() {
            let message = match &outcome {
                CycleOutcome::Completed { task_id }
                | CycleOutcome::SelfClosed { task_id }
                | CycleOutcome::Requeued { task_id }
                | CycleOutcome::Failed { task_id } => format!("cycle: task {task_id}"),
                _ => "cycle".to_string(),
            };
            persist::persist_dirs(&self.config.commit_dirs, &message).await;
        }

        Ok(outcome)
    }

    async fn run_locked(&self) -> Result<CycleOutcome> {
        self.recover_crashed()?;

        let Some(task) = self.db.list_pending()?.into_iter().next() else {
            return Ok(CycleOutcome::Idle);
        };

        self.lock.set_task(task.id)?;
        self.db.mark_active(task.id)?;
        let cycle_id = self.db.append_cycle(Some(task.id), &task.skills)?;

        info!(
            task = task.id,
            subject = %task.subject,
            attempt = task.attempt_count + 1,
            "dispatching"
        );

        // An error raised before the worker exits (spawn failure, stream
        // error) is a transient execution failure, not a crash: classify it
        // here instead of leaving the task active for the next cycle's
        // recovery to mislabel.
        match self.execute(&task).await {
            Ok(run) => self.resolve(&task, cycle_id, run),
            Err(e) => {
                warn!(task = task.id, error = %e, "execution failed before worker exit");
                self.resolve_execution_error(&task, cycle_id, &e)
            }
        }
    }

    async fn execute(&self, task: &Task) -> Result<WorkerRun> {
        let prompt = context::build_prompt(&self.db, &self.config.context, task)?;
        worker::run_worker(&self.config.worker, &prompt).await
    }

    /// Mark every task left active by a previous crash as failed. The engine
    /// never resumes in-flight work; a fresh attempt must be a fresh enqueue.
    fn recover_crashed(&self) -> Result<()> {
        for stale in self.db.list_active()? {
            warn!(task = stale.id, "failing task left active by a crashed cycle");
            self.db.mark_failed(
                stale.id,
                "interrupted: previous dispatch process died mid-execution",
            )?;
        }
        Ok(())
    }

    fn resolve(&self, task: &Task, cycle_id: i64, run: WorkerRun) -> Result<CycleOutcome> {
        let cost = run.cost_usd(&self.config.worker);
        self.db.update_cost(
            task.id,
            cost,
            run.api_cost_usd.unwrap_or(0.0),
            run.tokens_in,
            run.tokens_out,
        )?;

        // The worker's own transition wins on every exit path, success or
        // failure; only a still-active task is resolved by the engine.
        let outcome = if let Some(self_closed) = self.check_self_closed(task.id)? {
            self_closed
        } else if run.exit_code != 0 || run.is_error {
            let diagnostics = if run.stderr.trim().is_empty() {
                run.output().to_string()
            } else {
                run.stderr.clone()
            };
            self.classify_failure(task, &diagnostics, run.exit_code)?
        } else {
            let summary = truncate_chars(run.output(), SUMMARY_MAX_CHARS);
            self.db
                .mark_completed(task.id, &summary, Some(run.output()))?;
            info!(task = task.id, "completed (fallback close)");
            CycleOutcome::Completed { task_id: task.id }
        };

        let summary = match &outcome {
            CycleOutcome::Completed { .. } | CycleOutcome::SelfClosed { .. } => {
                Some(truncate_chars(run.output(), SUMMARY_MAX_CHARS))
            }
            CycleOutcome::Requeued { .. } => Some("requeued after transient failure".to_string()),
            CycleOutcome::Failed { .. } => Some("failed".to_string()),
            _ => None,
        };
        self.db.update_cycle(
            cycle_id,
            &CycleCompletion {
                cost_usd: cost,
                tokens_in: run.tokens_in,
                tokens_out: run.tokens_out,
                summary,
            },
        )?;

        Ok(outcome)
    }

    /// Resolution for errors raised before a worker exit code exists. No
    /// usage arrived, so the cycle row closes with empty cost fields.
    fn resolve_execution_error(
        &self,
        task: &Task,
        cycle_id: i64,
        err: &anyhow::Error,
    ) -> Result<CycleOutcome> {
        let outcome = if let Some(self_closed) = self.check_self_closed(task.id)? {
            self_closed
        } else {
            self.classify_failure(task, &format!("execution error: {err:#}"), -1)?
        };

        let summary = match &outcome {
            CycleOutcome::Requeued { .. } => Some("requeued after execution error".to_string()),
            CycleOutcome::Failed { .. } => Some("failed".to_string()),
            _ => None,
        };
        self.db.update_cycle(
            cycle_id,
            &CycleCompletion {
                summary,
                ..Default::default()
            },
        )?;

        Ok(outcome)
    }

    /// Re-read the task after execution. Any status other than active means
    /// the worker (or a cooperating process) already resolved it, and the
    /// engine must not overwrite that transition.
    fn check_self_closed(&self, task_id: i64) -> Result<Option<CycleOutcome>> {
        match self.db.get_task(task_id)? {
            Some(t) if t.status == TaskStatus::Active => Ok(None),
            Some(t) => {
                if t.status.is_terminal() {
                    info!(task = task_id, status = %t.status, "worker closed task");
                } else {
                    info!(task = task_id, status = %t.status, "worker left task resumable");
                }
                Ok(Some(CycleOutcome::SelfClosed { task_id }))
            }
            None => {
                warn!(task = task_id, "task row missing after execution");
                Ok(Some(CycleOutcome::SelfClosed { task_id }))
            }
        }
    }

    fn classify_failure(
        &self,
        task: &Task,
        diagnostics: &str,
        exit_code: i32,
    ) -> Result<CycleOutcome> {
        // Auth errors never heal on retry.
        if diagnostics.contains("401") || diagnostics.contains("403") {
            warn!(task = task.id, "auth failure, not retrying");
            self.db.mark_failed(
                task.id,
                &format!(
                    "authentication error: {}",
                    truncate_chars(diagnostics, SUMMARY_MAX_CHARS)
                ),
            )?;
            return Ok(CycleOutcome::Failed { task_id: task.id });
        }

        // attempt_count was bumped by mark_active after this row was read
        let attempts = task.attempt_count + 1;
        if attempts < task.max_retries {
            info!(task = task.id, attempts, max = task.max_retries, "requeueing");
            self.db.requeue(task.id)?;
            return Ok(CycleOutcome::Requeued { task_id: task.id });
        }

        warn!(task = task.id, attempts, "retries exhausted");
        self.db.mark_failed(
            task.id,
            &format!(
                "failed after {attempts} attempts (exit {exit_code}): {}",
                truncate_chars(diagnostics, SUMMARY_MAX_CHARS)
            ),
        )?;
        Ok(CycleOutcome::Failed { task_id: task.id })
    }
}

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
