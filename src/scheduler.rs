//! Sensor scheduler: cadence-gated, failure-isolated fan-out.
//!
//! Every registered sensor is considered once per tick. The scheduler gates
//! each sensor through its cadence lease, then runs all due sensors
//! concurrently; one sensor's error (or panic) is caught at its own boundary
//! and reported without cancelling or delaying siblings. The scheduler never
//! touches the dispatch engine; the two sides meet only in the task store.

use crate::credentials::Credentials;
use crate::db::Database;
use crate::types::{SensorOutcome, SensorReport, SensorStatus};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Everything a sensor's work function may touch: the task store (for
/// `exists_for_source` dedup and `enqueue`) and the credential accessor.
#[derive(Clone)]
pub struct SensorContext {
    pub db: Database,
    pub credentials: Credentials,
}

/// A periodically self-gated unit: one name, one interval, one work
/// function.
///
/// The scheduler claims the cadence lease before invoking `run`, so a work
/// function only ever executes inside a claimed window. Work functions must
/// be idempotent (or protected by task-store dedup): the lease is
/// best-effort and does not exclude overlapping scheduler processes.
#[async_trait]
pub trait Sensor: Send + Sync {
    fn name(&self) -> &str;

    fn interval_minutes(&self) -> i64;

    /// Inspect the sensor's condition and enqueue zero or more tasks, each
    /// keyed by a deterministic per-condition source.
    async fn run(&self, cx: &SensorContext) -> Result<SensorOutcome>;
}

/// Explicit startup-time sensor registry. No directory walking, no dynamic
/// loading: callers register each sensor once before the loop starts.
#[derive(Default)]
pub struct SensorRegistry {
    sensors: Vec<Arc<dyn Sensor>>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, sensor: Arc<dyn Sensor>) {
        self.sensors.push(sensor);
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}

/// Sensor scheduler: owns the registry and drives ticks.
pub struct Scheduler {
    registry: SensorRegistry,
    cx: SensorContext,
}

impl Scheduler {
    pub fn new(registry: SensorRegistry, db: Database, credentials: Credentials) -> Self {
        Self {
            registry,
            cx: SensorContext { db, credentials },
        }
    }

    /// Run one tick: gate every sensor by its lease, fan out the due ones
    /// concurrently, and collect one report entry per registered sensor.
    pub async fn run_tick(&self) -> Result<Vec<SensorReport>> {
        let mut reports = Vec::with_capacity(self.registry.len());
        let mut running = JoinSet::new();
        // task id -> sensor name, so a panicked task can still be attributed
        let mut names: HashMap<tokio::task::Id, String> = HashMap::new();

        for sensor in &self.registry.sensors {
            let name = sensor.name().to_string();

            // Cadence gate. A refused claim performs no write; the sensor is
            // simply not due. Claims are irrevocable once taken.
            let claimed = self.cx.db.claim_sensor_run(&name, sensor.interval_minutes())?;
            if !claimed {
                debug!(sensor = %name, "not due, skipping");
                reports.push(SensorReport {
                    name,
                    status: SensorStatus::Skipped,
                    duration_ms: 0,
                    error: None,
                });
                continue;
            }

            let sensor = Arc::clone(sensor);
            let cx = self.cx.clone();
            let spawned_name = name.clone();
            let handle = running.spawn(async move {
                let start = Instant::now();
                let result = sensor.run(&cx).await;
                (name, start.elapsed().as_millis() as u64, result)
            });
            names.insert(handle.id(), spawned_name);
        }

        while let Some(joined) = running.join_next_with_id().await {
            let report = match joined {
                Ok((_, (name, duration_ms, Ok(outcome)))) => {
                    self.cx.db.record_sensor_result(&name, true)?;
                    let status = match outcome {
                        SensorOutcome::Ok => SensorStatus::Ok,
                        SensorOutcome::Skip => SensorStatus::Skipped,
                    };
                    debug!(sensor = %name, ?status, duration_ms, "sensor finished");
                    SensorReport {
                        name,
                        status,
                        duration_ms,
                        error: None,
                    }
                }
                Ok((_, (name, duration_ms, Err(e)))) => {
                    self.cx.db.record_sensor_result(&name, false)?;
                    warn!(sensor = %name, error = %e, duration_ms, "sensor failed");
                    SensorReport {
                        name,
                        status: SensorStatus::Error,
                        duration_ms,
                        error: Some(e.to_string()),
                    }
                }
                // A panicked sensor task is contained the same as an error.
                Err(join_err) => {
                    let name = names.remove(&join_err.id()).unwrap_or_default();
                    self.cx.db.record_sensor_result(&name, false)?;
                    warn!(sensor = %name, error = %join_err, "sensor task panicked");
                    SensorReport {
                        name,
                        status: SensorStatus::Error,
                        duration_ms: 0,
                        error: Some(join_err.to_string()),
                    }
                }
            };
            reports.push(report);
        }

        let errors = reports
            .iter()
            .filter(|r| r.status == SensorStatus::Error)
            .count();
        if errors > 0 {
            info!(total = reports.len(), errors, "sensor tick finished with errors");
        } else {
            debug!(total = reports.len(), "sensor tick finished");
        }

        Ok(reports)
    }
}
