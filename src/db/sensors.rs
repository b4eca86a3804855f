//! Per-sensor lease state: cadence gating and failure counters.

use super::{Database, now_ms};
use crate::types::SensorState;
use anyhow::Result;
use rusqlite::{OptionalExtension, params};

impl Database {
    /// Try to claim a cadence slot for the named sensor.
    ///
    /// Returns false without writing when the sensor ran within its interval
    /// window. Otherwise overwrites the lease record wholesale (current
    /// time, version + 1, failure counter reset) and returns true.
    ///
    /// This is a best-effort lease, not a cross-process transaction: within
    /// one scheduler tick nothing else claims the same name, so
    /// claim-then-work is effectively atomic per sensor. Overlapping
    /// scheduler processes are not excluded here; sensor work must stay
    /// idempotent or lean on task-store dedup. Claims are irrevocable: a
    /// sensor that claims and then finds nothing to do has still consumed
    /// its window.
    pub fn claim_sensor_run(&self, name: &str, interval_minutes: i64) -> Result<bool> {
        let now = now_ms();
        let interval_ms = interval_minutes * 60_000;

        self.with_conn(|conn| {
            let existing: Option<(i64, i64)> = conn
                .query_row(
                    "SELECT last_ran, version FROM sensor_state WHERE name = ?1",
                    params![name],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            if let Some((last_ran, _)) = existing {
                if now < last_ran + interval_ms {
                    return Ok(false);
                }
            }

            let version = existing.map(|(_, v)| v + 1).unwrap_or(1);
            conn.execute(
                "INSERT INTO sensor_state (name, last_ran, last_result, version, consecutive_failures)
                 VALUES (?1, ?2, 'running', ?3, 0)
                 ON CONFLICT(name) DO UPDATE SET
                     last_ran = ?2, last_result = 'running',
                     version = ?3, consecutive_failures = 0",
                params![name, now, version],
            )?;

            Ok(true)
        })
    }

    /// Record the outcome of a claimed run: last_result plus the
    /// consecutive-failure counter (reset on success, bumped on error).
    pub fn record_sensor_result(&self, name: &str, ok: bool) -> Result<()> {
        self.with_conn(|conn| {
            if ok {
                conn.execute(
                    "UPDATE sensor_state SET last_result = 'ok', consecutive_failures = 0
                     WHERE name = ?1",
                    params![name],
                )?;
            } else {
                conn.execute(
                    "UPDATE sensor_state SET last_result = 'error',
                     consecutive_failures = consecutive_failures + 1
                     WHERE name = ?1",
                    params![name],
                )?;
            }
            Ok(())
        })
    }

    /// Read a sensor's lease record. A miss means the sensor has never run.
    pub fn get_sensor_state(&self, name: &str) -> Result<Option<SensorState>> {
        self.with_conn(|conn| {
            let state = conn
                .query_row(
                    "SELECT name, last_ran, last_result, version, consecutive_failures
                     FROM sensor_state WHERE name = ?1",
                    params![name],
                    |row| {
                        Ok(SensorState {
                            name: row.get(0)?,
                            last_ran: row.get(1)?,
                            last_result: row.get(2)?,
                            version: row.get(3)?,
                            consecutive_failures: row.get(4)?,
                        })
                    },
                )
                .optional()?;

            Ok(state)
        })
    }
}
