//! dispatchd: single-host automation loop.
//!
//! A durable SQLite task queue, a serialized dispatch engine running one
//! worker subprocess per task, and a concurrently fanned-out sensor
//! scheduler with per-sensor cadence leases.

pub mod config;
pub mod credentials;
pub mod db;
pub mod engine;
pub mod scheduler;
pub mod types;
