//! Configuration for the dispatch loop.
//!
//! Loaded from a YAML file; every field has a default so an empty file (or
//! none at all) yields a working single-host setup under the user data dir.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default dispatch tick interval in seconds.
const DEFAULT_DISPATCH_TICK_SECS: u64 = 60;

/// Default sensor tick interval in seconds.
const DEFAULT_SENSOR_TICK_SECS: u64 = 60;

/// Worker subprocess configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Program invoked once per dispatched task.
    #[serde(default = "default_worker_program")]
    pub program: String,

    /// Arguments passed to the worker. The prompt goes over stdin, and the
    /// worker is expected to emit newline-delimited JSON events on stdout.
    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,

    /// USD per million input tokens, used when the worker does not report an
    /// authoritative total cost.
    #[serde(default = "default_input_rate")]
    pub input_rate_per_mtok: f64,

    /// USD per million output tokens.
    #[serde(default = "default_output_rate")]
    pub output_rate_per_mtok: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: default_worker_program(),
            args: default_worker_args(),
            input_rate_per_mtok: default_input_rate(),
            output_rate_per_mtok: default_output_rate(),
        }
    }
}

fn default_worker_program() -> String {
    "claude".to_string()
}

fn default_worker_args() -> Vec<String> {
    vec![
        "-p".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ]
}

fn default_input_rate() -> f64 {
    3.0
}

fn default_output_rate() -> f64 {
    15.0
}

/// Context assembly bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Identity/memory documents prepended to every prompt, in order.
    #[serde(default)]
    pub identity_files: Vec<PathBuf>,

    /// Directory of skill-context documents, one `<name>.md` per skill.
    #[serde(default = "default_skills_dir")]
    pub skills_dir: PathBuf,

    /// How many recent cycle-log entries to include for continuity.
    #[serde(default = "default_recent_cycles")]
    pub recent_cycles: i64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            identity_files: Vec::new(),
            skills_dir: default_skills_dir(),
            recent_cycles: default_recent_cycles(),
        }
    }
}

fn default_skills_dir() -> PathBuf {
    data_dir().join("skills")
}

fn default_recent_cycles() -> i64 {
    10
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// SQLite database path.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Dispatch lock file path.
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,

    /// Credential store file (opaque to the core; read-only accessor).
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub context: ContextConfig,

    /// Working directories staged and committed after each cycle. Secrets
    /// and data stores must not live under these.
    #[serde(default)]
    pub commit_dirs: Vec<PathBuf>,

    /// Seconds between dispatch cycles in `run` mode.
    #[serde(default = "default_dispatch_tick_secs")]
    pub dispatch_tick_secs: u64,

    /// Seconds between sensor ticks in `run` mode.
    #[serde(default = "default_sensor_tick_secs")]
    pub sensor_tick_secs: u64,
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dispatchd")
}

fn default_db_path() -> PathBuf {
    data_dir().join("dispatchd.db")
}

fn default_lock_path() -> PathBuf {
    data_dir().join("dispatch.lock")
}

fn default_credentials_path() -> PathBuf {
    data_dir().join("credentials.yaml")
}

fn default_dispatch_tick_secs() -> u64 {
    DEFAULT_DISPATCH_TICK_SECS
}

fn default_sensor_tick_secs() -> u64 {
    DEFAULT_SENSOR_TICK_SECS
}

impl Config {
    /// Load configuration from a YAML file. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => data_dir().join("config.yaml"),
        };

        if !path.exists() {
            return Ok(Self::with_defaults());
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// A fully-defaulted config (serde defaults only fire during
    /// deserialization, so an explicit constructor is needed).
    pub fn with_defaults() -> Self {
        serde_yaml::from_str("{}").expect("empty config deserializes")
    }

    /// Ensure the parent directories of the db and lock paths exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        for path in [&self.db_path, &self.lock_path, &self.credentials_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::with_defaults();
        assert_eq!(config.worker.program, "claude");
        assert_eq!(config.context.recent_cycles, 10);
        assert_eq!(config.dispatch_tick_secs, 60);
        assert!(config.commit_dirs.is_empty());
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let config: Config =
            serde_yaml::from_str("worker:\n  program: fake-worker\n").unwrap();
        assert_eq!(config.worker.program, "fake-worker");
        // untouched sections keep their defaults
        assert_eq!(config.worker.input_rate_per_mtok, 3.0);
        assert_eq!(config.sensor_tick_secs, 60);
    }
}
