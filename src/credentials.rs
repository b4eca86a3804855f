//! Read accessor for the external credential store.
//!
//! The store itself (encryption, rotation, writes) is a separate subsystem;
//! the core only consumes this opaque lookup. The on-disk form here is a
//! two-level YAML map, `service -> key -> value`.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Opaque credential lookup consumed by sensors.
#[derive(Debug, Clone)]
pub struct Credentials {
    path: PathBuf,
}

impl Credentials {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Look up one credential. A missing file, service, or key is a normal
    /// `None`, not an error; only an unreadable/unparseable file fails.
    pub fn get(&self, service: &str, key: &str) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading credentials {}", self.path.display()))?;
        let map: HashMap<String, HashMap<String, String>> = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing credentials {}", self.path.display()))?;

        Ok(map.get(service).and_then(|svc| svc.get(key)).cloned())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
