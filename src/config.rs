//! Repository configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Which queue implementation a repository hands out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueBackend {
    /// Process-local queues; contents are lost on restart.
    Memory,
    /// Memory-mapped segment queues stored under `data_dir`.
    Segmented { data_dir: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub backend: QueueBackend,

    /// Flush the written segment after every enqueue.
    /// Default: false
    #[serde(default)]
    pub flush_on_enqueue: bool,

    /// Hold an exclusive lock on the data directory while open.
    /// Default: true
    #[serde(default = "default_lock_data_dir")]
    pub lock_data_dir: bool,
}

fn default_lock_data_dir() -> bool {
    true
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Memory,
            flush_on_enqueue: false,
            lock_data_dir: true,
        }
    }
}

impl RepositoryConfig {
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn segmented(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: QueueBackend::Segmented {
                data_dir: data_dir.into(),
            },
            ..Self::default()
        }
    }

    pub fn with_flush_on_enqueue(mut self, flush: bool) -> Self {
        self.flush_on_enqueue = flush;
        self
    }

    pub fn with_lock_data_dir(mut self, lock: bool) -> Self {
        self.lock_data_dir = lock;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn data_dir(&self) -> Option<&Path> {
        match &self.backend {
            QueueBackend::Memory => None,
            QueueBackend::Segmented { data_dir } => Some(data_dir),
        }
    }
}
