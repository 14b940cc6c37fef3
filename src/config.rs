use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration for an LSM tree.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the SSTable files.
    pub dir: PathBuf,

    /// Byte size at which the active memtable is rotated (default: 16 MiB).
    pub memtable_size: usize,

    /// Number of frozen memtables tolerated in memory before the flush loop
    /// writes the excess to disk (default: 4).
    pub max_memtables: usize,

    /// Sparse-index sampling interval at level 0: one checkpoint every
    /// `sparseness` entries (default: 16). Widens at higher levels.
    pub sparseness: usize,

    /// Target false-positive rate for the per-table membership filter
    /// (default: 0.01).
    pub target_fpr: f64,

    /// How often the flush loop wakes (default: 15s).
    pub flush_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./cinder"),
            memtable_size: 16 * 1024 * 1024, // 16 MiB
            max_memtables: 4,
            sparseness: 16,
            target_fpr: 0.01,
            flush_interval: Duration::from_secs(15),
        }
    }
}

impl Config {
    /// Create a new config rooted at the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the memtable rotation threshold in bytes.
    pub fn memtable_size(mut self, size: usize) -> Self {
        self.memtable_size = size;
        self
    }

    /// Set the maximum number of frozen memtables held in memory.
    pub fn max_memtables(mut self, max: usize) -> Self {
        self.max_memtables = max;
        self
    }

    /// Set the sparse-index sampling interval.
    pub fn sparseness(mut self, sparseness: usize) -> Self {
        self.sparseness = sparseness;
        self
    }

    /// Set the membership-filter target false-positive rate.
    pub fn target_fpr(mut self, fpr: f64) -> Self {
        self.target_fpr = fpr;
        self
    }

    /// Set the flush loop interval.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Validates option values. Fatal at open.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.memtable_size == 0 {
            return Err(Error::Config("memtable size must be positive".to_string()));
        }
        if self.max_memtables == 0 {
            return Err(Error::Config(
                "max in-memory memtables must be positive".to_string(),
            ));
        }
        if self.sparseness == 0 {
            return Err(Error::Config("sparseness must be positive".to_string()));
        }
        if !(self.target_fpr > 0.0 && self.target_fpr < 1.0) {
            return Err(Error::Config(format!(
                "target false-positive rate must be in (0, 1), got {}",
                self.target_fpr
            )));
        }
        Ok(())
    }
}
