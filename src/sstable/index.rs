//! Sparse index: key-to-offset checkpoints for an SSTable data file.
//!
//! While a data file is written, every S-th entry's key and starting offset
//! are recorded as a checkpoint. At read time the index answers with a byte
//! range `[lo, hi)` of the data file that is guaranteed to contain the key's
//! entry if the table holds it at all; the caller scans that range linearly.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Checkpoint {
    key: Vec<u8>,
    offset: u64,
}

/// Ordered list of `(key, offset)` checkpoints sampling a data file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseIndex {
    checkpoints: Vec<Checkpoint>,
}

impl SparseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a checkpoint. Keys must arrive in ascending order; this is
    /// only called while the owning SSTable is being written.
    pub fn append(&mut self, key: &[u8], offset: u64) {
        debug_assert!(self
            .checkpoints
            .last()
            .is_none_or(|last| last.key.as_slice() < key));
        self.checkpoints.push(Checkpoint {
            key: key.to_vec(),
            offset,
        });
    }

    /// Returns the byte range of the data file that may contain `key`.
    ///
    /// `lo` is the offset of the greatest checkpoint whose key is <= `key`,
    /// stepping back one more checkpoint on an exact match so a scan starting
    /// at `lo` cannot begin past the sought entry. `hi` is the offset of the
    /// following checkpoint, or `None` for end of file. An empty index
    /// yields the whole file.
    pub fn offsets(&self, key: &[u8]) -> (u64, Option<u64>) {
        let n = self.checkpoints.len();
        if n == 0 {
            return (0, None);
        }

        // First checkpoint strictly greater than the key.
        let upper = self
            .checkpoints
            .partition_point(|cp| cp.key.as_slice() <= key);
        let lower = match upper {
            0 => return (0, self.checkpoints.first().map(|cp| cp.offset)),
            _ if self.checkpoints[upper - 1].key.as_slice() == key => upper.saturating_sub(2),
            _ => upper - 1,
        };

        let hi = self.checkpoints.get(upper).map(|cp| cp.offset);
        (self.checkpoints[lower].offset, hi)
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Writes the index to `path`.
    pub fn encode(&self, path: &Path) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        bincode::serialize_into(&mut w, self)?;
        w.flush()?;
        Ok(())
    }

    /// Reads an index previously written by [`encode`](Self::encode).
    pub fn decode(path: &Path) -> Result<Self> {
        let r = BufReader::new(File::open(path)?);
        Ok(bincode::deserialize_from(r)?)
    }
}
