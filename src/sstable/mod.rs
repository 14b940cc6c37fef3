//! Immutable on-disk sorted runs and their manager.
//!
//! Each SSTable owns four files in the store directory, named by a shared
//! id stem:
//!
//! ```text
//! lsm-<id>.data    length-prefixed entries in ascending key order
//! lsm-<id>.index   sparse (key, offset) checkpoints
//! lsm-<id>.bloom   membership filter over the data file's keys
//! lsm-<id>.meta    level and item count
//! ```
//!
//! Tables are written once (by a flush or a compaction), published to the
//! manager's level collections, and deleted only after a compaction has
//! published their replacement.

pub mod data;
pub mod index;
pub mod manager;
pub mod merge;
pub mod meta;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::bloom::BloomFilter;
use crate::error::Result;
use data::EntrySlice;
use index::SparseIndex;
use meta::Meta;

pub use manager::SstManager;

/// One immutable sorted run: the open data file plus its in-memory sidecars.
pub struct SsTable {
    /// Monotonically increasing id assigned by the manager. A larger id
    /// means more recent data.
    pub id: u64,
    /// Data file length in bytes.
    pub file_size: u64,
    pub meta: Meta,
    pub index: SparseIndex,
    pub filter: BloomFilter,
    data: File,
}

impl SsTable {
    /// Assembles a table from parts just written by a flush or compaction.
    pub(crate) fn new(
        id: u64,
        file_size: u64,
        meta: Meta,
        index: SparseIndex,
        filter: BloomFilter,
        data: File,
    ) -> Self {
        Self {
            id,
            file_size,
            meta,
            index,
            filter,
            data,
        }
    }

    /// Opens the table with the given id from `dir`, decoding all sidecars.
    pub fn open(dir: &Path, id: u64) -> Result<Self> {
        let meta = Meta::decode(&meta_path(dir, id))?;
        let index = SparseIndex::decode(&index_path(dir, id))?;
        let filter = BloomFilter::decode(&bloom_path(dir, id))?;

        let data = File::open(data_path(dir, id))?;
        let file_size = data.metadata()?.len();

        Ok(Self {
            id,
            file_size,
            meta,
            index,
            filter,
            data,
        })
    }

    /// Point lookup within this table.
    ///
    /// The membership filter is consulted first; on a possible hit the
    /// sparse index narrows the scan to one checkpoint interval of the data
    /// file, which is read and walked linearly. Returns the stored value,
    /// which is empty for a tombstone.
    pub fn probe(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if !self.filter.contains(key) {
            return Ok(None);
        }

        let (lo, hi) = self.index.offsets(key);
        let hi = hi.unwrap_or(self.file_size);
        if lo >= hi {
            return Ok(None);
        }

        let mut chunk = vec![0u8; (hi - lo) as usize];
        let mut reader = self.data.try_clone()?;
        reader.seek(SeekFrom::Start(lo))?;
        reader.read_exact(&mut chunk)?;

        for entry in EntrySlice::new(&chunk) {
            let (k, v) = entry?;
            if k == key {
                return Ok(Some(v.to_vec()));
            }
            if k > key {
                break;
            }
        }
        Ok(None)
    }

    /// Reopens the data file for a front-to-back streaming read.
    pub(crate) fn reopen(&self, dir: &Path) -> Result<File> {
        Ok(File::open(data_path(dir, self.id))?)
    }
}

pub(crate) fn data_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("lsm-{id}.data"))
}

pub(crate) fn index_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("lsm-{id}.index"))
}

pub(crate) fn bloom_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("lsm-{id}.bloom"))
}

pub(crate) fn meta_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("lsm-{id}.meta"))
}

/// All four sidecar paths for one table id.
pub(crate) fn sidecar_paths(dir: &Path, id: u64) -> [PathBuf; 4] {
    [
        data_path(dir, id),
        index_path(dir, id),
        bloom_path(dir, id),
        meta_path(dir, id),
    ]
}
