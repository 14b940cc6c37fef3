//! Ownership and orchestration of the on-disk SSTables.
//!
//! The manager holds the per-level table collections behind one read/write
//! lock and serializes the writer-side mutations: flushing a memtable into
//! level 0, compacting level 0 into level 1, and advancing the id counter.
//! Reads take the lock shared, so lookups proceed concurrently with the
//! I/O-heavy phases of flush and compaction, which run without the
//! exclusive lock.
//!
//! # Write gate
//!
//! While a compaction is merging, the `writeable` flag is false and `add`
//! refuses with [`Error::InProgress`]. The flush loop treats that as a
//! recoverable condition and retries on its next tick. The gate reopens
//! when the compaction publishes or fails.
//!
//! # Publication ordering
//!
//! A new table's files are written and fsynced before the table enters a
//! level collection, and compaction inputs are unlinked only after their
//! replacement is published. A crash mid-write leaves sidecar files without
//! a meta file (meta is written last), which startup ignores.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::bloom::BloomFilter;
use crate::error::{Error, Result};
use crate::memtable::Memtable;

use super::data::{write_entry, EntryReader};
use super::index::SparseIndex;
use super::merge::MergeIter;
use super::meta::Meta;
use super::{data_path, sidecar_paths, SsTable};

/// Buffer size for sequential data-file writes.
const WRITE_BUF_SIZE: usize = 64 * 1024;

struct Inner {
    /// Tables per level. Within a level, ascending id order; reads walk each
    /// level newest-first.
    levels: Vec<Vec<Arc<SsTable>>>,
    /// Next table id to assign.
    next_id: u64,
    /// False while a compaction is running; gates `add`.
    writeable: bool,
}

/// Owns the set of SSTables, partitioned by level.
pub struct SstManager {
    dir: PathBuf,
    sparseness: usize,
    target_fpr: f64,
    inner: RwLock<Inner>,
}

impl SstManager {
    pub fn new(dir: impl Into<PathBuf>, sparseness: usize, target_fpr: f64) -> Self {
        Self {
            dir: dir.into(),
            sparseness,
            target_fpr,
            inner: RwLock::new(Inner {
                levels: vec![Vec::new()],
                next_id: 0,
                writeable: true,
            }),
        }
    }

    /// Writes a frozen memtable to a fresh level-0 SSTable.
    ///
    /// The id is reserved under the exclusive lock, all file I/O happens
    /// without it, and the finished table is published under the exclusive
    /// lock again. Nothing is published on error; partial files are removed
    /// best-effort.
    pub fn add(&self, memtable: &Memtable) -> Result<()> {
        if memtable.is_empty() {
            return Ok(());
        }

        let id = {
            let mut inner = self.inner.write().unwrap();
            if !inner.writeable {
                return Err(Error::InProgress);
            }
            let id = inner.next_id;
            inner.next_id += 1;
            id
        };

        let table = match self.write_memtable(id, memtable) {
            Ok(table) => table,
            Err(err) => {
                self.discard_partial(id);
                return Err(err);
            }
        };

        let items = table.meta.items;
        let mut inner = self.inner.write().unwrap();
        inner.levels[0].push(Arc::new(table));
        drop(inner);

        tracing::info!(table_id = id, items, "flushed memtable to level 0");
        Ok(())
    }

    /// Point lookup across all levels: level 0 newest-first, then deeper
    /// levels. The first table that holds the key ends the search; an empty
    /// value is a tombstone and counts as a hit.
    pub fn find(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.read().unwrap();
        for level in inner.levels.iter() {
            for table in level.iter().rev() {
                if let Some(value) = table.probe(key)? {
                    return Ok(Some(value));
                }
            }
        }
        Ok(None)
    }

    /// Loads every complete SSTable found in the directory at startup.
    ///
    /// Tables are discovered by their meta file and slotted into their
    /// recorded level in ascending id order. A table that fails to decode is
    /// logged and skipped; its id is still retired so it can never be
    /// reassigned.
    pub fn load(&self) -> Result<()> {
        let mut ids = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let name = dirent?.file_name();
            if let Some(id) = parse_table_id(&name.to_string_lossy()) {
                ids.push(id);
            }
        }
        ids.sort_unstable();

        let mut loaded = 0usize;
        let mut inner = self.inner.write().unwrap();
        for &id in &ids {
            inner.next_id = inner.next_id.max(id + 1);
            match SsTable::open(&self.dir, id) {
                Ok(table) => {
                    let level = table.meta.level as usize;
                    while inner.levels.len() <= level {
                        inner.levels.push(Vec::new());
                    }
                    inner.levels[level].push(Arc::new(table));
                    loaded += 1;
                }
                Err(err) => {
                    tracing::error!(table_id = id, error = %err, "skipping unreadable SSTable");
                }
            }
        }
        drop(inner);

        if !ids.is_empty() {
            tracing::info!(tables = loaded, "loaded SSTables from disk");
        }
        Ok(())
    }

    /// Merges all of level 0 into a single table at level 1.
    ///
    /// The exclusive lock is held only to close the write gate, snapshot the
    /// inputs, and reserve the output id; the merge itself runs under the
    /// shared lock so reads continue. The inputs leave the level collection
    /// only after the output is published, and their files are unlinked
    /// last. No-op when level 0 is empty; a compaction already underway is
    /// [`Error::InProgress`].
    pub fn compact(&self) -> Result<()> {
        let (inputs, new_id) = {
            let mut inner = self.inner.write().unwrap();
            if !inner.writeable {
                return Err(Error::InProgress);
            }
            if inner.levels[0].is_empty() {
                return Ok(());
            }
            inner.writeable = false;
            let new_id = inner.next_id;
            inner.next_id += 1;
            (inner.levels[0].clone(), new_id)
        };
        let _gate = GateGuard { manager: self };

        let level = inputs[0].meta.level;
        tracing::info!(
            inputs = inputs.len(),
            table_id = new_id,
            target_level = level + 1,
            "compaction started"
        );

        let merged = {
            let _read = self.inner.read().unwrap();
            self.merge_tables(new_id, level, &inputs)
        };
        let table = match merged {
            Ok(table) => table,
            Err(err) => {
                self.discard_partial(new_id);
                return Err(err);
            }
        };

        let items = table.meta.items;
        let input_ids: Vec<u64> = inputs.iter().map(|t| t.id).collect();
        {
            let mut inner = self.inner.write().unwrap();
            let target = (level + 1) as usize;
            while inner.levels.len() <= target {
                inner.levels.push(Vec::new());
            }
            inner.levels[target].push(Arc::new(table));
            inner.levels[0].clear();
        }

        for &id in &input_ids {
            self.discard_partial(id);
        }

        tracing::info!(
            inputs = input_ids.len(),
            table_id = new_id,
            items,
            target_level = level + 1,
            "compaction finished"
        );
        Ok(())
    }

    /// Number of tables at each level, shallowest first.
    pub fn table_counts(&self) -> Vec<usize> {
        let inner = self.inner.read().unwrap();
        inner.levels.iter().map(Vec::len).collect()
    }

    /// Traverses a memtable into the four files of table `id` and returns
    /// the assembled table.
    fn write_memtable(&self, id: u64, memtable: &Memtable) -> Result<SsTable> {
        let path = data_path(&self.dir, id);
        let mut w = BufWriter::with_capacity(WRITE_BUF_SIZE, File::create(&path)?);

        let mut index = SparseIndex::new();
        let mut filter = BloomFilter::new(memtable.len(), self.target_fpr)?;
        let mut offset = 0u64;
        let mut nth = 0usize;

        memtable.try_traverse(&mut |key, value| {
            if nth % self.sparseness == 0 {
                index.append(key, offset);
            }
            offset += write_entry(&mut w, key, value)? as u64;
            filter.add(key);
            nth += 1;
            Ok(())
        })?;

        let meta = Meta {
            level: 0,
            items: memtable.len() as u64,
        };
        self.finish_table(id, w, offset, meta, index, filter)
    }

    /// Streams the k-way merge of `inputs` into the files of table `id` at
    /// level `level + 1`, suppressing tombstones and widening the sparse
    /// index sampling interval.
    fn merge_tables(&self, id: u64, level: u32, inputs: &[Arc<SsTable>]) -> Result<SsTable> {
        let mut readers = Vec::with_capacity(inputs.len());
        let mut total_items = 0u64;
        for input in inputs {
            readers.push((
                input.id,
                EntryReader::new(input.reopen(&self.dir)?, input.file_size),
            ));
            total_items += input.meta.items;
        }

        let path = data_path(&self.dir, id);
        let mut w = BufWriter::with_capacity(WRITE_BUF_SIZE, File::create(&path)?);

        let mut index = SparseIndex::new();
        // The summed input count is an upper bound on the output count.
        let mut filter = BloomFilter::new(total_items.max(1) as usize, self.target_fpr)?;
        let sparseness = self.sparseness.saturating_pow(level + 2);
        let mut offset = 0u64;
        let mut emitted = 0u64;

        for entry in MergeIter::new(readers)? {
            let (key, value) = entry?;
            if value.is_empty() {
                continue;
            }
            if emitted % sparseness as u64 == 0 {
                index.append(&key, offset);
            }
            offset += write_entry(&mut w, &key, &value)? as u64;
            filter.add(&key);
            emitted += 1;
        }

        let meta = Meta {
            level: level + 1,
            items: emitted,
        };
        self.finish_table(id, w, offset, meta, index, filter)
    }

    /// Flushes and fsyncs the data file, encodes the sidecars (meta last,
    /// since its presence marks the table complete), and reopens the data
    /// file for random reads.
    fn finish_table(
        &self,
        id: u64,
        mut w: BufWriter<File>,
        file_size: u64,
        meta: Meta,
        index: SparseIndex,
        filter: BloomFilter,
    ) -> Result<SsTable> {
        w.flush()?;
        let file = w.into_inner().map_err(|err| err.into_error())?;
        file.sync_all()?;
        drop(file);

        index.encode(&super::index_path(&self.dir, id))?;
        filter.encode(&super::bloom_path(&self.dir, id))?;
        meta.encode(&super::meta_path(&self.dir, id))?;

        let data = File::open(data_path(&self.dir, id))?;
        Ok(SsTable::new(id, file_size, meta, index, filter, data))
    }

    /// Removes whatever files exist for table `id`. Failures are logged,
    /// not surfaced: a stray file without a meta sidecar is invisible to
    /// startup.
    fn discard_partial(&self, id: u64) {
        for path in sidecar_paths(&self.dir, id) {
            if path.exists() {
                if let Err(err) = fs::remove_file(&path) {
                    tracing::warn!(table_id = id, error = %err, "failed to remove table file");
                }
            }
        }
    }
}

/// Reopens the write gate when a compaction ends, successfully or not.
struct GateGuard<'a> {
    manager: &'a SstManager,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.manager.inner.write().unwrap().writeable = true;
    }
}

/// Extracts the table id from a meta file name (`lsm-<id>.meta`).
fn parse_table_id(name: &str) -> Option<u64> {
    name.strip_prefix("lsm-")?
        .strip_suffix(".meta")?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn memtable_of(entries: &[(&[u8], &[u8])]) -> Memtable {
        let mut mt = Memtable::new();
        for (k, v) in entries {
            mt.insert(k.to_vec(), v.to_vec());
        }
        mt
    }

    fn manager(dir: &TempDir) -> SstManager {
        SstManager::new(dir.path(), 4, 0.01)
    }

    #[test]
    fn test_add_and_find() {
        let dir = TempDir::new().expect("temp dir");
        let sm = manager(&dir);

        let mt = memtable_of(&[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")]);
        sm.add(&mt).expect("add");

        assert_eq!(sm.find(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(sm.find(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(sm.find(b"c").unwrap(), Some(b"3".to_vec()));
        assert_eq!(sm.find(b"d").unwrap(), None);
        assert_eq!(sm.table_counts(), vec![1]);
    }

    #[test]
    fn test_add_skips_empty_memtable() {
        let dir = TempDir::new().expect("temp dir");
        let sm = manager(&dir);
        sm.add(&Memtable::new()).expect("add");
        assert_eq!(sm.table_counts(), vec![0]);
    }

    #[test]
    fn test_level0_reads_newest_first() {
        let dir = TempDir::new().expect("temp dir");
        let sm = manager(&dir);

        sm.add(&memtable_of(&[(b"k", b"old"), (b"only_old", b"x")]))
            .expect("add");
        sm.add(&memtable_of(&[(b"k", b"new")])).expect("add");

        assert_eq!(sm.find(b"k").unwrap(), Some(b"new".to_vec()));
        assert_eq!(sm.find(b"only_old").unwrap(), Some(b"x".to_vec()));
    }

    #[test]
    fn test_tombstone_in_newer_table_shadows_value() {
        let dir = TempDir::new().expect("temp dir");
        let sm = manager(&dir);

        sm.add(&memtable_of(&[(b"k", b"v")])).expect("add");
        sm.add(&memtable_of(&[(b"k", b"")])).expect("add");

        // The tombstone is a hit: the search stops at the newer table.
        assert_eq!(sm.find(b"k").unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_add_refused_while_gate_closed() {
        let dir = TempDir::new().expect("temp dir");
        let sm = manager(&dir);

        sm.inner.write().unwrap().writeable = false;
        let err = sm.add(&memtable_of(&[(b"k", b"v")])).unwrap_err();
        assert!(matches!(err, Error::InProgress));

        sm.inner.write().unwrap().writeable = true;
        sm.add(&memtable_of(&[(b"k", b"v")])).expect("add");
    }

    #[test]
    fn test_load_restores_tables_and_counter() {
        let dir = TempDir::new().expect("temp dir");
        {
            let sm = manager(&dir);
            sm.add(&memtable_of(&[(b"a", b"1")])).expect("add");
            sm.add(&memtable_of(&[(b"b", b"2")])).expect("add");
        }

        let sm = manager(&dir);
        sm.load().expect("load");
        assert_eq!(sm.table_counts(), vec![2]);
        assert_eq!(sm.find(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(sm.find(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(sm.inner.read().unwrap().next_id, 2);
    }

    #[test]
    fn test_load_skips_corrupt_table() {
        let dir = TempDir::new().expect("temp dir");
        {
            let sm = manager(&dir);
            sm.add(&memtable_of(&[(b"a", b"1")])).expect("add");
        }
        // A meta file with no siblings: the table is unreadable.
        std::fs::write(dir.path().join("lsm-9.meta"), [0u8; 12]).unwrap();

        let sm = manager(&dir);
        sm.load().expect("load");
        assert_eq!(sm.table_counts(), vec![1]);
        assert_eq!(sm.find(b"a").unwrap(), Some(b"1".to_vec()));
        // The corrupt id is retired, never reassigned.
        assert_eq!(sm.inner.read().unwrap().next_id, 10);
    }

    #[test]
    fn test_compact_merges_and_deduplicates() {
        let dir = TempDir::new().expect("temp dir");
        let sm = manager(&dir);

        sm.add(&memtable_of(&[(b"a", b"a_old"), (b"b", b"b1"), (b"dead", b"x")]))
            .expect("add");
        sm.add(&memtable_of(&[(b"a", b"a_new"), (b"c", b"c1"), (b"dead", b"")]))
            .expect("add");

        sm.compact().expect("compact");

        assert_eq!(sm.table_counts(), vec![0, 1]);
        assert_eq!(sm.find(b"a").unwrap(), Some(b"a_new".to_vec()));
        assert_eq!(sm.find(b"b").unwrap(), Some(b"b1".to_vec()));
        assert_eq!(sm.find(b"c").unwrap(), Some(b"c1".to_vec()));
        // The tombstoned key is gone entirely, not carried as a tombstone.
        assert_eq!(sm.find(b"dead").unwrap(), None);

        // Input files are deleted after publication.
        assert!(!data_path(dir.path(), 0).exists());
        assert!(!data_path(dir.path(), 1).exists());
        assert!(data_path(dir.path(), 2).exists());
    }

    #[test]
    fn test_compact_empty_level0_is_noop() {
        let dir = TempDir::new().expect("temp dir");
        let sm = manager(&dir);
        sm.compact().expect("compact");
        assert_eq!(sm.table_counts(), vec![0]);
        assert!(sm.inner.read().unwrap().writeable);
    }

    #[test]
    fn test_gate_reopens_after_compaction() {
        let dir = TempDir::new().expect("temp dir");
        let sm = manager(&dir);
        sm.add(&memtable_of(&[(b"k", b"v")])).expect("add");
        sm.compact().expect("compact");

        assert!(sm.inner.read().unwrap().writeable);
        sm.add(&memtable_of(&[(b"k2", b"v2")])).expect("add");
    }

    #[test]
    fn test_compaction_output_keys_are_unique_and_ordered() {
        let dir = TempDir::new().expect("temp dir");
        let sm = manager(&dir);

        let mut first = Memtable::new();
        let mut second = Memtable::new();
        for i in 0..500u32 {
            first.insert(
                format!("key_{i:04}").into_bytes(),
                format!("old_{i}").into_bytes(),
            );
        }
        for i in (0..500u32).step_by(2) {
            second.insert(
                format!("key_{i:04}").into_bytes(),
                format!("new_{i}").into_bytes(),
            );
        }
        sm.add(&first).expect("add");
        sm.add(&second).expect("add");
        sm.compact().expect("compact");

        // Walk the merged data file and check strict key ordering.
        let table = sm.inner.read().unwrap().levels[1][0].clone();
        let reader = EntryReader::new(table.reopen(dir.path()).unwrap(), table.file_size);
        let entries: Vec<_> = reader.map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 500);
        for window in entries.windows(2) {
            assert!(window[0].0 < window[1].0);
        }

        for i in 0..500u32 {
            let key = format!("key_{i:04}").into_bytes();
            let expect = if i % 2 == 0 {
                format!("new_{i}")
            } else {
                format!("old_{i}")
            };
            assert_eq!(sm.find(&key).unwrap(), Some(expect.into_bytes()));
        }
    }

    #[test]
    fn test_single_table_compaction_is_idempotent() {
        let dir = TempDir::new().expect("temp dir");
        let sm = manager(&dir);

        let mut mt = Memtable::new();
        for i in 0..200u32 {
            mt.insert(
                format!("key_{i:03}").into_bytes(),
                format!("val_{i}").into_bytes(),
            );
        }
        sm.add(&mt).expect("add");
        let before = std::fs::read(data_path(dir.path(), 0)).unwrap();

        sm.compact().expect("compact");

        // Same entries, same framing; only the id and level differ.
        let after = std::fs::read(data_path(dir.path(), 1)).unwrap();
        assert_eq!(before, after);
        assert_eq!(
            sm.inner.read().unwrap().levels[1][0].meta,
            Meta {
                level: 1,
                items: 200
            }
        );
    }

    #[test]
    fn test_parse_table_id() {
        assert_eq!(parse_table_id("lsm-0.meta"), Some(0));
        assert_eq!(parse_table_id("lsm-42.meta"), Some(42));
        assert_eq!(parse_table_id("lsm-42.data"), None);
        assert_eq!(parse_table_id("lsm-x.meta"), None);
        assert_eq!(parse_table_id("other.meta"), None);
    }
}
