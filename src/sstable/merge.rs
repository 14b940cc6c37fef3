//! K-way merge of sorted runs for compaction.
//!
//! Each input SSTable contributes a streaming [`EntryReader`]; a min-heap
//! over the head of every stream yields entries in ascending key order. When
//! the same key appears in several inputs, the entry from the input with the
//! larger table id (the newer run) sorts first, and later occurrences of
//! that key are dropped. Tombstones are yielded like any other entry; the
//! compaction writer decides to suppress them.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::data::EntryReader;
use crate::error::Result;

struct MergeEntry {
    key: Vec<u8>,
    value: Vec<u8>,
    /// Id of the originating table; recency on key ties.
    id: u64,
    /// Index of the originating stream, for refilling the heap.
    source: usize,
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.id == other.id
    }
}

impl Eq for MergeEntry {}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.key.cmp(&other.key) {
            // Newer table wins the tie and must surface first.
            Ordering::Equal => self.id.cmp(&other.id),
            // Reversed so BinaryHeap's max-heap behaves as a min-heap on keys.
            ord => ord.reverse(),
        }
    }
}

/// Merges N sorted entry streams into one deduplicated sorted stream.
pub struct MergeIter {
    sources: Vec<EntryReader>,
    ids: Vec<u64>,
    heap: BinaryHeap<MergeEntry>,
    last_key: Option<Vec<u8>>,
}

impl MergeIter {
    /// Builds a merge over `(table_id, reader)` pairs, priming the heap with
    /// the head entry of each stream.
    pub fn new(inputs: Vec<(u64, EntryReader)>) -> Result<Self> {
        let mut merge = Self {
            sources: Vec::with_capacity(inputs.len()),
            ids: Vec::with_capacity(inputs.len()),
            heap: BinaryHeap::with_capacity(inputs.len()),
            last_key: None,
        };
        for (id, reader) in inputs {
            merge.sources.push(reader);
            merge.ids.push(id);
        }
        for source in 0..merge.sources.len() {
            merge.refill(source)?;
        }
        Ok(merge)
    }

    /// Pushes the next entry of `source` onto the heap, if any.
    fn refill(&mut self, source: usize) -> Result<()> {
        if let Some(entry) = self.sources[source].next() {
            let (key, value) = entry?;
            self.heap.push(MergeEntry {
                key,
                value,
                id: self.ids[source],
                source,
            });
        }
        Ok(())
    }
}

impl Iterator for MergeIter {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(entry) = self.heap.pop() {
            if let Err(err) = self.refill(entry.source) {
                return Some(Err(err));
            }

            // A key equal to the last yielded one comes from an older table;
            // the recency filter drops it.
            if self.last_key.as_deref() == Some(entry.key.as_slice()) {
                continue;
            }

            self.last_key = Some(entry.key.clone());
            return Some(Ok((entry.key, entry.value)));
        }
        None
    }
}
