//! The LSM tree façade: public API, memtable chain, and flush loop.
//!
//! # Write path
//!
//! `put` upserts into the active memtable under the chain's write lock; no
//! I/O happens there. When the active table's byte footprint crosses the
//! configured threshold it is frozen onto the back of the frozen list and a
//! fresh active table begins. A background thread wakes on a fixed interval
//! and flushes the excess oldest frozen tables to level-0 SSTables.
//!
//! # Read path
//!
//! `get` scans the chain newest to oldest (active table, then frozen tables
//! back to front) under the chain's read lock, then consults the SSTable
//! manager. The first hit wins; an empty value is a tombstone and resolves
//! to absent.
//!
//! # Locks
//!
//! Two locks exist: the chain lock here and the manager's lock. When both
//! are needed they are acquired chain-first, and never held across each
//! other's I/O.
//!
//! # Durability
//!
//! There is no write-ahead log: writes that have not reached an SSTable are
//! lost on crash. `close` flushes every memtable synchronously, so an
//! orderly shutdown loses nothing.

use std::collections::VecDeque;
use std::fs;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, tick, Receiver, Sender};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::memtable::Memtable;
use crate::sstable::SstManager;

/// The chain of memtables: one active table receiving writes, and the
/// frozen tables awaiting flush, oldest at the front.
struct Chain {
    active: Memtable,
    frozen: VecDeque<Arc<Memtable>>,
}

/// State shared with the flush loop thread.
struct Shared {
    chain: RwLock<Chain>,
    manager: SstManager,
}

/// An embedded, single-node, ordered key-value store.
pub struct LsmTree {
    config: Config,
    shared: Arc<Shared>,
    flush_stop: Sender<()>,
    flush_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Point-in-time snapshot of engine state, for tests and monitoring.
#[derive(Debug, Clone)]
pub struct Stats {
    pub active_memtable_size: usize,
    pub frozen_memtables: usize,
    pub tables_per_level: Vec<usize>,
}

impl LsmTree {
    /// Opens a store in `dir` with default options.
    pub fn open(dir: &str) -> Result<Self> {
        Self::open_with_config(Config::new(dir))
    }

    /// Opens a store with the given configuration, creating the directory
    /// and loading any SSTables it already holds.
    pub fn open_with_config(config: Config) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.dir)?;

        let manager = SstManager::new(&config.dir, config.sparseness, config.target_fpr);
        manager.load()?;

        let shared = Arc::new(Shared {
            chain: RwLock::new(Chain {
                active: Memtable::new(),
                frozen: VecDeque::new(),
            }),
            manager,
        });

        let (flush_stop, stop_rx) = bounded(1);
        let flush_handle = {
            let shared = shared.clone();
            let interval = config.flush_interval;
            let max_memtables = config.max_memtables;
            std::thread::spawn(move || flush_loop(shared, interval, max_memtables, stop_rx))
        };

        Ok(Self {
            config,
            shared,
            flush_stop,
            flush_handle: Mutex::new(Some(flush_handle)),
        })
    }

    /// Stores `value` under `key`. Keys must be non-empty; values may be
    /// empty, which is indistinguishable from a delete.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidInput("key must be non-empty".to_string()));
        }

        let mut chain = self.shared.chain.write().unwrap();
        chain.active.insert(key.to_vec(), value.to_vec());

        if chain.active.size() > self.config.memtable_size {
            let full = std::mem::take(&mut chain.active);
            chain.frozen.push_back(Arc::new(full));
        }
        Ok(())
    }

    /// Returns the value of the newest write to `key`, or `None` if the key
    /// was never written or its newest write is a delete.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        {
            let chain = self.shared.chain.read().unwrap();
            if let Some(value) = chain.active.get(key) {
                return Ok(not_tombstone(value.to_vec()));
            }
            for memtable in chain.frozen.iter().rev() {
                if let Some(value) = memtable.get(key) {
                    return Ok(not_tombstone(value.to_vec()));
                }
            }
        }

        match self.shared.manager.find(key)? {
            Some(value) => Ok(not_tombstone(value)),
            None => Ok(None),
        }
    }

    /// Removes `key` by writing a tombstone over it.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.put(key, &[])
    }

    /// Synchronously flushes every memtable, frozen and active, to level-0
    /// SSTables, oldest first. The chain lock is held only to rotate the
    /// active table and to pop each flushed one; no I/O happens under it. A
    /// failed add leaves the remaining tables in place for a retry.
    pub fn flush(&self) -> Result<()> {
        {
            let mut chain = self.shared.chain.write().unwrap();
            if !chain.active.is_empty() {
                let active = std::mem::take(&mut chain.active);
                chain.frozen.push_back(Arc::new(active));
            }
        }

        while flush_oldest(&self.shared)? {}
        Ok(())
    }

    /// Synchronously compacts level 0 into a single level-1 SSTable.
    pub fn compact(&self) -> Result<()> {
        self.shared.manager.compact()
    }

    /// Stops the flush loop and flushes all in-memory state. Idempotent;
    /// concurrent writers must be quiesced by the caller first.
    pub fn close(&self) -> Result<()> {
        let handle = self.flush_handle.lock().unwrap().take();
        let Some(handle) = handle else {
            return Ok(());
        };

        let _ = self.flush_stop.send(());
        handle
            .join()
            .map_err(|_| Error::Io(std::io::Error::other("flush loop panicked")))?;

        self.flush()
    }

    /// Snapshot of memtable and level occupancy.
    pub fn stats(&self) -> Stats {
        let (active_memtable_size, frozen_memtables) = {
            let chain = self.shared.chain.read().unwrap();
            (chain.active.size(), chain.frozen.len())
        };
        Stats {
            active_memtable_size,
            frozen_memtables,
            tables_per_level: self.shared.manager.table_counts(),
        }
    }
}

impl Drop for LsmTree {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::error!(error = %err, "close on drop failed");
        }
    }
}

fn not_tombstone(value: Vec<u8>) -> Option<Vec<u8>> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Body of the background flush thread: wake on each tick, flush the excess
/// oldest frozen memtables, exit on the stop signal.
fn flush_loop(shared: Arc<Shared>, interval: Duration, max_memtables: usize, stop: Receiver<()>) {
    let ticker = tick(interval);
    loop {
        crossbeam_channel::select! {
            recv(stop) -> _ => return,
            recv(ticker) -> _ => flush_excess(&shared, max_memtables),
        }
    }
}

/// Flushes the oldest frozen memtable, returning false when none remain.
///
/// The chain lock is never held across the SSTable write: the front table
/// is cloned out under a read lock, the I/O runs with no locks held, and a
/// write lock is re-acquired only to pop the flushed entry. The memtable
/// leaves the chain after its SSTable is published, so concurrent reads
/// never miss it; a failed add leaves it in place for a retry.
fn flush_oldest(shared: &Shared) -> Result<bool> {
    let memtable = {
        let chain = shared.chain.read().unwrap();
        chain.frozen.front().cloned()
    };
    let Some(memtable) = memtable else {
        return Ok(false);
    };

    shared.manager.add(&memtable)?;

    let mut chain = shared.chain.write().unwrap();
    // Another flusher may have drained the chain while the add ran; only
    // pop the entry just flushed.
    if chain
        .frozen
        .front()
        .is_some_and(|front| Arc::ptr_eq(front, &memtable))
    {
        chain.frozen.pop_front();
    }
    Ok(true)
}

/// Flushes frozen memtables oldest-first until at most `max_memtables`
/// remain.
fn flush_excess(shared: &Shared, max_memtables: usize) {
    loop {
        {
            let chain = shared.chain.read().unwrap();
            if chain.frozen.len() <= max_memtables {
                return;
            }
        }

        match flush_oldest(shared) {
            Ok(true) => {}
            Ok(false) => return,
            Err(Error::InProgress) => {
                tracing::debug!("flush skipped, compaction in progress");
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "periodic flush failed");
                return;
            }
        }
    }
}
