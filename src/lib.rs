//! Cinder: an embedded, single-node, ordered key-value store built as a
//! log-structured merge tree.
//!
//! Keys are arbitrary non-empty byte strings ordered lexicographically;
//! values are arbitrary byte strings. Writes land in an in-memory ordered
//! table and are amortized to disk by background flushing and leveled
//! compaction.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────┐
//! │ Active Memtable │───►│ Frozen Memtables │
//! │    (AA-tree)    │    │    (AA-trees)    │
//! └─────────────────┘    └──────────────────┘
//!                                 │ flush
//!                                 ▼
//!                        ┌──────────────────┐
//!                        │     Level 0      │
//!                        │ (SSTables, may   │
//!                        │  overlap in key) │
//!                        └──────────────────┘
//!                                 │ compact
//!                                 ▼
//!                        ┌──────────────────┐
//!                        │     Level 1      │
//!                        └──────────────────┘
//! ```
//!
//! Each SSTable is an immutable sorted run with three in-memory sidecars: a
//! sparse index mapping keys to byte offsets, a bloom filter over its keys,
//! and a meta record naming its level and item count.
//!
//! A write appends to the active memtable; once the table exceeds the
//! configured size it is frozen and later flushed to level 0. A read checks
//! memtables newest-first, then level 0 newest-first, then deeper levels;
//! the first hit wins. A delete writes an empty value, the tombstone, which
//! shadows older values until compaction drops the key entirely.
//!
//! # Durability
//!
//! There is no write-ahead log. Writes not yet flushed are lost on crash;
//! [`LsmTree::close`] flushes everything, so an orderly shutdown is
//! lossless.
//!
//! # Example
//!
//! ```no_run
//! use cinder::LsmTree;
//!
//! let db = LsmTree::open("./data")?;
//! db.put(b"name", b"cinder")?;
//! assert_eq!(db.get(b"name")?, Some(b"cinder".to_vec()));
//! db.delete(b"name")?;
//! assert_eq!(db.get(b"name")?, None);
//! db.close()?;
//! # Ok::<(), cinder::Error>(())
//! ```

pub mod bloom;
pub mod config;
pub mod error;
pub mod memtable;
pub mod sstable;
pub mod tree;

#[cfg(test)]
pub mod tmpfs;

pub use config::Config;
pub use error::{Error, Result};
pub use tree::{LsmTree, Stats};
