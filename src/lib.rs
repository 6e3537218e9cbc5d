//! # CascadeDB
//!
//! An embeddable, persistent, *ordered* key-value store built on a tiered
//! **Log-Structured Merge Tree (LSM-tree)** with incremental background
//! merges. Designed for fast writes, bounded write latency, and crash-safe
//! operation.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        Engine                             │
//! │  ┌───────────┐      ┌─────────┐   ┌─────────┐             │
//! │  │  Nursery  │ ---> │ Level 8 │-->│ Level 9 │--> …        │
//! │  │ + journal │flush │  A, B   │   │  A, B   │ (cascading  │
//! │  └───────────┘      └─────────┘   └─────────┘  merges)    │
//! │        ▲                  │             │                 │
//! │  put/delete/         incremental    incremental           │
//! │  transact            merge → next   merge → next          │
//! │                                                           │
//! │  get:  nursery → level 8 → level 9 → …  (first hit wins)  │
//! │  fold: MergeIterator over nursery + all level files,      │
//! │        streamed by a FoldWorker with per-item acks        │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Writes land journal-first in the [`nursery`]; a full nursery is frozen
//! into a sorted file and injected into the top level. Each level holds at
//! most two files; when the second arrives, an incremental merge produces a
//! single file for the next (twice as large) level. Merge work is paced by
//! the write stream, so a write never waits for more than one bounded merge
//! quantum.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Coordinator — open, read, write, transact, fold, close |
//! | [`nursery`] | Bounded in-memory write buffer with journal recovery |
//! | [`journal`] | CRC-protected append-only log with torn-tail healing |
//! | [`sstable`] | Immutable sorted files with bloom filters and block compression |
//! | [`level`] | One LSM tier — two files and an incremental merge task |
//! | [`fold`] | Merge iterator and fold worker with caller back-pressure |
//! | [`encoding`] | Deterministic binary wire format for on-disk structures |
//!
//! ## Key features
//!
//! - **Journaled writes** — every mutation is appended to `nursery.data`
//!   before being applied, with a configurable fsync policy.
//! - **Atomic multi-op transactions** — a batch of puts and deletes shares
//!   one journal record and one logical position in the write order.
//! - **Per-entry expiry** — entries may carry an absolute expiry; expired
//!   entries read as deleted and are physically dropped at the deepest
//!   level.
//! - **Incremental merges** — merge work is performed in small quanta
//!   interleaved with writes, bounding write-path latency.
//! - **Snapshot and blocking folds** — ordered range iteration over a
//!   pinned snapshot, or over the most compact structure for short reads.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use cascadedb::engine::{Engine, WriteOp};
//!
//! let db = Engine::open("/tmp/my_store")?;
//!
//! db.put(b"hello".to_vec(), b"world".to_vec())?;
//! assert_eq!(db.get(b"hello")?, Some(b"world".to_vec()));
//!
//! db.transact(vec![
//!     WriteOp::Put(b"a".to_vec(), b"1".to_vec()),
//!     WriteOp::Delete(b"hello".to_vec()),
//! ])?;
//!
//! let keys = db.fold(Vec::new(), |mut acc, key, _value| {
//!     acc.push(key);
//!     Ok(acc)
//! })?;
//!
//! db.close()?;
//! # Ok::<(), cascadedb::engine::EngineError>(())
//! ```

pub mod encoding;
pub mod engine;
pub mod fold;
pub mod journal;
pub mod level;
pub mod nursery;
pub mod sstable;

pub use engine::{Engine, EngineError, Expiry, Options, WriteOp};
pub use fold::FoldRange;
