//! Storage engine — the single-writer coordinator over the nursery and
//! the level chain.
//!
//! ## Design overview
//!
//! The engine serializes every mutation through one internal lock. Writes
//! go journal-first into the [`nursery`](crate::nursery); a full nursery
//! is frozen into a sorted file, injected into the top level, and paid
//! for with a fixed quantum of merge work across the whole level chain.
//! That pacing is the store's central liveness invariant: a level `n`
//! receives a new input at most once per `2^(n-TOP)` flushes while a full
//! merge there consumes at most `2^(n+1)` units, so a quantum of
//! `2 * 2^TOP` units per level per flush retires every merge before its
//! level can fill again — an inject never waits on an unfinished merge in
//! steady state.
//!
//! Reads consult the nursery under the lock, then release it and walk the
//! level chain through a reply continuation — the engine never holds its
//! lock across file I/O.
//!
//! Folds pin their sources (the nursery snapshot and refcounted file
//! handles from every level) while the write lock is held, which is
//! exactly the snapshot point: writes admitted afterwards are invisible
//! to that fold. Delivery runs on a dedicated fold worker with per-item
//! acknowledgements.
//!
//! ## Failure policy
//!
//! An error on the write path (journal append, flush staging, inject,
//! merge quantum) halts the engine: every subsequent operation fails with
//! [`EngineError::Halted`] until the store is reopened. Read-path errors
//! fail only the read. Recovery heals torn journal tails and stray merge
//! temps silently; corrupt sorted files are fatal to `open`.

pub mod utils;
pub use utils::{level_capacity, unix_now, Entry, Expiry, LookupOutcome, WriteOp, TOP_LEVEL};

pub use crate::journal::SyncStrategy;
pub use crate::sstable::Compression;

#[cfg(test)]
mod tests;

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use crossbeam::channel::{unbounded, Receiver};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fold::{EntryStream, FoldError, FoldMessage, FoldRange, FoldWorker};
use crate::level::{parse_level_file_name, EngineNotice, LevelError, LevelHandle};
use crate::nursery::{Nursery, NurseryError};
use crate::sstable::{SstError, WriterConfig};

/// Units of merge work driven at every level per nursery flush.
///
/// Two input entries per incoming entry is the exact break-even rate for
/// a doubling level chain; see the module docs.
pub(crate) const MERGE_QUANTUM: u64 = 2 * level_capacity(TOP_LEVEL) as u64;

// ------------------------------------------------------------------------------------------------
// Error types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Error originating in the nursery.
    #[error("Nursery error: {0}")]
    Nursery(#[from] NurseryError),

    /// Error originating in the level chain.
    #[error("Level error: {0}")]
    Level(#[from] LevelError),

    /// Error originating in the sorted-file codec.
    #[error("Sorted file error: {0}")]
    Sst(#[from] SstError),

    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The caller passed something unusable: an empty key, an inverted
    /// range, a zero expiry, or an oversized transaction batch.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The fold worker stopped without delivering a terminator.
    #[error("Fold worker died: {0}")]
    FoldWorkerDied(String),

    /// A previous write-path failure stopped the engine; reopen the store.
    #[error("Engine halted by a previous write error")]
    Halted,

    /// The store handle was closed.
    #[error("Store is closed")]
    Closed,

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// How merge work is scheduled against the write stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// Run a scheduled merge to completion at the first quantum —
    /// maximizes throughput at the cost of occasional long writes.
    Fast,

    /// Spread merge work evenly across quanta — uniform write latency.
    #[default]
    Predictable,
}

/// Configuration for an [`Engine`] instance, passed to
/// [`Engine::open_with`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Sorted-file block compression codec.
    pub compress: Compression,

    /// Target payload size of one sorted-file data block.
    pub page_size: usize,

    /// Buffer capacity for journal replay.
    pub read_buffer_size: usize,

    /// Buffer capacity for sorted-file writers.
    pub write_buffer_size: usize,

    /// Merge pacing policy.
    pub merge_strategy: MergeStrategy,

    /// Journal durability policy.
    pub sync_strategy: SyncStrategy,

    /// Default TTL in seconds applied to writes that carry no explicit
    /// expiry; `0` means such writes never expire.
    pub expiry_secs: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            compress: Compression::None,
            page_size: 4096,
            read_buffer_size: 64 * 1024,
            write_buffer_size: 64 * 1024,
            merge_strategy: MergeStrategy::Predictable,
            sync_strategy: SyncStrategy::Always,
            expiry_secs: 0,
        }
    }
}

impl Options {
    /// Sorted-file writer knobs for a run of up to `expected` entries.
    pub(crate) fn writer_config(&self, expected: usize) -> WriterConfig {
        WriterConfig {
            compression: self.compress,
            page_size: self.page_size,
            write_buffer_size: self.write_buffer_size,
            expected_entries: expected,
        }
    }
}

/// Snapshot of engine statistics returned by [`Engine::stats`].
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Keys currently buffered in the nursery.
    pub nursery_len: usize,

    /// Nursery capacity (entries per flush).
    pub nursery_capacity: usize,

    /// Deepest level materialized so far.
    pub max_level: usize,
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

struct EngineInner {
    dir: PathBuf,
    opts: Arc<Options>,

    /// The write buffer; `None` only transiently during a flush or after
    /// close.
    nursery: Option<Nursery>,

    /// Entry point of the level chain.
    top: Option<LevelHandle>,

    /// Deepest materialized level, maintained from [`EngineNotice`]s.
    max_level: usize,

    notices_rx: Receiver<EngineNotice>,

    halted: bool,
    closed: bool,
}

/// The store handle.
///
/// Thread-safe: clones share one engine. All mutations serialize through
/// the internal lock; reads and folds release it before any file I/O.
pub struct Engine {
    inner: Arc<Mutex<EngineInner>>,
}

impl Clone for Engine {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Engine {
    /// Open (or create) a store with default options.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, EngineError> {
        Self::open_with(dir, Options::default())
    }

    /// Open (or create) a store rooted at `dir`.
    ///
    /// On an existing directory this runs full recovery: stray `.tmp`
    /// merge outputs are deleted, the level chain is rebuilt from the
    /// deepest level upward, all pending merge debt is paid down before
    /// writes are admitted, and a leftover nursery journal is replayed
    /// and flushed into the top level.
    pub fn open_with<P: AsRef<Path>>(dir: P, opts: Options) -> Result<Self, EngineError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let opts = Arc::new(opts);
        let (notices_tx, notices_rx) = unbounded();

        // Discover materialized levels; clear temp files from interrupted
        // merges and flushes (their inputs are intact, the work is simply
        // redone).
        let mut max_level = TOP_LEVEL;
        for dirent in fs::read_dir(&dir)? {
            let dirent = dirent?;
            let Some(name) = dirent.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if name.ends_with(".tmp") {
                warn!(file = %name, "removing stale temp file");
                fs::remove_file(dirent.path())?;
                continue;
            }
            if let Some(level) = parse_level_file_name(&name) {
                max_level = max_level.max(level);
            }
        }

        // Build the chain bottom-up so each level links to the one below.
        let mut next: Option<LevelHandle> = None;
        for number in (TOP_LEVEL..=max_level).rev() {
            let handle = LevelHandle::spawn(
                dir.clone(),
                number,
                next.take(),
                Arc::clone(&opts),
                notices_tx.clone(),
            )?;
            next = Some(handle);
        }
        let top = next.ok_or_else(|| EngineError::Internal("empty level chain".into()))?;

        // Pre-pay pending merge debt in staged quanta, so the write path
        // starts with its no-deadlock invariant intact. Completing one
        // merge can cascade a file downward and schedule another, hence
        // the loop.
        loop {
            let pending = top.unmerged_total()?;
            if pending == 0 {
                break;
            }
            debug!(pending, "paying down merge debt");
            top.merge_quantum(pending)?;
        }

        // Replay a leftover nursery journal into the chain, then start
        // fresh. The recovery flush also gets its merge quantum.
        Nursery::recover(&dir, &top, &opts)?;
        top.merge_quantum(MERGE_QUANTUM)?;
        let nursery = Nursery::create(&dir, &opts)?;

        let mut inner = EngineInner {
            dir: dir.clone(),
            opts,
            nursery: Some(nursery),
            top: Some(top),
            max_level,
            notices_rx,
            halted: false,
            closed: false,
        };
        inner.drain_notices();

        info!(dir = %dir.display(), max_level = inner.max_level, "store opened");
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Insert or overwrite a key, applying the store's default TTL.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), EngineError> {
        let mut inner = self.lock()?;
        let expiry = inner.default_expiry();
        inner.write(key, Some(value), expiry)
    }

    /// Insert or overwrite a key with an explicit expiry deadline.
    pub fn put_with_expiry(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        expiry: Expiry,
    ) -> Result<(), EngineError> {
        if expiry == Expiry::At(0) {
            return Err(EngineError::InvalidArgument(
                "expiry must be a positive timestamp".into(),
            ));
        }
        let mut inner = self.lock()?;
        inner.write(key, Some(value), expiry)
    }

    /// Delete a key by writing a tombstone.
    pub fn delete(&self, key: Vec<u8>) -> Result<(), EngineError> {
        let mut inner = self.lock()?;
        inner.write(key, None, Expiry::Never)
    }

    /// Apply a batch of writes atomically.
    ///
    /// All ops occupy one position in the write order and share one
    /// journal record: a concurrent reader (or a crash) sees either all
    /// of them or none. When a key appears more than once, the last op
    /// wins. A batch larger than the nursery capacity is rejected — it
    /// could not be flushed as a single legal top-level file.
    pub fn transact(&self, ops: Vec<WriteOp>) -> Result<(), EngineError> {
        if ops.is_empty() {
            return Ok(());
        }
        for op in &ops {
            if op.key().is_empty() {
                return Err(EngineError::InvalidArgument("empty key".into()));
            }
        }

        let mut inner = self.lock()?;
        inner.check_live()?;
        inner.drain_notices();

        let (len, capacity) = {
            let nursery = inner
                .nursery
                .as_ref()
                .ok_or_else(|| EngineError::Internal("nursery missing".into()))?;
            (nursery.len(), nursery.capacity())
        };
        if ops.len() > capacity {
            return Err(EngineError::InvalidArgument(format!(
                "transaction of {} ops exceeds nursery capacity {capacity}",
                ops.len()
            )));
        }
        // Flush first if the batch would overflow the buffer, so a staged
        // file never exceeds the top level's size class.
        if len + ops.len() > capacity {
            inner.flush_nursery()?;
        }

        let expiry = inner.default_expiry();
        let entries: Vec<Entry> = ops
            .into_iter()
            .map(|op| match op {
                WriteOp::Put(key, value) => Entry {
                    key,
                    value: Some(value),
                    expiry,
                },
                WriteOp::Delete(key) => Entry::tombstone(key),
            })
            .collect();

        let nursery = inner
            .nursery
            .as_mut()
            .ok_or_else(|| EngineError::Internal("nursery missing".into()))?;
        if let Err(e) = nursery.transact(entries) {
            inner.halted = true;
            return Err(e.into());
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Look up a single key.
    ///
    /// Returns `Ok(None)` for a missing, deleted, or expired key. The
    /// nursery is checked under the write lock; the level chain is walked
    /// afterwards with the lock released, via a reply continuation that
    /// whichever level finds a definitive answer fulfils.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let now = unix_now();

        let top = {
            let inner = self.lock()?;
            inner.check_live()?;
            let nursery = inner
                .nursery
                .as_ref()
                .ok_or_else(|| EngineError::Internal("nursery missing".into()))?;
            match nursery.lookup(key, now) {
                LookupOutcome::Found(value) => return Ok(Some(value)),
                LookupOutcome::Tombstone => return Ok(None),
                LookupOutcome::Absent => inner
                    .top
                    .as_ref()
                    .ok_or_else(|| EngineError::Internal("level chain missing".into()))?
                    .clone(),
            }
        };

        match top.lookup(key.to_vec(), now)? {
            LookupOutcome::Found(value) => Ok(Some(value)),
            LookupOutcome::Tombstone | LookupOutcome::Absent => Ok(None),
        }
    }

    /// Fold over the entire store in key order.
    ///
    /// The callback receives the accumulator and each `(key, value)`;
    /// returning an error cancels the fold, cleans up the worker, and
    /// re-raises that error unchanged.
    pub fn fold<B, F>(&self, acc: B, f: F) -> Result<B, EngineError>
    where
        F: FnMut(B, Vec<u8>, Vec<u8>) -> Result<B, EngineError>,
    {
        self.fold_range(FoldRange::all(), acc, f)
    }

    /// Fold over `[from, to)` with an optional result limit.
    ///
    /// Limits below [`BLOCKING_FOLD_LIMIT`](crate::fold::BLOCKING_FOLD_LIMIT)
    /// run in blocking mode: pending merges complete before the fold
    /// starts, so the short read sees the most compact structure.
    /// Larger or unlimited folds snapshot the store at call time and are
    /// unaffected by concurrent writes.
    pub fn fold_range<B, F>(&self, range: FoldRange, acc: B, mut f: F) -> Result<B, EngineError>
    where
        F: FnMut(B, Vec<u8>, Vec<u8>) -> Result<B, EngineError>,
    {
        if let (Some(from), Some(to)) = (&range.from, &range.to) {
            if from > to {
                return Err(EngineError::InvalidArgument("inverted range".into()));
            }
        }
        if range.limit == Some(0) {
            return Ok(acc);
        }

        let now = unix_now();
        let blocking = range.is_blocking();

        // Pin every source while holding the write lock — this is the
        // snapshot point. The nursery contributes a frozen copy; each
        // level contributes refcounted file handles.
        let (snapshot, files) = {
            let inner = self.lock()?;
            inner.check_live()?;
            let nursery = inner
                .nursery
                .as_ref()
                .ok_or_else(|| EngineError::Internal("nursery missing".into()))?;
            let snapshot = nursery.range_snapshot(range.from.as_deref(), range.to.as_deref());
            let top = inner
                .top
                .as_ref()
                .ok_or_else(|| EngineError::Internal("level chain missing".into()))?;
            let files = top.collect_range(blocking)?;
            (snapshot, files)
        };

        let mut sources: Vec<EntryStream> = Vec::with_capacity(files.len() + 1);
        sources.push(Box::new(snapshot.into_iter().map(Ok)));
        for file in files {
            sources.push(Box::new(
                file.range_reader(range.from.clone(), range.to.clone()),
            ));
        }

        let stream = FoldWorker::spawn(sources, range.limit, now).map_err(|e| match e {
            FoldError::Io(io) => EngineError::Io(io),
            other => EngineError::FoldWorkerDied(other.to_string()),
        })?;

        let mut acc = acc;
        loop {
            match stream.next_message() {
                Some(FoldMessage::Item { key, value }) => {
                    acc = match f(acc, key, value) {
                        Ok(acc) => acc,
                        Err(e) => {
                            // Kill the worker, drain in-flight results,
                            // re-raise the user's error untouched.
                            stream.cancel();
                            return Err(e);
                        }
                    };
                    // A failed ack means the worker is gone; the next
                    // receive reports how it died.
                    let _ = stream.ack();
                }
                Some(FoldMessage::Done) | Some(FoldMessage::Limited) => {
                    stream
                        .finish()
                        .map_err(|e| EngineError::FoldWorkerDied(e.to_string()))?;
                    return Ok(acc);
                }
                None => {
                    return Err(EngineError::FoldWorkerDied(stream.death_reason()));
                }
            }
        }
    }

    /// Engine statistics.
    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let mut inner = self.lock()?;
        inner.drain_notices();
        let nursery = inner
            .nursery
            .as_ref()
            .ok_or_else(|| EngineError::Internal("nursery missing".into()))?;
        Ok(EngineStats {
            nursery_len: nursery.len(),
            nursery_capacity: nursery.capacity(),
            max_level: inner.max_level,
        })
    }

    // --------------------------------------------------------------------------------------------
    // Shutdown
    // --------------------------------------------------------------------------------------------

    /// Close the store: flush the nursery into the level chain, stop every
    /// level task, and release all resources. Idempotent.
    pub fn close(&self) -> Result<(), EngineError> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Ok(());
        }

        if inner.halted {
            // State is suspect after a write failure; drop the buffer and
            // just tear down. The journal stays behind for recovery.
            inner.nursery = None;
        } else if let Some(nursery) = inner.nursery.take() {
            let top = inner
                .top
                .as_ref()
                .ok_or_else(|| EngineError::Internal("level chain missing".into()))?;
            nursery.finish(top, &inner.opts)?;
        }

        if let Some(top) = inner.top.take() {
            top.close()?;
        }
        inner.closed = true;
        info!(dir = %inner.dir.display(), "store closed");
        Ok(())
    }

    /// Close without flushing and delete every store file. Idempotent in
    /// the same way `close` is.
    pub fn destroy(&self) -> Result<(), EngineError> {
        let mut inner = self.lock()?;

        // Dropping the nursery releases the journal handle; the file goes
        // with the directory below.
        inner.nursery = None;
        if let Some(top) = inner.top.take() {
            top.destroy()?;
        }
        if inner.dir.exists() {
            fs::remove_dir_all(&inner.dir)?;
        }
        inner.closed = true;
        info!(dir = %inner.dir.display(), "store destroyed");
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, EngineInner>, EngineError> {
        self.inner
            .lock()
            .map_err(|_| EngineError::Internal("engine lock poisoned".into()))
    }
}

impl EngineInner {
    fn check_live(&self) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        if self.halted {
            return Err(EngineError::Halted);
        }
        Ok(())
    }

    /// Expiry for writes that carry none: the store default TTL, resolved
    /// to an absolute deadline at write time.
    fn default_expiry(&self) -> Expiry {
        if self.opts.expiry_secs == 0 {
            Expiry::Never
        } else {
            Expiry::At(unix_now() + self.opts.expiry_secs)
        }
    }

    /// The single-write path shared by put and delete.
    fn write(
        &mut self,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
        expiry: Expiry,
    ) -> Result<(), EngineError> {
        if key.is_empty() {
            return Err(EngineError::InvalidArgument("empty key".into()));
        }
        self.check_live()?;
        self.drain_notices();

        // Check-then-insert: if this write would overflow the buffer,
        // freeze the nursery first so a staged file never exceeds the top
        // level's size class.
        let needs_flush = {
            let nursery = self
                .nursery
                .as_ref()
                .ok_or_else(|| EngineError::Internal("nursery missing".into()))?;
            nursery.len() + 1 > nursery.capacity()
        };
        if needs_flush {
            self.flush_nursery()?;
        }

        let nursery = self
            .nursery
            .as_mut()
            .ok_or_else(|| EngineError::Internal("nursery missing".into()))?;
        if let Err(e) = nursery.add(key, value, expiry) {
            self.halted = true;
            return Err(e.into());
        }
        Ok(())
    }

    /// Freeze the full nursery into the top level and drive one merge
    /// quantum across the chain. Any failure here halts the engine.
    fn flush_nursery(&mut self) -> Result<(), EngineError> {
        let result = (|| -> Result<(), EngineError> {
            let nursery = self
                .nursery
                .take()
                .ok_or_else(|| EngineError::Internal("nursery missing".into()))?;
            let top = self
                .top
                .as_ref()
                .ok_or_else(|| EngineError::Internal("level chain missing".into()))?;
            nursery.finish(top, &self.opts)?;
            self.nursery = Some(Nursery::create(&self.dir, &self.opts)?);

            let top = self
                .top
                .as_ref()
                .ok_or_else(|| EngineError::Internal("level chain missing".into()))?;
            top.merge_quantum(MERGE_QUANTUM)?;
            Ok(())
        })();

        if result.is_err() {
            self.halted = true;
        } else {
            self.drain_notices();
        }
        result
    }

    /// Absorb pending notices from the level chain.
    fn drain_notices(&mut self) {
        while let Ok(notice) = self.notices_rx.try_recv() {
            match notice {
                EngineNotice::BottomLevel(level) => {
                    if level > self.max_level {
                        debug!(level, "level chain deepened");
                        self.max_level = level;
                    }
                }
            }
        }
    }
}
