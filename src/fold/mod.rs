//! Fold machinery — the shadowing merge iterator and the fold worker.
//!
//! A fold sees one ordered, de-duplicated stream across the nursery
//! snapshot and every pinned level file. [`MergeIterator`] produces that
//! stream; [`FoldWorker`] drives it on its own thread and delivers
//! `(key, value)` pairs to the caller one at a time, waiting for an
//! acknowledgement after each. The ack window is the back-pressure: the
//! worker can never run more than one result ahead of the caller, so a
//! slow fold function costs bounded memory.
//!
//! # Shadowing
//!
//! Sources are ordered by priority: the nursery snapshot first, then each
//! level's `B` before its `A`, upper levels before lower ones. For every
//! distinct key only the highest-priority entry survives; if that entry is
//! a tombstone or has expired, the key is omitted entirely.
//!
//! # Cancellation & death
//!
//! The caller cancels by dropping its ack sender; the worker observes the
//! disconnect at its next send or ack wait and exits cleanly. A worker
//! that stops without sending `Done` or `Limited` — a corrupt block, a
//! panic — is reported to the fold caller as a worker death with the
//! underlying reason.


use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    io,
    thread::{self, JoinHandle},
};

use crossbeam::channel::{bounded, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, trace};

use crate::engine::Entry;
use crate::sstable::SstError;

/// Limits below this run in blocking mode: pending top-level merges are
/// completed before the fold starts, so a short read sees the most
/// compact structure.
pub const BLOCKING_FOLD_LIMIT: usize = 10;

// ------------------------------------------------------------------------------------------------
// Error types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by the fold worker.
#[derive(Debug, Error)]
pub enum FoldError {
    /// A pinned source failed mid-stream (corrupt block, I/O error).
    #[error("Sorted file error: {0}")]
    Sst(#[from] SstError),

    /// The worker thread stopped without a terminator.
    #[error("Fold worker died: {0}")]
    WorkerDied(String),

    /// Worker thread could not be spawned.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// ------------------------------------------------------------------------------------------------
// Range
// ------------------------------------------------------------------------------------------------

/// A fold's key range and result limit.
///
/// The range is half-open: keys `k` with `from <= k < to`, where an unset
/// bound is open. `limit` caps the number of emitted pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FoldRange {
    /// Inclusive lower bound; `None` starts at the smallest key.
    pub from: Option<Vec<u8>>,

    /// Exclusive upper bound; `None` runs to the largest key.
    pub to: Option<Vec<u8>>,

    /// Maximum number of results; `None` is unlimited.
    pub limit: Option<usize>,
}

impl FoldRange {
    /// The full keyspace, unlimited.
    pub fn all() -> Self {
        Self::default()
    }

    /// Whether this fold runs in blocking mode (small limits are expected
    /// to be brief and prefer a compact read over write overlap).
    pub fn is_blocking(&self) -> bool {
        matches!(self.limit, Some(limit) if limit < BLOCKING_FOLD_LIMIT)
    }
}

// ------------------------------------------------------------------------------------------------
// MergeIterator
// ------------------------------------------------------------------------------------------------

/// A sorted source of entries; priority is its position in the source
/// vector (0 = highest = newest).
pub type EntryStream = Box<dyn Iterator<Item = Result<Entry, SstError>> + Send>;

struct HeapSlot {
    entry: Entry,
    priority: usize,
}

impl PartialEq for HeapSlot {
    fn eq(&self, other: &Self) -> bool {
        self.entry.key == other.entry.key && self.priority == other.priority
    }
}
impl Eq for HeapSlot {}

impl Ord for HeapSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap on (key ASC, priority ASC): reverse for BinaryHeap.
        self.entry
            .key
            .cmp(&other.entry.key)
            .then(self.priority.cmp(&other.priority))
            .reverse()
    }
}
impl PartialOrd for HeapSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// K-way shadowing merge over prioritized sorted sources.
///
/// Yields `(key, value)` for every live, visible key in ascending order.
/// The first source error ends the stream with that error.
pub struct MergeIterator {
    sources: Vec<EntryStream>,
    heap: BinaryHeap<HeapSlot>,
    now: u64,
    pending_err: Option<SstError>,
    done: bool,
}

impl MergeIterator {
    /// Build the iterator, priming one entry per source.
    ///
    /// `now` is the single notion of "current time" used for every expiry
    /// decision in this fold.
    pub fn new(mut sources: Vec<EntryStream>, now: u64) -> Self {
        let mut heap = BinaryHeap::new();
        let mut pending_err = None;

        for (priority, source) in sources.iter_mut().enumerate() {
            match source.next() {
                Some(Ok(entry)) => heap.push(HeapSlot { entry, priority }),
                Some(Err(e)) => {
                    pending_err = Some(e);
                    break;
                }
                None => {}
            }
        }

        Self {
            sources,
            heap,
            now,
            pending_err,
            done: false,
        }
    }

    /// Pull the next entry from `priority`'s source into the heap.
    fn advance(&mut self, priority: usize) -> Result<(), SstError> {
        match self.sources[priority].next() {
            Some(Ok(entry)) => {
                self.heap.push(HeapSlot { entry, priority });
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }
}

impl Iterator for MergeIterator {
    type Item = Result<(Vec<u8>, Vec<u8>), SstError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(e) = self.pending_err.take() {
            self.done = true;
            return Some(Err(e));
        }

        loop {
            let Some(winner) = self.heap.pop() else {
                self.done = true;
                return None;
            };
            if let Err(e) = self.advance(winner.priority) {
                self.done = true;
                return Some(Err(e));
            }

            // Everything else in the heap with this key is shadowed.
            while self
                .heap
                .peek()
                .is_some_and(|slot| slot.entry.key == winner.entry.key)
            {
                let Some(shadowed) = self.heap.pop() else { break };
                if let Err(e) = self.advance(shadowed.priority) {
                    self.done = true;
                    return Some(Err(e));
                }
            }

            if winner.entry.is_live(self.now) {
                let Entry { key, value, .. } = winner.entry;
                let value = value.unwrap_or_default();
                return Some(Ok((key, value)));
            }
            // Tombstone or expired — the key is invisible; keep going.
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Fold worker
// ------------------------------------------------------------------------------------------------

/// One message from the worker to the fold caller.
#[derive(Debug, PartialEq, Eq)]
pub enum FoldMessage {
    /// The next `(key, value)` pair; must be acknowledged.
    Item { key: Vec<u8>, value: Vec<u8> },
    /// The result limit was reached.
    Limited,
    /// The range is exhausted.
    Done,
}

/// Caller-side handle to a running fold worker.
pub struct FoldStream {
    results: Receiver<FoldMessage>,
    acks: Sender<()>,
    join: Option<JoinHandle<Result<(), FoldError>>>,
}

/// Spawner for fold worker threads.
pub struct FoldWorker;

impl FoldWorker {
    /// Start a worker over the given prioritized sources.
    ///
    /// The merge iterator is built on the worker thread, so even priming
    /// I/O stays off the caller.
    pub fn spawn(
        sources: Vec<EntryStream>,
        limit: Option<usize>,
        now: u64,
    ) -> Result<FoldStream, FoldError> {
        let (results_tx, results_rx) = bounded(1);
        let (acks_tx, acks_rx) = bounded(1);

        let join = thread::Builder::new()
            .name("cascadedb-fold".into())
            .spawn(move || run_worker(sources, limit, now, results_tx, acks_rx))?;

        Ok(FoldStream {
            results: results_rx,
            acks: acks_tx,
            join: Some(join),
        })
    }
}

impl FoldStream {
    /// Receive the next worker message; `None` means the worker stopped
    /// without a terminator (see [`FoldStream::death_reason`]).
    pub fn next_message(&self) -> Option<FoldMessage> {
        self.results.recv().ok()
    }

    /// Acknowledge the last `Item`, releasing the next one. Returns
    /// `false` if the worker is gone.
    pub fn ack(&self) -> bool {
        self.acks.send(()).is_ok()
    }

    /// Cancel the fold: signal the worker, drain anything in flight, and
    /// reap the thread.
    pub fn cancel(mut self) {
        debug!("fold cancelled by caller");
        drop(self.acks);
        // Drain until the worker observes the disconnect and hangs up.
        while self.results.recv().is_ok() {}
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    /// Reap the worker after `Done`/`Limited`.
    pub fn finish(mut self) -> Result<(), FoldError> {
        self.reap()
    }

    /// Reap a worker that stopped without a terminator and describe why.
    pub fn death_reason(mut self) -> String {
        match self.reap() {
            Ok(()) => "terminated without result".into(),
            Err(e) => e.to_string(),
        }
    }

    fn reap(&mut self) -> Result<(), FoldError> {
        let Some(join) = self.join.take() else {
            return Ok(());
        };
        match join.join() {
            Ok(result) => result,
            Err(_) => Err(FoldError::WorkerDied("worker panicked".into())),
        }
    }
}

fn run_worker(
    sources: Vec<EntryStream>,
    limit: Option<usize>,
    now: u64,
    results: Sender<FoldMessage>,
    acks: Receiver<()>,
) -> Result<(), FoldError> {
    let mut iter = MergeIterator::new(sources, now);
    let mut sent = 0usize;

    while let Some(item) = iter.next() {
        let (key, value) = item?;

        if let Some(limit) = limit {
            if sent >= limit {
                trace!(sent, "fold limit reached");
                let _ = results.send(FoldMessage::Limited);
                return Ok(());
            }
        }

        if results.send(FoldMessage::Item { key, value }).is_err() {
            // Caller hung up — a cancellation, not an error.
            return Ok(());
        }
        if acks.recv().is_err() {
            return Ok(());
        }
        sent += 1;
    }

    let _ = results.send(FoldMessage::Done);
    trace!(sent, "fold exhausted");
    Ok(())
}
