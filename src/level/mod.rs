//! Level module — one tier of the LSM tree.
//!
//! A level holds up to two sorted files of its size class: `A` (older) and
//! `B` (newer). When `B` arrives, an incremental merge starts producing a
//! single file for the next level; the merge runs in quanta driven by the
//! write stream, so it interleaves with foreground traffic instead of
//! stalling it.
//!
//! # Task model
//!
//! Each materialized level is one OS thread owning its files and merge
//! state, served by a typed channel. Levels form a singly-linked chain;
//! messages that concern the whole chain (lookups, range collects, merge
//! quanta, close) cascade from the top level downward, each level either
//! answering the caller directly or forwarding the caller's reply sender
//! to the next level. The engine never holds a lock across level I/O —
//! it parks on a one-shot reply channel instead.
//!
//! When a merge cascades into a never-before-used tier, the level spawns
//! it on demand and notifies the engine through an [`EngineNotice`]
//! sender. The level chain holds no reference to the engine.
//!
//! # Invariants
//!
//! - `b` is only occupied while `a` is, and whenever both are occupied a
//!   merge is scheduled or running.
//! - An inject that finds both slots occupied completes the pending merge
//!   first; because merge pacing retires every merge before its level can
//!   refill (see the engine's quantum sizing), this wait is bounded.
//! - Tombstones and expired entries are dropped by a merge only at the
//!   deepest level; everywhere else they are preserved as shadows.
//! - Merge output is written to `C-<n>.tmp` and renamed into the next
//!   level's canonical slot only after a durable finish; recovery deletes
//!   stray `.tmp` files and reschedules the merge from the intact inputs.

mod merge;

#[cfg(test)]
mod tests;

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
};

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::engine::{unix_now, LookupOutcome, MergeStrategy, Options};
use crate::sstable::{SortedFile, SstError};

use merge::MergeState;

// ------------------------------------------------------------------------------------------------
// File naming
// ------------------------------------------------------------------------------------------------

/// Canonical name of the older file at `level`.
pub(crate) fn a_file_name(level: usize) -> String {
    format!("A-{level}.data")
}

/// Canonical name of the newer file at `level`.
pub(crate) fn b_file_name(level: usize) -> String {
    format!("B-{level}.data")
}

/// Merge-in-progress output at `level`; the `.tmp` suffix keeps it out of
/// level discovery and marks it for deletion during recovery.
pub(crate) fn merge_temp_name(level: usize) -> String {
    format!("C-{level}.tmp")
}

/// Parse a canonical level-file name (`<tag>-<level>.data` with a
/// non-numeric tag), returning the level number.
pub(crate) fn parse_level_file_name(name: &str) -> Option<usize> {
    let stem = name.strip_suffix(".data")?;
    let (tag, level) = stem.rsplit_once('-')?;
    if tag.is_empty() || tag.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    level.parse().ok()
}

// ------------------------------------------------------------------------------------------------
// Error types
// ------------------------------------------------------------------------------------------------

/// Errors returned by level operations.
#[derive(Debug, Error)]
pub enum LevelError {
    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Sorted-file failure.
    #[error("Sorted file error: {0}")]
    Sst(#[from] SstError),

    /// The level task is gone — its channel disconnected or its thread
    /// terminated.
    #[error("Level task terminated")]
    Closed,

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Engine notices
// ------------------------------------------------------------------------------------------------

/// Out-of-band notifications from the level chain to the engine.
///
/// Sent over a plain channel so a level never needs a reference to the
/// engine that (transitively) owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineNotice {
    /// A merge cascaded into a never-before-used level; the chain now
    /// extends to this depth.
    BottomLevel(usize),
}

// ------------------------------------------------------------------------------------------------
// Messages
// ------------------------------------------------------------------------------------------------

enum LevelMsg {
    Inject {
        path: PathBuf,
        reply: Sender<Result<(), LevelError>>,
    },
    Lookup {
        key: Vec<u8>,
        now: u64,
        reply: Sender<Result<LookupOutcome, LevelError>>,
    },
    CollectRange {
        blocking: bool,
        sources: Vec<SortedFile>,
        reply: Sender<Result<Vec<SortedFile>, LevelError>>,
    },
    MergeQuantum {
        units: u64,
        reply: Sender<Result<(), LevelError>>,
    },
    UnmergedCount {
        acc: u64,
        reply: Sender<u64>,
    },
    Close {
        reply: Sender<()>,
    },
    Destroy {
        reply: Sender<()>,
    },
}

// ------------------------------------------------------------------------------------------------
// LevelHandle — the channel-facing side
// ------------------------------------------------------------------------------------------------

/// Handle to a level task.
///
/// Cloning shares the underlying task; the thread is joined by whichever
/// handle runs [`close`](Self::close) or [`destroy`](Self::destroy).
pub struct LevelHandle {
    tx: Sender<LevelMsg>,
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Clone for LevelHandle {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            join: Arc::clone(&self.join),
        }
    }
}

impl std::fmt::Debug for LevelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LevelHandle").finish_non_exhaustive()
    }
}

impl LevelHandle {
    /// Open the level's on-disk state and start its task thread.
    ///
    /// File problems surface here, synchronously, rather than inside the
    /// task. If both `A` and `B` survive on disk the merge between them is
    /// rescheduled immediately.
    pub fn spawn(
        dir: PathBuf,
        number: usize,
        next: Option<LevelHandle>,
        opts: Arc<Options>,
        notices: Sender<EngineNotice>,
    ) -> Result<Self, LevelError> {
        let level = Level::open_state(dir, number, next, opts, notices)?;
        let (tx, rx) = unbounded();
        let join = thread::Builder::new()
            .name(format!("cascadedb-level-{number}"))
            .spawn(move || level.run(rx))?;
        Ok(Self {
            tx,
            join: Arc::new(Mutex::new(Some(join))),
        })
    }

    /// Hand a staged sorted file to this level. The level renames it into
    /// its canonical `A`/`B` slot; if both slots are occupied, the pending
    /// merge is completed first.
    pub fn inject(&self, path: PathBuf) -> Result<(), LevelError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(LevelMsg::Inject {
                path,
                reply: reply_tx,
            })
            .map_err(|_| LevelError::Closed)?;
        reply_rx.recv().map_err(|_| LevelError::Closed)?
    }

    /// Point lookup through this level and everything below it.
    ///
    /// The reply is fulfilled by whichever level finds a definitive
    /// answer; the caller parks on the one-shot channel, not on any lock.
    pub fn lookup(&self, key: Vec<u8>, now: u64) -> Result<LookupOutcome, LevelError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(LevelMsg::Lookup {
                key,
                now,
                reply: reply_tx,
            })
            .map_err(|_| LevelError::Closed)?;
        reply_rx.recv().map_err(|_| LevelError::Closed)?
    }

    /// Pin the chain's current files for a fold, in priority order
    /// (each level contributes `B` before `A`, upper levels first).
    ///
    /// With `blocking` set, each level completes any running merge before
    /// contributing, so short folds see the most compact structure.
    pub fn collect_range(&self, blocking: bool) -> Result<Vec<SortedFile>, LevelError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(LevelMsg::CollectRange {
                blocking,
                sources: Vec::new(),
                reply: reply_tx,
            })
            .map_err(|_| LevelError::Closed)?;
        reply_rx.recv().map_err(|_| LevelError::Closed)?
    }

    /// Drive up to `units` units of merge work at every level of the
    /// chain, waiting until the whole cascade has finished its quantum.
    pub fn merge_quantum(&self, units: u64) -> Result<(), LevelError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(LevelMsg::MergeQuantum {
                units,
                reply: reply_tx,
            })
            .map_err(|_| LevelError::Closed)?;
        reply_rx.recv().map_err(|_| LevelError::Closed)?
    }

    /// Total pending merge work (in input entries) across the chain.
    pub fn unmerged_total(&self) -> Result<u64, LevelError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(LevelMsg::UnmergedCount {
                acc: 0,
                reply: reply_tx,
            })
            .map_err(|_| LevelError::Closed)?;
        reply_rx.recv().map_err(|_| LevelError::Closed)
    }

    /// Close the chain: cascade, release files, stop every task.
    pub fn close(&self) -> Result<(), LevelError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(LevelMsg::Close { reply: reply_tx })
            .map_err(|_| LevelError::Closed)?;
        reply_rx.recv().map_err(|_| LevelError::Closed)?;
        self.join_task()
    }

    /// Destroy the chain: cascade, delete every level file, stop every
    /// task.
    pub fn destroy(&self) -> Result<(), LevelError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(LevelMsg::Destroy { reply: reply_tx })
            .map_err(|_| LevelError::Closed)?;
        reply_rx.recv().map_err(|_| LevelError::Closed)?;
        self.join_task()
    }

    fn join_task(&self) -> Result<(), LevelError> {
        let handle = self
            .join
            .lock()
            .map_err(|_| LevelError::Internal("join handle lock poisoned".into()))?
            .take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| LevelError::Internal("level task panicked".into()))?;
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Level — the task-owned state
// ------------------------------------------------------------------------------------------------

struct Level {
    dir: PathBuf,
    number: usize,
    a: Option<SortedFile>,
    b: Option<SortedFile>,
    merge: Option<MergeState>,
    next: Option<LevelHandle>,
    opts: Arc<Options>,
    notices: Sender<EngineNotice>,
}

impl Level {
    /// Open the on-disk state for level `number` under `dir`.
    fn open_state(
        dir: PathBuf,
        number: usize,
        next: Option<LevelHandle>,
        opts: Arc<Options>,
        notices: Sender<EngineNotice>,
    ) -> Result<Self, LevelError> {
        let a_path = dir.join(a_file_name(number));
        let b_path = dir.join(b_file_name(number));

        // A `B` without an `A` means a crash hit the narrow window where a
        // finished merge had unlinked `A` but not yet `B`; promote it.
        if !a_path.exists() && b_path.exists() {
            warn!(level = number, "found B without A, promoting");
            fs::rename(&b_path, &a_path)?;
        }

        let a = if a_path.exists() {
            Some(SortedFile::open(&a_path)?)
        } else {
            None
        };
        let b = if b_path.exists() {
            Some(SortedFile::open(&b_path)?)
        } else {
            None
        };

        let mut level = Self {
            dir,
            number,
            a,
            b,
            merge: None,
            next,
            opts,
            notices,
        };
        if level.a.is_some() && level.b.is_some() {
            debug!(level = number, "rescheduling interrupted merge");
            level.schedule_merge()?;
        }

        info!(
            level = number,
            has_a = level.a.is_some(),
            has_b = level.b.is_some(),
            "level opened"
        );
        Ok(level)
    }

    fn run(mut self, rx: Receiver<LevelMsg>) {
        while let Ok(msg) = rx.recv() {
            match msg {
                LevelMsg::Inject { path, reply } => {
                    let result = self.handle_inject(path);
                    let _ = reply.send(result);
                }
                LevelMsg::Lookup { key, now, reply } => self.handle_lookup(key, now, reply),
                LevelMsg::CollectRange {
                    blocking,
                    sources,
                    reply,
                } => self.handle_collect(blocking, sources, reply),
                LevelMsg::MergeQuantum { units, reply } => {
                    match self.do_merge_work(units) {
                        Ok(()) => match &self.next {
                            Some(next) => {
                                if next
                                    .tx
                                    .send(LevelMsg::MergeQuantum { units, reply: reply.clone() })
                                    .is_err()
                                {
                                    let _ = reply.send(Err(LevelError::Closed));
                                }
                            }
                            None => {
                                let _ = reply.send(Ok(()));
                            }
                        },
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                LevelMsg::UnmergedCount { acc, reply } => {
                    let acc = acc + self.unmerged();
                    match &self.next {
                        Some(next) => {
                            if next
                                .tx
                                .send(LevelMsg::UnmergedCount { acc, reply: reply.clone() })
                                .is_err()
                            {
                                let _ = reply.send(acc);
                            }
                        }
                        None => {
                            let _ = reply.send(acc);
                        }
                    }
                }
                LevelMsg::Close { reply } => {
                    if let Some(next) = self.next.take() {
                        if let Err(e) = next.close() {
                            warn!(level = self.number, error = %e, "child close failed");
                        }
                    }
                    if let Some(merge) = self.merge.take() {
                        // The temp output is garbage now; inputs are intact
                        // and the merge will be rescheduled on reopen.
                        if let Err(e) = merge.writer.abandon() {
                            warn!(level = self.number, error = %e, "failed to drop merge temp");
                        }
                    }
                    self.a = None;
                    self.b = None;
                    debug!(level = self.number, "level closed");
                    let _ = reply.send(());
                    break;
                }
                LevelMsg::Destroy { reply } => {
                    if let Some(next) = self.next.take() {
                        if let Err(e) = next.destroy() {
                            warn!(level = self.number, error = %e, "child destroy failed");
                        }
                    }
                    if let Some(merge) = self.merge.take() {
                        if let Err(e) = merge.writer.abandon() {
                            warn!(level = self.number, error = %e, "failed to drop merge temp");
                        }
                    }
                    if let Some(a) = self.a.take() {
                        if let Err(e) = a.unlink() {
                            warn!(level = self.number, error = %e, "failed to unlink A");
                        }
                    }
                    if let Some(b) = self.b.take() {
                        if let Err(e) = b.unlink() {
                            warn!(level = self.number, error = %e, "failed to unlink B");
                        }
                    }
                    debug!(level = self.number, "level destroyed");
                    let _ = reply.send(());
                    break;
                }
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Inject
    // --------------------------------------------------------------------------------------------

    fn handle_inject(&mut self, path: PathBuf) -> Result<(), LevelError> {
        if self.a.is_some() && self.b.is_some() {
            // Both slots occupied — retire the pending merge to make room.
            // Merge pacing keeps this remainder small in steady state.
            trace!(level = self.number, "inject found level full, completing merge");
            self.complete_merge()?;
        }

        if self.a.is_none() {
            let dst = self.dir.join(a_file_name(self.number));
            fs::rename(&path, &dst)?;
            self.a = Some(SortedFile::open(&dst)?);
            debug!(level = self.number, slot = "A", "file injected");
        } else {
            let dst = self.dir.join(b_file_name(self.number));
            fs::rename(&path, &dst)?;
            self.b = Some(SortedFile::open(&dst)?);
            debug!(level = self.number, slot = "B", "file injected");
            self.schedule_merge()?;
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Lookup
    // --------------------------------------------------------------------------------------------

    fn handle_lookup(
        &mut self,
        key: Vec<u8>,
        now: u64,
        reply: Sender<Result<LookupOutcome, LevelError>>,
    ) {
        // B shadows A; both shadow everything below.
        for file in [&self.b, &self.a].into_iter().flatten() {
            match file.get(&key, now) {
                Ok(LookupOutcome::Absent) => {}
                Ok(outcome) => {
                    let _ = reply.send(Ok(outcome));
                    return;
                }
                Err(e) => {
                    let _ = reply.send(Err(e.into()));
                    return;
                }
            }
        }

        match &self.next {
            Some(next) => {
                // Forward the caller's reply sender down the chain; the
                // level that finds a definitive answer fulfils it.
                if next.tx.send(LevelMsg::Lookup { key, now, reply: reply.clone() }).is_err() {
                    let _ = reply.send(Err(LevelError::Closed));
                }
            }
            None => {
                let _ = reply.send(Ok(LookupOutcome::Absent));
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Range collect
    // --------------------------------------------------------------------------------------------

    fn handle_collect(
        &mut self,
        blocking: bool,
        mut sources: Vec<SortedFile>,
        reply: Sender<Result<Vec<SortedFile>, LevelError>>,
    ) {
        if blocking && self.merge.is_some() {
            if let Err(e) = self.complete_merge() {
                let _ = reply.send(Err(e));
                return;
            }
        }

        if let Some(b) = &self.b {
            sources.push(b.clone());
        }
        if let Some(a) = &self.a {
            sources.push(a.clone());
        }

        match &self.next {
            Some(next) => {
                if next
                    .tx
                    .send(LevelMsg::CollectRange { blocking, sources, reply: reply.clone() })
                    .is_err()
                {
                    let _ = reply.send(Err(LevelError::Closed));
                }
            }
            None => {
                let _ = reply.send(Ok(sources));
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Merging
    // --------------------------------------------------------------------------------------------

    fn schedule_merge(&mut self) -> Result<(), LevelError> {
        let a = self
            .a
            .as_ref()
            .ok_or_else(|| LevelError::Internal("merge scheduled without A".into()))?;
        let b = self
            .b
            .as_ref()
            .ok_or_else(|| LevelError::Internal("merge scheduled without B".into()))?;

        // Only the deepest level may drop tombstones and expired entries:
        // anything below us could still hold shadowed versions.
        let drop_dead = self.next.is_none();
        let out_path = self.dir.join(merge_temp_name(self.number));
        let expected = (a.entry_count() + b.entry_count()) as usize;
        let writer = crate::sstable::Writer::create(&out_path, self.opts.writer_config(expected))?;

        debug!(
            level = self.number,
            inputs = expected,
            drop_dead,
            "merge scheduled"
        );
        self.merge = Some(MergeState::new(a, b, writer, out_path, drop_dead, unix_now()));
        Ok(())
    }

    /// Run one quantum of merge work; under the `Fast` strategy a
    /// scheduled merge runs to completion instead.
    fn do_merge_work(&mut self, units: u64) -> Result<(), LevelError> {
        let Some(merge) = self.merge.as_mut() else {
            return Ok(());
        };

        let finished = match self.opts.merge_strategy {
            MergeStrategy::Fast => merge.work(u64::MAX)?,
            MergeStrategy::Predictable => merge.work(units)?,
        };
        trace!(
            level = self.number,
            finished,
            remaining = merge.remaining(),
            "merge quantum"
        );
        if finished {
            self.finalize_merge()?;
        }
        Ok(())
    }

    /// Run the scheduled merge to completion and retire it.
    fn complete_merge(&mut self) -> Result<(), LevelError> {
        let Some(merge) = self.merge.as_mut() else {
            return Err(LevelError::Internal(
                "level full but no merge scheduled".into(),
            ));
        };
        merge.work(u64::MAX)?;
        self.finalize_merge()
    }

    /// The merge consumed all input; finish the output, push it to the
    /// next level (spawning it on demand), and drop the inputs.
    fn finalize_merge(&mut self) -> Result<(), LevelError> {
        let merge = self
            .merge
            .take()
            .ok_or_else(|| LevelError::Internal("finalize without merge".into()))?;
        let out_path = merge.out_path.clone();
        let produced = merge.writer.entry_count();

        if produced == 0 {
            // Every entry was a dropped tombstone or expired; no output.
            merge.writer.abandon()?;
            debug!(level = self.number, "merge produced empty output");
        } else {
            merge.writer.finish()?;

            if self.next.is_none() {
                let number = self.number + 1;
                let next = LevelHandle::spawn(
                    self.dir.clone(),
                    number,
                    None,
                    Arc::clone(&self.opts),
                    self.notices.clone(),
                )?;
                // The engine drains this opportunistically; a full channel
                // or a shut-down engine loses nothing critical.
                let _ = self.notices.send(EngineNotice::BottomLevel(number));
                self.next = Some(next);
                info!(level = number, "new bottom level materialized");
            }
            let next = self
                .next
                .as_ref()
                .ok_or_else(|| LevelError::Internal("merge output with no next level".into()))?;
            next.inject(out_path)?;
            debug!(level = self.number, produced, "merge output injected downward");
        }

        // Inputs are fully represented downward (or provably dead).
        // Unlinking frees the canonical names for the next generation;
        // in-flight readers keep their mapped inodes until they finish.
        if let Some(a) = self.a.take() {
            a.unlink()?;
        }
        if let Some(b) = self.b.take() {
            b.unlink()?;
        }
        Ok(())
    }

    fn unmerged(&self) -> u64 {
        self.merge.as_ref().map_or(0, MergeState::remaining)
    }
}
