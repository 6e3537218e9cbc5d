//! Incremental two-way merge of a level's `A` and `B` files.
//!
//! The merge is a resumable state machine so its work can be split into
//! quanta interleaved with foreground writes. One **unit** of work is one
//! input entry consumed; when the two files carry the same key they
//! collapse to the newer (`B`) entry and both inputs count as consumed.

use tracing::trace;

use crate::engine::Entry;
use crate::sstable::{RangeReader, SortedFile, SstError, Writer};

use super::LevelError;

/// A merge in progress, producing one output file for the next level.
pub(crate) struct MergeState {
    a: RangeReader,
    b: RangeReader,
    a_next: Option<Entry>,
    b_next: Option<Entry>,
    primed: bool,

    pub(crate) writer: Writer,
    pub(crate) out_path: std::path::PathBuf,

    /// Drop tombstones and expired entries — legal only when nothing can
    /// be shadowed below this level.
    drop_dead: bool,

    /// Wall-clock seconds captured when the merge was scheduled; one
    /// consistent notion of "now" for the whole merge.
    now: u64,

    total_units: u64,
    consumed: u64,
}

impl MergeState {
    pub(crate) fn new(
        a: &SortedFile,
        b: &SortedFile,
        writer: Writer,
        out_path: std::path::PathBuf,
        drop_dead: bool,
        now: u64,
    ) -> Self {
        Self {
            a: a.range_reader(None, None),
            b: b.range_reader(None, None),
            a_next: None,
            b_next: None,
            primed: false,
            writer,
            out_path,
            drop_dead,
            now,
            total_units: a.entry_count() + b.entry_count(),
            consumed: 0,
        }
    }

    /// Input entries not yet consumed.
    pub(crate) fn remaining(&self) -> u64 {
        self.total_units.saturating_sub(self.consumed)
    }

    /// Perform up to `units` units of work. Returns `true` when both
    /// inputs are exhausted and the output is fully written (but not yet
    /// finished/renamed — that is the level's job).
    pub(crate) fn work(&mut self, units: u64) -> Result<bool, LevelError> {
        if !self.primed {
            self.a_next = pull(&mut self.a)?;
            self.b_next = pull(&mut self.b)?;
            self.primed = true;
        }

        let mut budget = units;
        while budget > 0 {
            match (self.a_next.take(), self.b_next.take()) {
                (None, None) => {
                    trace!(consumed = self.consumed, "merge inputs exhausted");
                    return Ok(true);
                }
                (Some(ae), None) => {
                    self.emit(ae)?;
                    self.consumed += 1;
                    budget = budget.saturating_sub(1);
                    self.a_next = pull(&mut self.a)?;
                }
                (None, Some(be)) => {
                    self.emit(be)?;
                    self.consumed += 1;
                    budget = budget.saturating_sub(1);
                    self.b_next = pull(&mut self.b)?;
                }
                (Some(ae), Some(be)) => match ae.key.cmp(&be.key) {
                    std::cmp::Ordering::Less => {
                        self.b_next = Some(be);
                        self.emit(ae)?;
                        self.consumed += 1;
                        budget = budget.saturating_sub(1);
                        self.a_next = pull(&mut self.a)?;
                    }
                    std::cmp::Ordering::Greater => {
                        self.a_next = Some(ae);
                        self.emit(be)?;
                        self.consumed += 1;
                        budget = budget.saturating_sub(1);
                        self.b_next = pull(&mut self.b)?;
                    }
                    std::cmp::Ordering::Equal => {
                        // Same key in both inputs: B is newer and wins.
                        self.emit(be)?;
                        self.consumed += 2;
                        budget = budget.saturating_sub(2);
                        self.a_next = pull(&mut self.a)?;
                        self.b_next = pull(&mut self.b)?;
                    }
                },
            }
        }
        Ok(self.a_next.is_none() && self.b_next.is_none())
    }

    fn emit(&mut self, entry: Entry) -> Result<(), LevelError> {
        if self.drop_dead && !entry.is_live(self.now) {
            // Deepest level: nothing below can be shadowed, so tombstones
            // and expired entries simply vanish.
            return Ok(());
        }
        self.writer.add(&entry)?;
        Ok(())
    }
}

fn pull(reader: &mut RangeReader) -> Result<Option<Entry>, SstError> {
    reader.next().transpose()
}
