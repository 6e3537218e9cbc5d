//! Nursery — the bounded in-memory write buffer.
//!
//! All writes land here first: journal append, then an insert into an
//! ordered map where the latest write per key wins. The nursery is bounded
//! to [`level_capacity(TOP_LEVEL)`](crate::engine::level_capacity) entries;
//! when it reaches that bound the engine freezes it into a sorted file and
//! injects the file into the top level.
//!
//! # Recovery
//!
//! `nursery.data` survives a crash. [`Nursery::recover`] replays it into a
//! fresh map, stages the recovered entries as a sorted file through the
//! normal flush path, injects that file into the top level, and only then
//! deletes the log — the log remains the source of truth until its
//! contents are durably inside the level chain.
//!
//! # Transactions
//!
//! A transaction batch shares a single journal record, so recovery sees
//! all of its ops or none of them. Ops are applied to the map in list
//! order; if a key appears twice, the last op wins.

#[cfg(test)]
mod tests;

use std::{
    collections::BTreeMap,
    ops::Bound,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, info, trace};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::engine::{level_capacity, Entry, Expiry, LookupOutcome, Options, TOP_LEVEL};
use crate::journal::{Journal, JournalError};
use crate::level::{LevelError, LevelHandle};
use crate::sstable::{SstError, Writer};

/// File name of the nursery's recovery log inside the store directory.
pub const NURSERY_LOG: &str = "nursery.data";

/// Staging name for a nursery flush before the top level renames it.
fn staging_path(dir: &Path) -> PathBuf {
    dir.join(format!("N-{TOP_LEVEL}.tmp"))
}

// ------------------------------------------------------------------------------------------------
// Error types
// ------------------------------------------------------------------------------------------------

/// Errors returned by nursery operations.
#[derive(Debug, Error)]
pub enum NurseryError {
    /// Journal failure.
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    /// Sorted-file failure while staging a flush.
    #[error("Sorted file error: {0}")]
    Sst(#[from] SstError),

    /// The top level rejected an injected file.
    #[error("Level error: {0}")]
    Level(#[from] LevelError),

    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ------------------------------------------------------------------------------------------------
// Journal records
// ------------------------------------------------------------------------------------------------

/// One record in the nursery log: a single write or an atomic batch.
#[derive(Debug, PartialEq, Eq)]
pub enum NurseryRecord {
    /// A single put or delete.
    Write(Entry),
    /// A transaction — every entry applies atomically.
    Batch(Vec<Entry>),
}

impl encoding::Encode for NurseryRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            NurseryRecord::Write(entry) => {
                0u8.encode_to(buf)?;
                entry.encode_to(buf)?;
            }
            NurseryRecord::Batch(entries) => {
                1u8.encode_to(buf)?;
                encoding::encode_vec(entries, buf)?;
            }
        }
        Ok(())
    }
}

impl encoding::Decode for NurseryRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut off) = u8::decode_from(buf)?;
        match tag {
            0 => {
                let (entry, n) = Entry::decode_from(&buf[off..])?;
                off += n;
                Ok((NurseryRecord::Write(entry), off))
            }
            1 => {
                let (entries, n) = encoding::decode_vec::<Entry>(&buf[off..])?;
                off += n;
                Ok((NurseryRecord::Batch(entries), off))
            }
            other => Err(EncodingError::InvalidTag {
                tag: other as u32,
                type_name: "NurseryRecord",
            }),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Nursery
// ------------------------------------------------------------------------------------------------

/// Latest state of one buffered key.
#[derive(Debug, Clone)]
struct Slot {
    value: Option<Vec<u8>>,
    expiry: Expiry,
}

/// The in-memory write buffer backed by `nursery.data`.
///
/// Owned exclusively by the engine task; no internal locking.
pub struct Nursery {
    dir: PathBuf,
    journal: Journal<NurseryRecord>,
    tree: BTreeMap<Vec<u8>, Slot>,
    capacity: usize,
}

impl Nursery {
    /// Create an empty nursery with a fresh journal.
    ///
    /// Any pre-existing `nursery.data` is truncated — callers run
    /// [`Nursery::recover`] first when that file may still hold writes.
    pub fn create(dir: &Path, opts: &Options) -> Result<Self, NurseryError> {
        let journal = Journal::create(dir.join(NURSERY_LOG), opts.sync_strategy)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            journal,
            tree: BTreeMap::new(),
            capacity: level_capacity(TOP_LEVEL),
        })
    }

    /// Replay a leftover nursery log and push its contents into the top
    /// level.
    ///
    /// The log is deleted only after the staged file has been durably
    /// injected. A torn tail record was never acknowledged under
    /// `sync_strategy = sync` and is silently dropped by the journal.
    pub fn recover(dir: &Path, top: &LevelHandle, opts: &Options) -> Result<(), NurseryError> {
        let log_path = dir.join(NURSERY_LOG);
        if !log_path.exists() {
            return Ok(());
        }

        let records: Vec<NurseryRecord> = Journal::replay(&log_path, opts.read_buffer_size)?;
        let mut tree = BTreeMap::new();
        for record in records {
            match record {
                NurseryRecord::Write(entry) => apply(&mut tree, entry),
                NurseryRecord::Batch(entries) => {
                    for entry in entries {
                        apply(&mut tree, entry);
                    }
                }
            }
        }

        info!(entries = tree.len(), "nursery log recovered");
        flush_tree(&tree, dir, top, opts)?;
        std::fs::remove_file(&log_path)?;
        Ok(())
    }

    /// Journal and buffer one write.
    ///
    /// Returns `true` when the nursery has reached capacity and must be
    /// flushed before the next write.
    pub fn add(
        &mut self,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
        expiry: Expiry,
    ) -> Result<bool, NurseryError> {
        let entry = Entry {
            key,
            value,
            expiry,
        };
        self.journal.append(&NurseryRecord::Write(entry.clone()))?;
        apply(&mut self.tree, entry);
        Ok(self.tree.len() >= self.capacity)
    }

    /// Journal and buffer an atomic batch.
    ///
    /// All entries share one journal record; recovery applies all or none.
    /// Returns `true` when the nursery has reached capacity.
    pub fn transact(&mut self, entries: Vec<Entry>) -> Result<bool, NurseryError> {
        self.journal.append(&NurseryRecord::Batch(entries.clone()))?;
        for entry in entries {
            apply(&mut self.tree, entry);
        }
        Ok(self.tree.len() >= self.capacity)
    }

    /// Point lookup honoring expiry.
    pub fn lookup(&self, key: &[u8], now: u64) -> LookupOutcome {
        match self.tree.get(key) {
            None => LookupOutcome::Absent,
            Some(slot) => match &slot.value {
                Some(value) if !slot.expiry.is_expired(now) => {
                    LookupOutcome::Found(value.clone())
                }
                _ => LookupOutcome::Tombstone,
            },
        }
    }

    /// Number of buffered keys.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Whether the buffer holds no keys.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Maximum number of buffered keys before a flush is required.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frozen copy of the buffered entries intersecting `[from, to)`, in
    /// key order, tombstones and expired entries included.
    ///
    /// This is a fold's highest-priority source; cloning here is what
    /// makes a snapshot fold immune to later writes.
    pub fn range_snapshot(&self, from: Option<&[u8]>, to: Option<&[u8]>) -> Vec<Entry> {
        let lo = from.map_or(Bound::Unbounded, Bound::Included);
        let hi = to.map_or(Bound::Unbounded, Bound::Excluded);
        self.tree
            .range::<[u8], _>((lo, hi))
            .map(|(key, slot)| Entry {
                key: key.clone(),
                value: slot.value.clone(),
                expiry: slot.expiry,
            })
            .collect()
    }

    /// Freeze the nursery into a sorted file, inject it into the top
    /// level, and delete the journal.
    ///
    /// An empty nursery produces no file. Consumes the nursery; the engine
    /// replaces it with [`Nursery::create`].
    pub fn finish(self, top: &LevelHandle, opts: &Options) -> Result<(), NurseryError> {
        debug!(entries = self.tree.len(), "nursery flush");
        flush_tree(&self.tree, &self.dir, top, opts)?;
        self.journal.remove()?;
        Ok(())
    }
}

/// Insert one entry; the latest write per key wins.
fn apply(tree: &mut BTreeMap<Vec<u8>, Slot>, entry: Entry) {
    trace!(key_len = entry.key.len(), tombstone = entry.is_tombstone(), "nursery apply");
    tree.insert(
        entry.key,
        Slot {
            value: entry.value,
            expiry: entry.expiry,
        },
    );
}

/// Stage the buffered entries as `N-<top>.tmp` and hand the file to the
/// top level, which renames it into its canonical slot.
fn flush_tree(
    tree: &BTreeMap<Vec<u8>, Slot>,
    dir: &Path,
    top: &LevelHandle,
    opts: &Options,
) -> Result<(), NurseryError> {
    if tree.is_empty() {
        return Ok(());
    }

    let path = staging_path(dir);
    let mut writer = Writer::create(&path, opts.writer_config(tree.len()))?;
    for (key, slot) in tree {
        writer.add(&Entry {
            key: key.clone(),
            value: slot.value.clone(),
            expiry: slot.expiry,
        })?;
    }
    let entries = writer.finish()?;
    debug!(entries, path = %path.display(), "nursery staged");

    top.inject(path)?;
    Ok(())
}
