//! Shared store types — entries, expiry, lookup outcomes, write ops.
//!
//! This module defines the common currency passed between the nursery,
//! the level chain, the sorted-file codec, and the fold machinery:
//!
//! - [`Entry`] — one keyed record; a `None` value is the tombstone.
//! - [`Expiry`] — per-entry time-to-live, absolute wall-clock seconds.
//! - [`LookupOutcome`] — the three-way result of a point lookup.
//! - [`WriteOp`] — one operation inside an atomic transaction batch.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::encoding::{self, Decode, Encode, EncodingError};

// ------------------------------------------------------------------------------------------------
// Level sizing
// ------------------------------------------------------------------------------------------------

/// Index of the smallest (top) level. Files at level `n` hold at most
/// `2^n` entries, so the top level works in runs of 256.
pub const TOP_LEVEL: usize = 8;

/// Maximum number of entries in a file at the given level.
pub const fn level_capacity(level: usize) -> usize {
    1 << level
}

// ------------------------------------------------------------------------------------------------
// Expiry
// ------------------------------------------------------------------------------------------------

/// Per-entry expiry deadline.
///
/// `At(t)` is an absolute wall-clock time in seconds since the UNIX epoch;
/// a reader treats an entry with `t <= now` exactly like a tombstone for
/// that key. On the wire, `0` encodes `Never`, so `At(0)` is rejected at
/// the public API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// The entry never expires.
    Never,
    /// The entry expires at the given second.
    At(u64),
}

impl Expiry {
    /// Whether the deadline has passed at time `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        matches!(self, Expiry::At(t) if *t <= now)
    }

    pub(crate) fn to_wire(self) -> u64 {
        match self {
            Expiry::Never => 0,
            Expiry::At(t) => t,
        }
    }

    pub(crate) fn from_wire(raw: u64) -> Self {
        if raw == 0 { Expiry::Never } else { Expiry::At(raw) }
    }
}

/// Current wall-clock time in whole seconds since the UNIX epoch.
///
/// Readers capture this once per operation so that one lookup or fold
/// applies a single, consistent notion of "now".
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ------------------------------------------------------------------------------------------------
// Entry
// ------------------------------------------------------------------------------------------------

/// One keyed record as it travels through the store.
///
/// `value: None` is the in-band tombstone sentinel: it shadows older
/// entries for the same key and is physically dropped only once it reaches
/// the deepest level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Raw key bytes, ordered lexicographically.
    pub key: Vec<u8>,

    /// Stored value; `None` marks a deletion.
    pub value: Option<Vec<u8>>,

    /// Expiry deadline for this entry.
    pub expiry: Expiry,
}

impl Entry {
    /// Build a live entry.
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, expiry: Expiry) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            expiry,
        }
    }

    /// Build a tombstone.
    pub fn tombstone(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: None,
            expiry: Expiry::Never,
        }
    }

    /// Whether this entry marks a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Whether this entry is visible to a reader at time `now` — neither a
    /// tombstone nor expired.
    pub fn is_live(&self, now: u64) -> bool {
        self.value.is_some() && !self.expiry.is_expired(now)
    }
}

impl encoding::Encode for Entry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key.encode_to(buf)?;
        self.value.encode_to(buf)?;
        self.expiry.to_wire().encode_to(buf)?;
        Ok(())
    }
}

impl encoding::Decode for Entry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (key, n) = <Vec<u8>>::decode_from(&buf[off..])?;
        off += n;
        let (value, n) = <Option<Vec<u8>>>::decode_from(&buf[off..])?;
        off += n;
        let (expiry, n) = u64::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                key,
                value,
                expiry: Expiry::from_wire(expiry),
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Lookup outcome
// ------------------------------------------------------------------------------------------------

/// Result of a point lookup against one layer of the store.
///
/// `Tombstone` is a *definitive* answer — the key was deleted (or has
/// expired) at this layer, and deeper layers must not be consulted.
/// `Absent` means the layer knows nothing about the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    /// A live value for the key.
    Found(Vec<u8>),
    /// The key is deleted or expired at this layer.
    Tombstone,
    /// This layer has no information about the key.
    Absent,
}

// ------------------------------------------------------------------------------------------------
// Write ops
// ------------------------------------------------------------------------------------------------

/// One operation inside a [`transact`](crate::engine::Engine::transact)
/// batch. All ops in a batch become visible atomically; when the same key
/// appears more than once, the last op wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert or overwrite a key.
    Put(Vec<u8>, Vec<u8>),
    /// Delete a key.
    Delete(Vec<u8>),
}

impl WriteOp {
    /// The key this op touches.
    pub fn key(&self) -> &[u8] {
        match self {
            WriteOp::Put(key, _) => key,
            WriteOp::Delete(key) => key,
        }
    }
}
