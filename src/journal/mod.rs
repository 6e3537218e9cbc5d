//! Nursery journal — the append-only recovery log behind the write buffer.
//!
//! Every mutation accepted by the store is appended here *before* it is
//! applied in memory, so a crash can never lose an acknowledged write
//! (subject to the configured [`SyncStrategy`]). The journal is generic
//! over its record type via [`JournalRecord`] and uses [`crate::encoding`]
//! for serialization and [`crc32fast`] for integrity.
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER_BYTES][HEADER_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! ...
//! ```
//!
//! - **Header** — a [`JournalHeader`] followed by a 4-byte CRC32.
//! - **Record** — a 4-byte little-endian length prefix, the encoded record
//!   bytes, and a CRC32 computed over `len || record_bytes`.
//!
//! # Torn-tail healing
//!
//! A crash can leave a partially-written record at the end of the file.
//! [`Journal::replay`] treats the first truncated or checksum-failing
//! record as the end of the log: everything before it is returned, the
//! file is truncated back to the last whole record, and nothing is
//! surfaced as an error. Mid-file corruption is indistinguishable from a
//! torn tail and is handled the same way — replay yields a prefix of the
//! confirmed write sequence.
//!
//! # Ownership
//!
//! The journal file is owned by exactly one writer (the engine task holds
//! it through the nursery); replay runs on a separate read handle before
//! any appends, so no internal locking is required.

#[cfg(test)]
mod tests;

use std::{
    fs::{File, OpenOptions},
    io::{self, BufReader, Read, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};

const U32_SIZE: usize = std::mem::size_of::<u32>();

/// Upper bound on a single encoded journal record (16 MiB).
///
/// A length prefix beyond this is treated as corruption, not as a request
/// to allocate.
pub const MAX_RECORD_SIZE: u32 = 16 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error types
// ------------------------------------------------------------------------------------------------

/// Errors returned by journal operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JournalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Record exceeds [`MAX_RECORD_SIZE`].
    #[error("Record size exceeds limit ({0} bytes)")]
    RecordTooLarge(usize),

    /// Journal header failed validation — the file is not one of ours or
    /// is damaged beyond the healable tail region.
    #[error("Invalid journal header: {0}")]
    InvalidHeader(String),
}

// ------------------------------------------------------------------------------------------------
// Durability policy
// ------------------------------------------------------------------------------------------------

/// When the journal fsyncs after an append.
///
/// Mirrors the store-level `sync_strategy` option:
///
/// - [`SyncStrategy::Never`] — rely on the OS page cache; an acknowledged
///   write survives a process crash but not a machine crash.
/// - [`SyncStrategy::Always`] — fsync after every append; an acknowledged
///   write is durable.
/// - [`SyncStrategy::Seconds`] — fsync when the previous fsync is at least
///   `k` seconds old, bounding the window of acknowledged-but-volatile
///   writes to `k` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// Never fsync from the append path.
    Never,
    /// Fsync on every append.
    Always,
    /// Fsync at most every `k` seconds.
    Seconds(u64),
}

// ------------------------------------------------------------------------------------------------
// Header
// ------------------------------------------------------------------------------------------------

/// Metadata written at the start of the journal file.
#[derive(Debug)]
pub struct JournalHeader {
    /// Magic constant identifying journal files (`b"CJNL"`).
    magic: [u8; 4],

    /// Journal format version.
    version: u32,
}

impl JournalHeader {
    /// Expected 4-byte magic constant.
    pub const MAGIC: [u8; 4] = *b"CJNL";

    /// Current format version.
    pub const VERSION: u32 = 1;

    /// Encoded size without the trailing CRC: `magic(4) + version(4)`.
    pub const ENCODED_SIZE: usize = 8;

    /// Total on-disk size including the trailing CRC32.
    pub const DISK_SIZE: usize = Self::ENCODED_SIZE + U32_SIZE;

    fn new() -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
        }
    }
}

impl encoding::Encode for JournalHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)?;
        Ok(())
    }
}

impl encoding::Decode for JournalHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (magic, n) = <[u8; 4]>::decode_from(&buf[off..])?;
        off += n;
        let (version, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { magic, version }, off))
    }
}

// ------------------------------------------------------------------------------------------------
// Record trait
// ------------------------------------------------------------------------------------------------

/// Marker trait for types that can be journaled.
pub trait JournalRecord: encoding::Encode + encoding::Decode + std::fmt::Debug {}
impl<T> JournalRecord for T where T: encoding::Encode + encoding::Decode + std::fmt::Debug {}

// ------------------------------------------------------------------------------------------------
// Journal core
// ------------------------------------------------------------------------------------------------

/// An append-only, CRC-protected recovery log with a configurable fsync
/// policy.
///
/// See the [module-level documentation](self) for the format and the
/// torn-tail healing rules.
#[derive(Debug)]
pub struct Journal<T: JournalRecord> {
    file: File,
    path: PathBuf,
    sync: SyncStrategy,
    last_sync: Instant,
    dirty: bool,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: JournalRecord> Journal<T> {
    /// Create a fresh journal at `path`, truncating any existing file, and
    /// write a synced header.
    pub fn create<P: AsRef<Path>>(path: P, sync: SyncStrategy) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        let header_bytes = encoding::encode_to_vec(&JournalHeader::new())?;
        let crc = compute_crc(&[&header_bytes]);
        file.write_all(&header_bytes)?;
        file.write_all(&crc.to_le_bytes())?;
        file.sync_all()?;

        info!(path = %path.display(), "journal created");

        Ok(Self {
            file,
            path,
            sync,
            last_sync: Instant::now(),
            dirty: false,
            _phantom: std::marker::PhantomData,
        })
    }

    /// Append a single record and apply the sync strategy.
    ///
    /// The record is written as one contiguous
    /// `[u32 len][record_bytes][u32 crc]` frame so a crash tears at most
    /// the final frame.
    pub fn append(&mut self, record: &T) -> Result<(), JournalError> {
        let record_bytes = encoding::encode_to_vec(record)?;
        let record_len = u32::try_from(record_bytes.len())
            .map_err(|_| JournalError::RecordTooLarge(record_bytes.len()))?;
        if record_len > MAX_RECORD_SIZE {
            return Err(JournalError::RecordTooLarge(record_len as usize));
        }

        let len_bytes = record_len.to_le_bytes();
        let crc = compute_crc(&[&len_bytes, &record_bytes]);

        let mut frame = Vec::with_capacity(U32_SIZE * 2 + record_bytes.len());
        frame.extend_from_slice(&len_bytes);
        frame.extend_from_slice(&record_bytes);
        frame.extend_from_slice(&crc.to_le_bytes());
        self.file.write_all(&frame)?;
        self.dirty = true;

        trace!(len = record_len, crc = format_args!("{crc:08x}"), "journal record appended");

        match self.sync {
            SyncStrategy::Always => self.sync()?,
            SyncStrategy::Seconds(k) => {
                if self.last_sync.elapsed().as_secs() >= k {
                    self.sync()?;
                }
            }
            SyncStrategy::Never => {}
        }
        Ok(())
    }

    /// Force an fsync of all appended records.
    pub fn sync(&mut self) -> Result<(), JournalError> {
        self.file.sync_data()?;
        self.last_sync = Instant::now();
        self.dirty = false;
        Ok(())
    }

    /// Close the journal and delete its file.
    ///
    /// Used when the nursery has been flushed into the level chain and the
    /// log is no longer the source of truth.
    pub fn remove(mut self) -> Result<(), JournalError> {
        let path = self.path.clone();
        self.dirty = false; // no point syncing a file we are about to delete
        drop(self);
        std::fs::remove_file(&path)?;
        info!(path = %path.display(), "journal removed");
        Ok(())
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replay all whole records from the journal at `path`.
    ///
    /// Validates the header, decodes records until the first torn or
    /// checksum-failing frame, truncates the file back to the last whole
    /// record, and returns the decoded prefix. A file too short to hold a
    /// header is treated as empty (a crash during creation).
    pub fn replay<P: AsRef<Path>>(
        path: P,
        read_buffer_size: usize,
    ) -> Result<Vec<T>, JournalError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::with_capacity(read_buffer_size, file);

        debug!(path = %path.display(), len = file_len, "journal replay started");

        if (file_len as usize) < JournalHeader::DISK_SIZE {
            warn!(path = %path.display(), "journal shorter than header, treating as empty");
            return Ok(Vec::new());
        }

        // Header + trailing CRC.
        let mut header_bytes = [0u8; JournalHeader::ENCODED_SIZE];
        reader.read_exact(&mut header_bytes)?;
        let mut crc_bytes = [0u8; U32_SIZE];
        reader.read_exact(&mut crc_bytes)?;
        if compute_crc(&[&header_bytes]) != u32::from_le_bytes(crc_bytes) {
            return Err(JournalError::InvalidHeader("header checksum mismatch".into()));
        }
        let (header, _) = encoding::decode_from_slice::<JournalHeader>(&header_bytes)?;
        if header.magic != JournalHeader::MAGIC {
            return Err(JournalError::InvalidHeader("bad magic".into()));
        }
        if header.version != JournalHeader::VERSION {
            return Err(JournalError::InvalidHeader(format!(
                "unsupported version {}",
                header.version
            )));
        }

        // Records, until the tail tears.
        let mut records = Vec::new();
        let mut good_end = JournalHeader::DISK_SIZE as u64;

        loop {
            let mut len_bytes = [0u8; U32_SIZE];
            match read_exact_or_eof(&mut reader, &mut len_bytes) {
                ReadOutcome::Full => {}
                ReadOutcome::Eof => break,
                ReadOutcome::Partial => {
                    warn!(offset = good_end, "torn length prefix at journal tail, dropping");
                    break;
                }
                ReadOutcome::Err(e) => return Err(e.into()),
            }

            let record_len = u32::from_le_bytes(len_bytes);
            if record_len > MAX_RECORD_SIZE {
                warn!(offset = good_end, len = record_len, "implausible record length, dropping tail");
                break;
            }

            let mut record_bytes = vec![0u8; record_len as usize];
            match read_exact_or_eof(&mut reader, &mut record_bytes) {
                ReadOutcome::Full => {}
                ReadOutcome::Eof | ReadOutcome::Partial => {
                    warn!(offset = good_end, len = record_len, "torn record payload at journal tail, dropping");
                    break;
                }
                ReadOutcome::Err(e) => return Err(e.into()),
            }

            let mut crc_bytes = [0u8; U32_SIZE];
            match read_exact_or_eof(&mut reader, &mut crc_bytes) {
                ReadOutcome::Full => {}
                ReadOutcome::Eof | ReadOutcome::Partial => {
                    warn!(offset = good_end, "torn record checksum at journal tail, dropping");
                    break;
                }
                ReadOutcome::Err(e) => return Err(e.into()),
            }

            if compute_crc(&[&len_bytes, &record_bytes]) != u32::from_le_bytes(crc_bytes) {
                warn!(offset = good_end, "journal record checksum mismatch, dropping tail");
                break;
            }

            let record = match encoding::decode_from_slice::<T>(&record_bytes) {
                Ok((record, _)) => record,
                Err(e) => {
                    warn!(offset = good_end, error = %e, "undecodable journal record, dropping tail");
                    break;
                }
            };

            good_end += (U32_SIZE * 2 + record_len as usize) as u64;
            records.push(record);
        }

        if good_end < file_len {
            let surgeon = OpenOptions::new().write(true).open(path)?;
            surgeon.set_len(good_end)?;
            surgeon.sync_all()?;
            info!(
                path = %path.display(),
                dropped = file_len - good_end,
                "journal tail truncated to last whole record"
            );
        }

        debug!(path = %path.display(), records = records.len(), "journal replay finished");
        Ok(records)
    }
}

impl<T: JournalRecord> Drop for Journal<T> {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.file.sync_data() {
                error!(path = %self.path.display(), error = %e, "journal sync failed on drop");
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Read helper
// ------------------------------------------------------------------------------------------------

enum ReadOutcome {
    Full,
    Eof,
    Partial,
    Err(io::Error),
}

/// `read_exact` that distinguishes "cleanly at EOF" from "EOF mid-buffer".
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> ReadOutcome {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return if filled == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Partial
                };
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return ReadOutcome::Err(e),
        }
    }
    ReadOutcome::Full
}

// ------------------------------------------------------------------------------------------------
// CRC helpers
// ------------------------------------------------------------------------------------------------

fn compute_crc(parts: &[&[u8]]) -> u32 {
    let mut hasher = Crc32::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}
