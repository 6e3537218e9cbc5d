//! Sorted file module — the immutable on-disk runs of the LSM tree.
//!
//! A sorted file holds a run of entries with **strictly ascending, unique
//! keys**. Files are written once (by a nursery flush or a level merge),
//! then only ever read, and finally unlinked when the last reader handle
//! drops. Point lookups go through a bloom filter and a block index; range
//! reads stream one block at a time.
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER: magic | version | codec | crc32]
//! [DATA_BLOCK_LEN_LE][compressed cell bytes][DATA_BLOCK_CRC32_LE]
//! [DATA_BLOCK_LEN_LE][compressed cell bytes][DATA_BLOCK_CRC32_LE]
//! ...
//! [BLOOM block]  [PROPS block]  [INDEX block]     (same framing)
//! [FOOTER: bloom | props | index handles, file size, crc32]
//! ```
//!
//! - **Data blocks** — encoded [`Entry`] cells, cut at the configured page
//!   size and compressed with the configured codec. Each block carries its
//!   own CRC32 so corruption is detected at read time.
//! - **Bloom block** — serialized bloom filter over every key in the file
//!   (tombstones included).
//! - **Props block** — entry/tombstone counts and the key bounds.
//! - **Index block** — the first key and block handle of every data block,
//!   enabling binary search for point lookups and range seeks.
//! - **Footer** — fixed-size trailer locating the meta blocks; validated
//!   before anything else is trusted.
//!
//! # Concurrency & lifecycle
//!
//! [`SortedFile`] is a cheap-clone handle over a reference-counted,
//! memory-mapped table. A file consumed by a merge is
//! [`unlink`](SortedFile::unlink)ed at once — the directory entry goes
//! away so its canonical name can be reused — while still-streaming
//! readers keep the mapped inode alive until their handles drop.
//!
//! # Sub-modules
//!
//! - [`builder`] — [`Writer`] for producing files from sorted streams.
//! - [`iterator`] — [`RangeReader`], the streaming block-at-a-time reader.

pub mod builder;
pub mod iterator;

#[cfg(test)]
mod tests;

pub use builder::{Writer, WriterConfig};
pub use iterator::RangeReader;

use std::{
    fs::File,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;
use tracing::{trace, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::engine::{Entry, LookupOutcome};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

pub(crate) const SST_MAGIC: [u8; 4] = *b"CSF1";
pub(crate) const SST_VERSION: u32 = 1;

/// Header layout: `magic(4) + version(4) + codec(1) + crc32(4)`.
pub(crate) const SST_HDR_SIZE: usize = 13;

/// Footer layout: three block handles, the total file size, and a CRC32.
pub(crate) const SST_FOOTER_SIZE: usize = 3 * 16 + 8 + 4;

pub(crate) const BLOCK_LEN_SIZE: usize = 4;
pub(crate) const BLOCK_CRC_SIZE: usize = 4;

pub(crate) const BLOOM_FP_RATE: f64 = 0.01;

// ------------------------------------------------------------------------------------------------
// Error types
// ------------------------------------------------------------------------------------------------

/// Errors returned by sorted-file operations.
#[derive(Debug, Error)]
pub enum SstError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A block, header, or footer checksum did not match.
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// The file header is damaged or not one of ours.
    #[error("Invalid header: {0}")]
    BadHeader(String),

    /// The file footer is damaged or inconsistent with the file.
    #[error("Invalid footer: {0}")]
    BadFooter(String),

    /// Block compression or decompression failed.
    #[error("Compression error: {0}")]
    Compression(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Compression codec
// ------------------------------------------------------------------------------------------------

/// Block compression codec applied to data-block payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Store blocks verbatim.
    #[default]
    None,
    /// DEFLATE with a gzip wrapper via `flate2`.
    Gzip,
    /// Snappy raw format via `snap`.
    Snappy,
}

impl Compression {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Gzip => 1,
            Compression::Snappy => 2,
        }
    }

    pub(crate) fn from_wire(raw: u8) -> Result<Self, SstError> {
        match raw {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Gzip),
            2 => Ok(Compression::Snappy),
            other => Err(SstError::BadHeader(format!("unknown codec id {other}"))),
        }
    }

    /// Compress a data-block payload.
    pub(crate) fn compress(self, data: &[u8]) -> Result<Vec<u8>, SstError> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Gzip => {
                let mut encoder =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data)?;
                encoder
                    .finish()
                    .map_err(|e| SstError::Compression(e.to_string()))
            }
            Compression::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| SstError::Compression(e.to_string())),
        }
    }

    /// Decompress a data-block payload.
    pub(crate) fn decompress(self, data: &[u8]) -> Result<Vec<u8>, SstError> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Gzip => {
                let mut decoder = flate2::read::GzDecoder::new(data);
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
            Compression::Snappy => snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(|e| SstError::Compression(e.to_string())),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// On-disk structures
// ------------------------------------------------------------------------------------------------

/// Location of a framed block inside the file.
///
/// `size` is the byte length of the block *payload*; the frame on disk
/// additionally carries a 4-byte length prefix and a 4-byte CRC32.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockHandle {
    pub(crate) offset: u64,
    pub(crate) size: u64,
}

impl encoding::Encode for BlockHandle {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.offset.encode_to(buf)?;
        self.size.encode_to(buf)?;
        Ok(())
    }
}

impl encoding::Decode for BlockHandle {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (offset, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (size, n) = u64::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { offset, size }, off))
    }
}

/// One entry of the block index: the first key stored in a data block and
/// the block's location.
#[derive(Debug, Clone)]
pub(crate) struct IndexEntry {
    pub(crate) first_key: Vec<u8>,
    pub(crate) handle: BlockHandle,
}

impl encoding::Encode for IndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.first_key.encode_to(buf)?;
        self.handle.encode_to(buf)?;
        Ok(())
    }
}

impl encoding::Decode for IndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (first_key, n) = <Vec<u8>>::decode_from(&buf[off..])?;
        off += n;
        let (handle, n) = BlockHandle::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { first_key, handle }, off))
    }
}

/// Table-level statistics and key bounds.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    /// Total number of entries (tombstones included).
    pub entry_count: u64,

    /// Number of tombstone entries.
    pub tombstone_count: u64,

    /// Smallest key in the file.
    pub min_key: Vec<u8>,

    /// Largest key in the file.
    pub max_key: Vec<u8>,
}

impl encoding::Encode for Properties {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.entry_count.encode_to(buf)?;
        self.tombstone_count.encode_to(buf)?;
        self.min_key.encode_to(buf)?;
        self.max_key.encode_to(buf)?;
        Ok(())
    }
}

impl encoding::Decode for Properties {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (entry_count, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (tombstone_count, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (min_key, n) = <Vec<u8>>::decode_from(&buf[off..])?;
        off += n;
        let (max_key, n) = <Vec<u8>>::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                entry_count,
                tombstone_count,
                min_key,
                max_key,
            },
            off,
        ))
    }
}

#[derive(Debug)]
pub(crate) struct Footer {
    pub(crate) bloom: BlockHandle,
    pub(crate) props: BlockHandle,
    pub(crate) index: BlockHandle,
    pub(crate) file_size: u64,
}

impl encoding::Encode for Footer {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.bloom.encode_to(buf)?;
        self.props.encode_to(buf)?;
        self.index.encode_to(buf)?;
        self.file_size.encode_to(buf)?;
        Ok(())
    }
}

impl encoding::Decode for Footer {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (bloom, n) = BlockHandle::decode_from(&buf[off..])?;
        off += n;
        let (props, n) = BlockHandle::decode_from(&buf[off..])?;
        off += n;
        let (index, n) = BlockHandle::decode_from(&buf[off..])?;
        off += n;
        let (file_size, n) = u64::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                bloom,
                props,
                index,
                file_size,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// CRC helpers
// ------------------------------------------------------------------------------------------------

pub(crate) fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    hasher.finalize()
}

// ------------------------------------------------------------------------------------------------
// SortedFile — immutable reader handle
// ------------------------------------------------------------------------------------------------

struct TableInner {
    mmap: Mmap,
    path: PathBuf,
    codec: Compression,
    bloom: Option<Bloom<[u8]>>,
    props: Properties,
    index: Vec<IndexEntry>,
}

/// A reference-counted handle to an immutable, memory-mapped sorted file.
///
/// Cloning is cheap and pins the table: [`unlink`](Self::unlink) removes
/// the directory entry immediately (so the canonical name is free for a
/// successor), while the mapped inode stays readable until the last
/// handle drops.
#[derive(Clone)]
pub struct SortedFile {
    inner: Arc<TableInner>,
}

impl std::fmt::Debug for SortedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortedFile")
            .field("path", &self.inner.path)
            .field("entries", &self.inner.props.entry_count)
            .finish_non_exhaustive()
    }
}

impl SortedFile {
    /// Open and validate a sorted file.
    ///
    /// Maps the file read-only, checks the header and footer CRCs, and
    /// loads the bloom filter, properties, and block index into memory.
    /// Any integrity failure here is fatal — a damaged table cannot be
    /// partially trusted.
    ///
    /// The mmap is sound because files are immutable once written and are
    /// only unlinked (never rewritten) after their last handle drops.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SstError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < SST_HDR_SIZE + SST_FOOTER_SIZE {
            return Err(SstError::BadHeader("file too small".into()));
        }

        // Header.
        let header = &mmap[..SST_HDR_SIZE];
        let stored_crc = u32::from_le_bytes([header[9], header[10], header[11], header[12]]);
        if compute_crc(&header[..9]) != stored_crc {
            return Err(SstError::BadHeader("header checksum mismatch".into()));
        }
        if header[..4] != SST_MAGIC {
            return Err(SstError::BadHeader("bad magic".into()));
        }
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != SST_VERSION {
            return Err(SstError::BadHeader(format!("unsupported version {version}")));
        }
        let codec = Compression::from_wire(header[8])?;

        // Footer.
        let footer_start = mmap.len() - SST_FOOTER_SIZE;
        let footer_bytes = &mmap[footer_start..];
        let crc_start = SST_FOOTER_SIZE - 4;
        let stored_crc = u32::from_le_bytes([
            footer_bytes[crc_start],
            footer_bytes[crc_start + 1],
            footer_bytes[crc_start + 2],
            footer_bytes[crc_start + 3],
        ]);
        if compute_crc(&footer_bytes[..crc_start]) != stored_crc {
            return Err(SstError::BadFooter("footer checksum mismatch".into()));
        }
        let (footer, _) = encoding::decode_from_slice::<Footer>(&footer_bytes[..crc_start])?;
        if footer.file_size != mmap.len() as u64 {
            return Err(SstError::BadFooter(format!(
                "footer says {} bytes, file has {}",
                footer.file_size,
                mmap.len()
            )));
        }

        // Meta blocks.
        let bloom_bytes = read_block(&mmap, footer.bloom)?;
        let bloom = if bloom_bytes.is_empty() {
            None
        } else {
            match Bloom::from_slice(&bloom_bytes) {
                Ok(bloom) => Some(bloom),
                Err(e) => {
                    // A broken bloom only costs us lookups, not correctness.
                    warn!(path = %path.display(), error = %e, "unreadable bloom filter, disabling");
                    None
                }
            }
        };

        let props_bytes = read_block(&mmap, footer.props)?;
        let (props, _) = encoding::decode_from_slice::<Properties>(&props_bytes)?;

        let index_bytes = read_block(&mmap, footer.index)?;
        let (index, _) = encoding::decode_vec::<IndexEntry>(&index_bytes)?;

        trace!(
            path = %path.display(),
            entries = props.entry_count,
            blocks = index.len(),
            codec = ?codec,
            "sorted file opened"
        );

        Ok(Self {
            inner: Arc::new(TableInner {
                mmap,
                path,
                codec,
                bloom,
                props,
                index,
            }),
        })
    }

    /// Number of entries in the file, tombstones included.
    pub fn entry_count(&self) -> u64 {
        self.inner.props.entry_count
    }

    /// Table statistics and key bounds.
    pub fn properties(&self) -> &Properties {
        &self.inner.props
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Remove the file's directory entry now.
    ///
    /// Called when a merge has consumed this file. Readers that pinned a
    /// handle keep reading the mapped inode; the OS reclaims it after the
    /// last mapping goes away. Removing the entry immediately also means
    /// the canonical `A`/`B` name is free for the next file generation.
    pub fn unlink(&self) -> Result<(), SstError> {
        trace!(path = %self.inner.path.display(), "unlinking merged-away sorted file");
        std::fs::remove_file(&self.inner.path)?;
        Ok(())
    }

    /// Point lookup honoring expiry.
    ///
    /// Returns [`LookupOutcome::Tombstone`] both for explicit deletions
    /// and for entries whose expiry has passed at `now` — either way the
    /// key is definitively gone at this layer.
    pub fn get(&self, key: &[u8], now: u64) -> Result<LookupOutcome, SstError> {
        let props = &self.inner.props;
        if props.entry_count == 0
            || key < props.min_key.as_slice()
            || key > props.max_key.as_slice()
        {
            return Ok(LookupOutcome::Absent);
        }
        if let Some(bloom) = &self.inner.bloom {
            if !bloom.check(key) {
                return Ok(LookupOutcome::Absent);
            }
        }

        // Last block whose first key is <= key.
        let idx = self
            .inner
            .index
            .partition_point(|e| e.first_key.as_slice() <= key);
        if idx == 0 {
            return Ok(LookupOutcome::Absent);
        }
        let entries = self.read_data_block(idx - 1)?;

        match entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
            Ok(pos) => {
                let entry = &entries[pos];
                if entry.is_live(now) {
                    Ok(LookupOutcome::Found(
                        entry.value.clone().unwrap_or_default(),
                    ))
                } else {
                    Ok(LookupOutcome::Tombstone)
                }
            }
            Err(_) => Ok(LookupOutcome::Absent),
        }
    }

    /// Streaming reader over `[from, to)`; `None` bounds are open.
    ///
    /// The reader holds a clone of this handle, so the file stays pinned
    /// for as long as the iteration runs.
    pub fn range_reader(&self, from: Option<Vec<u8>>, to: Option<Vec<u8>>) -> RangeReader {
        RangeReader::new(self.clone(), from, to)
    }

    /// Number of data blocks.
    pub(crate) fn block_count(&self) -> usize {
        self.inner.index.len()
    }

    /// Index of the first data block that can contain keys `>= from`.
    pub(crate) fn seek_block(&self, from: &[u8]) -> usize {
        // Blocks before this one end strictly below `from`.
        self.inner
            .index
            .partition_point(|e| e.first_key.as_slice() <= from)
            .saturating_sub(1)
    }

    /// Decode the data block at `block_idx` into its entries.
    pub(crate) fn read_data_block(&self, block_idx: usize) -> Result<Vec<Entry>, SstError> {
        let handle = self
            .inner
            .index
            .get(block_idx)
            .ok_or_else(|| SstError::Internal(format!("block index {block_idx} out of range")))?
            .handle;

        let payload = read_block(&self.inner.mmap, handle)?;
        let cells = self.inner.codec.decompress(&payload)?;

        let mut entries = Vec::new();
        let mut off = 0;
        while off < cells.len() {
            let (entry, n) = encoding::decode_from_slice::<Entry>(&cells[off..])?;
            off += n;
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// Read and CRC-check one framed block, returning its raw payload.
fn read_block(mmap: &Mmap, handle: BlockHandle) -> Result<Vec<u8>, SstError> {
    let start = handle.offset as usize;
    let payload_len = handle.size as usize;
    let end = start
        .checked_add(BLOCK_LEN_SIZE + payload_len + BLOCK_CRC_SIZE)
        .ok_or_else(|| SstError::BadFooter("block handle overflows".into()))?;
    if end > mmap.len() {
        return Err(SstError::BadFooter("block handle out of bounds".into()));
    }

    let frame = &mmap[start..end];
    let stored_len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if stored_len != payload_len {
        return Err(SstError::ChecksumMismatch);
    }
    let payload = &frame[BLOCK_LEN_SIZE..BLOCK_LEN_SIZE + payload_len];
    let crc_bytes = &frame[BLOCK_LEN_SIZE + payload_len..];
    let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    if compute_crc(payload) != stored_crc {
        return Err(SstError::ChecksumMismatch);
    }
    Ok(payload.to_vec())
}
