//! Sorted-file writer — streams ascending entries into a complete file.
//!
//! Unlike a batch builder, [`Writer`] does not need the whole run up
//! front: the nursery flush and the incremental level merge both feed it
//! one entry at a time. The caller supplies an upper bound on the entry
//! count (known in both cases from the level sizing) so the bloom filter
//! can be sized before the first key arrives.
//!
//! Callers always point the writer at a temporary path and rename the
//! finished file into place, so a crash can never leave a half-written
//! file under a canonical name.

use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    mem,
    path::{Path, PathBuf},
};

use bloomfilter::Bloom;
use tracing::{debug, trace};

use crate::encoding::{self, Encode};
use crate::engine::Entry;

use super::{
    compute_crc, BlockHandle, Compression, Footer, IndexEntry, Properties, SstError,
    BLOCK_CRC_SIZE, BLOCK_LEN_SIZE, BLOOM_FP_RATE, SST_FOOTER_SIZE, SST_MAGIC, SST_VERSION,
};

// ------------------------------------------------------------------------------------------------
// Writer configuration
// ------------------------------------------------------------------------------------------------

/// Knobs for one file write, derived from the store options plus the
/// caller's knowledge of the run being written.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Block compression codec.
    pub compression: Compression,

    /// Target byte size of one data block's cell payload.
    pub page_size: usize,

    /// Capacity of the buffered file writer.
    pub write_buffer_size: usize,

    /// Upper bound on the number of entries this file will hold; sizes the
    /// bloom filter.
    pub expected_entries: usize,
}

// ------------------------------------------------------------------------------------------------
// Writer
// ------------------------------------------------------------------------------------------------

/// Streaming sorted-file writer.
///
/// Entries must arrive with strictly ascending keys; the writer enforces
/// this and fails rather than produce an unsearchable file.
pub struct Writer {
    file: BufWriter<File>,
    path: PathBuf,
    cfg: WriterConfig,
    bloom: Bloom<[u8]>,

    /// Encoded cells of the block being assembled.
    block_buf: Vec<u8>,
    block_first_key: Option<Vec<u8>>,
    index: Vec<IndexEntry>,

    /// Byte offset where the next block frame will start.
    offset: u64,

    entry_count: u64,
    tombstone_count: u64,
    min_key: Option<Vec<u8>>,
    last_key: Option<Vec<u8>>,
}

impl Writer {
    /// Create a writer at `path` (truncating any previous file) and write
    /// the header.
    pub fn create<P: AsRef<Path>>(path: P, cfg: WriterConfig) -> Result<Self, SstError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut file = BufWriter::with_capacity(cfg.write_buffer_size.max(4096), file);

        // Header: magic | version | codec | crc.
        let mut header = Vec::with_capacity(13);
        header.extend_from_slice(&SST_MAGIC);
        header.extend_from_slice(&SST_VERSION.to_le_bytes());
        header.push(cfg.compression.to_wire());
        let crc = compute_crc(&header);
        header.extend_from_slice(&crc.to_le_bytes());
        file.write_all(&header)?;

        let bloom = Bloom::new_for_fp_rate(cfg.expected_entries.max(1), BLOOM_FP_RATE)
            .map_err(|e| SstError::Internal(e.to_string()))?;

        let offset = header.len() as u64;
        Ok(Self {
            file,
            path,
            cfg,
            bloom,
            block_buf: Vec::new(),
            block_first_key: None,
            index: Vec::new(),
            offset,
            entry_count: 0,
            tombstone_count: 0,
            min_key: None,
            last_key: None,
        })
    }

    /// Append one entry. Keys must be strictly ascending.
    pub fn add(&mut self, entry: &Entry) -> Result<(), SstError> {
        if let Some(last) = &self.last_key {
            if entry.key.as_slice() <= last.as_slice() {
                return Err(SstError::Internal(format!(
                    "keys out of order: {:02x?} after {:02x?}",
                    entry.key, last
                )));
            }
        }

        if self.block_first_key.is_none() {
            self.block_first_key = Some(entry.key.clone());
        }
        if self.min_key.is_none() {
            self.min_key = Some(entry.key.clone());
        }
        self.bloom.set(&entry.key);
        self.entry_count += 1;
        if entry.is_tombstone() {
            self.tombstone_count += 1;
        }

        entry.encode_to(&mut self.block_buf)?;
        self.last_key = Some(entry.key.clone());

        if self.block_buf.len() >= self.cfg.page_size {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Entries written so far.
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Write out the meta blocks and footer, sync, and close.
    ///
    /// Returns the final entry count. The file at `path` is complete and
    /// validated-openable once this returns.
    pub fn finish(mut self) -> Result<u64, SstError> {
        if !self.block_buf.is_empty() {
            self.flush_block()?;
        }

        let bloom_handle = if self.entry_count == 0 {
            self.write_meta_block(&[])?
        } else {
            let bloom_bytes = self.bloom.as_slice().to_vec();
            self.write_meta_block(&bloom_bytes)?
        };

        let props = Properties {
            entry_count: self.entry_count,
            tombstone_count: self.tombstone_count,
            min_key: self.min_key.take().unwrap_or_default(),
            max_key: self.last_key.take().unwrap_or_default(),
        };
        let props_bytes = encoding::encode_to_vec(&props)?;
        let props_handle = self.write_meta_block(&props_bytes)?;

        let mut index_bytes = Vec::new();
        encoding::encode_vec(&self.index, &mut index_bytes)?;
        let index_handle = self.write_meta_block(&index_bytes)?;

        let footer = Footer {
            bloom: bloom_handle,
            props: props_handle,
            index: index_handle,
            file_size: self.offset + SST_FOOTER_SIZE as u64,
        };
        let mut footer_bytes = encoding::encode_to_vec(&footer)?;
        let crc = compute_crc(&footer_bytes);
        footer_bytes.extend_from_slice(&crc.to_le_bytes());
        self.file.write_all(&footer_bytes)?;

        self.file.flush()?;
        let file = self
            .file
            .into_inner()
            .map_err(|e| SstError::Io(e.into_error()))?;
        file.sync_all()?;

        debug!(
            path = %self.path.display(),
            entries = self.entry_count,
            tombstones = self.tombstone_count,
            blocks = self.index.len(),
            "sorted file written"
        );
        Ok(self.entry_count)
    }

    /// Discard the writer and remove its (partial) output file.
    pub fn abandon(self) -> Result<(), SstError> {
        let path = self.path.clone();
        drop(self.file);
        std::fs::remove_file(&path)?;
        trace!(path = %path.display(), "abandoned sorted-file write");
        Ok(())
    }

    /// Compress and frame the assembled block, recording its index entry.
    fn flush_block(&mut self) -> Result<(), SstError> {
        let cells = mem::take(&mut self.block_buf);
        let payload = self.cfg.compression.compress(&cells)?;
        let handle = self.write_frame(&payload)?;

        let first_key = self
            .block_first_key
            .take()
            .ok_or_else(|| SstError::Internal("flushing a block with no first key".into()))?;
        self.index.push(IndexEntry { first_key, handle });
        Ok(())
    }

    /// Frame an uncompressed meta-block payload.
    fn write_meta_block(&mut self, payload: &[u8]) -> Result<BlockHandle, SstError> {
        self.write_frame(payload)
    }

    /// Write `[len][payload][crc]`, returning the block handle.
    fn write_frame(&mut self, payload: &[u8]) -> Result<BlockHandle, SstError> {
        let len = u32::try_from(payload.len())
            .map_err(|_| SstError::Internal("block payload exceeds u32".into()))?;
        let crc = compute_crc(payload);

        self.file.write_all(&len.to_le_bytes())?;
        self.file.write_all(payload)?;
        self.file.write_all(&crc.to_le_bytes())?;

        let handle = BlockHandle {
            offset: self.offset,
            size: payload.len() as u64,
        };
        self.offset += (BLOCK_LEN_SIZE + payload.len() + BLOCK_CRC_SIZE) as u64;
        Ok(handle)
    }
}
