//! Streaming range reader over a sorted file.
//!
//! Decodes one data block at a time rather than materializing the file,
//! so a full-store fold over a deep level costs one block of memory per
//! open source. The reader owns a [`SortedFile`] clone, pinning the
//! mapped table for the lifetime of the iteration (a merge may unlink the
//! file mid-read; the inode outlives us).

use crate::engine::Entry;

use super::{SortedFile, SstError};

/// Iterator over the entries of one sorted file inside `[from, to)`.
///
/// Yields tombstones and expired entries too — shadowing and liveness are
/// the merge layer's business, not the codec's.
pub struct RangeReader {
    table: SortedFile,
    to: Option<Vec<u8>>,

    /// Lower bound still to be applied to the first decoded block.
    from: Option<Vec<u8>>,

    /// Next block to decode.
    block_idx: usize,

    /// Entries of the current block.
    pending: std::vec::IntoIter<Entry>,

    done: bool,
}

impl RangeReader {
    pub(crate) fn new(table: SortedFile, from: Option<Vec<u8>>, to: Option<Vec<u8>>) -> Self {
        let block_idx = match &from {
            Some(from) => table.seek_block(from),
            None => 0,
        };
        Self {
            table,
            to,
            from,
            block_idx,
            pending: Vec::new().into_iter(),
            done: false,
        }
    }

    /// Decode the next block, applying the lower bound if this is the
    /// first block of the iteration.
    fn load_next_block(&mut self) -> Result<bool, SstError> {
        if self.block_idx >= self.table.block_count() {
            return Ok(false);
        }
        let mut entries = self.table.read_data_block(self.block_idx)?;
        self.block_idx += 1;

        if let Some(from) = self.from.take() {
            let start = entries.partition_point(|e| e.key.as_slice() < from.as_slice());
            entries.drain(..start);
        }

        self.pending = entries.into_iter();
        Ok(true)
    }
}

impl Iterator for RangeReader {
    type Item = Result<Entry, SstError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Some(entry) = self.pending.next() {
                if let Some(to) = &self.to {
                    if entry.key.as_slice() >= to.as_slice() {
                        self.done = true;
                        return None;
                    }
                }
                return Some(Ok(entry));
            }

            match self.load_next_block() {
                Ok(true) => continue,
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
