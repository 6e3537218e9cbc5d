//! Shared builders for sorted-file tests.

use std::path::Path;

use crate::engine::{Entry, Expiry};
use crate::sstable::{Compression, SortedFile, Writer, WriterConfig};

pub fn config(compression: Compression, page_size: usize, expected: usize) -> WriterConfig {
    WriterConfig {
        compression,
        page_size,
        write_buffer_size: 64 * 1024,
        expected_entries: expected,
    }
}

/// Write `entries` (already sorted) into a sorted file and reopen it.
pub fn build_file(path: &Path, entries: &[Entry], cfg: WriterConfig) -> SortedFile {
    let mut writer = Writer::create(path, cfg).unwrap();
    for entry in entries {
        writer.add(entry).unwrap();
    }
    writer.finish().unwrap();
    SortedFile::open(path).unwrap()
}

/// `count` ascending `key_NNNN` → `val_NNNN` entries.
pub fn numbered_entries(count: usize) -> Vec<Entry> {
    (0..count)
        .map(|i| {
            Entry::put(
                format!("key_{i:04}").into_bytes(),
                format!("val_{i:04}").into_bytes(),
                Expiry::Never,
            )
        })
        .collect()
}
