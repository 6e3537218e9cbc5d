//! Shared scaffolding for level tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::engine::{Entry, Expiry, MergeStrategy, Options};
use crate::journal::SyncStrategy;
use crate::level::EngineNotice;
use crate::sstable::Writer;

pub fn test_options(strategy: MergeStrategy) -> Arc<Options> {
    Arc::new(Options {
        merge_strategy: strategy,
        sync_strategy: SyncStrategy::Never,
        ..Options::default()
    })
}

pub fn notice_channel() -> (Sender<EngineNotice>, Receiver<EngineNotice>) {
    unbounded()
}

/// Stage a sorted file under a `.tmp` name, ready for injection.
pub fn stage_file(dir: &Path, name: &str, entries: &[Entry], opts: &Options) -> PathBuf {
    let path = dir.join(name);
    let mut writer = Writer::create(&path, opts.writer_config(entries.len().max(1))).unwrap();
    for entry in entries {
        writer.add(entry).unwrap();
    }
    writer.finish().unwrap();
    path
}

pub fn put(key: &[u8], value: &[u8]) -> Entry {
    Entry::put(key.to_vec(), value.to_vec(), Expiry::Never)
}

pub fn tomb(key: &[u8]) -> Entry {
    Entry::tombstone(key.to_vec())
}

/// `count` ascending entries with a value prefix.
pub fn run_of(count: usize, value_tag: &str) -> Vec<Entry> {
    (0..count)
        .map(|i| {
            Entry::put(
                format!("key_{i:04}").into_bytes(),
                format!("{value_tag}_{i:04}").into_bytes(),
                Expiry::Never,
            )
        })
        .collect()
}
