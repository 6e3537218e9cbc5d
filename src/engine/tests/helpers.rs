//! Shared scaffolding for engine tests.

use std::path::Path;

use crate::engine::{Engine, Options};
use crate::journal::SyncStrategy;

/// Route tracing output to the test harness; filter with `RUST_LOG`.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fast options for tests that do not exercise durability.
pub fn test_options() -> Options {
    Options {
        sync_strategy: SyncStrategy::Never,
        ..Options::default()
    }
}

pub fn open_engine(dir: &Path) -> Engine {
    Engine::open_with(dir, test_options()).unwrap()
}

pub fn key(i: usize) -> Vec<u8> {
    format!("key_{i:06}").into_bytes()
}

pub fn val(tag: &str, i: usize) -> Vec<u8> {
    format!("{tag}_{i:06}").into_bytes()
}

/// Write `count` distinct ascending keys.
pub fn fill(engine: &Engine, count: usize, tag: &str) {
    for i in 0..count {
        engine.put(key(i), val(tag, i)).unwrap();
    }
}

/// All keys in the store, in fold order.
pub fn collect_keys(engine: &Engine) -> Vec<Vec<u8>> {
    engine
        .fold(Vec::new(), |mut acc, key, _value| {
            acc.push(key);
            Ok(acc)
        })
        .unwrap()
}

/// All pairs in the store, in fold order.
pub fn collect_pairs(engine: &Engine) -> Vec<(Vec<u8>, Vec<u8>)> {
    engine
        .fold(Vec::new(), |mut acc, key, value| {
            acc.push((key, value));
            Ok(acc)
        })
        .unwrap()
}
