//! Shared scaffolding for nursery tests.

use std::path::Path;
use std::sync::Arc;

use crossbeam::channel::unbounded;

use crate::engine::{Options, TOP_LEVEL};
use crate::journal::SyncStrategy;
use crate::level::LevelHandle;

pub fn test_options() -> Arc<Options> {
    Arc::new(Options {
        sync_strategy: SyncStrategy::Never,
        ..Options::default()
    })
}

/// A lone top level to receive nursery flushes.
pub fn spawn_top(dir: &Path, opts: &Arc<Options>) -> LevelHandle {
    let (notices, _rx) = unbounded();
    LevelHandle::spawn(dir.to_path_buf(), TOP_LEVEL, None, Arc::clone(opts), notices).unwrap()
}
