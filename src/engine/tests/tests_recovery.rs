//! Crash recovery — reopening a store that was never closed.

mod tests {
    use crate::engine::tests::helpers::*;
    use crate::engine::{level_capacity, Engine, Options, TOP_LEVEL};
    use crate::journal::SyncStrategy;
    use tempfile::TempDir;

    fn durable_options() -> Options {
        Options {
            sync_strategy: SyncStrategy::Always,
            ..Options::default()
        }
    }

    #[test]
    fn reopen_after_clean_close() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = open_engine(tmp.path());
            fill(&engine, 300, "v");
            engine.close().unwrap();
        }

        let engine = open_engine(tmp.path());
        assert_eq!(collect_keys(&engine).len(), 300);
        assert_eq!(engine.get(&key(299)).unwrap(), Some(val("v", 299)));
        engine.close().unwrap();
    }

    #[test]
    fn unclosed_store_recovers_every_synced_write() {
        let tmp = TempDir::new().unwrap();
        let count = 2 * level_capacity(TOP_LEVEL) + 57;
        {
            let engine = Engine::open_with(tmp.path(), durable_options()).unwrap();
            fill(&engine, count, "v");
            engine.delete(key(3)).unwrap();
            // No close: handles drop, level tasks wind down, the nursery
            // journal stays behind.
        }

        let engine = Engine::open_with(tmp.path(), durable_options()).unwrap();
        let pairs = collect_pairs(&engine);
        assert_eq!(pairs.len(), count - 1);
        assert_eq!(engine.get(&key(3)).unwrap(), None);
        assert_eq!(engine.get(&key(count - 1)).unwrap(), Some(val("v", count - 1)));

        // The store keeps working after recovery.
        engine.put(key(3), b"back".to_vec()).unwrap();
        assert_eq!(engine.get(&key(3)).unwrap(), Some(b"back".to_vec()));
        engine.close().unwrap();
    }

    #[test]
    fn recovery_is_repeatable() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = Engine::open_with(tmp.path(), durable_options()).unwrap();
            fill(&engine, 100, "v");
        }
        // Two crash/reopen cycles in a row.
        {
            let engine = Engine::open_with(tmp.path(), durable_options()).unwrap();
            assert_eq!(collect_keys(&engine).len(), 100);
        }
        let engine = Engine::open_with(tmp.path(), durable_options()).unwrap();
        assert_eq!(collect_keys(&engine).len(), 100);
        engine.close().unwrap();
    }

    #[test]
    fn transaction_recovers_atomically() {
        use crate::engine::WriteOp;

        let tmp = TempDir::new().unwrap();
        {
            let engine = Engine::open_with(tmp.path(), durable_options()).unwrap();
            engine.put(b"z".to_vec(), b"old".to_vec()).unwrap();
            engine
                .transact(vec![
                    WriteOp::Put(b"x".to_vec(), b"1".to_vec()),
                    WriteOp::Delete(b"z".to_vec()),
                ])
                .unwrap();
        }

        let engine = Engine::open_with(tmp.path(), durable_options()).unwrap();
        assert_eq!(engine.get(b"x").unwrap(), Some(b"1".to_vec()));
        assert_eq!(engine.get(b"z").unwrap(), None);
        engine.close().unwrap();
    }

    #[test]
    fn stale_temp_files_are_swept_on_open() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = open_engine(tmp.path());
            fill(&engine, 300, "v");
            engine.close().unwrap();
        }
        // Plant debris a crash mid-merge or mid-flush could leave.
        std::fs::write(tmp.path().join("C-8.tmp"), b"partial merge output").unwrap();
        std::fs::write(tmp.path().join("N-8.tmp"), b"partial flush").unwrap();

        let engine = open_engine(tmp.path());
        assert!(!tmp.path().join("C-8.tmp").exists());
        assert!(!tmp.path().join("N-8.tmp").exists());
        assert_eq!(collect_keys(&engine).len(), 300);
        engine.close().unwrap();
    }

    #[test]
    fn reopen_with_default_options() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = Engine::open(tmp.path()).unwrap();
            engine.put(b"k".to_vec(), b"v".to_vec()).unwrap();
            engine.close().unwrap();
        }
        let engine = Engine::open(tmp.path()).unwrap();
        assert_eq!(engine.get(b"k").unwrap(), Some(b"v".to_vec()));
        engine.close().unwrap();
    }
}
