//! End-to-end integration tests against the public API.

use cascadedb::engine::{unix_now, Engine, EngineError, Expiry, Options, WriteOp};
use cascadedb::journal::SyncStrategy;
use cascadedb::FoldRange;
use tempfile::TempDir;

fn fast_options() -> Options {
    Options {
        sync_strategy: SyncStrategy::Never,
        ..Options::default()
    }
}

#[test]
fn basic_point_operations() {
    let tmp = TempDir::new().unwrap();
    let db = Engine::open_with(tmp.path(), fast_options()).unwrap();

    db.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    db.put(b"b".to_vec(), b"2".to_vec()).unwrap();
    assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(db.get(b"c").unwrap(), None);

    db.close().unwrap();
}

#[test]
fn overwrite_delete_rewrite() {
    let tmp = TempDir::new().unwrap();
    let db = Engine::open_with(tmp.path(), fast_options()).unwrap();

    db.put(b"k".to_vec(), b"v1".to_vec()).unwrap();
    db.put(b"k".to_vec(), b"v2".to_vec()).unwrap();
    db.delete(b"k".to_vec()).unwrap();
    assert_eq!(db.get(b"k").unwrap(), None);

    db.put(b"k".to_vec(), b"v3".to_vec()).unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(b"v3".to_vec()));

    db.close().unwrap();
}

#[test]
fn deep_fill_folds_back_in_order() {
    let tmp = TempDir::new().unwrap();
    let db = Engine::open_with(tmp.path(), fast_options()).unwrap();

    // ≥ 4 nurseries of monotonically increasing keys forces at least two
    // cascading merges.
    let count = 1100usize;
    for i in 0..count {
        db.put(
            format!("key_{i:06}").into_bytes(),
            format!("val_{i:06}").into_bytes(),
        )
        .unwrap();
    }

    let pairs = db
        .fold(Vec::new(), |mut acc: Vec<(Vec<u8>, Vec<u8>)>, k, v| {
            acc.push((k, v));
            Ok(acc)
        })
        .unwrap();
    assert_eq!(pairs.len(), count);
    for (i, (k, v)) in pairs.iter().enumerate() {
        assert_eq!(k, format!("key_{i:06}").as_bytes());
        assert_eq!(v, format!("val_{i:06}").as_bytes());
    }

    db.close().unwrap();
}

#[test]
fn transactions_are_atomic_under_a_concurrent_fold() {
    let tmp = TempDir::new().unwrap();
    let db = Engine::open_with(tmp.path(), fast_options()).unwrap();

    db.put(b"x".to_vec(), b"old_x".to_vec()).unwrap();
    db.put(b"y".to_vec(), b"old_y".to_vec()).unwrap();
    db.put(b"z".to_vec(), b"old_z".to_vec()).unwrap();

    // The fold pins its snapshot before the transact lands, so it must
    // see the complete old state; a later read sees the complete new one.
    let writer = db.clone();
    let snapshot = db
        .fold(Vec::new(), move |mut acc: Vec<(Vec<u8>, Vec<u8>)>, k, v| {
            if k == b"x" {
                writer
                    .transact(vec![
                        WriteOp::Put(b"x".to_vec(), b"new_x".to_vec()),
                        WriteOp::Put(b"y".to_vec(), b"new_y".to_vec()),
                        WriteOp::Delete(b"z".to_vec()),
                    ])
                    .unwrap();
            }
            acc.push((k, v));
            Ok(acc)
        })
        .unwrap();

    let values: Vec<&[u8]> = snapshot.iter().map(|(_, v)| v.as_slice()).collect();
    assert_eq!(values, vec![b"old_x".as_ref(), b"old_y", b"old_z"]);

    assert_eq!(db.get(b"x").unwrap(), Some(b"new_x".to_vec()));
    assert_eq!(db.get(b"y").unwrap(), Some(b"new_y".to_vec()));
    assert_eq!(db.get(b"z").unwrap(), None);

    db.close().unwrap();
}

#[test]
fn expiry_hides_entries_after_the_deadline() {
    let tmp = TempDir::new().unwrap();
    let db = Engine::open_with(tmp.path(), fast_options()).unwrap();

    db.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    db.put_with_expiry(b"a".to_vec(), b"2".to_vec(), Expiry::At(unix_now() + 1))
        .unwrap();
    assert_eq!(db.get(b"a").unwrap(), Some(b"2".to_vec()));

    std::thread::sleep(std::time::Duration::from_secs(2));
    assert_eq!(db.get(b"a").unwrap(), None);

    let keys = db
        .fold(Vec::new(), |mut acc: Vec<Vec<u8>>, k, _| {
            acc.push(k);
            Ok(acc)
        })
        .unwrap();
    assert!(keys.is_empty());

    db.close().unwrap();
}

#[test]
fn synced_writes_survive_a_crash() {
    let tmp = TempDir::new().unwrap();
    let count = 10_000usize;
    {
        let db = Engine::open_with(
            tmp.path(),
            Options {
                sync_strategy: SyncStrategy::Always,
                ..Options::default()
            },
        )
        .unwrap();
        for i in 0..count {
            db.put(
                format!("key_{i:06}").into_bytes(),
                format!("val_{i:06}").into_bytes(),
            )
            .unwrap();
        }
        // Crash: drop without close.
    }

    let db = Engine::open(tmp.path()).unwrap();
    let pairs = db
        .fold(Vec::new(), |mut acc: Vec<(Vec<u8>, Vec<u8>)>, k, v| {
            acc.push((k, v));
            Ok(acc)
        })
        .unwrap();
    assert_eq!(pairs.len(), count);
    for (i, (k, v)) in pairs.iter().enumerate() {
        assert_eq!(k, format!("key_{i:06}").as_bytes());
        assert_eq!(v, format!("val_{i:06}").as_bytes());
    }
    db.close().unwrap();
}

#[test]
fn compressed_stores_roundtrip() {
    use cascadedb::engine::Compression;

    for codec in [Compression::Gzip, Compression::Snappy] {
        let tmp = TempDir::new().unwrap();
        let db = Engine::open_with(
            tmp.path(),
            Options {
                sync_strategy: SyncStrategy::Never,
                compress: codec,
                ..Options::default()
            },
        )
        .unwrap();

        for i in 0..600usize {
            db.put(
                format!("key_{i:06}").into_bytes(),
                vec![0xAB; 64],
            )
            .unwrap();
        }
        db.close().unwrap();

        // Reopen with the same codec and read everything back.
        let db = Engine::open_with(
            tmp.path(),
            Options {
                sync_strategy: SyncStrategy::Never,
                compress: codec,
                ..Options::default()
            },
        )
        .unwrap();
        assert_eq!(db.get(b"key_000123").unwrap(), Some(vec![0xAB; 64]));
        let total = db.fold(0usize, |acc, _, _| Ok(acc + 1)).unwrap();
        assert_eq!(total, 600);
        db.destroy().unwrap();
    }
}

#[test]
fn fold_range_with_limits() {
    let tmp = TempDir::new().unwrap();
    let db = Engine::open_with(tmp.path(), fast_options()).unwrap();

    for i in 0..500usize {
        db.put(format!("key_{i:06}").into_bytes(), b"v".to_vec())
            .unwrap();
    }

    // Snapshot-mode fold (large limit).
    let range = FoldRange {
        from: Some(b"key_000100".to_vec()),
        to: Some(b"key_000200".to_vec()),
        limit: Some(50),
    };
    let keys = db
        .fold_range(range, Vec::new(), |mut acc: Vec<Vec<u8>>, k, _| {
            acc.push(k);
            Ok(acc)
        })
        .unwrap();
    assert_eq!(keys.len(), 50);
    assert_eq!(keys[0], b"key_000100".to_vec());

    // Blocking-mode fold (limit < 10).
    let range = FoldRange {
        from: Some(b"key_000490".to_vec()),
        to: None,
        limit: Some(3),
    };
    let keys = db
        .fold_range(range, Vec::new(), |mut acc: Vec<Vec<u8>>, k, _| {
            acc.push(k);
            Ok(acc)
        })
        .unwrap();
    assert_eq!(
        keys,
        vec![
            b"key_000490".to_vec(),
            b"key_000491".to_vec(),
            b"key_000492".to_vec()
        ]
    );

    db.close().unwrap();
}

#[test]
fn fold_error_reraises_to_the_caller() {
    let tmp = TempDir::new().unwrap();
    let db = Engine::open_with(tmp.path(), fast_options()).unwrap();
    db.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    db.put(b"b".to_vec(), b"2".to_vec()).unwrap();

    let result = db.fold((), |_, k, _| {
        if k == b"b" {
            Err(EngineError::InvalidArgument("enough".into()))
        } else {
            Ok(())
        }
    });
    assert!(matches!(result, Err(EngineError::InvalidArgument(_))));

    // Store remains healthy.
    assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
    db.close().unwrap();
}
