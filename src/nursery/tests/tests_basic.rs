//! Add / lookup / capacity / flush basics.

mod tests {
    use crate::engine::{level_capacity, Expiry, LookupOutcome, TOP_LEVEL};
    use crate::nursery::tests::helpers::*;
    use crate::nursery::{Nursery, NURSERY_LOG};
    use tempfile::TempDir;

    #[test]
    fn add_then_lookup() {
        let tmp = TempDir::new().unwrap();
        let opts = test_options();
        let mut nursery = Nursery::create(tmp.path(), &opts).unwrap();

        nursery
            .add(b"k".to_vec(), Some(b"v".to_vec()), Expiry::Never)
            .unwrap();
        assert_eq!(
            nursery.lookup(b"k", 0),
            LookupOutcome::Found(b"v".to_vec())
        );
        assert_eq!(nursery.lookup(b"other", 0), LookupOutcome::Absent);
        assert_eq!(nursery.len(), 1);
    }

    #[test]
    fn latest_write_wins_per_key() {
        let tmp = TempDir::new().unwrap();
        let opts = test_options();
        let mut nursery = Nursery::create(tmp.path(), &opts).unwrap();

        nursery
            .add(b"k".to_vec(), Some(b"v1".to_vec()), Expiry::Never)
            .unwrap();
        nursery
            .add(b"k".to_vec(), Some(b"v2".to_vec()), Expiry::Never)
            .unwrap();
        assert_eq!(
            nursery.lookup(b"k", 0),
            LookupOutcome::Found(b"v2".to_vec())
        );
        assert_eq!(nursery.len(), 1, "overwrites do not grow the buffer");

        nursery.add(b"k".to_vec(), None, Expiry::Never).unwrap();
        assert_eq!(nursery.lookup(b"k", 0), LookupOutcome::Tombstone);
    }

    #[test]
    fn expired_entry_reads_as_tombstone() {
        let tmp = TempDir::new().unwrap();
        let opts = test_options();
        let mut nursery = Nursery::create(tmp.path(), &opts).unwrap();

        nursery
            .add(b"k".to_vec(), Some(b"v".to_vec()), Expiry::At(100))
            .unwrap();
        assert_eq!(nursery.lookup(b"k", 50), LookupOutcome::Found(b"v".to_vec()));
        assert_eq!(nursery.lookup(b"k", 100), LookupOutcome::Tombstone);
        assert_eq!(nursery.lookup(b"k", 500), LookupOutcome::Tombstone);
    }

    #[test]
    fn capacity_is_reported_at_the_bound() {
        let tmp = TempDir::new().unwrap();
        let opts = test_options();
        let mut nursery = Nursery::create(tmp.path(), &opts).unwrap();
        let cap = level_capacity(TOP_LEVEL);
        assert_eq!(nursery.capacity(), cap);

        for i in 0..cap {
            let full = nursery
                .add(
                    format!("key_{i:05}").into_bytes(),
                    Some(b"v".to_vec()),
                    Expiry::Never,
                )
                .unwrap();
            assert_eq!(full, i + 1 == cap, "full only at the very last insert");
        }
    }

    #[test]
    fn range_snapshot_is_ordered_and_frozen() {
        let tmp = TempDir::new().unwrap();
        let opts = test_options();
        let mut nursery = Nursery::create(tmp.path(), &opts).unwrap();

        for key in [b"c".to_vec(), b"a".to_vec(), b"d".to_vec(), b"b".to_vec()] {
            nursery.add(key, Some(b"v".to_vec()), Expiry::Never).unwrap();
        }
        nursery.add(b"b".to_vec(), None, Expiry::Never).unwrap();

        let snapshot = nursery.range_snapshot(Some(b"a"), Some(b"d"));
        let keys: Vec<&[u8]> = snapshot.iter().map(|e| e.key.as_slice()).collect();
        assert_eq!(keys, vec![b"a".as_ref(), b"b".as_ref(), b"c".as_ref()]);
        // Tombstones travel in the snapshot; shadowing happens later.
        assert!(snapshot[1].is_tombstone());

        // Mutations after the snapshot do not affect it.
        nursery
            .add(b"a".to_vec(), Some(b"changed".to_vec()), Expiry::Never)
            .unwrap();
        assert_eq!(snapshot[0].value, Some(b"v".to_vec()));
    }

    #[test]
    fn finish_stages_into_the_top_level_and_drops_the_log() {
        let tmp = TempDir::new().unwrap();
        let opts = test_options();
        let top = spawn_top(tmp.path(), &opts);

        let mut nursery = Nursery::create(tmp.path(), &opts).unwrap();
        nursery
            .add(b"a".to_vec(), Some(b"1".to_vec()), Expiry::Never)
            .unwrap();
        nursery.add(b"b".to_vec(), None, Expiry::Never).unwrap();
        nursery.finish(&top, &opts).unwrap();

        assert!(!tmp.path().join(NURSERY_LOG).exists());
        assert!(tmp.path().join("A-8.data").exists());
        assert!(!tmp.path().join("N-8.tmp").exists());

        assert_eq!(
            top.lookup(b"a".to_vec(), 0).unwrap(),
            LookupOutcome::Found(b"1".to_vec())
        );
        assert_eq!(
            top.lookup(b"b".to_vec(), 0).unwrap(),
            LookupOutcome::Tombstone
        );

        top.close().unwrap();
    }

    #[test]
    fn finishing_an_empty_nursery_produces_no_file() {
        let tmp = TempDir::new().unwrap();
        let opts = test_options();
        let top = spawn_top(tmp.path(), &opts);

        let nursery = Nursery::create(tmp.path(), &opts).unwrap();
        nursery.finish(&top, &opts).unwrap();

        assert!(!tmp.path().join(NURSERY_LOG).exists());
        assert!(!tmp.path().join("A-8.data").exists());

        top.close().unwrap();
    }
}
