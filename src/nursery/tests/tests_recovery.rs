//! Journal replay into the level chain.

mod tests {
    use std::fs;

    use crate::engine::{Expiry, LookupOutcome};
    use crate::nursery::tests::helpers::*;
    use crate::nursery::{Nursery, NURSERY_LOG};
    use tempfile::TempDir;

    #[test]
    fn recover_flushes_buffered_writes_then_deletes_the_log() {
        let tmp = TempDir::new().unwrap();
        let opts = test_options();

        // First life: writes land in the journal, no clean finish.
        {
            let mut nursery = Nursery::create(tmp.path(), &opts).unwrap();
            nursery
                .add(b"a".to_vec(), Some(b"1".to_vec()), Expiry::Never)
                .unwrap();
            nursery
                .add(b"b".to_vec(), Some(b"2".to_vec()), Expiry::Never)
                .unwrap();
            nursery.add(b"a".to_vec(), None, Expiry::Never).unwrap();
            // Dropped without finish — the crash.
        }
        assert!(tmp.path().join(NURSERY_LOG).exists());

        // Second life.
        let top = spawn_top(tmp.path(), &opts);
        Nursery::recover(tmp.path(), &top, &opts).unwrap();

        // The log is gone only after its contents reached the level.
        assert!(!tmp.path().join(NURSERY_LOG).exists());
        assert_eq!(
            top.lookup(b"b".to_vec(), 0).unwrap(),
            LookupOutcome::Found(b"2".to_vec())
        );
        // The delete survived recovery too.
        assert_eq!(
            top.lookup(b"a".to_vec(), 0).unwrap(),
            LookupOutcome::Tombstone
        );

        top.close().unwrap();
    }

    #[test]
    fn recover_without_a_log_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let opts = test_options();
        let top = spawn_top(tmp.path(), &opts);

        Nursery::recover(tmp.path(), &top, &opts).unwrap();
        assert!(!tmp.path().join("A-8.data").exists());

        top.close().unwrap();
    }

    #[test]
    fn torn_tail_record_is_dropped_quietly() {
        let tmp = TempDir::new().unwrap();
        let opts = test_options();

        {
            let mut nursery = Nursery::create(tmp.path(), &opts).unwrap();
            nursery
                .add(b"whole".to_vec(), Some(b"1".to_vec()), Expiry::Never)
                .unwrap();
            nursery
                .add(b"torn".to_vec(), Some(b"2".to_vec()), Expiry::Never)
                .unwrap();
        }

        // Tear the last record's checksum off.
        let log = tmp.path().join(NURSERY_LOG);
        let len = fs::metadata(&log).unwrap().len();
        let surgeon = fs::OpenOptions::new().write(true).open(&log).unwrap();
        surgeon.set_len(len - 2).unwrap();
        drop(surgeon);

        let top = spawn_top(tmp.path(), &opts);
        Nursery::recover(tmp.path(), &top, &opts).unwrap();

        assert_eq!(
            top.lookup(b"whole".to_vec(), 0).unwrap(),
            LookupOutcome::Found(b"1".to_vec())
        );
        assert_eq!(
            top.lookup(b"torn".to_vec(), 0).unwrap(),
            LookupOutcome::Absent
        );

        top.close().unwrap();
    }

    #[test]
    fn recovered_batch_is_all_or_nothing() {
        let tmp = TempDir::new().unwrap();
        let opts = test_options();

        {
            let mut nursery = Nursery::create(tmp.path(), &opts).unwrap();
            nursery
                .transact(vec![
                    crate::engine::Entry::put(b"x".to_vec(), b"1".to_vec(), Expiry::Never),
                    crate::engine::Entry::put(b"y".to_vec(), b"2".to_vec(), Expiry::Never),
                ])
                .unwrap();
        }

        // Damage the batch record; both ops must vanish together.
        let log = tmp.path().join(NURSERY_LOG);
        let mut bytes = fs::read(&log).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&log, &bytes).unwrap();

        let top = spawn_top(tmp.path(), &opts);
        Nursery::recover(tmp.path(), &top, &opts).unwrap();

        assert_eq!(
            top.lookup(b"x".to_vec(), 0).unwrap(),
            LookupOutcome::Absent
        );
        assert_eq!(
            top.lookup(b"y".to_vec(), 0).unwrap(),
            LookupOutcome::Absent
        );

        top.close().unwrap();
    }
}
