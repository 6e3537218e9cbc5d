//! Block compression codecs.

mod tests {
    use crate::engine::{Entry, Expiry, LookupOutcome};
    use crate::sstable::tests::helpers::*;
    use crate::sstable::Compression;
    use tempfile::TempDir;

    fn exercise_codec(codec: Compression) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("A-8.data");
        let entries = numbered_entries(300);
        // Small page size forces several compressed blocks.
        let table = build_file(&path, &entries, config(codec, 256, 300));
        assert!(table.block_count() > 1);

        assert_eq!(
            table.get(b"key_0123", 0).unwrap(),
            LookupOutcome::Found(b"val_0123".to_vec())
        );
        assert_eq!(table.get(b"missing", 0).unwrap(), LookupOutcome::Absent);

        let scanned: Vec<Entry> = table
            .range_reader(None, None)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(scanned, entries);
    }

    #[test]
    fn gzip_blocks() {
        exercise_codec(Compression::Gzip);
    }

    #[test]
    fn snappy_blocks() {
        exercise_codec(Compression::Snappy);
    }

    #[test]
    fn gzip_shrinks_repetitive_payloads() {
        let tmp = TempDir::new().unwrap();

        let entries: Vec<Entry> = (0..100)
            .map(|i| {
                Entry::put(
                    format!("key_{i:04}").into_bytes(),
                    vec![0xAA; 256],
                    Expiry::Never,
                )
            })
            .collect();

        let plain_path = tmp.path().join("plain.data");
        build_file(&plain_path, &entries, config(Compression::None, 4096, 100));
        let gzip_path = tmp.path().join("gzip.data");
        build_file(&gzip_path, &entries, config(Compression::Gzip, 4096, 100));

        let plain_len = std::fs::metadata(&plain_path).unwrap().len();
        let gzip_len = std::fs::metadata(&gzip_path).unwrap().len();
        assert!(
            gzip_len < plain_len / 2,
            "gzip {gzip_len} should beat plain {plain_len}"
        );
    }
}
