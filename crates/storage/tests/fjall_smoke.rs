#![cfg(feature = "fjall")]

use ledgerd_storage::fjall::{FjallOptions, FjallStore};
use ledgerd_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn fjall_batch_roundtrip_and_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");

    {
        let store = FjallStore::open(dir.path()).expect("open fjall");
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"key", b"value");
        batch.put(Column::Coins, b"prefix:1", b"a");
        batch.put(Column::Coins, b"prefix:2", b"b");
        store.write_batch(&batch).expect("batch commit");

        let rows = store.scan_prefix(Column::Coins, b"prefix:").expect("scan");
        assert_eq!(
            rows,
            vec![
                (b"prefix:1".to_vec(), b"a".to_vec()),
                (b"prefix:2".to_vec(), b"b".to_vec()),
            ]
        );

        let mut batch = WriteBatch::new();
        batch.delete(Column::Meta, b"key");
        batch.put(Column::Meta, b"batch", b"ok");
        store.write_batch(&batch).expect("batch commit");
        store.persist().expect("persist");
    }

    let store = FjallStore::open(dir.path()).expect("reopen fjall");
    assert!(store.get(Column::Meta, b"key").expect("get").is_none());
    assert_eq!(
        store.get(Column::Meta, b"batch").expect("get"),
        Some(b"ok".to_vec())
    );
    assert_eq!(store.scan_prefix(Column::Coins, b"").expect("scan").len(), 2);
}

#[test]
fn synced_commits_survive_reopen_without_persist() {
    let dir = tempfile::tempdir().expect("tempdir");
    let options = FjallOptions {
        cache_bytes: Some(8 * 1024 * 1024),
        sync_commits: true,
    };

    {
        let store = FjallStore::open_with_options(dir.path(), options).expect("open fjall");
        let mut batch = WriteBatch::new();
        batch.put(Column::BlockUndo, [7u8; 32], b"undo");
        batch.put(Column::Coins, [7u8; 36], b"coin");
        store.write_batch(&batch).expect("batch commit");
        store.write_batch(&WriteBatch::new()).expect("empty batch");
    }

    let store = FjallStore::open_with_options(dir.path(), options).expect("reopen fjall");
    assert_eq!(
        store.get(Column::BlockUndo, &[7u8; 32]).expect("get"),
        Some(b"undo".to_vec())
    );
    let mut seen = 0;
    store
        .for_each_prefix(Column::Coins, &[7u8], &mut |key: &[u8], value: &[u8]| {
            assert_eq!(key.len(), 36);
            assert_eq!(value, b"coin");
            seen += 1;
            Ok(())
        })
        .expect("visit");
    assert_eq!(seen, 1);
    assert!(store.get(Column::Meta, b"missing").expect("get").is_none());
}
