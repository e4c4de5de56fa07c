//! In-memory store used by tests and the `memory` backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

type MemoryStoreMap = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreMap>,
    fail_writes: AtomicBool,
    batches_committed: AtomicUsize,
    ops_committed: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following `write_batch` fail without touching the map.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn batches_committed(&self) -> usize {
        self.batches_committed.load(Ordering::SeqCst)
    }

    pub fn ops_committed(&self) -> usize {
        self.ops_committed.load(Ordering::SeqCst)
    }

    pub fn len(&self, column: Column) -> Result<usize, StoreError> {
        let guard = self.read()?;
        Ok(guard.keys().filter(|(col, _)| *col == column).count())
    }

    pub fn is_empty(&self, column: Column) -> Result<bool, StoreError> {
        Ok(self.len(column)? == 0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreMap>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreMap>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.read()?;
        Ok(guard.get(&(column, key.to_vec())).cloned())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let guard = self.read()?;
        let mut results = Vec::new();
        for ((entry_column, key), value) in guard.range((column, prefix.to_vec())..) {
            if *entry_column != column || !key.starts_with(prefix) {
                break;
            }
            results.push((key.clone(), value.clone()));
        }
        Ok(results)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let guard = self.read()?;
        for ((entry_column, key), value) in guard.range((column, prefix.to_vec())..) {
            if *entry_column != column || !key.starts_with(prefix) {
                break;
            }
            visitor(key.as_slice(), value.as_slice())?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(
                "memory store rejected batch (write failure injected)".to_string(),
            ));
        }
        let mut guard = self.write()?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    guard.insert(
                        (*column, key.as_slice().to_vec()),
                        value.as_slice().to_vec(),
                    );
                }
                WriteOp::Delete { column, key } => {
                    guard.remove(&(*column, key.as_slice().to_vec()));
                }
            }
        }
        self.batches_committed.fetch_add(1, Ordering::SeqCst);
        self.ops_committed.fetch_add(batch.len(), Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_scan_stays_inside_column() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::Coins, b"ab1", b"x");
        batch.put(Column::Coins, b"ab2", b"y");
        batch.put(Column::Coins, b"ac", b"z");
        batch.put(Column::Meta, b"ab3", b"w");
        store.write_batch(&batch).expect("write");

        let rows = store.scan_prefix(Column::Coins, b"ab").expect("scan");
        assert_eq!(
            rows,
            vec![
                (b"ab1".to_vec(), b"x".to_vec()),
                (b"ab2".to_vec(), b"y".to_vec()),
            ]
        );
        let mut seen = 0usize;
        store
            .for_each_prefix(Column::Meta, b"", &mut |_, _| {
                seen += 1;
                Ok(())
            })
            .expect("visit");
        assert_eq!(seen, 1);
    }

    #[test]
    fn injected_failure_leaves_contents() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"k", b"v");
        store.set_fail_writes(true);
        assert!(store.write_batch(&batch).is_err());
        assert!(store.get(Column::Meta, b"k").expect("get").is_none());
        assert_eq!(store.batches_committed(), 0);

        store.set_fail_writes(false);
        store.write_batch(&batch).expect("write");
        assert_eq!(store.ops_committed(), 1);
    }
}
