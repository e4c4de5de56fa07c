//! Coin records in the key/value store.

use std::cell::Cell;

use ledgerd_consensus::Hash256;
use ledgerd_primitives::outpoint::OutPoint;
use ledgerd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::coins::{Coin, CoinsError, CoinsMap, CoinsView};

pub const OUTPOINT_KEY_LEN: usize = 36;

const META_BEST_BLOCK_KEY: &[u8] = b"best_block";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct OutPointKey([u8; OUTPOINT_KEY_LEN]);

impl OutPointKey {
    pub fn new(outpoint: &OutPoint) -> Self {
        let mut bytes = [0u8; OUTPOINT_KEY_LEN];
        bytes[..32].copy_from_slice(&outpoint.hash);
        bytes[32..].copy_from_slice(&outpoint.index.to_be_bytes());
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; OUTPOINT_KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn outpoint(&self) -> OutPoint {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&self.0[..32]);
        let mut index = [0u8; 4];
        index.copy_from_slice(&self.0[32..]);
        OutPoint::new(hash, u32::from_be_bytes(index))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// Persistent bottom layer of the coin cache stack. Only
/// [`CoinsView::batch_write`] writes, so the store has a single writer.
pub struct CoinsStore<S> {
    store: S,
    /// Result of the last size scan; cleared by every write.
    size_estimate: Cell<Option<usize>>,
}

impl<S: KeyValueStore> CoinsStore<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            size_estimate: Cell::new(None),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        let key = OutPointKey::new(outpoint);
        match self.store.get(Column::Coins, key.as_bytes())? {
            Some(bytes) => Coin::decode(&bytes)
                .map(Some)
                .map_err(|_| CoinsError::Corrupt("undecodable coin record")),
            None => Ok(None),
        }
    }

    pub fn read_best_block(&self) -> Result<Option<Hash256>, CoinsError> {
        match self.store.get(Column::Meta, META_BEST_BLOCK_KEY)? {
            Some(bytes) => {
                let hash: Hash256 = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| CoinsError::Corrupt("best block hash length"))?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    /// Builds the store batch for `entries` without committing it.
    pub fn write_entries(
        &self,
        batch: &mut WriteBatch,
        entries: &CoinsMap,
        best_block: Option<Hash256>,
    ) -> usize {
        let mut written = 0usize;
        for (outpoint, entry) in entries {
            if !entry.is_dirty() {
                continue;
            }
            let key = OutPointKey::new(outpoint);
            match &entry.coin {
                Some(coin) => batch.put(Column::Coins, key.as_bytes(), coin.encode()),
                // never reached the store, nothing to delete
                None if entry.is_fresh() => continue,
                None => batch.delete(Column::Coins, key.as_bytes()),
            }
            written += 1;
        }
        if let Some(hash) = best_block {
            batch.put(Column::Meta, META_BEST_BLOCK_KEY, hash);
        }
        written
    }

    /// Visits every stored coin in key order.
    pub fn for_each_coin<F>(&self, mut visitor: F) -> Result<(), CoinsError>
    where
        F: FnMut(OutPoint, Coin) -> Result<(), CoinsError>,
    {
        let mut failure = None;
        let result = self
            .store
            .for_each_prefix(Column::Coins, &[], &mut |key: &[u8], value: &[u8]| {
                let parsed = OutPointKey::from_slice(key)
                    .ok_or(CoinsError::Corrupt("coin key length"))
                    .and_then(|key| {
                        Coin::decode(value)
                            .map(|coin| (key.outpoint(), coin))
                            .map_err(|_| CoinsError::Corrupt("undecodable coin record"))
                    })
                    .and_then(|(outpoint, coin)| visitor(outpoint, coin));
                parsed.map_err(|err| {
                    failure = Some(err);
                    StoreError::Backend("coin iteration stopped".to_string())
                })
            });
        match (result, failure) {
            (Ok(()), _) => Ok(()),
            (Err(_), Some(inner)) => Err(inner),
            (Err(err), None) => Err(CoinsError::Store(err)),
        }
    }
}

impl<S: KeyValueStore> CoinsView for CoinsStore<S> {
    fn fetch_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        self.get(outpoint)
    }

    fn best_block(&mut self) -> Result<Option<Hash256>, CoinsError> {
        self.read_best_block()
    }

    fn batch_write(
        &mut self,
        entries: &CoinsMap,
        best_block: Option<Hash256>,
    ) -> Result<(), CoinsError> {
        let mut batch = WriteBatch::with_capacity(entries.len() + 1);
        let written = self.write_entries(&mut batch, entries, best_block);
        if batch.is_empty() {
            return Ok(());
        }
        self.store.write_batch(&batch)?;
        self.size_estimate.set(None);
        ledgerd_log::log_trace!("coins store wrote {written} records");
        Ok(())
    }

    /// Bytes held in the coin column. Diagnostics only: the first call after
    /// a write walks the whole column, later calls reuse that figure.
    fn estimate_size(&self) -> usize {
        if let Some(size) = self.size_estimate.get() {
            return size;
        }
        let mut size = 0usize;
        let scanned = self
            .store
            .for_each_prefix(Column::Coins, &[], &mut |key: &[u8], value: &[u8]| {
                size += key.len() + value.len();
                Ok(())
            });
        if scanned.is_err() {
            return 0;
        }
        self.size_estimate.set(Some(size));
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coins::CoinsCache;
    use ledgerd_primitives::transaction::TxOut;
    use ledgerd_storage::memory::MemoryStore;
    use std::sync::Arc;

    fn coin(value: i64, height: u32) -> Coin {
        Coin::new(
            TxOut {
                value,
                script_pubkey: vec![0x76, 0xa9, 0x14],
            },
            height,
            false,
        )
    }

    #[test]
    fn outpoint_keys_sort_by_txid_then_index() {
        let a = OutPointKey::new(&OutPoint::new([1u8; 32], 2));
        let b = OutPointKey::new(&OutPoint::new([1u8; 32], 256));
        assert!(a.as_bytes() < b.as_bytes());
        assert_eq!(b.outpoint(), OutPoint::new([1u8; 32], 256));
        assert!(OutPointKey::from_slice(&[0u8; 35]).is_none());
    }

    #[test]
    fn flush_round_trips_through_fresh_cache() {
        let store = Arc::new(MemoryStore::new());
        {
            let mut cache = CoinsCache::new(CoinsStore::new(Arc::clone(&store)));
            for index in 0..10 {
                cache
                    .add_coin(OutPoint::new([3u8; 32], index), coin(100 + index as i64, 5), false)
                    .expect("add");
            }
            cache.set_best_block([9u8; 32]);
            cache.flush().expect("flush");
            assert_eq!(cache.cache_size(), 0);
        }
        let mut reopened = CoinsCache::new(CoinsStore::new(Arc::clone(&store)));
        assert_eq!(reopened.best_block().expect("best"), Some([9u8; 32]));
        for index in 0..10 {
            assert_eq!(
                reopened
                    .get_coin(&OutPoint::new([3u8; 32], index))
                    .expect("get"),
                Some(coin(100 + index as i64, 5))
            );
        }

        reopened
            .spend_coin(&OutPoint::new([3u8; 32], 4))
            .expect("spend");
        reopened.flush().expect("flush spend");
        let mut third = CoinsCache::new(CoinsStore::new(Arc::clone(&store)));
        assert!(!third.have_coin(&OutPoint::new([3u8; 32], 4)).expect("have"));
        assert_eq!(store.len(Column::Coins).expect("len"), 9);
    }

    #[test]
    fn add_then_spend_before_flush_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let mut cache = CoinsCache::new(CoinsStore::new(Arc::clone(&store)));
        let outpoint = OutPoint::new([4u8; 32], 0);
        cache.add_coin(outpoint, coin(1, 1), false).expect("add");
        cache.spend_coin(&outpoint).expect("spend");
        cache.flush().expect("flush");
        assert_eq!(store.batches_committed(), 0);
        assert_eq!(store.ops_committed(), 0);
    }

    #[test]
    fn failed_flush_leaves_cache_intact() {
        let store = Arc::new(MemoryStore::new());
        let mut cache = CoinsCache::new(CoinsStore::new(Arc::clone(&store)));
        for index in 0..3 {
            cache
                .add_coin(OutPoint::new([5u8; 32], index), coin(7, 2), false)
                .expect("add");
        }
        let usage = cache.dynamic_memory_usage();
        store.set_fail_writes(true);
        assert!(matches!(cache.flush(), Err(CoinsError::Store(_))));
        assert_eq!(cache.cache_size(), 3);
        assert_eq!(cache.dirty_count(), 3);
        assert_eq!(cache.dynamic_memory_usage(), usage);
        assert!(store.is_empty(Column::Coins).expect("empty"));

        store.set_fail_writes(false);
        cache.flush().expect("retry");
        assert_eq!(store.len(Column::Coins).expect("len"), 3);
    }

    #[test]
    fn for_each_coin_visits_all_records() {
        let store = Arc::new(MemoryStore::new());
        let mut cache = CoinsCache::new(CoinsStore::new(Arc::clone(&store)));
        for index in 0..5 {
            cache
                .add_coin(OutPoint::new([6u8; 32], index), coin(1, 3), false)
                .expect("add");
        }
        cache.flush().expect("flush");
        let db = CoinsStore::new(Arc::clone(&store));
        let mut seen = Vec::new();
        db.for_each_coin(|outpoint, coin| {
            seen.push((outpoint.index, coin.height));
            Ok(())
        })
        .expect("iterate");
        assert_eq!(seen, vec![(0, 3), (1, 3), (2, 3), (3, 3), (4, 3)]);
        assert!(db.estimate_size() > 0);
    }

    #[test]
    fn size_estimate_is_reused_until_the_next_write() {
        let store = Arc::new(MemoryStore::new());
        let mut db = CoinsStore::new(Arc::clone(&store));
        assert_eq!(db.estimate_size(), 0);

        let mut cache = CoinsCache::new(&mut db);
        cache
            .add_coin(OutPoint::new([8u8; 32], 0), coin(1, 3), false)
            .expect("add");
        cache.flush().expect("flush");
        drop(cache);
        let one = db.estimate_size();
        assert_eq!(one, OUTPOINT_KEY_LEN + coin(1, 3).encode().len());

        // a write that bypasses this view is not seen until the next flush
        let mut batch = WriteBatch::new();
        batch.put(Column::Coins, [9u8; OUTPOINT_KEY_LEN], coin(2, 4).encode());
        store.write_batch(&batch).expect("side write");
        assert_eq!(db.estimate_size(), one);

        let mut cache = CoinsCache::new(&mut db);
        cache
            .add_coin(OutPoint::new([8u8; 32], 1), coin(1, 3), false)
            .expect("add");
        cache.flush().expect("flush");
        drop(cache);
        assert_eq!(
            db.estimate_size(),
            2 * one + OUTPOINT_KEY_LEN + coin(2, 4).encode().len()
        );
    }

    #[test]
    fn iteration_stops_on_visitor_error() {
        let store = Arc::new(MemoryStore::new());
        let mut batch = WriteBatch::new();
        batch.put(Column::Coins, [5u8; OUTPOINT_KEY_LEN], coin(1, 3).encode());
        store.write_batch(&batch).expect("seed");
        let db = CoinsStore::new(Arc::clone(&store));

        let stopped = db.for_each_coin(|_, _| Err(CoinsError::Corrupt("stop")));
        assert!(matches!(stopped, Err(CoinsError::Corrupt("stop"))));
    }
}
