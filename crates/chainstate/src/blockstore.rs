//! Block bodies and undo records keyed by block hash.

use ledgerd_consensus::Hash256;
use ledgerd_primitives::block::Block;
use ledgerd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::undo::BlockUndo;

const META_BEST_CHAIN_TIP_KEY: &[u8] = b"best_chain_tip";

pub struct BlockStore<S> {
    store: S,
}

impl<S: KeyValueStore> BlockStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn put_block(&self, batch: &mut WriteBatch, block: &Block) {
        batch.put(Column::BlockData, block.hash(), block.consensus_encode());
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, StoreError> {
        let Some(bytes) = self.store.get(Column::BlockData, hash)? else {
            return Ok(None);
        };
        Block::consensus_decode(&bytes)
            .map(Some)
            .map_err(|err| StoreError::Backend(format!("corrupt block record: {err}")))
    }

    pub fn has_block(&self, hash: &Hash256) -> Result<bool, StoreError> {
        Ok(self.store.get(Column::BlockData, hash)?.is_some())
    }

    pub fn put_undo(&self, batch: &mut WriteBatch, hash: &Hash256, undo: &BlockUndo) {
        batch.put(Column::BlockUndo, *hash, undo.encode());
    }

    pub fn get_undo(&self, hash: &Hash256) -> Result<Option<BlockUndo>, StoreError> {
        let Some(bytes) = self.store.get(Column::BlockUndo, hash)? else {
            return Ok(None);
        };
        BlockUndo::decode(&bytes)
            .map(Some)
            .map_err(|err| StoreError::Backend(format!("corrupt undo record: {err}")))
    }

    pub fn put_chain_tip(&self, batch: &mut WriteBatch, hash: &Hash256) {
        batch.put(Column::Meta, META_BEST_CHAIN_TIP_KEY, *hash);
    }

    pub fn chain_tip(&self) -> Result<Option<Hash256>, StoreError> {
        match self.store.get(Column::Meta, META_BEST_CHAIN_TIP_KEY)? {
            Some(bytes) => bytes
                .as_slice()
                .try_into()
                .map(Some)
                .map_err(|_| StoreError::Backend("corrupt chain tip record".to_string())),
            None => Ok(None),
        }
    }

    pub fn commit(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.store.write_batch(batch)
    }
}
