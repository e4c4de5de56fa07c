//! Coin view that layers pooled outputs over the chain's coins.

use ledgerd_chainstate::coins::CoinsMap;
use ledgerd_chainstate::{Coin, CoinsError, CoinsView};
use ledgerd_consensus::Hash256;
use ledgerd_primitives::outpoint::OutPoint;

use crate::entry::MEMPOOL_HEIGHT;
use crate::pool::Mempool;

/// Outputs of pooled transactions appear as coins at [`MEMPOOL_HEIGHT`].
/// Read-only: spends recorded against it stay in the cache stacked on top.
pub struct MempoolCoinsView<'a, V> {
    base: V,
    pool: &'a Mempool,
}

impl<'a, V: CoinsView> MempoolCoinsView<'a, V> {
    pub fn new(base: V, pool: &'a Mempool) -> Self {
        Self { base, pool }
    }

    pub fn base(&self) -> &V {
        &self.base
    }

    pub fn into_base(self) -> V {
        self.base
    }
}

impl<V: CoinsView> CoinsView for MempoolCoinsView<'_, V> {
    fn fetch_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        if let Some(tx) = self.pool.get(&outpoint.hash) {
            return Ok(tx
                .vout
                .get(outpoint.index as usize)
                .map(|output| Coin::new(output.clone(), MEMPOOL_HEIGHT, false)));
        }
        self.base.fetch_coin(outpoint)
    }

    fn best_block(&mut self) -> Result<Option<Hash256>, CoinsError> {
        self.base.best_block()
    }

    fn batch_write(
        &mut self,
        _entries: &CoinsMap,
        _best_block: Option<Hash256>,
    ) -> Result<(), CoinsError> {
        Err(CoinsError::Corrupt("mempool coin view is read-only"))
    }
}
