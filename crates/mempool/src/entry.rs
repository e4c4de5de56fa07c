//! Pool entries and their package aggregates.

use std::mem::size_of;
use std::sync::Arc;

use ledgerd_consensus::money::Amount;
use ledgerd_consensus::Hash256;
use ledgerd_primitives::transaction::{Transaction, TxIn, TxOut};

use crate::policy::FeeRate;

/// Height recorded for coins created by pool transactions.
pub const MEMPOOL_HEIGHT: u32 = 0x7fff_ffff;

/// Chain position a transaction's finality was last evaluated at.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LockPoints {
    pub height: i32,
    pub time: i64,
}

#[derive(Clone, Debug)]
pub struct MempoolEntry {
    tx: Arc<Transaction>,
    txid: Hash256,
    fee: Amount,
    size: u64,
    usage: usize,
    time: i64,
    entry_height: i32,
    spends_coinbase: bool,
    sigops: u64,
    fee_delta: Amount,
    lock_points: LockPoints,

    count_with_descendants: u64,
    size_with_descendants: u64,
    mod_fees_with_descendants: Amount,

    count_with_ancestors: u64,
    size_with_ancestors: u64,
    mod_fees_with_ancestors: Amount,
    sigops_with_ancestors: u64,
}

impl MempoolEntry {
    pub fn new(
        tx: Arc<Transaction>,
        fee: Amount,
        time: i64,
        entry_height: i32,
        spends_coinbase: bool,
        sigops: u64,
        lock_points: LockPoints,
    ) -> Self {
        let txid = tx.txid();
        let size = tx.serialized_size() as u64;
        let usage = transaction_usage(&tx);
        Self {
            tx,
            txid,
            fee,
            size,
            usage,
            time,
            entry_height,
            spends_coinbase,
            sigops,
            fee_delta: 0,
            lock_points,
            count_with_descendants: 1,
            size_with_descendants: size,
            mod_fees_with_descendants: fee,
            count_with_ancestors: 1,
            size_with_ancestors: size,
            mod_fees_with_ancestors: fee,
            sigops_with_ancestors: sigops,
        }
    }

    pub fn tx(&self) -> &Arc<Transaction> {
        &self.tx
    }

    pub fn txid(&self) -> Hash256 {
        self.txid
    }

    pub fn fee(&self) -> Amount {
        self.fee
    }

    pub fn modified_fee(&self) -> Amount {
        self.fee.saturating_add(self.fee_delta)
    }

    pub fn fee_delta(&self) -> Amount {
        self.fee_delta
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> usize {
        self.usage
    }

    pub fn time(&self) -> i64 {
        self.time
    }

    pub fn entry_height(&self) -> i32 {
        self.entry_height
    }

    pub fn spends_coinbase(&self) -> bool {
        self.spends_coinbase
    }

    pub fn sigops(&self) -> u64 {
        self.sigops
    }

    pub fn lock_points(&self) -> LockPoints {
        self.lock_points
    }

    pub fn fee_rate(&self) -> FeeRate {
        FeeRate::new(self.fee, self.size as usize)
    }

    pub fn count_with_descendants(&self) -> u64 {
        self.count_with_descendants
    }

    pub fn size_with_descendants(&self) -> u64 {
        self.size_with_descendants
    }

    pub fn mod_fees_with_descendants(&self) -> Amount {
        self.mod_fees_with_descendants
    }

    pub fn count_with_ancestors(&self) -> u64 {
        self.count_with_ancestors
    }

    pub fn size_with_ancestors(&self) -> u64 {
        self.size_with_ancestors
    }

    pub fn mod_fees_with_ancestors(&self) -> Amount {
        self.mod_fees_with_ancestors
    }

    pub fn sigops_with_ancestors(&self) -> u64 {
        self.sigops_with_ancestors
    }

    pub(crate) fn set_time(&mut self, time: i64) {
        self.time = time;
    }

    pub(crate) fn set_lock_points(&mut self, lock_points: LockPoints) {
        self.lock_points = lock_points;
    }

    /// Replaces the prioritisation delta and shifts both package fees.
    pub(crate) fn set_fee_delta(&mut self, fee_delta: Amount) {
        let change = fee_delta.saturating_sub(self.fee_delta);
        self.mod_fees_with_descendants = self.mod_fees_with_descendants.saturating_add(change);
        self.mod_fees_with_ancestors = self.mod_fees_with_ancestors.saturating_add(change);
        self.fee_delta = fee_delta;
    }

    pub(crate) fn update_descendant_state(&mut self, size: i64, mod_fee: Amount, count: i64) {
        self.size_with_descendants = apply_delta(self.size_with_descendants, size);
        self.mod_fees_with_descendants = self.mod_fees_with_descendants.saturating_add(mod_fee);
        self.count_with_descendants = apply_delta(self.count_with_descendants, count);
    }

    pub(crate) fn update_ancestor_state(
        &mut self,
        size: i64,
        mod_fee: Amount,
        count: i64,
        sigops: i64,
    ) {
        self.size_with_ancestors = apply_delta(self.size_with_ancestors, size);
        self.mod_fees_with_ancestors = self.mod_fees_with_ancestors.saturating_add(mod_fee);
        self.count_with_ancestors = apply_delta(self.count_with_ancestors, count);
        self.sigops_with_ancestors = apply_delta(self.sigops_with_ancestors, sigops);
    }
}

fn apply_delta(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta.unsigned_abs())
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

/// Approximate heap footprint of a transaction.
pub fn transaction_usage(tx: &Transaction) -> usize {
    let inputs: usize = tx
        .vin
        .iter()
        .map(|input| size_of::<TxIn>() + input.script_sig.capacity())
        .sum();
    let outputs: usize = tx
        .vout
        .iter()
        .map(|output| size_of::<TxOut>() + output.script_pubkey.capacity())
        .sum();
    size_of::<Transaction>() + inputs + outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerd_primitives::outpoint::OutPoint;

    #[test]
    fn fee_delta_moves_both_packages() {
        let tx = Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::new([1u8; 32], 0), vec![0x51])],
            vout: vec![TxOut {
                value: 10,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        };
        let mut entry = MempoolEntry::new(Arc::new(tx), 500, 10, 1, false, 1, LockPoints::default());
        assert_eq!(entry.count_with_ancestors(), 1);
        assert_eq!(entry.size_with_descendants(), entry.size());
        entry.set_fee_delta(200);
        assert_eq!(entry.modified_fee(), 700);
        assert_eq!(entry.mod_fees_with_ancestors(), 700);
        entry.set_fee_delta(-100);
        assert_eq!(entry.mod_fees_with_descendants(), 400);
        entry.update_descendant_state(-(entry.size() as i64) - 5, 0, -3);
        assert_eq!(entry.size_with_descendants(), 0);
        assert_eq!(entry.count_with_descendants(), 0);
    }
}
