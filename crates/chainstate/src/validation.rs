//! Context-free and contextual block/transaction checks.

use std::collections::HashSet;

use ledgerd_consensus::constants::{
    COINBASE_MATURITY, MAX_BLOCK_SERIALIZED_SIZE, MAX_BLOCK_SIGOPS, MAX_FUTURE_BLOCK_TIME,
    MIN_TRANSACTION_SIZE,
};
use ledgerd_consensus::money::{money_range, Amount};
use ledgerd_consensus::params::ConsensusParams;
use ledgerd_consensus::Hash256;
use ledgerd_pow::validation::{self as pow_validation, PowError};
use ledgerd_primitives::block::{Block, BlockHeader};
use ledgerd_primitives::merkle::merkle_root;
use ledgerd_primitives::transaction::Transaction;
use ledgerd_script::sigops::transaction_sigops;
use ledgerd_script::CheckFailure;
use rayon::prelude::*;

use crate::coins::{CoinsCache, CoinsError, CoinsView};

const MIN_COINBASE_SCRIPT_SIZE: usize = 2;
const MAX_COINBASE_SCRIPT_SIZE: usize = 100;

#[derive(Clone, Copy, Debug)]
pub struct ValidationFlags {
    pub check_pow: bool,
    pub check_merkle: bool,
    pub check_script: bool,
}

impl Default for ValidationFlags {
    fn default() -> Self {
        Self {
            check_pow: true,
            check_merkle: true,
            check_script: true,
        }
    }
}

#[derive(Debug)]
pub enum ValidationError {
    InvalidBlock(&'static str),
    InvalidHeader(&'static str),
    InvalidTransaction(&'static str),
    ValueOutOfRange,
    DuplicateInput,
    DuplicateTransaction,
    MerkleMismatch,
    MissingInputs,
    PrematureCoinbaseSpend,
    UndoMismatch(&'static str),
    Pow(PowError),
    Script(CheckFailure),
    Coins(CoinsError),
}

impl ValidationError {
    /// Whether the error proves the block itself is invalid, as opposed to a
    /// local failure (store I/O, missing undo) that says nothing about it.
    pub fn is_consensus(&self) -> bool {
        match self {
            ValidationError::Coins(CoinsError::Store(_))
            | ValidationError::Coins(CoinsError::Corrupt(_))
            | ValidationError::UndoMismatch(_) => false,
            _ => true,
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::InvalidBlock(message) => write!(f, "{message}"),
            ValidationError::InvalidHeader(message) => write!(f, "{message}"),
            ValidationError::InvalidTransaction(message) => write!(f, "{message}"),
            ValidationError::ValueOutOfRange => write!(f, "value out of range"),
            ValidationError::DuplicateInput => write!(f, "duplicate input"),
            ValidationError::DuplicateTransaction => write!(f, "duplicate transaction"),
            ValidationError::MerkleMismatch => write!(f, "merkle root mismatch"),
            ValidationError::MissingInputs => write!(f, "inputs missing or spent"),
            ValidationError::PrematureCoinbaseSpend => {
                write!(f, "tried to spend coinbase before maturity")
            }
            ValidationError::UndoMismatch(message) => write!(f, "{message}"),
            ValidationError::Pow(err) => write!(f, "{err}"),
            ValidationError::Script(err) => write!(f, "{err}"),
            ValidationError::Coins(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<PowError> for ValidationError {
    fn from(err: PowError) -> Self {
        ValidationError::Pow(err)
    }
}

impl From<CheckFailure> for ValidationError {
    fn from(err: CheckFailure) -> Self {
        ValidationError::Script(err)
    }
}

impl From<CoinsError> for ValidationError {
    fn from(err: CoinsError) -> Self {
        ValidationError::Coins(err)
    }
}

/// Checks that need nothing but the transaction.
pub fn check_transaction(tx: &Transaction) -> Result<(), ValidationError> {
    if tx.vin.is_empty() {
        return Err(ValidationError::InvalidTransaction("transaction has no inputs"));
    }
    if tx.vout.is_empty() {
        return Err(ValidationError::InvalidTransaction("transaction has no outputs"));
    }
    let size = tx.serialized_size();
    if size < MIN_TRANSACTION_SIZE && !tx.is_coinbase() {
        return Err(ValidationError::InvalidTransaction("transaction too small"));
    }
    if size > MAX_BLOCK_SERIALIZED_SIZE {
        return Err(ValidationError::InvalidTransaction("transaction too large"));
    }

    let mut total: Amount = 0;
    for output in &tx.vout {
        if !money_range(output.value) {
            return Err(ValidationError::ValueOutOfRange);
        }
        total = total
            .checked_add(output.value)
            .ok_or(ValidationError::ValueOutOfRange)?;
        if !money_range(total) {
            return Err(ValidationError::ValueOutOfRange);
        }
    }

    let mut seen = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen.insert(input.prevout) {
            return Err(ValidationError::DuplicateInput);
        }
    }

    if tx.is_coinbase() {
        let len = tx.vin[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_SIZE..=MAX_COINBASE_SCRIPT_SIZE).contains(&len) {
            return Err(ValidationError::InvalidTransaction("bad coinbase script size"));
        }
    } else if tx.vin.iter().any(|input| input.prevout.is_null()) {
        return Err(ValidationError::InvalidTransaction("null prevout"));
    }
    Ok(())
}

/// Context-free block checks. Returns the txids so callers do not hash the
/// transactions twice.
pub fn check_block(
    block: &Block,
    params: &ConsensusParams,
    flags: &ValidationFlags,
) -> Result<Vec<Hash256>, ValidationError> {
    if flags.check_pow {
        pow_validation::validate_pow_header(&block.header, params)?;
    }
    if block.transactions.is_empty() {
        return Err(ValidationError::InvalidBlock(
            "block must contain at least one transaction",
        ));
    }
    if block.transactions.len() > MAX_BLOCK_SERIALIZED_SIZE / MIN_TRANSACTION_SIZE {
        return Err(ValidationError::InvalidBlock("block transaction count too large"));
    }
    let txids: Vec<Hash256> = block.transactions.par_iter().map(|tx| tx.txid()).collect();
    if flags.check_merkle {
        let (root, mutated) = merkle_root(&txids);
        if mutated {
            return Err(ValidationError::DuplicateTransaction);
        }
        if root != block.header.merkle_root {
            return Err(ValidationError::MerkleMismatch);
        }
    }
    if block.consensus_encode().len() > MAX_BLOCK_SERIALIZED_SIZE {
        return Err(ValidationError::InvalidBlock("block size too large"));
    }
    if !block.transactions[0].is_coinbase() {
        return Err(ValidationError::InvalidBlock("first transaction is not coinbase"));
    }
    if block.transactions[1..].iter().any(Transaction::is_coinbase) {
        return Err(ValidationError::InvalidBlock("more than one coinbase"));
    }
    block
        .transactions
        .par_iter()
        .try_for_each(check_transaction)?;
    let sigops: usize = block.transactions.iter().map(transaction_sigops).sum();
    if sigops > MAX_BLOCK_SIGOPS {
        return Err(ValidationError::InvalidBlock("block sigops limit exceeded"));
    }
    Ok(txids)
}

/// Header checks against its parent: time must exceed the parent's median
/// time past and may not run too far ahead of local time.
pub fn contextual_check_header(
    header: &BlockHeader,
    median_time_past: i64,
    adjusted_time: i64,
) -> Result<(), ValidationError> {
    let time = i64::from(header.time);
    if time <= median_time_past {
        return Err(ValidationError::InvalidHeader("block time too old"));
    }
    if time > adjusted_time + MAX_FUTURE_BLOCK_TIME {
        return Err(ValidationError::InvalidHeader("block time too far in the future"));
    }
    Ok(())
}

/// Every transaction must be final at the block's height and time.
pub fn contextual_check_block(block: &Block, height: i32) -> Result<(), ValidationError> {
    let block_time = i64::from(block.header.time);
    if block
        .transactions
        .iter()
        .any(|tx| !tx.is_final(height, block_time))
    {
        return Err(ValidationError::InvalidTransaction("transaction is not final"));
    }
    Ok(())
}

/// Input checks against the coin view at `spend_height`. Returns the fee.
pub fn check_tx_inputs<V: CoinsView>(
    tx: &Transaction,
    coins: &mut CoinsCache<V>,
    spend_height: i32,
) -> Result<Amount, ValidationError> {
    let mut value_in: Amount = 0;
    for input in &tx.vin {
        let coin = coins
            .access_coin(&input.prevout)?
            .ok_or(ValidationError::MissingInputs)?;
        if coin.is_coinbase && spend_height - (coin.height as i32) < COINBASE_MATURITY {
            return Err(ValidationError::PrematureCoinbaseSpend);
        }
        if !money_range(coin.output.value) {
            return Err(ValidationError::ValueOutOfRange);
        }
        value_in = value_in
            .checked_add(coin.output.value)
            .filter(|total| money_range(*total))
            .ok_or(ValidationError::ValueOutOfRange)?;
    }
    let value_out = tx.value_out().ok_or(ValidationError::ValueOutOfRange)?;
    if value_in < value_out {
        return Err(ValidationError::InvalidTransaction("value in below value out"));
    }
    let fee = value_in - value_out;
    if !money_range(fee) {
        return Err(ValidationError::ValueOutOfRange);
    }
    Ok(fee)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coins::{Coin, EmptyCoinsView};
    use ledgerd_consensus::money::COIN;
    use ledgerd_consensus::params::{consensus_params, Network};
    use ledgerd_primitives::outpoint::OutPoint;
    use ledgerd_primitives::transaction::{TxIn, TxOut};

    fn spend(prevouts: &[OutPoint], value: i64) -> Transaction {
        Transaction {
            version: 1,
            vin: prevouts
                .iter()
                .map(|prevout| TxIn::new(*prevout, vec![0x51; 40]))
                .collect(),
            vout: vec![TxOut {
                value,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn coinbase(value: i64) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::null(), vec![0x01, 0x01])],
            vout: vec![TxOut {
                value,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn transaction_rules() {
        let a = OutPoint::new([1u8; 32], 0);
        assert!(check_transaction(&spend(&[a], 10)).is_ok());
        assert!(matches!(
            check_transaction(&spend(&[a, a], 10)),
            Err(ValidationError::DuplicateInput)
        ));
        assert!(matches!(
            check_transaction(&spend(&[a], -1)),
            Err(ValidationError::ValueOutOfRange)
        ));
        assert!(check_transaction(&spend(&[OutPoint::null(), a], 1)).is_err());
        let mut empty = spend(&[a], 1);
        empty.vout.clear();
        assert!(check_transaction(&empty).is_err());
        assert!(check_transaction(&coinbase(50)).is_ok());
    }

    #[test]
    fn block_rules() {
        let params = consensus_params(Network::Regtest);
        let flags = ValidationFlags {
            check_pow: false,
            ..ValidationFlags::default()
        };
        let txs = vec![coinbase(50 * COIN), spend(&[OutPoint::new([2u8; 32], 1)], 5)];
        let txids: Vec<Hash256> = txs.iter().map(Transaction::txid).collect();
        let mut block = Block {
            header: BlockHeader {
                version: 4,
                prev_block: [0u8; 32],
                merkle_root: merkle_root(&txids).0,
                time: 1_600_000_000,
                bits: 0x207fffff,
                nonce: 0,
            },
            transactions: txs,
        };
        assert_eq!(check_block(&block, &params, &flags).expect("valid"), txids);

        block.header.merkle_root = [0u8; 32];
        assert!(matches!(
            check_block(&block, &params, &flags),
            Err(ValidationError::MerkleMismatch)
        ));

        block.transactions.swap(0, 1);
        let txids: Vec<Hash256> = block.transactions.iter().map(Transaction::txid).collect();
        block.header.merkle_root = merkle_root(&txids).0;
        assert!(check_block(&block, &params, &flags).is_err());
    }

    #[test]
    fn header_time_window() {
        let header = BlockHeader {
            version: 4,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: 1_000,
            bits: 0x207fffff,
            nonce: 0,
        };
        assert!(contextual_check_header(&header, 999, 1_000).is_ok());
        assert!(contextual_check_header(&header, 1_000, 1_000).is_err());
        assert!(contextual_check_header(&header, 0, 1_000 - MAX_FUTURE_BLOCK_TIME - 1).is_err());
    }

    #[test]
    fn input_rules_check_maturity_and_fee() {
        let mut cache = CoinsCache::new(EmptyCoinsView);
        let mature = OutPoint::new([3u8; 32], 0);
        let young = OutPoint::new([4u8; 32], 0);
        cache
            .add_coin(
                mature,
                Coin::new(
                    TxOut {
                        value: 1_000,
                        script_pubkey: vec![0x51],
                    },
                    1,
                    true,
                ),
                false,
            )
            .expect("add");
        cache
            .add_coin(
                young,
                Coin::new(
                    TxOut {
                        value: 1_000,
                        script_pubkey: vec![0x51],
                    },
                    50,
                    true,
                ),
                false,
            )
            .expect("add");

        assert_eq!(
            check_tx_inputs(&spend(&[mature], 900), &mut cache, 101).expect("fee"),
            100
        );
        assert!(matches!(
            check_tx_inputs(&spend(&[mature], 900), &mut cache, 100),
            Err(ValidationError::PrematureCoinbaseSpend)
        ));
        assert!(matches!(
            check_tx_inputs(&spend(&[young], 900), &mut cache, 101),
            Err(ValidationError::PrematureCoinbaseSpend)
        ));
        assert!(check_tx_inputs(&spend(&[mature], 1_001), &mut cache, 200).is_err());
        assert!(matches!(
            check_tx_inputs(&spend(&[OutPoint::new([9u8; 32], 0)], 1), &mut cache, 200),
            Err(ValidationError::MissingInputs)
        ));
    }
}
