//! Applying and reverting a block's effect on the coin view.

use std::sync::Arc;

use ledgerd_consensus::money::{block_subsidy, money_range, Amount};
use ledgerd_consensus::params::ConsensusParams;
use ledgerd_consensus::Hash256;
use ledgerd_primitives::block::Block;
use ledgerd_primitives::outpoint::OutPoint;
use ledgerd_script::{CheckQueue, ScriptCheck, ScriptFlags, BLOCK_SCRIPT_VERIFY_FLAGS};

use crate::coins::{Coin, CoinsCache, CoinsView};
use crate::undo::{BlockUndo, TxUndo};
use crate::validation::{check_tx_inputs, ValidationError, ValidationFlags};

pub type SubsidyFn = fn(i32, &ConsensusParams) -> Amount;

pub struct ConnectContext<'a> {
    pub params: &'a ConsensusParams,
    pub flags: ValidationFlags,
    pub script_flags: ScriptFlags,
    pub check_queue: &'a dyn CheckQueue,
    pub subsidy: SubsidyFn,
}

impl<'a> ConnectContext<'a> {
    pub fn new(params: &'a ConsensusParams, check_queue: &'a dyn CheckQueue) -> Self {
        Self {
            params,
            flags: ValidationFlags::default(),
            script_flags: BLOCK_SCRIPT_VERIFY_FLAGS,
            check_queue,
            subsidy: block_subsidy,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisconnectResult {
    Clean,
    /// Coins were missing or already present; the view was repaired anyway.
    Unclean,
}

/// Spends the block's inputs and adds its outputs to `coins`, returning the
/// undo record. `coins` should be a child cache: on error it is left
/// half-applied and must be discarded.
pub fn connect_block<V: CoinsView>(
    block: &Block,
    txids: &[Hash256],
    height: i32,
    coins: &mut CoinsCache<V>,
    ctx: &ConnectContext<'_>,
) -> Result<BlockUndo, ValidationError> {
    if txids.len() != block.transactions.len() {
        return Err(ValidationError::InvalidBlock("txid count mismatch"));
    }
    let coinbase = block
        .transactions
        .first()
        .ok_or(ValidationError::InvalidBlock("block has no coinbase"))?;
    let spend_height = u32::try_from(height)
        .map_err(|_| ValidationError::InvalidBlock("negative block height"))?;

    // no transaction may overwrite an unspent output of an earlier one
    for (tx, txid) in block.transactions.iter().zip(txids) {
        for index in 0..tx.vout.len() {
            if coins.have_coin(&OutPoint::new(*txid, index as u32))? {
                return Err(ValidationError::InvalidBlock(
                    "tried to overwrite transaction",
                ));
            }
        }
    }

    let mut undo = BlockUndo {
        txs: Vec::with_capacity(block.transactions.len().saturating_sub(1)),
    };
    let mut checks = Vec::new();
    let mut fees: Amount = 0;
    for (tx_index, (tx, txid)) in block.transactions.iter().zip(txids).enumerate() {
        if !tx.is_coinbase() {
            let fee = check_tx_inputs(tx, coins, height)?;
            fees = fees
                .checked_add(fee)
                .filter(|total| money_range(*total))
                .ok_or(ValidationError::ValueOutOfRange)?;

            let shared = ctx.flags.check_script.then(|| Arc::new(tx.clone()));
            let mut spent = Vec::with_capacity(tx.vin.len());
            for (input_index, input) in tx.vin.iter().enumerate() {
                let coin = coins
                    .spend_coin(&input.prevout)?
                    .ok_or(ValidationError::MissingInputs)?;
                if let Some(shared) = &shared {
                    checks.push(ScriptCheck {
                        tx: Arc::clone(shared),
                        tx_index,
                        input_index,
                        spent: coin.output.clone(),
                        flags: ctx.script_flags,
                    });
                }
                spent.push(coin);
            }
            undo.txs.push(TxUndo { spent });
        }
        coins.add_coins(tx, *txid, spend_height, false)?;
    }

    let handle = ctx.check_queue.enqueue_batch(checks);

    let coinbase_out = coinbase
        .value_out()
        .ok_or(ValidationError::ValueOutOfRange)?;
    let allowed = fees.saturating_add((ctx.subsidy)(height, ctx.params));
    if coinbase_out > allowed {
        // drain the batch so no worker outlives the block
        let _ = ctx.check_queue.await_batch(handle);
        return Err(ValidationError::InvalidBlock("coinbase pays too much"));
    }
    if let Err(failure) = ctx.check_queue.await_batch(handle) {
        ledgerd_log::log_warn!(
            "block {} height {height}: {failure}",
            ledgerd_consensus::hash256_to_hex(&block.hash())
        );
        return Err(failure.into());
    }

    coins.set_best_block(block.hash());
    Ok(undo)
}

/// Reverts `block`, connected at `height`, using its undo record.
pub fn disconnect_block<V: CoinsView>(
    block: &Block,
    height: i32,
    undo: &BlockUndo,
    coins: &mut CoinsCache<V>,
) -> Result<DisconnectResult, ValidationError> {
    if undo.txs.len() + 1 != block.transactions.len() {
        return Err(ValidationError::UndoMismatch(
            "undo record does not match block transaction count",
        ));
    }
    let mut clean = true;
    for (position, tx) in block.transactions.iter().enumerate().rev() {
        let txid = tx.txid();
        for (index, output) in tx.vout.iter().enumerate() {
            if output.is_unspendable() {
                continue;
            }
            match coins.spend_coin(&OutPoint::new(txid, index as u32))? {
                Some(coin)
                    if coin.output == *output
                        && coin.is_coinbase == tx.is_coinbase()
                        && i64::from(coin.height) == i64::from(height) => {}
                _ => clean = false,
            }
        }

        if position == 0 {
            continue;
        }
        let tx_undo = &undo.txs[position - 1];
        if tx_undo.spent.len() != tx.vin.len() {
            return Err(ValidationError::UndoMismatch(
                "undo record does not match input count",
            ));
        }
        for (input, coin) in tx.vin.iter().zip(&tx_undo.spent).rev() {
            clean &= restore_coin(coins, input.prevout, coin.clone())?;
        }
    }
    coins.set_best_block(block.header.prev_block);
    Ok(if clean {
        DisconnectResult::Clean
    } else {
        DisconnectResult::Unclean
    })
}

fn restore_coin<V: CoinsView>(
    coins: &mut CoinsCache<V>,
    outpoint: OutPoint,
    coin: Coin,
) -> Result<bool, ValidationError> {
    let overwrite = coins.have_coin(&outpoint)?;
    coins.add_coin(outpoint, coin, overwrite)?;
    Ok(!overwrite)
}
