//! Admission of loose transactions into the pool.

use std::sync::Arc;

use ledgerd_chainstate::validation::{check_transaction, check_tx_inputs};
use ledgerd_chainstate::{CoinsCache, CoinsView};
use ledgerd_consensus::money::Amount;
use ledgerd_consensus::{hash256_to_hex, Hash256};
use ledgerd_log::{log_debug, log_trace};
use ledgerd_primitives::outpoint::OutPoint;
use ledgerd_primitives::transaction::{Transaction, TxOut};
use ledgerd_script::sigops::transaction_sigops;
use ledgerd_script::{ScriptFlags, ScriptVerifier, STANDARD_SCRIPT_VERIFY_FLAGS};

use crate::entry::{LockPoints, MempoolEntry};
use crate::error::{MempoolError, MempoolErrorKind};
use crate::policy::MempoolPolicy;
use crate::pool::{Mempool, RemovalReason};
use crate::rbf::{check_replacement, find_conflicts};
use crate::view::MempoolCoinsView;

pub struct AcceptContext<'a> {
    pub policy: &'a MempoolPolicy,
    pub verifier: &'a dyn ScriptVerifier,
    pub script_flags: ScriptFlags,
    /// Height of the active tip. Transactions are judged for the next block.
    pub tip_height: i32,
    pub median_time_past: i64,
    /// Entry time to record; `None` takes the pool clock.
    pub accept_time: Option<i64>,
    /// Skips fee floors and the post-admission trim. Used when re-adding
    /// transactions from disconnected blocks.
    pub bypass_limits: bool,
}

impl<'a> AcceptContext<'a> {
    pub fn new(
        policy: &'a MempoolPolicy,
        verifier: &'a dyn ScriptVerifier,
        tip_height: i32,
        median_time_past: i64,
    ) -> Self {
        Self {
            policy,
            verifier,
            script_flags: STANDARD_SCRIPT_VERIFY_FLAGS,
            tip_height,
            median_time_past,
            accept_time: None,
            bypass_limits: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AcceptOutcome {
    pub txid: Hash256,
    pub fee: Amount,
    pub size: usize,
    /// Entries evicted by replacement.
    pub replaced: Vec<MempoolEntry>,
}

/// Validates `tx` against the pool and `coins` and admits it. On failure
/// the coin cache entries this call pulled in are dropped again.
pub fn accept_to_memory_pool<V: CoinsView>(
    pool: &mut Mempool,
    coins: &mut CoinsCache<V>,
    tx: Arc<Transaction>,
    ctx: &AcceptContext<'_>,
) -> Result<AcceptOutcome, MempoolError> {
    let mut pulled_in = Vec::new();
    let result = accept_inner(pool, coins, tx, ctx, &mut pulled_in);
    if let Err(err) = &result {
        for outpoint in &pulled_in {
            coins.uncache(outpoint);
        }
        log_trace!("mempool: rejected transaction: {err}");
    }
    result
}

struct InputSummary {
    fee: Amount,
    spends_coinbase: bool,
    spent: Vec<TxOut>,
}

fn accept_inner<V: CoinsView>(
    pool: &mut Mempool,
    coins: &mut CoinsCache<V>,
    tx: Arc<Transaction>,
    ctx: &AcceptContext<'_>,
    pulled_in: &mut Vec<OutPoint>,
) -> Result<AcceptOutcome, MempoolError> {
    check_transaction(&tx)?;
    if tx.is_coinbase() {
        return Err(MempoolError::new(
            MempoolErrorKind::InvalidTransaction,
            "coinbase transactions are never pooled",
        ));
    }
    let next_height = ctx.tip_height + 1;
    if !tx.is_final(next_height, ctx.median_time_past) {
        return Err(MempoolError::new(MempoolErrorKind::NonFinal, "non-final"));
    }
    let txid = tx.txid();
    if pool.exists(&txid) {
        return Err(MempoolError::new(
            MempoolErrorKind::AlreadyInMempool,
            "txn-already-in-mempool",
        ));
    }

    let conflicts = find_conflicts(pool, &tx);
    if !conflicts.is_empty() && !ctx.policy.enable_replacement {
        return Err(MempoolError::new(
            MempoolErrorKind::ConflictingInput,
            "txn-mempool-conflict",
        ));
    }

    let inputs = {
        let mut view = CoinsCache::new(MempoolCoinsView::new(&mut *coins, &*pool));
        summarize_inputs(&tx, txid, &mut view, next_height, pulled_in)?
    };

    let size = tx.serialized_size();
    let modified_fee = inputs.fee.saturating_add(pool.apply_delta(&txid));
    let time = ctx.accept_time.unwrap_or_else(|| pool.now());
    let entry = MempoolEntry::new(
        Arc::clone(&tx),
        inputs.fee,
        time,
        ctx.tip_height,
        inputs.spends_coinbase,
        transaction_sigops(&tx) as u64,
        LockPoints {
            height: next_height,
            time: ctx.median_time_past,
        },
    );

    if !ctx.bypass_limits {
        let relay_fee = ctx.policy.min_relay_fee.fee(size);
        if modified_fee < relay_fee {
            return Err(MempoolError::new(
                MempoolErrorKind::InsufficientFee,
                format!("min relay fee not met, {modified_fee} < {relay_fee}"),
            ));
        }
        let reject_fee = pool.get_min_fee(ctx.policy.max_mempool_bytes).fee(size);
        if reject_fee > 0 && modified_fee < reject_fee {
            return Err(MempoolError::new(
                MempoolErrorKind::InsufficientFee,
                format!("mempool min fee not met, {modified_fee} < {reject_fee}"),
            ));
        }
    }

    let ancestors = pool.calculate_ancestors(&entry, &ctx.policy.limits)?;

    let plan = if conflicts.is_empty() {
        None
    } else {
        Some(check_replacement(
            pool,
            &tx,
            modified_fee,
            size,
            &conflicts,
            &ancestors,
            ctx.policy.incremental_relay_fee,
        )?)
    };

    for (index, spent) in inputs.spent.iter().enumerate() {
        ctx.verifier
            .verify(&tx, index, spent, ctx.script_flags)
            .map_err(|err| {
                MempoolError::new(
                    MempoolErrorKind::InvalidScript,
                    format!("input {index} failed script verification: {err}"),
                )
            })?;
    }

    let mut replaced = Vec::new();
    if let Some(plan) = plan {
        replaced = pool.remove_staged(&plan.to_remove, false, RemovalReason::Replaced);
        log_debug!(
            "mempool: {} replaces {} transactions ({} sat over {} bytes)",
            hash256_to_hex(&txid),
            replaced.len(),
            plan.conflicting_fees,
            plan.conflicting_size
        );
    }
    pool.add_unchecked(entry, &ancestors);

    if !ctx.bypass_limits {
        for outpoint in pool.trim_to_size(ctx.policy.max_mempool_bytes) {
            coins.uncache(&outpoint);
        }
        if !pool.exists(&txid) {
            return Err(MempoolError::new(MempoolErrorKind::MempoolFull, "mempool full"));
        }
    }

    log_debug!(
        "mempool: accepted {} (fee {}, {} bytes, pool size {})",
        hash256_to_hex(&txid),
        inputs.fee,
        size,
        pool.size()
    );
    Ok(AcceptOutcome {
        txid,
        fee: inputs.fee,
        size,
        replaced,
    })
}

fn summarize_inputs<V: CoinsView>(
    tx: &Transaction,
    txid: Hash256,
    view: &mut CoinsCache<MempoolCoinsView<'_, &mut CoinsCache<V>>>,
    spend_height: i32,
    pulled_in: &mut Vec<OutPoint>,
) -> Result<InputSummary, MempoolError> {
    for index in 0..tx.vout.len() {
        let outpoint = OutPoint::new(txid, index as u32);
        let cached = view.base().base().have_coin_in_cache(&outpoint);
        if view.have_coin(&outpoint)? {
            if !cached {
                pulled_in.push(outpoint);
            }
            return Err(MempoolError::new(
                MempoolErrorKind::AlreadyInMempool,
                "txn-already-known",
            ));
        }
        if !cached {
            pulled_in.push(outpoint);
        }
    }

    for input in &tx.vin {
        let cached = view.base().base().have_coin_in_cache(&input.prevout);
        let present = view.have_coin(&input.prevout)?;
        if !cached {
            pulled_in.push(input.prevout);
        }
        if !present {
            return Err(MempoolError::new(
                MempoolErrorKind::MissingInputs,
                format!("missing input {}", input.prevout),
            ));
        }
    }

    let fee = check_tx_inputs(tx, view, spend_height)?;
    let mut spends_coinbase = false;
    let mut spent = Vec::with_capacity(tx.vin.len());
    for input in &tx.vin {
        let coin = view.access_coin(&input.prevout)?.ok_or_else(|| {
            MempoolError::new(MempoolErrorKind::MissingInputs, "input vanished")
        })?;
        spends_coinbase |= coin.is_coinbase;
        spent.push(coin.output.clone());
    }
    Ok(InputSummary {
        fee,
        spends_coinbase,
        spent,
    })
}
