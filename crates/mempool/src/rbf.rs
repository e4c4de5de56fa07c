//! Opt-in full replacement of pooled transactions.

use std::collections::BTreeSet;

use ledgerd_consensus::money::Amount;
use ledgerd_consensus::{hash256_to_hex, Hash256};
use ledgerd_primitives::transaction::Transaction;

use crate::error::{MempoolError, MempoolErrorKind};
use crate::policy::{FeeRate, MempoolLimits, MAX_REPLACEMENT_CANDIDATES};
use crate::pool::{AncestorSet, Mempool};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RbfState {
    /// Neither the tx nor a pooled ancestor signals; an unpooled tx is
    /// reported as `Unknown`.
    Final,
    Unknown,
    ReplaceableBip125,
}

/// Whether `tx`, or any of its in-pool ancestors, opts in to replacement.
pub fn is_rbf_opt_in(tx: &Transaction, pool: &Mempool) -> RbfState {
    if tx.signals_opt_in_rbf() {
        return RbfState::ReplaceableBip125;
    }
    let Some(entry) = pool.entry(&tx.txid()) else {
        return RbfState::Unknown;
    };
    let Ok(ancestors) = pool.calculate_ancestors(entry, &MempoolLimits::unlimited()) else {
        return RbfState::Unknown;
    };
    let replaceable = ancestors
        .iter()
        .filter_map(|txid| pool.get(txid))
        .any(|ancestor| ancestor.signals_opt_in_rbf());
    if replaceable {
        RbfState::ReplaceableBip125
    } else {
        RbfState::Final
    }
}

/// Pooled transactions spending an outpoint `tx` also spends.
pub fn find_conflicts(pool: &Mempool, tx: &Transaction) -> BTreeSet<Hash256> {
    tx.vin
        .iter()
        .filter_map(|input| pool.spender(&input.prevout))
        .collect()
}

/// What a valid replacement evicts.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReplacementPlan {
    /// Direct conflicts and all of their descendants.
    pub to_remove: BTreeSet<Hash256>,
    pub conflicting_fees: Amount,
    pub conflicting_size: u64,
}

/// Replacement rules for `tx`, paying `modified_fee` over `size` bytes,
/// against its direct `conflicts`.
pub fn check_replacement(
    pool: &Mempool,
    tx: &Transaction,
    modified_fee: Amount,
    size: usize,
    conflicts: &BTreeSet<Hash256>,
    ancestors: &AncestorSet,
    relay_fee: FeeRate,
) -> Result<ReplacementPlan, MempoolError> {
    let txid = tx.txid();
    let new_rate = FeeRate::new(modified_fee, size);

    let mut conflict_parents = BTreeSet::new();
    for conflict in conflicts {
        let Some(entry) = pool.entry(conflict) else {
            continue;
        };
        if is_rbf_opt_in(entry.tx(), pool) != RbfState::ReplaceableBip125 {
            return Err(MempoolError::new(
                MempoolErrorKind::ConflictingInput,
                format!("txn-mempool-conflict: {} is not replaceable", hash256_to_hex(conflict)),
            ));
        }
        let old_rate = FeeRate::new(entry.modified_fee(), entry.size() as usize);
        if new_rate <= old_rate {
            return Err(rejected(format!(
                "insufficient fee: rejecting replacement {}; new feerate {new_rate} <= old feerate {old_rate}",
                hash256_to_hex(&txid)
            )));
        }
        conflict_parents.extend(entry.tx().vin.iter().map(|input| input.prevout.hash));
    }

    let mut to_remove = BTreeSet::new();
    for conflict in conflicts {
        to_remove.extend(pool.calculate_descendants(conflict));
        if to_remove.len() > MAX_REPLACEMENT_CANDIDATES {
            return Err(rejected(format!(
                "too many potential replacements: rejecting replacement {}; too many potential replacements ({} > {MAX_REPLACEMENT_CANDIDATES})",
                hash256_to_hex(&txid),
                to_remove.len()
            )));
        }
    }

    if let Some(spent) = ancestors.iter().find(|ancestor| to_remove.contains(*ancestor)) {
        return Err(rejected(format!(
            "bad-txns-spends-conflicting-tx: {} spends conflicting transaction {}",
            hash256_to_hex(&txid),
            hash256_to_hex(spent)
        )));
    }

    for input in &tx.vin {
        let parent = input.prevout.hash;
        if !conflict_parents.contains(&parent) && pool.exists(&parent) {
            return Err(rejected(format!(
                "replacement-adds-unconfirmed: replacement {} adds unconfirmed input {}",
                hash256_to_hex(&txid),
                input.prevout
            )));
        }
    }

    let mut conflicting_fees: Amount = 0;
    let mut conflicting_size = 0u64;
    for removed in &to_remove {
        if let Some(entry) = pool.entry(removed) {
            conflicting_fees = conflicting_fees.saturating_add(entry.modified_fee());
            conflicting_size += entry.size();
        }
    }
    if modified_fee < conflicting_fees {
        return Err(rejected(format!(
            "insufficient fee: rejecting replacement {}, less fees than conflicting txs; {modified_fee} < {conflicting_fees}",
            hash256_to_hex(&txid)
        )));
    }
    let additional = modified_fee - conflicting_fees;
    let required = relay_fee.fee(size);
    if additional < required {
        return Err(rejected(format!(
            "insufficient fee: rejecting replacement {}, not enough additional fees to relay; {additional} < {required}",
            hash256_to_hex(&txid)
        )));
    }

    Ok(ReplacementPlan {
        to_remove,
        conflicting_fees,
        conflicting_size,
    })
}

fn rejected(message: String) -> MempoolError {
    MempoolError::new(MempoolErrorKind::ReplacementRejected, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{LockPoints, MempoolEntry};
    use crate::policy::MempoolPolicy;
    use ledgerd_primitives::outpoint::OutPoint;
    use ledgerd_primitives::transaction::{TxIn, TxOut};
    use std::sync::Arc;

    fn tx(prevouts: &[OutPoint], sequence: u32, salt: u8) -> Transaction {
        Transaction {
            version: 1,
            vin: prevouts
                .iter()
                .map(|prevout| {
                    let mut input = TxIn::new(*prevout, vec![salt; 20]);
                    input.sequence = sequence;
                    input
                })
                .collect(),
            vout: vec![TxOut {
                value: 1000,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn add(pool: &mut Mempool, tx: &Transaction, fee: Amount) {
        let entry =
            MempoolEntry::new(Arc::new(tx.clone()), fee, 1, 1, false, 1, LockPoints::default());
        let ancestors = pool
            .calculate_ancestors(&entry, &MempoolLimits::unlimited())
            .expect("ancestors");
        pool.add_unchecked(entry, &ancestors);
    }

    #[test]
    fn opt_in_is_inherited_from_ancestors() {
        let mut pool = Mempool::new(&MempoolPolicy::default());
        let parent = tx(&[OutPoint::new([1u8; 32], 0)], 0xffff_fffd, 1);
        let child = tx(&[OutPoint::new(parent.txid(), 0)], u32::MAX, 2);
        let unrelated = tx(&[OutPoint::new([2u8; 32], 0)], u32::MAX, 3);
        add(&mut pool, &parent, 100);
        add(&mut pool, &child, 100);
        add(&mut pool, &unrelated, 100);
        assert_eq!(is_rbf_opt_in(&parent, &pool), RbfState::ReplaceableBip125);
        assert_eq!(is_rbf_opt_in(&child, &pool), RbfState::ReplaceableBip125);
        assert_eq!(is_rbf_opt_in(&unrelated, &pool), RbfState::Final);
        let outsider = tx(&[OutPoint::new([3u8; 32], 0)], u32::MAX, 4);
        assert_eq!(is_rbf_opt_in(&outsider, &pool), RbfState::Unknown);
    }

    #[test]
    fn replacement_rules() {
        let mut pool = Mempool::new(&MempoolPolicy::default());
        let funding = OutPoint::new([1u8; 32], 0);
        let original = tx(&[funding], 0, 1);
        add(&mut pool, &original, 1000);
        let relay = FeeRate::from_sat_per_kb(1000);

        let replacement = tx(&[funding], 0, 2);
        let size = replacement.serialized_size();
        let conflicts = find_conflicts(&pool, &replacement);
        assert_eq!(conflicts, BTreeSet::from([original.txid()]));

        let plan = check_replacement(
            &pool,
            &replacement,
            2000,
            size,
            &conflicts,
            &AncestorSet::new(),
            relay,
        )
        .expect("pays more");
        assert_eq!(plan.to_remove, BTreeSet::from([original.txid()]));
        assert_eq!(plan.conflicting_fees, 1000);

        let err = check_replacement(
            &pool,
            &replacement,
            1000,
            size,
            &conflicts,
            &AncestorSet::new(),
            relay,
        )
        .expect_err("same fee rate");
        assert_eq!(err.kind, MempoolErrorKind::ReplacementRejected);

        // higher rate but not enough extra fee to pay for its own relay
        let err = check_replacement(
            &pool,
            &replacement,
            1001,
            size - 1,
            &conflicts,
            &AncestorSet::new(),
            relay,
        )
        .expect_err("relay fee");
        assert_eq!(err.kind, MempoolErrorKind::ReplacementRejected);

        let other = tx(&[OutPoint::new([5u8; 32], 0)], u32::MAX, 5);
        add(&mut pool, &other, 10);
        let adds_unconfirmed = tx(&[funding, OutPoint::new(other.txid(), 0)], 0, 6);
        let err = check_replacement(
            &pool,
            &adds_unconfirmed,
            50_000,
            adds_unconfirmed.serialized_size(),
            &find_conflicts(&pool, &adds_unconfirmed),
            &AncestorSet::from([other.txid()]),
            relay,
        )
        .expect_err("new unconfirmed input");
        assert_eq!(err.kind, MempoolErrorKind::ReplacementRejected);
    }

    #[test]
    fn final_conflicts_cannot_be_replaced() {
        let mut pool = Mempool::new(&MempoolPolicy::default());
        let funding = OutPoint::new([1u8; 32], 0);
        let original = tx(&[funding], u32::MAX, 1);
        add(&mut pool, &original, 1000);
        let replacement = tx(&[funding], 0, 2);
        let err = check_replacement(
            &pool,
            &replacement,
            1_000_000,
            replacement.serialized_size(),
            &find_conflicts(&pool, &replacement),
            &AncestorSet::new(),
            FeeRate::from_sat_per_kb(1000),
        )
        .expect_err("final");
        assert_eq!(err.kind, MempoolErrorKind::ConflictingInput);
    }
}
