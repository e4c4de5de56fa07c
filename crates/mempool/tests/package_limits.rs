use std::sync::Arc;

use ledgerd_chainstate::{Coin, CoinsCache, EmptyCoinsView};
use ledgerd_consensus::money::COIN;
use ledgerd_mempool::{
    accept_to_memory_pool, AcceptContext, Mempool, MempoolErrorKind, MempoolLimits, MempoolPolicy,
    RemovalReason,
};
use ledgerd_primitives::outpoint::OutPoint;
use ledgerd_primitives::transaction::{Transaction, TxIn, TxOut};
use ledgerd_script::AcceptAll;

fn spend(prevout: OutPoint, value: i64, outputs: usize) -> Arc<Transaction> {
    Arc::new(Transaction {
        version: 1,
        vin: vec![TxIn::new(prevout, vec![0x51; 25])],
        vout: (0..outputs)
            .map(|_| TxOut {
                value: value / outputs as i64,
                script_pubkey: vec![0x51],
            })
            .collect(),
        lock_time: 0,
    })
}

fn funded(outpoint: OutPoint) -> CoinsCache<EmptyCoinsView> {
    let mut coins = CoinsCache::new(EmptyCoinsView);
    coins
        .add_coin(
            outpoint,
            Coin::new(
                TxOut {
                    value: COIN,
                    script_pubkey: vec![0x51],
                },
                1,
                false,
            ),
            false,
        )
        .expect("fund");
    coins
}

#[test]
fn chain_limit_rejects_the_overflowing_child_only() {
    let policy = MempoolPolicy {
        limits: MempoolLimits {
            ancestor_count: 4,
            descendant_count: 4,
            ..MempoolLimits::default()
        },
        ..MempoolPolicy::default()
    };
    let mut pool = Mempool::new(&policy);
    let funding = OutPoint::new([3u8; 32], 0);
    let mut coins = funded(funding);
    let ctx = AcceptContext::new(&policy, &AcceptAll, 500, 0);

    let mut prevout = funding;
    let mut value = COIN;
    let mut chain = Vec::new();
    for _ in 0..4 {
        value -= 10_000;
        let tx = spend(prevout, value, 1);
        accept_to_memory_pool(&mut pool, &mut coins, Arc::clone(&tx), &ctx).expect("within limit");
        prevout = OutPoint::new(tx.txid(), 0);
        chain.push(tx);
    }
    let usage = pool.dynamic_memory_usage();
    let updated = pool.transactions_updated();

    let overflow = spend(prevout, value - 10_000, 1);
    let err = accept_to_memory_pool(&mut pool, &mut coins, overflow, &ctx).expect_err("limit");
    assert_eq!(err.kind, MempoolErrorKind::TooLongMempoolChain);
    assert_eq!(pool.size(), 4);
    assert_eq!(pool.dynamic_memory_usage(), usage);
    assert_eq!(pool.transactions_updated(), updated);
    pool.check_structure().expect("consistent");

    let removed = pool.remove_recursive(&chain[0], RemovalReason::Conflict);
    assert_eq!(removed.len(), 4);
    assert!(pool.is_empty());
}

#[test]
fn fan_out_aggregates_survive_partial_removal() {
    let policy = MempoolPolicy::default();
    let mut pool = Mempool::new(&policy);
    let funding = OutPoint::new([4u8; 32], 0);
    let mut coins = funded(funding);
    let ctx = AcceptContext::new(&policy, &AcceptAll, 500, 0);

    let root = spend(funding, COIN - 20_000, 3);
    accept_to_memory_pool(&mut pool, &mut coins, Arc::clone(&root), &ctx).expect("root");
    let per_output = (COIN - 20_000) / 3;
    let mut leaves = Vec::new();
    for index in 0..3 {
        let leaf = spend(OutPoint::new(root.txid(), index), per_output - 5_000, 1);
        accept_to_memory_pool(&mut pool, &mut coins, Arc::clone(&leaf), &ctx).expect("leaf");
        leaves.push(leaf);
    }
    let root_entry = pool.entry(&root.txid()).expect("root");
    let root_fee = root_entry.fee();
    assert_eq!(root_entry.count_with_descendants(), 4);
    assert_eq!(root_entry.mod_fees_with_descendants(), root_fee + 3 * 5_000);

    pool.remove_recursive(&leaves[1], RemovalReason::Unknown);
    pool.check_structure().expect("consistent after removal");
    let root_entry = pool.entry(&root.txid()).expect("root");
    assert_eq!(root_entry.count_with_descendants(), 3);
    assert_eq!(root_entry.mod_fees_with_descendants(), root_fee + 2 * 5_000);
    assert!(!pool.is_spent(&OutPoint::new(root.txid(), 1)));
}
