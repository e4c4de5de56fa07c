use std::sync::Arc;

use ledgerd_chainstate::{
    connect_block, disconnect_block, ActiveChain, BlockIndexTree, BlockStore, CoinsCache,
    CoinsStore, ConnectContext, DisconnectResult, EntryId, Validity,
};
use ledgerd_consensus::money::COIN;
use ledgerd_consensus::params::{consensus_params, Network};
use ledgerd_consensus::Hash256;
use ledgerd_primitives::block::{genesis_block, Block, BlockHeader};
use ledgerd_primitives::merkle::merkle_root;
use ledgerd_primitives::outpoint::OutPoint;
use ledgerd_primitives::transaction::{Transaction, TxIn, TxOut};
use ledgerd_script::{AcceptAll, InlineCheckQueue};
use ledgerd_storage::memory::MemoryStore;
use ledgerd_storage::WriteBatch;

fn coinbase(height: i32) -> Transaction {
    let mut script_sig = vec![0x04];
    script_sig.extend_from_slice(&height.to_le_bytes());
    Transaction {
        version: 1,
        vin: vec![TxIn::new(OutPoint::null(), script_sig)],
        vout: vec![TxOut {
            value: COIN,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

fn child_block(prev: &BlockHeader, height: i32) -> Block {
    let transactions = vec![coinbase(height)];
    let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
    Block {
        header: BlockHeader {
            version: 4,
            prev_block: prev.hash(),
            merkle_root: merkle_root(&txids).0,
            time: prev.time + 150,
            bits: prev.bits,
            nonce: 0,
        },
        transactions,
    }
}

fn reward(block: &Block) -> OutPoint {
    OutPoint::new(block.transactions[0].txid(), 0)
}

#[test]
fn connected_chain_survives_reload_and_unwinds_from_stored_undo() {
    let params = consensus_params(Network::Regtest);
    let queue = InlineCheckQueue::new(Arc::new(AcceptAll));
    let ctx = ConnectContext::new(&params, &queue);
    let store = Arc::new(MemoryStore::new());
    let blocks = BlockStore::new(Arc::clone(&store));

    let genesis = genesis_block(&params);
    let mut tree = BlockIndexTree::new();
    let genesis_id = tree.insert(&genesis.header).expect("genesis");
    tree.set_have_data(genesis_id, 1);
    tree.raise_validity(genesis_id, Validity::Scripts);

    let mut coins = CoinsCache::new(CoinsStore::new(Arc::clone(&store)));
    coins.set_best_block(genesis.hash());

    let mut chain = vec![genesis.clone()];
    let mut tip: EntryId = genesis_id;
    for height in 1..=3 {
        let block = child_block(&chain[chain.len() - 1].header, height);
        let id = tree.insert(&block.header).expect("insert");
        let txids: Vec<Hash256> = block.transactions.iter().map(Transaction::txid).collect();
        let undo = {
            let mut view = CoinsCache::new(&mut coins);
            let undo = connect_block(&block, &txids, height, &mut view, &ctx).expect("connect");
            view.flush().expect("child flush");
            undo
        };
        let mut batch = WriteBatch::new();
        blocks.put_block(&mut batch, &block);
        blocks.put_undo(&mut batch, &block.hash(), &undo);
        blocks.commit(&batch).expect("commit block");
        tree.set_have_data(id, 1);
        tree.set_have_undo(id);
        tree.raise_validity(id, Validity::Scripts);
        tip = id;
        chain.push(block);
    }

    let mut batch = WriteBatch::new();
    assert_eq!(tree.write_dirty(&mut batch), 4);
    blocks.put_chain_tip(&mut batch, &tree.entry(tip).hash);
    blocks.commit(&batch).expect("commit index");
    tree.mark_clean();
    assert_eq!(tree.dirty_count(), 0);
    coins.flush().expect("flush coins");
    drop(coins);

    let reloaded = BlockIndexTree::load(store.as_ref()).expect("load");
    let reloaded_tip = reloaded.get(&chain[3].hash()).expect("tip entry");
    assert_eq!(reloaded.best_candidate(), Some(reloaded_tip));
    assert!(reloaded.entry(reloaded_tip).have_undo());
    assert!(reloaded.entry(reloaded_tip).is_valid(Validity::Scripts));
    assert_eq!(blocks.chain_tip().expect("tip"), Some(chain[3].hash()));

    let mut active = ActiveChain::new(100);
    active.set_tip(&reloaded, Some(reloaded_tip));
    assert_eq!(active.height(), 3);

    let mut coins = CoinsCache::new(CoinsStore::new(Arc::clone(&store)));
    assert_eq!(coins.best_block().expect("best"), Some(chain[3].hash()));
    for block in &chain[1..] {
        assert!(coins.have_coin(&reward(block)).expect("coin"));
    }

    let top = blocks
        .get_block(&chain[3].hash())
        .expect("read block")
        .expect("stored block");
    let undo = blocks
        .get_undo(&chain[3].hash())
        .expect("read undo")
        .expect("stored undo");
    let result = {
        let mut view = CoinsCache::new(&mut coins);
        let result = disconnect_block(&top, 3, &undo, &mut view).expect("disconnect");
        view.flush().expect("child flush");
        result
    };
    assert_eq!(result, DisconnectResult::Clean);
    assert!(!coins.have_coin(&reward(&chain[3])).expect("coin"));
    assert_eq!(coins.best_block().expect("best"), Some(chain[2].hash()));
    coins.flush().expect("flush");

    let mut fresh = CoinsCache::new(CoinsStore::new(Arc::clone(&store)));
    assert!(!fresh.have_coin(&reward(&chain[3])).expect("coin"));
    assert!(fresh.have_coin(&reward(&chain[2])).expect("coin"));
}
