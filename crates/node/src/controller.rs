//! Process-wide ledger state: the block index with its active chain, the coin
//! cache and the mempool, each behind its own lock.
//!
//! Locks are always taken in the order chain, coins, mempool. A block
//! connection holds all three so the coin view and the pool move together.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use ledgerd_chainstate::validation::{
    check_block, contextual_check_block, contextual_check_header,
};
use ledgerd_chainstate::{
    connect_block, disconnect_block, ActiveChain, BlockIndexError, BlockIndexTree, BlockStore,
    Coin, CoinsCache, CoinsError, CoinsStore, ConnectContext, DisconnectResult, EntryId,
    ValidationError, ValidationFlags, Validity,
};
use ledgerd_consensus::money::Amount;
use ledgerd_consensus::{consensus_params, hash256_to_hex, ConsensusParams, Hash256, Network};
use ledgerd_log::{log_debug, log_error, log_info, log_warn};
use ledgerd_mempool::persist;
use ledgerd_mempool::{
    accept_to_memory_pool, AcceptContext, AcceptOutcome, LoadStats, Mempool, MempoolError,
    MempoolLoader, MempoolPolicy, PersistError, RemovalReason,
};
use ledgerd_pow::validation::{validate_pow_header, PowError};
use ledgerd_primitives::block::{genesis_block, Block, BlockHeader};
use ledgerd_primitives::outpoint::OutPoint;
use ledgerd_primitives::transaction::Transaction;
use ledgerd_script::{CheckQueue, ScriptVerifier};
use ledgerd_storage::{KeyValueStore, StoreError, WriteBatch};
use primitive_types::U256;
use serde::Serialize;

pub const DEFAULT_DB_CACHE_MB: u64 = 450;
pub const DEFAULT_MAX_FORK_TRAVERSAL: usize = 1000;
/// Consecutive failed flushes after which the node should stop.
pub const MAX_FLUSH_FAILURES: u32 = 3;

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub network: Network,
    pub max_fork_traversal: usize,
    /// Coin cache memory above which maintenance flushes to the store.
    pub db_cache_bytes: usize,
    pub check_script: bool,
    pub mempool: MempoolPolicy,
    /// Where the mempool is dumped on shutdown; `None` disables persistence.
    pub mempool_path: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            max_fork_traversal: DEFAULT_MAX_FORK_TRAVERSAL,
            db_cache_bytes: (DEFAULT_DB_CACHE_MB * 1024 * 1024) as usize,
            check_script: true,
            mempool: MempoolPolicy::default(),
            mempool_path: None,
        }
    }
}

#[derive(Debug)]
pub enum ChainStateError {
    BlockIndex(BlockIndexError),
    Coins(CoinsError),
    Validation(ValidationError),
    Mempool(MempoolError),
    Persist(PersistError),
    Store(StoreError),
    InvalidBlock { hash: Hash256, reason: String },
    UnknownBlock(Hash256),
    MissingBlockData(Hash256),
    MissingUndoData(Hash256),
    FlushFailed { attempts: u32, last: String },
    Poisoned(&'static str),
}

impl std::fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStateError::BlockIndex(err) => write!(f, "{err}"),
            ChainStateError::Coins(err) => write!(f, "{err}"),
            ChainStateError::Validation(err) => write!(f, "{err}"),
            ChainStateError::Mempool(err) => write!(f, "{err}"),
            ChainStateError::Persist(err) => write!(f, "{err}"),
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::InvalidBlock { hash, reason } => {
                write!(f, "block {} is invalid: {reason}", hash256_to_hex(hash))
            }
            ChainStateError::UnknownBlock(hash) => {
                write!(f, "block {} is not in the block index", hash256_to_hex(hash))
            }
            ChainStateError::MissingBlockData(hash) => {
                write!(f, "block {} body is not stored", hash256_to_hex(hash))
            }
            ChainStateError::MissingUndoData(hash) => {
                write!(f, "block {} undo record is not stored", hash256_to_hex(hash))
            }
            ChainStateError::FlushFailed { attempts, last } => {
                write!(f, "flush failed {attempts} times in a row: {last}")
            }
            ChainStateError::Poisoned(name) => write!(f, "{name} lock poisoned"),
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<BlockIndexError> for ChainStateError {
    fn from(err: BlockIndexError) -> Self {
        ChainStateError::BlockIndex(err)
    }
}

impl From<CoinsError> for ChainStateError {
    fn from(err: CoinsError) -> Self {
        ChainStateError::Coins(err)
    }
}

impl From<ValidationError> for ChainStateError {
    fn from(err: ValidationError) -> Self {
        ChainStateError::Validation(err)
    }
}

impl From<MempoolError> for ChainStateError {
    fn from(err: MempoolError) -> Self {
        ChainStateError::Mempool(err)
    }
}

impl From<PersistError> for ChainStateError {
    fn from(err: PersistError) -> Self {
        ChainStateError::Persist(err)
    }
}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

/// The block index together with the chain selected from it.
pub struct ChainIndex {
    pub tree: BlockIndexTree,
    pub active: ActiveChain,
}

impl ChainIndex {
    fn tip(&self) -> Result<EntryId, ChainStateError> {
        self.active
            .tip()
            .ok_or(ChainStateError::BlockIndex(BlockIndexError::Corrupt(
                "active chain is empty",
            )))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChainTip {
    pub hash: Hash256,
    pub height: i32,
    pub chain_work: U256,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChainStatus {
    pub network: &'static str,
    pub tip_hash: String,
    pub tip_height: i32,
    pub chain_work: String,
    pub best_header_height: i32,
    pub headers: usize,
    pub coins_cached: usize,
    pub coins_memory_bytes: usize,
    pub mempool_txs: usize,
    pub mempool_bytes: u64,
    pub mempool_usage_bytes: usize,
    pub mempool_min_fee_per_kb: Amount,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub trimmed_outpoints: usize,
    pub flushed: bool,
}

enum ConnectOutcome {
    Connected,
    Invalid,
}

/// Transactions of disconnected blocks, held until the reorg settles.
#[derive(Default)]
struct DisconnectedTransactions {
    /// Per block, most recently disconnected last.
    blocks: Vec<Vec<Arc<Transaction>>>,
}

impl DisconnectedTransactions {
    fn add_block(&mut self, block: &Block) {
        let txs = block
            .transactions
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .map(|tx| Arc::new(tx.clone()))
            .collect();
        self.blocks.push(txs);
    }

    fn remove_confirmed(&mut self, txids: &[Hash256]) {
        if self.blocks.is_empty() {
            return;
        }
        let confirmed: HashSet<&Hash256> = txids.iter().collect();
        for txs in &mut self.blocks {
            txs.retain(|tx| !confirmed.contains(&tx.txid()));
        }
    }

    fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Oldest block first, so parents precede children.
    fn into_chain_order(self) -> Vec<Arc<Transaction>> {
        self.blocks.into_iter().rev().flatten().collect()
    }
}

type CoinsCacheOf<S> = CoinsCache<CoinsStore<Arc<S>>>;

pub struct ChainStateController<S: KeyValueStore> {
    params: ConsensusParams,
    config: ControllerConfig,
    store: Arc<S>,
    blocks: BlockStore<Arc<S>>,
    chain: RwLock<ChainIndex>,
    coins: Mutex<CoinsCacheOf<S>>,
    mempool: RwLock<Mempool>,
    verifier: Arc<dyn ScriptVerifier>,
    check_queue: Arc<dyn CheckQueue>,
    flush_failures: AtomicU32,
}

impl<S: KeyValueStore> ChainStateController<S> {
    /// Loads the block index, restores the active chain to the block the
    /// coin store was last flushed at, then connects any stored blocks that
    /// make a better chain.
    pub fn open(
        store: Arc<S>,
        config: ControllerConfig,
        verifier: Arc<dyn ScriptVerifier>,
        check_queue: Arc<dyn CheckQueue>,
    ) -> Result<Self, ChainStateError> {
        let params = consensus_params(config.network);
        let blocks = BlockStore::new(Arc::clone(&store));
        let mut tree = BlockIndexTree::load(store.as_ref())?;
        let mut coins = CoinsCache::new(CoinsStore::new(Arc::clone(&store)));
        let mut active = ActiveChain::new(config.max_fork_traversal);

        if tree.is_empty() {
            let genesis = genesis_block(&params);
            let id = tree.insert(&genesis.header)?;
            let mut batch = WriteBatch::new();
            blocks.put_block(&mut batch, &genesis);
            blocks.commit(&batch)?;
            tree.set_have_data(id, genesis.transactions.len() as u32);
            tree.raise_validity(id, Validity::Scripts);
            coins.set_best_block(genesis.hash());
            active.set_tip(&tree, Some(id));
            log_info!(
                "Initialized {} chain state at genesis {}",
                config.network.as_str(),
                hash256_to_hex(&genesis.hash())
            );
        } else {
            let genesis = tree.genesis().ok_or(BlockIndexError::Corrupt("no genesis entry"))?;
            let tip = match coins.best_block()? {
                Some(hash) => tree.get(&hash).ok_or(BlockIndexError::Corrupt(
                    "coin store best block is not in the block index",
                ))?,
                None => {
                    coins.set_best_block(tree.entry(genesis).hash);
                    genesis
                }
            };
            let tip_hash = tree.entry(tip).hash;
            if let Some(recorded) = blocks.chain_tip()? {
                if recorded != tip_hash {
                    log_warn!(
                        "Recorded chain tip {} differs from coin store tip {}; using the coin store",
                        hash256_to_hex(&recorded),
                        hash256_to_hex(&tip_hash)
                    );
                }
            }
            active.set_tip(&tree, Some(tip));
            log_info!(
                "Loaded {} block index entries; tip {} at height {}",
                tree.len(),
                hash256_to_hex(&tip_hash),
                active.height()
            );
        }

        let mempool = Mempool::new(&config.mempool);
        let controller = Self {
            params,
            config,
            store,
            blocks,
            chain: RwLock::new(ChainIndex { tree, active }),
            coins: Mutex::new(coins),
            mempool: RwLock::new(mempool),
            verifier,
            check_queue,
            flush_failures: AtomicU32::new(0),
        };
        controller.activate_best_chain()?;
        Ok(controller)
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn chain_read(&self) -> Result<RwLockReadGuard<'_, ChainIndex>, ChainStateError> {
        self.chain.read().map_err(|_| ChainStateError::Poisoned("chain"))
    }

    fn chain_write(&self) -> Result<RwLockWriteGuard<'_, ChainIndex>, ChainStateError> {
        self.chain.write().map_err(|_| ChainStateError::Poisoned("chain"))
    }

    fn coins_lock(&self) -> Result<MutexGuard<'_, CoinsCacheOf<S>>, ChainStateError> {
        self.coins.lock().map_err(|_| ChainStateError::Poisoned("coins"))
    }

    fn mempool_read(&self) -> Result<RwLockReadGuard<'_, Mempool>, ChainStateError> {
        self.mempool.read().map_err(|_| ChainStateError::Poisoned("mempool"))
    }

    fn mempool_write(&self) -> Result<RwLockWriteGuard<'_, Mempool>, ChainStateError> {
        self.mempool.write().map_err(|_| ChainStateError::Poisoned("mempool"))
    }

    fn validation_flags(&self) -> ValidationFlags {
        ValidationFlags {
            check_script: self.config.check_script,
            ..ValidationFlags::default()
        }
    }

    /// Runs `f` with shared access to the block index and active chain.
    pub fn with_chain<R>(&self, f: impl FnOnce(&ChainIndex) -> R) -> Result<R, ChainStateError> {
        let chain = self.chain_read()?;
        Ok(f(&chain))
    }

    /// Runs `f` with shared access to the mempool.
    pub fn with_mempool<R>(&self, f: impl FnOnce(&Mempool) -> R) -> Result<R, ChainStateError> {
        let pool = self.mempool_read()?;
        Ok(f(&pool))
    }

    pub fn tip(&self) -> Result<ChainTip, ChainStateError> {
        let chain = self.chain_read()?;
        let entry = chain.tree.entry(chain.tip()?);
        Ok(ChainTip {
            hash: entry.hash,
            height: entry.height,
            chain_work: entry.chain_work,
        })
    }

    pub fn locator(&self) -> Result<Vec<Hash256>, ChainStateError> {
        let chain = self.chain_read()?;
        Ok(chain.active.locator(&chain.tree, None))
    }

    /// The most recent active-chain ancestor of `hash`, within the
    /// configured traversal limit.
    pub fn find_fork(&self, hash: &Hash256) -> Result<Option<(Hash256, i32)>, ChainStateError> {
        let chain = self.chain_read()?;
        let id = chain
            .tree
            .get(hash)
            .ok_or(ChainStateError::UnknownBlock(*hash))?;
        Ok(chain.active.find_fork(&chain.tree, id).map(|fork| {
            let entry = chain.tree.entry(fork);
            (entry.hash, entry.height)
        }))
    }

    pub fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainStateError> {
        Ok(self.coins_lock()?.get_coin(outpoint)?)
    }

    pub fn have_coin(&self, outpoint: &OutPoint) -> Result<bool, ChainStateError> {
        Ok(self.coins_lock()?.have_coin(outpoint)?)
    }

    /// Validates a header against its parent and adds it to the index.
    pub fn accept_header(&self, header: &BlockHeader) -> Result<EntryId, ChainStateError> {
        let mut chain = self.chain_write()?;
        self.accept_header_locked(&mut chain.tree, header)
    }

    fn accept_header_locked(
        &self,
        tree: &mut BlockIndexTree,
        header: &BlockHeader,
    ) -> Result<EntryId, ChainStateError> {
        let hash = header.hash();
        if let Some(id) = tree.get(&hash) {
            if tree.is_tainted(id) {
                return Err(invalid(hash, "block is marked invalid"));
            }
            return Ok(id);
        }
        let parent = tree
            .get(&header.prev_block)
            .ok_or(BlockIndexError::OrphanHeader(header.prev_block))?;
        if tree.is_tainted(parent) {
            return Err(invalid(hash, "parent block is marked invalid"));
        }
        validate_pow_header(header, &self.params).map_err(|err: PowError| invalid(hash, err))?;
        contextual_check_header(header, tree.median_time_past(parent), unix_now_secs())
            .map_err(|err| invalid(hash, err))?;
        Ok(tree.insert(header)?)
    }

    /// Validates and stores `block`, then moves to the best chain. Returns
    /// whether the block is on the active chain afterwards.
    pub fn process_block(&self, block: &Block) -> Result<bool, ChainStateError> {
        let hash = block.hash();
        {
            let mut chain = self.chain_write()?;
            let id = self.accept_header_locked(&mut chain.tree, &block.header)?;
            if chain.tree.entry(id).have_data() {
                return Ok(chain.active.contains(&chain.tree, id));
            }
            let height = chain.tree.entry(id).height;
            let checked = check_block(block, &self.params, &self.validation_flags())
                .and_then(|_| contextual_check_block(block, height));
            if let Err(err) = checked {
                // a bad merkle tree may be a mutated copy of a valid block
                if !matches!(
                    err,
                    ValidationError::MerkleMismatch | ValidationError::DuplicateTransaction
                ) {
                    chain.tree.mark_failed(id);
                }
                log_warn!("Rejected block {} at height {height}: {err}", hash256_to_hex(&hash));
                return Err(invalid(hash, err));
            }
            let mut batch = WriteBatch::new();
            self.blocks.put_block(&mut batch, block);
            self.blocks.commit(&batch)?;
            chain
                .tree
                .set_have_data(id, block.transactions.len() as u32);
        }
        self.activate_best_chain()?;
        let chain = self.chain_read()?;
        let id = chain
            .tree
            .get(&hash)
            .ok_or(ChainStateError::UnknownBlock(hash))?;
        if chain.tree.entry(id).is_failed() {
            return Err(invalid(hash, "block failed to connect"));
        }
        Ok(chain.active.contains(&chain.tree, id))
    }

    /// Reorganizes onto the most-work valid candidate until none is better
    /// than the tip.
    pub fn activate_best_chain(&self) -> Result<(), ChainStateError> {
        let mut chain = self.chain_write()?;
        let mut coins = self.coins_lock()?;
        let mut pool = self.mempool_write()?;
        self.activate_best_chain_locked(&mut chain, &mut coins, &mut pool)
    }

    fn activate_best_chain_locked(
        &self,
        chain: &mut ChainIndex,
        coins: &mut CoinsCacheOf<S>,
        pool: &mut Mempool,
    ) -> Result<(), ChainStateError> {
        loop {
            let tip = chain.tip()?;
            let Some(candidate) = chain.tree.best_candidate() else {
                return Ok(());
            };
            if candidate == tip
                || chain.tree.entry(candidate).chain_work <= chain.tree.entry(tip).chain_work
            {
                return Ok(());
            }
            self.reorganize_to(chain, coins, pool, candidate)?;
        }
    }

    /// One reorg step: disconnect to the fork point, then connect toward
    /// `candidate`, stopping at the first invalid block.
    fn reorganize_to(
        &self,
        chain: &mut ChainIndex,
        coins: &mut CoinsCacheOf<S>,
        pool: &mut Mempool,
        candidate: EntryId,
    ) -> Result<(), ChainStateError> {
        let old_tip = chain.tip()?;
        let fork = chain.tree.lowest_common_ancestor(old_tip, candidate);
        let fork_height = chain.tree.entry(fork).height;
        let mut disconnected = DisconnectedTransactions::default();
        let mut disconnected_blocks = 0usize;

        while chain.tip()? != fork {
            if let Err(err) = self.disconnect_tip(chain, coins, &mut disconnected) {
                return Err(self.reconcile_after_failure(chain, coins, pool, disconnected, err));
            }
            disconnected_blocks += 1;
        }

        let target_height = chain.tree.entry(candidate).height;
        let path: Vec<EntryId> = (fork_height + 1..=target_height)
            .filter_map(|height| chain.tree.ancestor_at(candidate, height))
            .collect();
        let mut connected_blocks = 0usize;
        for id in path {
            match self.connect_tip(chain, coins, pool, id, &mut disconnected) {
                Ok(ConnectOutcome::Connected) => connected_blocks += 1,
                Ok(ConnectOutcome::Invalid) => break,
                Err(err) => {
                    return Err(self.reconcile_after_failure(chain, coins, pool, disconnected, err));
                }
            }
        }

        let tip = chain.tip()?;
        chain.tree.prune_candidates(tip);
        if disconnected_blocks > 0 {
            let old = chain.tree.entry(old_tip);
            let new = chain.tree.entry(tip);
            log_info!(
                "Reorganized from {} (height {}) to {} (height {}): fork at height {fork_height}, {disconnected_blocks} disconnected, {connected_blocks} connected",
                hash256_to_hex(&old.hash),
                old.height,
                hash256_to_hex(&new.hash),
                new.height
            );
            self.update_mempool_for_reorg(chain, coins, pool, disconnected)?;
        }
        Ok(())
    }

    fn connect_tip(
        &self,
        chain: &mut ChainIndex,
        coins: &mut CoinsCacheOf<S>,
        pool: &mut Mempool,
        id: EntryId,
        disconnected: &mut DisconnectedTransactions,
    ) -> Result<ConnectOutcome, ChainStateError> {
        let (hash, height) = {
            let entry = chain.tree.entry(id);
            (entry.hash, entry.height)
        };
        let block = self
            .blocks
            .get_block(&hash)?
            .ok_or(ChainStateError::MissingBlockData(hash))?;
        let txids: Vec<Hash256> = block.transactions.iter().map(Transaction::txid).collect();
        let ctx = ConnectContext {
            flags: self.validation_flags(),
            ..ConnectContext::new(&self.params, self.check_queue.as_ref())
        };

        {
            let mut view = CoinsCache::new(&mut *coins);
            let undo = match connect_block(&block, &txids, height, &mut view, &ctx) {
                Ok(undo) => undo,
                Err(err) if err.is_consensus() => {
                    chain.tree.mark_failed(id);
                    log_warn!(
                        "Block {} at height {height} failed to connect: {err}",
                        hash256_to_hex(&hash)
                    );
                    return Ok(ConnectOutcome::Invalid);
                }
                Err(err) => return Err(err.into()),
            };
            // the undo record must be durable before the coins it reverts move
            let mut batch = WriteBatch::new();
            self.blocks.put_undo(&mut batch, &hash, &undo);
            self.blocks.commit(&batch)?;
            view.flush()?;
        }

        chain.tree.set_have_undo(id);
        let tier = if self.config.check_script {
            Validity::Scripts
        } else {
            Validity::Chain
        };
        chain.tree.raise_validity(id, tier);
        chain.active.set_tip(&chain.tree, Some(id));

        let conflicted = pool.remove_for_block(&block.transactions, height);
        disconnected.remove_confirmed(&txids);
        log_debug!(
            "Connected block {} at height {height} ({} txs, {} mempool conflicts)",
            hash256_to_hex(&hash),
            txids.len(),
            conflicted.len()
        );
        Ok(ConnectOutcome::Connected)
    }

    fn disconnect_tip(
        &self,
        chain: &mut ChainIndex,
        coins: &mut CoinsCacheOf<S>,
        disconnected: &mut DisconnectedTransactions,
    ) -> Result<(), ChainStateError> {
        let tip = chain.tip()?;
        let (hash, height, prev) = {
            let entry = chain.tree.entry(tip);
            (entry.hash, entry.height, entry.prev)
        };
        let prev = prev.ok_or(BlockIndexError::Corrupt("cannot disconnect the genesis block"))?;
        let block = self
            .blocks
            .get_block(&hash)?
            .ok_or(ChainStateError::MissingBlockData(hash))?;
        let undo = self
            .blocks
            .get_undo(&hash)?
            .ok_or(ChainStateError::MissingUndoData(hash))?;

        {
            let mut view = CoinsCache::new(&mut *coins);
            if disconnect_block(&block, height, &undo, &mut view)? == DisconnectResult::Unclean {
                log_warn!(
                    "Disconnected block {} at height {height} from an inconsistent coin view",
                    hash256_to_hex(&hash)
                );
            }
            view.flush()?;
        }

        chain.active.set_tip(&chain.tree, Some(prev));
        disconnected.add_block(&block);
        log_debug!(
            "Disconnected block {} at height {height}",
            hash256_to_hex(&hash)
        );
        Ok(())
    }

    /// Returns transactions from blocks already disconnected to the pool
    /// before a failed reorg step propagates `err`.
    fn reconcile_after_failure(
        &self,
        chain: &ChainIndex,
        coins: &mut CoinsCacheOf<S>,
        pool: &mut Mempool,
        disconnected: DisconnectedTransactions,
        err: ChainStateError,
    ) -> ChainStateError {
        log_warn!(
            "Reorg stopped at height {}: {err}",
            chain.active.height()
        );
        if let Err(reconcile) = self.update_mempool_for_reorg(chain, coins, pool, disconnected) {
            log_warn!("Mempool: reconciliation after the failed reorg also failed: {reconcile}");
        }
        err
    }

    /// Re-admits transactions from disconnected blocks, then drops pool
    /// entries the shorter chain no longer supports.
    fn update_mempool_for_reorg(
        &self,
        chain: &ChainIndex,
        coins: &mut CoinsCacheOf<S>,
        pool: &mut Mempool,
        disconnected: DisconnectedTransactions,
    ) -> Result<(), ChainStateError> {
        if disconnected.is_empty() {
            return Ok(());
        }
        let tip = chain.tip()?;
        let tip_height = chain.active.height();
        let median_time_past = chain.tree.median_time_past(tip);
        let ctx = AcceptContext {
            bypass_limits: true,
            ..AcceptContext::new(
                &self.config.mempool,
                self.verifier.as_ref(),
                tip_height,
                median_time_past,
            )
        };

        let txs = disconnected.into_chain_order();
        let total = txs.len();
        let mut readded = Vec::with_capacity(total);
        for tx in txs {
            match accept_to_memory_pool(pool, &mut *coins, Arc::clone(&tx), &ctx) {
                Ok(outcome) => readded.push(outcome.txid),
                Err(err) => {
                    log_debug!(
                        "Mempool: dropped disconnected transaction {}: {err}",
                        hash256_to_hex(&tx.txid())
                    );
                    if err.kind != ledgerd_mempool::MempoolErrorKind::AlreadyInMempool {
                        pool.remove_recursive(&tx, RemovalReason::Reorg);
                    }
                }
            }
        }
        pool.update_transactions_from_block(&readded);

        let next_height = tip_height + 1;
        let removed = pool.remove_for_reorg(&mut *coins, tip_height, |entry| {
            entry.tx().is_final(next_height, median_time_past)
        })?;
        for outpoint in pool.trim_to_size(self.config.mempool.max_mempool_bytes) {
            coins.uncache(&outpoint);
        }
        log_info!(
            "Mempool: re-added {} of {total} disconnected transactions, removed {removed} invalidated by the reorg",
            readded.len()
        );
        Ok(())
    }

    /// Marks `hash` and its descendants invalid and moves off them.
    pub fn invalidate_block(&self, hash: &Hash256) -> Result<(), ChainStateError> {
        let mut chain = self.chain_write()?;
        let mut coins = self.coins_lock()?;
        let mut pool = self.mempool_write()?;
        let id = chain
            .tree
            .get(hash)
            .ok_or(ChainStateError::UnknownBlock(*hash))?;
        if chain.tree.entry(id).prev.is_none() {
            return Err(invalid(*hash, "the genesis block cannot be invalidated"));
        }
        chain.tree.mark_failed(id);

        let mut disconnected = DisconnectedTransactions::default();
        while chain.active.contains(&chain.tree, id) {
            if let Err(err) = self.disconnect_tip(&mut chain, &mut coins, &mut disconnected) {
                return Err(self.reconcile_after_failure(
                    &chain,
                    &mut coins,
                    &mut pool,
                    disconnected,
                    err,
                ));
            }
        }
        let tip = chain.tip()?;
        chain.tree.restore_candidates(tip);
        self.update_mempool_for_reorg(&chain, &mut coins, &mut pool, disconnected)?;
        log_info!(
            "Invalidated block {}; tip is now height {}",
            hash256_to_hex(hash),
            chain.active.height()
        );
        self.activate_best_chain_locked(&mut chain, &mut coins, &mut pool)
    }

    /// Clears failure marks on `hash` and its relatives and re-selects the
    /// best chain.
    pub fn reconsider_block(&self, hash: &Hash256) -> Result<(), ChainStateError> {
        let mut chain = self.chain_write()?;
        let mut coins = self.coins_lock()?;
        let mut pool = self.mempool_write()?;
        let id = chain
            .tree
            .get(hash)
            .ok_or(ChainStateError::UnknownBlock(*hash))?;
        chain.tree.reconsider(id);
        self.activate_best_chain_locked(&mut chain, &mut coins, &mut pool)
    }

    pub fn accept_transaction(&self, tx: Transaction) -> Result<AcceptOutcome, ChainStateError> {
        self.accept_transaction_at(tx, None)
    }

    /// Admission with an explicit entry time, used when replaying a dump.
    pub fn accept_transaction_at(
        &self,
        tx: Transaction,
        accept_time: Option<i64>,
    ) -> Result<AcceptOutcome, ChainStateError> {
        let chain = self.chain_read()?;
        let tip = chain.tip()?;
        let tip_height = chain.active.height();
        let ctx = AcceptContext {
            accept_time,
            ..AcceptContext::new(
                &self.config.mempool,
                self.verifier.as_ref(),
                tip_height,
                chain.tree.median_time_past(tip),
            )
        };
        let mut coins = self.coins_lock()?;
        let mut pool = self.mempool_write()?;
        let outcome = accept_to_memory_pool(&mut pool, &mut *coins, Arc::new(tx), &ctx)?;
        pool.check(&mut *coins, tip_height + 1)?;
        Ok(outcome)
    }

    pub fn prioritise_transaction(&self, txid: Hash256, delta: Amount) -> Result<(), ChainStateError> {
        self.mempool_write()?.prioritise_transaction(txid, delta);
        Ok(())
    }

    /// Expires old mempool entries, trims to the size limit and flushes the
    /// coin cache once it outgrows its budget.
    pub fn maintenance(&self) -> Result<MaintenanceReport, ChainStateError> {
        let mut report = MaintenanceReport::default();
        let over_budget = {
            let mut coins = self.coins_lock()?;
            let mut pool = self.mempool_write()?;
            let cutoff = pool.now() - self.config.mempool.expiry_secs;
            report.expired = pool.expire(cutoff);
            let stale = pool.trim_to_size(self.config.mempool.max_mempool_bytes);
            report.trimmed_outpoints = stale.len();
            for outpoint in &stale {
                coins.uncache(outpoint);
            }
            coins.dynamic_memory_usage() > self.config.db_cache_bytes
        };
        if report.expired > 0 {
            log_debug!("Mempool: expired {} transactions", report.expired);
        }
        if over_budget {
            self.flush()?;
            report.flushed = true;
        }
        Ok(report)
    }

    /// Writes dirty block index entries and then the coin cache. After
    /// `MAX_FLUSH_FAILURES` consecutive failures the error becomes
    /// [`ChainStateError::FlushFailed`].
    pub fn flush(&self) -> Result<(), ChainStateError> {
        let result = {
            let mut chain = self.chain_write()?;
            let mut coins = self.coins_lock()?;
            self.flush_locked(&mut chain, &mut coins)
        };
        match result {
            Ok(()) => {
                self.flush_failures.store(0, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                let attempts = self.flush_failures.fetch_add(1, Ordering::SeqCst) + 1;
                log_error!("Flush failed ({attempts}/{MAX_FLUSH_FAILURES}): {err}");
                if attempts >= MAX_FLUSH_FAILURES {
                    return Err(ChainStateError::FlushFailed {
                        attempts,
                        last: err.to_string(),
                    });
                }
                Err(err)
            }
        }
    }

    fn flush_locked(
        &self,
        chain: &mut ChainIndex,
        coins: &mut CoinsCacheOf<S>,
    ) -> Result<(), ChainStateError> {
        let mut batch = WriteBatch::new();
        let entries = chain.tree.write_dirty(&mut batch);
        let tip = chain.tip()?;
        self.blocks
            .put_chain_tip(&mut batch, &chain.tree.entry(tip).hash);
        self.blocks.commit(&batch)?;
        chain.tree.mark_clean();

        let dirty = coins.dirty_count();
        coins.flush()?;
        log_debug!("Flushed {entries} block index entries and {dirty} coins");
        Ok(())
    }

    pub fn consecutive_flush_failures(&self) -> u32 {
        self.flush_failures.load(Ordering::SeqCst)
    }

    /// Writes the mempool to the configured dump file, if any.
    pub fn dump_mempool(&self) -> Result<usize, ChainStateError> {
        let Some(path) = &self.config.mempool_path else {
            return Ok(0);
        };
        let pool = self.mempool_read()?;
        Ok(persist::dump(&pool, path)?)
    }

    /// Replays the dump file through normal admission.
    pub fn load_mempool(&self) -> Result<LoadStats, ChainStateError> {
        let Some(path) = self.config.mempool_path.clone() else {
            return Ok(LoadStats::default());
        };
        let now = self.mempool_read()?.now();
        let mut loader = ControllerLoader { controller: self };
        Ok(persist::load(
            &path,
            now,
            self.config.mempool.expiry_secs,
            &mut loader,
        )?)
    }

    /// Dumps the mempool (when enabled) and flushes everything to the store.
    pub fn shutdown(&self) -> Result<(), ChainStateError> {
        let dumped = self.dump_mempool();
        if let Err(err) = &dumped {
            log_error!("Failed to dump mempool: {err}");
        }
        self.flush()?;
        dumped.map(|_| ())
    }

    pub fn status(&self) -> Result<ChainStatus, ChainStateError> {
        let chain = self.chain_read()?;
        let coins = self.coins_lock()?;
        let mut pool = self.mempool_write()?;
        let tip = chain.tree.entry(chain.tip()?);
        let best_header_height = chain
            .tree
            .best_header()
            .map(|id| chain.tree.entry(id).height)
            .unwrap_or(-1);
        Ok(ChainStatus {
            network: self.config.network.as_str(),
            tip_hash: hash256_to_hex(&tip.hash),
            tip_height: tip.height,
            chain_work: format!("{:x}", tip.chain_work),
            best_header_height,
            headers: chain.tree.len(),
            coins_cached: coins.cache_size(),
            coins_memory_bytes: coins.dynamic_memory_usage(),
            mempool_txs: pool.size(),
            mempool_bytes: pool.total_tx_size(),
            mempool_usage_bytes: pool.dynamic_memory_usage(),
            mempool_min_fee_per_kb: pool
                .get_min_fee(self.config.mempool.max_mempool_bytes)
                .sat_per_kb(),
        })
    }
}

struct ControllerLoader<'a, S: KeyValueStore> {
    controller: &'a ChainStateController<S>,
}

impl<S: KeyValueStore> MempoolLoader for ControllerLoader<'_, S> {
    fn prioritise(&mut self, txid: Hash256, delta: Amount) {
        if let Err(err) = self.controller.prioritise_transaction(txid, delta) {
            log_warn!("Failed to restore prioritisation: {err}");
        }
    }

    fn admit(&mut self, tx: Transaction, time: i64) -> Result<(), MempoolError> {
        match self.controller.accept_transaction_at(tx, Some(time)) {
            Ok(_) => Ok(()),
            Err(ChainStateError::Mempool(err)) => Err(err),
            Err(other) => Err(MempoolError::internal(other.to_string())),
        }
    }
}

fn invalid(hash: Hash256, reason: impl std::fmt::Display) -> ChainStateError {
    ChainStateError::InvalidBlock {
        hash,
        reason: reason.to_string(),
    }
}

fn unix_now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}
