//! The transaction pool: entries, spend links and the three score indices.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::mem::size_of;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ledgerd_chainstate::validation::check_tx_inputs;
use ledgerd_chainstate::{CoinsCache, CoinsError, CoinsView};
use ledgerd_consensus::constants::COINBASE_MATURITY;
use ledgerd_consensus::money::Amount;
use ledgerd_consensus::{hash256_to_hex, Hash256};
use ledgerd_log::{log_debug, log_trace, log_warn};
use ledgerd_primitives::outpoint::OutPoint;
use ledgerd_primitives::transaction::Transaction;

use crate::entry::{MempoolEntry, MEMPOOL_HEIGHT};
use crate::error::{MempoolError, MempoolErrorKind};
use crate::policy::{FeeRate, MempoolLimits, MempoolPolicy, MAX_PRIORITISATION_DELTA};

/// Half-life of the rolling minimum fee once a block has been seen.
pub const ROLLING_FEE_HALFLIFE: i64 = 60 * 60 * 12;

/// Upper bound on packages evicted by one `trim_to_size` call.
pub const MAX_ITERATIONS_PER_TRIM: usize = 1000;

/// Packages with more ancestors than this must pay the package fee floor.
pub const PACKAGE_ANCESTOR_THRESHOLD: usize = 6;

/// Number of recent eviction rates the rolling minimum fee is smoothed over.
const RECENT_REMOVED_HISTORY: usize = 16;

/// One eviction may at most double the rolling minimum fee.
const MAX_BUMP_FACTOR: f64 = 2.0;

/// In-pool ancestors of an entry, the entry itself excluded.
pub type AncestorSet = BTreeSet<Hash256>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RemovalReason {
    Unknown,
    Expiry,
    SizeLimit,
    Reorg,
    Block,
    Conflict,
    Replaced,
}

impl RemovalReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Expiry => "expiry",
            Self::SizeLimit => "sizelimit",
            Self::Reorg => "reorg",
            Self::Block => "block",
            Self::Conflict => "conflict",
            Self::Replaced => "replaced",
        }
    }
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary handed to relay and RPC callers.
#[derive(Clone, Debug)]
pub struct TxMempoolInfo {
    pub tx: Arc<Transaction>,
    pub time: i64,
    pub fee_rate: FeeRate,
    pub fee_delta: Amount,
}

fn compare_rates(fee_a: Amount, size_a: u64, fee_b: Amount, size_b: u64) -> Ordering {
    let left = i128::from(fee_a).saturating_mul(i128::from(size_b));
    let right = i128::from(fee_b).saturating_mul(i128::from(size_a));
    left.cmp(&right)
}

/// Eviction order: lowest of `max(own rate, descendant package rate)` first.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct DescendantScore {
    fee: Amount,
    size: u64,
    time: i64,
    txid: Hash256,
}

impl DescendantScore {
    fn of(entry: &MempoolEntry) -> Self {
        let use_descendants = compare_rates(
            entry.mod_fees_with_descendants(),
            entry.size_with_descendants(),
            entry.modified_fee(),
            entry.size(),
        ) == Ordering::Greater;
        let (fee, size) = if use_descendants {
            (entry.mod_fees_with_descendants(), entry.size_with_descendants())
        } else {
            (entry.modified_fee(), entry.size())
        };
        Self {
            fee,
            size,
            time: entry.time(),
            txid: entry.txid(),
        }
    }
}

impl Ord for DescendantScore {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_rates(self.fee, self.size, other.fee, other.size)
            .then_with(|| other.time.cmp(&self.time))
            .then_with(|| self.txid.cmp(&other.txid))
    }
}

impl PartialOrd for DescendantScore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Mining order: highest of `min(own rate, ancestor package rate)` first.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct AncestorScore {
    fee: Amount,
    size: u64,
    txid: Hash256,
}

impl AncestorScore {
    fn of(entry: &MempoolEntry) -> Self {
        let use_ancestors = compare_rates(
            entry.modified_fee(),
            entry.size_with_ancestors(),
            entry.mod_fees_with_ancestors(),
            entry.size(),
        ) == Ordering::Greater;
        let (fee, size) = if use_ancestors {
            (entry.mod_fees_with_ancestors(), entry.size_with_ancestors())
        } else {
            (entry.modified_fee(), entry.size())
        };
        Self {
            fee,
            size,
            txid: entry.txid(),
        }
    }
}

impl Ord for AncestorScore {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_rates(other.fee, other.size, self.fee, self.size)
            .then_with(|| self.txid.cmp(&other.txid))
    }
}

impl PartialOrd for AncestorScore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone, Debug, Default)]
struct TxLinks {
    parents: BTreeSet<Hash256>,
    children: BTreeSet<Hash256>,
}

const LINK_USAGE: usize = size_of::<Hash256>() + 4 * size_of::<usize>();
const ENTRY_OVERHEAD: usize = size_of::<MempoolEntry>()
    + size_of::<DescendantScore>()
    + size_of::<AncestorScore>()
    + size_of::<(i64, Hash256)>()
    + size_of::<TxLinks>()
    + 12 * size_of::<usize>();
const SPENT_USAGE: usize = size_of::<OutPoint>() + size_of::<Hash256>() + 4 * size_of::<usize>();
const DELTA_USAGE: usize = size_of::<Hash256>() + size_of::<Amount>() + 4 * size_of::<usize>();

pub struct Mempool {
    entries: HashMap<Hash256, MempoolEntry>,
    links: HashMap<Hash256, TxLinks>,
    by_descendant_score: BTreeSet<DescendantScore>,
    by_entry_time: BTreeSet<(i64, Hash256)>,
    by_ancestor_score: BTreeSet<AncestorScore>,
    spent: BTreeMap<OutPoint, Hash256>,
    deltas: HashMap<Hash256, Amount>,
    total_tx_size: u64,
    cached_inner_usage: usize,
    transactions_updated: u64,
    rolling_minimum_fee_rate: f64,
    recent_removed_rates: VecDeque<f64>,
    last_rolling_fee_update: i64,
    block_since_last_rolling_fee_bump: bool,
    incremental_relay_fee: FeeRate,
    check_ratio: f64,
    mock_time: Option<i64>,
}

impl Mempool {
    pub fn new(policy: &MempoolPolicy) -> Self {
        Self {
            entries: HashMap::new(),
            links: HashMap::new(),
            by_descendant_score: BTreeSet::new(),
            by_entry_time: BTreeSet::new(),
            by_ancestor_score: BTreeSet::new(),
            spent: BTreeMap::new(),
            deltas: HashMap::new(),
            total_tx_size: 0,
            cached_inner_usage: 0,
            transactions_updated: 0,
            rolling_minimum_fee_rate: 0.0,
            recent_removed_rates: VecDeque::with_capacity(RECENT_REMOVED_HISTORY + 1),
            last_rolling_fee_update: now_secs(),
            block_since_last_rolling_fee_bump: false,
            incremental_relay_fee: policy.incremental_relay_fee,
            check_ratio: policy.check_ratio,
            mock_time: None,
        }
    }

    /// Pins the pool clock; `None` returns to wall-clock time.
    pub fn set_mock_time(&mut self, time: Option<i64>) {
        self.mock_time = time;
    }

    pub fn now(&self) -> i64 {
        self.mock_time.unwrap_or_else(now_secs)
    }

    pub fn incremental_relay_fee(&self) -> FeeRate {
        self.incremental_relay_fee
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_tx_size(&self) -> u64 {
        self.total_tx_size
    }

    pub fn transactions_updated(&self) -> u64 {
        self.transactions_updated
    }

    pub fn add_transactions_updated(&mut self, count: u64) {
        self.transactions_updated = self.transactions_updated.saturating_add(count);
    }

    pub fn exists(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<Arc<Transaction>> {
        self.entries.get(txid).map(|entry| Arc::clone(entry.tx()))
    }

    pub fn entry(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn entries(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.entries.values()
    }

    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.spent.contains_key(outpoint)
    }

    pub fn spender(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.spent.get(outpoint).copied()
    }

    pub fn parents(&self, txid: &Hash256) -> Option<&BTreeSet<Hash256>> {
        self.links.get(txid).map(|links| &links.parents)
    }

    pub fn children(&self, txid: &Hash256) -> Option<&BTreeSet<Hash256>> {
        self.links.get(txid).map(|links| &links.children)
    }

    pub fn dynamic_memory_usage(&self) -> usize {
        self.entries.len() * ENTRY_OVERHEAD
            + self.spent.len() * SPENT_USAGE
            + self.deltas.len() * DELTA_USAGE
            + self.cached_inner_usage
    }

    /// Entries ordered for block assembly, best ancestor package first.
    pub fn iter_by_ancestor_score(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.by_ancestor_score
            .iter()
            .filter_map(|key| self.entries.get(&key.txid))
    }

    /// Entries ordered for eviction, worst descendant package first.
    pub fn iter_by_descendant_score(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.by_descendant_score
            .iter()
            .filter_map(|key| self.entries.get(&key.txid))
    }

    pub fn calculate_ancestors(
        &self,
        entry: &MempoolEntry,
        limits: &MempoolLimits,
    ) -> Result<AncestorSet, MempoolError> {
        let mut stage: BTreeSet<Hash256> = BTreeSet::new();
        match self.links.get(&entry.txid()) {
            Some(links) => stage.extend(links.parents.iter().copied()),
            None => {
                for input in &entry.tx().vin {
                    if self.entries.contains_key(&input.prevout.hash) {
                        stage.insert(input.prevout.hash);
                        if stage.len() as u64 + 1 > limits.ancestor_count {
                            return Err(chain_error(format!(
                                "too many unconfirmed parents [limit: {}]",
                                limits.ancestor_count
                            )));
                        }
                    }
                }
            }
        }

        let mut ancestors = AncestorSet::new();
        let mut total_size = entry.size();
        let mut total_fees = entry.modified_fee();
        while let Some(txid) = stage.pop_first() {
            ancestors.insert(txid);
            let Some(ancestor) = self.entries.get(&txid) else {
                return Err(MempoolError::internal("ancestor link to missing entry"));
            };
            total_size = total_size.saturating_add(ancestor.size());
            total_fees = total_fees.saturating_add(ancestor.modified_fee());
            if ancestor.size_with_descendants().saturating_add(entry.size())
                > limits.descendant_size
            {
                return Err(chain_error(format!(
                    "exceeds descendant size limit for tx {} [limit: {}]",
                    hash256_to_hex(&txid),
                    limits.descendant_size
                )));
            }
            if ancestor.count_with_descendants().saturating_add(1) > limits.descendant_count {
                return Err(chain_error(format!(
                    "too many descendants for tx {} [limit: {}]",
                    hash256_to_hex(&txid),
                    limits.descendant_count
                )));
            }
            if total_size > limits.ancestor_size {
                return Err(chain_error(format!(
                    "exceeds ancestor size limit [limit: {}]",
                    limits.ancestor_size
                )));
            }
            if let Some(links) = self.links.get(&txid) {
                for parent in &links.parents {
                    if !ancestors.contains(parent) {
                        stage.insert(*parent);
                    }
                    if (stage.len() + ancestors.len()) as u64 + 1 > limits.ancestor_count {
                        return Err(chain_error(format!(
                            "too many unconfirmed ancestors [limit: {}]",
                            limits.ancestor_count
                        )));
                    }
                }
            }
        }

        if !limits.is_unlimited() && ancestors.len() > PACKAGE_ANCESTOR_THRESHOLD {
            let floor = self.package_fee_floor();
            let package_rate = FeeRate::new(total_fees, total_size as usize);
            if package_rate < floor {
                return Err(chain_error(format!(
                    "package feerate too low: {package_rate} < {floor} (ancestors={})",
                    ancestors.len()
                )));
            }
        }
        Ok(ancestors)
    }

    /// Fee rate a deep package must pay: the incremental relay fee or the
    /// current rolling minimum, whichever is higher. Does not apply decay.
    fn package_fee_floor(&self) -> FeeRate {
        FeeRate::from_sat_per_kb(self.rolling_minimum_fee_rate.round() as Amount)
            .max(self.incremental_relay_fee)
    }

    /// Inserts `entry` with precomputed `ancestors`. The caller has already
    /// checked limits and conflicts.
    pub fn add_unchecked(&mut self, mut entry: MempoolEntry, ancestors: &AncestorSet) {
        let txid = entry.txid();
        if let Some(delta) = self.deltas.get(&txid) {
            entry.set_fee_delta(*delta);
        }

        let mut parents = BTreeSet::new();
        for input in &entry.tx().vin {
            self.spent.insert(input.prevout, txid);
            if self.entries.contains_key(&input.prevout.hash) {
                parents.insert(input.prevout.hash);
            }
        }
        for parent in &parents {
            if let Some(links) = self.links.get_mut(parent) {
                links.children.insert(txid);
            }
        }
        self.cached_inner_usage += parents.len() * 2 * LINK_USAGE;

        let size = entry.size() as i64;
        let mod_fee = entry.modified_fee();
        let (mut anc_size, mut anc_fee, mut anc_count, mut anc_sigops) = (0i64, 0i64, 0i64, 0i64);
        for ancestor in ancestors {
            self.modify_entry(ancestor, |ancestor| {
                ancestor.update_descendant_state(size, mod_fee, 1);
            });
            if let Some(ancestor) = self.entries.get(ancestor) {
                anc_size += ancestor.size() as i64;
                anc_fee = anc_fee.saturating_add(ancestor.modified_fee());
                anc_count += 1;
                anc_sigops += ancestor.sigops() as i64;
            }
        }
        entry.update_ancestor_state(anc_size, anc_fee, anc_count, anc_sigops);

        self.total_tx_size += entry.size();
        self.cached_inner_usage += entry.usage();
        self.by_descendant_score.insert(DescendantScore::of(&entry));
        self.by_ancestor_score.insert(AncestorScore::of(&entry));
        self.by_entry_time.insert((entry.time(), txid));
        self.links.insert(
            txid,
            TxLinks {
                parents,
                children: BTreeSet::new(),
            },
        );
        self.entries.insert(txid, entry);
        self.transactions_updated += 1;
    }

    /// Removes the transaction (or, when it is not pooled, the in-pool
    /// spenders of its outputs) together with every descendant.
    pub fn remove_recursive(
        &mut self,
        tx: &Transaction,
        reason: RemovalReason,
    ) -> Vec<MempoolEntry> {
        let txid = tx.txid();
        let mut roots = BTreeSet::new();
        if self.entries.contains_key(&txid) {
            roots.insert(txid);
        } else {
            for index in 0..tx.vout.len() {
                if let Some(spender) = self.spent.get(&OutPoint::new(txid, index as u32)) {
                    roots.insert(*spender);
                }
            }
        }
        let mut stage = BTreeSet::new();
        for root in roots {
            self.collect_descendants(&root, &mut stage);
        }
        self.remove_staged(&stage, false, reason)
    }

    /// Drops a connected block's transactions and everything conflicting
    /// with them. Returns the conflicted entries.
    pub fn remove_for_block(&mut self, txs: &[Transaction], height: i32) -> Vec<MempoolEntry> {
        let mut conflicted = Vec::new();
        let mut confirmed = 0usize;
        for tx in txs {
            let txid = tx.txid();
            if self.entries.contains_key(&txid) {
                let stage = BTreeSet::from([txid]);
                confirmed += self.remove_staged(&stage, true, RemovalReason::Block).len();
            }
            conflicted.extend(self.remove_conflicts(tx));
            self.clear_prioritisation(&txid);
        }
        self.last_rolling_fee_update = self.now();
        self.block_since_last_rolling_fee_bump = true;
        if confirmed > 0 || !conflicted.is_empty() {
            log_debug!(
                "mempool: block {height} confirmed {confirmed} and conflicted {} transactions",
                conflicted.len()
            );
        }
        conflicted
    }

    fn remove_conflicts(&mut self, tx: &Transaction) -> Vec<MempoolEntry> {
        let txid = tx.txid();
        let mut removed = Vec::new();
        for input in &tx.vin {
            let Some(spender) = self.spent.get(&input.prevout).copied() else {
                continue;
            };
            if spender == txid {
                continue;
            }
            if let Some(conflict) = self.get(&spender) {
                removed.extend(self.remove_recursive(&conflict, RemovalReason::Conflict));
                self.clear_prioritisation(&spender);
            }
        }
        removed
    }

    /// Evicts the worst descendant packages until usage fits `limit`.
    /// Returns prevouts no remaining entry spends and no pool transaction
    /// creates, so the caller can drop them from its coin cache.
    pub fn trim_to_size(&mut self, limit: usize) -> Vec<OutPoint> {
        self.trim_with_cap(limit, MAX_ITERATIONS_PER_TRIM)
    }

    fn trim_with_cap(&mut self, limit: usize, max_iterations: usize) -> Vec<OutPoint> {
        let mut no_spends_remaining = Vec::new();
        let mut removed_count = 0usize;
        let mut max_rate_removed = FeeRate::ZERO;
        let mut iterations = 0usize;
        while !self.entries.is_empty()
            && self.dynamic_memory_usage() > limit
            && iterations < max_iterations
        {
            iterations += 1;
            let Some(worst) = self.by_descendant_score.first().copied() else {
                break;
            };
            let Some(entry) = self.entries.get(&worst.txid) else {
                break;
            };
            let removed_rate = FeeRate::new(
                entry.mod_fees_with_descendants(),
                entry.size_with_descendants() as usize,
            )
            .saturating_add(self.incremental_relay_fee);
            self.track_package_removed(removed_rate);
            max_rate_removed = max_rate_removed.max(removed_rate);

            let stage = self.calculate_descendants(&worst.txid);
            let removed = self.remove_staged(&stage, false, RemovalReason::SizeLimit);
            removed_count += removed.len();
            for entry in &removed {
                for input in &entry.tx().vin {
                    if self.entries.contains_key(&input.prevout.hash) {
                        continue;
                    }
                    if !self.spent.contains_key(&input.prevout) {
                        no_spends_remaining.push(input.prevout);
                    }
                }
            }
        }
        if removed_count > 0 {
            log_debug!(
                "mempool: removed {removed_count} transactions ({max_rate_removed} minimum fee rate)"
            );
        }
        if iterations >= max_iterations && self.dynamic_memory_usage() > limit {
            log_warn!(
                "mempool: trim stopped after {iterations} packages, usage {} above {limit} bytes",
                self.dynamic_memory_usage()
            );
        }
        no_spends_remaining
    }

    /// Folds an evicted package's rate into the rolling minimum fee. The
    /// bump follows the 75th percentile of recent evictions, is capped at
    /// twice the current floor, and needs at least two evictions on record.
    fn track_package_removed(&mut self, rate: FeeRate) {
        let rate = rate.sat_per_kb() as f64;
        self.recent_removed_rates.push_back(rate);
        if self.recent_removed_rates.len() > RECENT_REMOVED_HISTORY {
            self.recent_removed_rates.pop_front();
        }

        let mut sorted: Vec<f64> = self.recent_removed_rates.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let index = (sorted.len() * 75 / 100).min(sorted.len().saturating_sub(1));
        let percentile = sorted.get(index).copied().unwrap_or(rate);

        let current = self.rolling_minimum_fee_rate;
        let mut bumped = current.max(percentile);
        if current > 0.0 && bumped > current * MAX_BUMP_FACTOR {
            bumped = current * MAX_BUMP_FACTOR;
            log_debug!("mempool: clamped fee bump to {bumped} (from {percentile})");
        }
        if self.recent_removed_rates.len() >= 2 && bumped > current {
            self.rolling_minimum_fee_rate = bumped;
            self.block_since_last_rolling_fee_bump = false;
        }
    }

    /// Removes entries that entered before `cutoff`, with their descendants.
    pub fn expire(&mut self, cutoff: i64) -> usize {
        let expired: Vec<Hash256> = self
            .by_entry_time
            .iter()
            .take_while(|(time, _)| *time < cutoff)
            .map(|(_, txid)| *txid)
            .collect();
        let mut stage = BTreeSet::new();
        for txid in &expired {
            self.collect_descendants(txid, &mut stage);
        }
        let removed = self.remove_staged(&stage, false, RemovalReason::Expiry).len();
        if removed > 0 {
            log_debug!("mempool: expired {removed} transactions");
        }
        removed
    }

    /// Minimum fee rate for admission while usage is bounded by `size_limit`.
    pub fn get_min_fee(&mut self, size_limit: usize) -> FeeRate {
        if !self.block_since_last_rolling_fee_bump || self.rolling_minimum_fee_rate == 0.0 {
            return FeeRate::from_sat_per_kb(self.rolling_minimum_fee_rate.round() as Amount);
        }
        let now = self.now();
        if now > self.last_rolling_fee_update + 10 {
            let mut halflife = ROLLING_FEE_HALFLIFE as f64;
            let usage = self.dynamic_memory_usage();
            if usage < size_limit / 4 {
                halflife /= 4.0;
            } else if usage < size_limit / 2 {
                halflife /= 2.0;
            }
            let elapsed = (now - self.last_rolling_fee_update) as f64;
            self.rolling_minimum_fee_rate /= 2f64.powf(elapsed / halflife);
            self.last_rolling_fee_update = now;
            if self.rolling_minimum_fee_rate < self.incremental_relay_fee.sat_per_kb() as f64 / 2.0
            {
                self.rolling_minimum_fee_rate = 0.0;
                return FeeRate::ZERO;
            }
        }
        FeeRate::from_sat_per_kb(self.rolling_minimum_fee_rate.round() as Amount)
            .max(self.incremental_relay_fee)
    }

    pub fn prioritise_transaction(&mut self, txid: Hash256, delta: Amount) {
        let total = {
            let slot = self.deltas.entry(txid).or_insert(0);
            let sum = i128::from(*slot) + i128::from(delta);
            *slot = sum.clamp(i128::from(Amount::MIN), i128::from(MAX_PRIORITISATION_DELTA))
                as Amount;
            *slot
        };
        if let Some(entry) = self.entries.get(&txid) {
            let change = total.saturating_sub(entry.fee_delta());
            self.modify_entry(&txid, |entry| entry.set_fee_delta(total));
            for ancestor in self.ancestors_of(&txid) {
                self.modify_entry(&ancestor, |ancestor| {
                    ancestor.update_descendant_state(0, change, 0);
                });
            }
            let mut descendants = self.calculate_descendants(&txid);
            descendants.remove(&txid);
            for descendant in descendants {
                self.modify_entry(&descendant, |descendant| {
                    descendant.update_ancestor_state(0, change, 0, 0);
                });
            }
            self.transactions_updated += 1;
        }
        log_debug!(
            "mempool: prioritised {} by {delta} (total delta {total})",
            hash256_to_hex(&txid)
        );
    }

    pub fn apply_delta(&self, txid: &Hash256) -> Amount {
        self.deltas.get(txid).copied().unwrap_or(0)
    }

    pub fn clear_prioritisation(&mut self, txid: &Hash256) {
        self.deltas.remove(txid);
    }

    pub fn prioritisations(&self) -> impl Iterator<Item = (&Hash256, &Amount)> {
        self.deltas.iter()
    }

    /// Pooled txids, parents before children, then by fee rate.
    pub fn query_hashes(&self) -> Vec<Hash256> {
        self.sorted_by_depth_and_score()
            .into_iter()
            .map(|entry| entry.txid())
            .collect()
    }

    pub fn info(&self, txid: &Hash256) -> Option<TxMempoolInfo> {
        self.entries.get(txid).map(info_for)
    }

    pub fn info_all(&self) -> Vec<TxMempoolInfo> {
        self.sorted_by_depth_and_score()
            .into_iter()
            .map(info_for)
            .collect()
    }

    fn sorted_by_depth_and_score(&self) -> Vec<&MempoolEntry> {
        let mut entries: Vec<&MempoolEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            a.count_with_ancestors()
                .cmp(&b.count_with_ancestors())
                .then_with(|| compare_rates(b.modified_fee(), b.size(), a.modified_fee(), a.size()))
                .then_with(|| b.txid().cmp(&a.txid()))
        });
        entries
    }

    /// `txid` and every in-pool descendant.
    pub fn calculate_descendants(&self, txid: &Hash256) -> BTreeSet<Hash256> {
        let mut out = BTreeSet::new();
        self.collect_descendants(txid, &mut out);
        out
    }

    fn collect_descendants(&self, txid: &Hash256, out: &mut BTreeSet<Hash256>) {
        if !self.entries.contains_key(txid) || out.contains(txid) {
            return;
        }
        let mut stage = vec![*txid];
        while let Some(next) = stage.pop() {
            if !out.insert(next) {
                continue;
            }
            if let Some(links) = self.links.get(&next) {
                stage.extend(links.children.iter().filter(|child| !out.contains(*child)));
            }
        }
    }

    /// Ancestors reachable over parent links, `txid` excluded.
    fn ancestors_of(&self, txid: &Hash256) -> BTreeSet<Hash256> {
        let mut out = BTreeSet::new();
        let mut stage: Vec<Hash256> = self
            .links
            .get(txid)
            .map(|links| links.parents.iter().copied().collect())
            .unwrap_or_default();
        while let Some(next) = stage.pop() {
            if !out.insert(next) {
                continue;
            }
            if let Some(links) = self.links.get(&next) {
                stage.extend(links.parents.iter().filter(|parent| !out.contains(*parent)));
            }
        }
        out
    }

    pub fn has_no_inputs_of(&self, tx: &Transaction) -> bool {
        tx.vin
            .iter()
            .all(|input| !self.entries.contains_key(&input.prevout.hash))
    }

    pub fn transaction_within_chain_limit(&self, txid: &Hash256, limit: u64) -> bool {
        match self.entries.get(txid) {
            Some(entry) => {
                entry.count_with_ancestors() < limit && entry.count_with_descendants() < limit
            }
            None => true,
        }
    }

    /// After a reorg to `tip_height`, drops entries that are no longer final
    /// and entries spending coinbase outputs that are missing or immature at
    /// the next block.
    pub fn remove_for_reorg<V, F>(
        &mut self,
        coins: &mut CoinsCache<V>,
        tip_height: i32,
        mut is_final: F,
    ) -> Result<usize, CoinsError>
    where
        V: CoinsView,
        F: FnMut(&MempoolEntry) -> bool,
    {
        let spend_height = tip_height + 1;
        let mut doomed = Vec::new();
        for entry in self.entries.values() {
            if !is_final(entry) {
                doomed.push(entry.txid());
                continue;
            }
            if !entry.spends_coinbase() {
                continue;
            }
            for input in &entry.tx().vin {
                if self.entries.contains_key(&input.prevout.hash) {
                    continue;
                }
                let immature = match coins.access_coin(&input.prevout)? {
                    None => true,
                    Some(coin) => {
                        coin.is_coinbase
                            && spend_height - (coin.height as i32) < COINBASE_MATURITY
                    }
                };
                if immature {
                    doomed.push(entry.txid());
                    break;
                }
            }
        }
        let mut stage = BTreeSet::new();
        for txid in &doomed {
            self.collect_descendants(txid, &mut stage);
        }
        Ok(self.remove_staged(&stage, false, RemovalReason::Reorg).len())
    }

    /// Re-links pooled children of transactions re-added from disconnected
    /// blocks (`txids` in block order) and folds the new descendants into the
    /// aggregates.
    pub fn update_transactions_from_block(&mut self, txids: &[Hash256]) {
        let already_included: BTreeSet<Hash256> = txids.iter().copied().collect();
        for txid in txids.iter().rev() {
            if !self.entries.contains_key(txid) {
                continue;
            }
            let children: BTreeSet<Hash256> = self
                .spent
                .range(OutPoint::new(*txid, 0)..=OutPoint::new(*txid, u32::MAX))
                .map(|(_, child)| *child)
                .filter(|child| !already_included.contains(child))
                .collect();
            for child in &children {
                let mut inserted = false;
                if let Some(links) = self.links.get_mut(txid) {
                    inserted = links.children.insert(*child);
                }
                if let Some(links) = self.links.get_mut(child) {
                    links.parents.insert(*txid);
                }
                if inserted {
                    self.cached_inner_usage += 2 * LINK_USAGE;
                }
            }
            self.update_for_descendants(txid, &already_included);
        }
    }

    fn update_for_descendants(&mut self, txid: &Hash256, exclude: &BTreeSet<Hash256>) {
        let Some(entry) = self.entries.get(txid) else {
            return;
        };
        let (size, mod_fee, sigops) = (
            entry.size() as i64,
            entry.modified_fee(),
            entry.sigops() as i64,
        );
        let mut descendants = self.calculate_descendants(txid);
        descendants.remove(txid);
        let (mut add_size, mut add_fee, mut add_count) = (0i64, 0i64, 0i64);
        for descendant in descendants.difference(exclude) {
            if let Some(entry) = self.entries.get(descendant) {
                add_size += entry.size() as i64;
                add_fee = add_fee.saturating_add(entry.modified_fee());
                add_count += 1;
            }
            self.modify_entry(descendant, |entry| {
                entry.update_ancestor_state(size, mod_fee, 1, sigops);
            });
        }
        self.modify_entry(txid, |entry| {
            entry.update_descendant_state(add_size, add_fee, add_count);
        });
    }

    /// Removes `stage`, which must be closed under descendants unless
    /// `update_descendants` is set.
    pub fn remove_staged(
        &mut self,
        stage: &BTreeSet<Hash256>,
        update_descendants: bool,
        reason: RemovalReason,
    ) -> Vec<MempoolEntry> {
        self.update_for_remove(stage, update_descendants);
        stage
            .iter()
            .filter_map(|txid| self.remove_unchecked(txid, reason))
            .collect()
    }

    fn update_for_remove(&mut self, stage: &BTreeSet<Hash256>, update_descendants: bool) {
        if update_descendants {
            for txid in stage {
                let Some(entry) = self.entries.get(txid) else {
                    continue;
                };
                let (size, mod_fee, sigops) = (
                    -(entry.size() as i64),
                    -entry.modified_fee(),
                    -(entry.sigops() as i64),
                );
                let mut descendants = self.calculate_descendants(txid);
                descendants.remove(txid);
                for descendant in descendants {
                    self.modify_entry(&descendant, |entry| {
                        entry.update_ancestor_state(size, mod_fee, -1, sigops);
                    });
                }
            }
        }
        for txid in stage {
            let Some(entry) = self.entries.get(txid) else {
                continue;
            };
            let (size, mod_fee) = (-(entry.size() as i64), -entry.modified_fee());
            for ancestor in self.ancestors_of(txid) {
                self.modify_entry(&ancestor, |entry| {
                    entry.update_descendant_state(size, mod_fee, -1);
                });
            }
        }
        for txid in stage {
            let Some(links) = self.links.get(txid) else {
                continue;
            };
            let parents: Vec<Hash256> = links.parents.iter().copied().collect();
            let children: Vec<Hash256> = links.children.iter().copied().collect();
            for parent in parents {
                self.unlink(&parent, txid);
            }
            for child in children {
                self.unlink(txid, &child);
            }
        }
    }

    fn unlink(&mut self, parent: &Hash256, child: &Hash256) {
        let mut removed = false;
        if let Some(links) = self.links.get_mut(parent) {
            removed |= links.children.remove(child);
        }
        if let Some(links) = self.links.get_mut(child) {
            removed |= links.parents.remove(parent);
        }
        if removed {
            self.cached_inner_usage = self.cached_inner_usage.saturating_sub(2 * LINK_USAGE);
        }
    }

    fn remove_unchecked(&mut self, txid: &Hash256, reason: RemovalReason) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        self.by_descendant_score.remove(&DescendantScore::of(&entry));
        self.by_ancestor_score.remove(&AncestorScore::of(&entry));
        self.by_entry_time.remove(&(entry.time(), *txid));
        self.links.remove(txid);
        for input in &entry.tx().vin {
            if self.spent.get(&input.prevout) == Some(txid) {
                self.spent.remove(&input.prevout);
            }
        }
        self.total_tx_size = self.total_tx_size.saturating_sub(entry.size());
        self.cached_inner_usage = self.cached_inner_usage.saturating_sub(entry.usage());
        self.transactions_updated += 1;
        log_trace!("mempool: removed {} ({reason})", hash256_to_hex(txid));
        Some(entry)
    }

    fn modify_entry<F: FnOnce(&mut MempoolEntry)>(&mut self, txid: &Hash256, update: F) {
        let Some(entry) = self.entries.get_mut(txid) else {
            return;
        };
        self.by_descendant_score.remove(&DescendantScore::of(entry));
        self.by_ancestor_score.remove(&AncestorScore::of(entry));
        self.by_entry_time.remove(&(entry.time(), *txid));
        update(entry);
        self.by_descendant_score.insert(DescendantScore::of(entry));
        self.by_ancestor_score.insert(AncestorScore::of(entry));
        self.by_entry_time.insert((entry.time(), *txid));
    }

    /// Runs [`Mempool::check_structure`] plus an input check against `coins`
    /// on the configured fraction of calls.
    pub fn check<V: CoinsView>(
        &self,
        coins: &mut CoinsCache<V>,
        spend_height: i32,
    ) -> Result<(), MempoolError> {
        if self.check_ratio <= 0.0 {
            return Ok(());
        }
        if self.check_ratio < 1.0 && rand::random::<f64>() >= self.check_ratio {
            return Ok(());
        }
        log_debug!(
            "mempool: checking {} transactions spending {} outputs",
            self.entries.len(),
            self.spent.len()
        );
        self.check_structure()?;

        let mut ordered: Vec<&MempoolEntry> = self.entries.values().collect();
        ordered.sort_by_key(|entry| entry.count_with_ancestors());
        let mut view = CoinsCache::new(&mut *coins);
        for entry in ordered {
            let fee = check_tx_inputs(entry.tx(), &mut view, spend_height).map_err(|err| {
                MempoolError::internal(format!(
                    "pooled tx {} fails input checks: {err}",
                    hash256_to_hex(&entry.txid())
                ))
            })?;
            if fee != entry.fee() {
                return Err(MempoolError::internal("pooled fee differs from inputs"));
            }
            for input in &entry.tx().vin {
                view.spend_coin(&input.prevout)?;
            }
            view.add_coins(entry.tx(), entry.txid(), MEMPOOL_HEIGHT, false)?;
        }
        Ok(())
    }

    /// Verifies links, the spend map, every aggregate and the totals.
    pub fn check_structure(&self) -> Result<(), MempoolError> {
        let mut total_size = 0u64;
        for (txid, entry) in &self.entries {
            total_size += entry.size();
            let links = self
                .links
                .get(txid)
                .ok_or_else(|| MempoolError::internal("entry without links"))?;
            let mut parents = BTreeSet::new();
            for input in &entry.tx().vin {
                if self.entries.contains_key(&input.prevout.hash) {
                    parents.insert(input.prevout.hash);
                }
                if self.spent.get(&input.prevout) != Some(txid) {
                    return Err(MempoolError::internal("spend map misses a pooled input"));
                }
            }
            if parents != links.parents {
                return Err(MempoolError::internal("parent links disagree with inputs"));
            }
            let children: BTreeSet<Hash256> = self
                .spent
                .range(OutPoint::new(*txid, 0)..=OutPoint::new(*txid, u32::MAX))
                .map(|(_, child)| *child)
                .collect();
            if children != links.children {
                return Err(MempoolError::internal("child links disagree with spends"));
            }

            let ancestors = self.ancestors_of(txid);
            let mut size = entry.size();
            let mut fees = entry.modified_fee();
            let mut sigops = entry.sigops();
            for ancestor in &ancestors {
                let ancestor = self
                    .entries
                    .get(ancestor)
                    .ok_or_else(|| MempoolError::internal("ancestor missing"))?;
                size += ancestor.size();
                fees += ancestor.modified_fee();
                sigops += ancestor.sigops();
            }
            if entry.count_with_ancestors() != ancestors.len() as u64 + 1
                || entry.size_with_ancestors() != size
                || entry.mod_fees_with_ancestors() != fees
                || entry.sigops_with_ancestors() != sigops
            {
                return Err(MempoolError::internal(format!(
                    "ancestor aggregates of {} are stale",
                    hash256_to_hex(txid)
                )));
            }

            let descendants = self.calculate_descendants(txid);
            let mut size = 0u64;
            let mut fees = 0i64;
            for descendant in &descendants {
                let descendant = self
                    .entries
                    .get(descendant)
                    .ok_or_else(|| MempoolError::internal("descendant missing"))?;
                size += descendant.size();
                fees += descendant.modified_fee();
            }
            if entry.count_with_descendants() != descendants.len() as u64
                || entry.size_with_descendants() != size
                || entry.mod_fees_with_descendants() != fees
            {
                return Err(MempoolError::internal(format!(
                    "descendant aggregates of {} are stale",
                    hash256_to_hex(txid)
                )));
            }
        }
        for (outpoint, spender) in &self.spent {
            let spends = self
                .entries
                .get(spender)
                .is_some_and(|entry| entry.tx().vin.iter().any(|input| input.prevout == *outpoint));
            if !spends {
                return Err(MempoolError::internal("spend map points at a non-spender"));
            }
        }
        if total_size != self.total_tx_size {
            return Err(MempoolError::internal("total size mismatch"));
        }
        let len = self.entries.len();
        if self.links.len() != len
            || self.by_descendant_score.len() != len
            || self.by_ancestor_score.len() != len
            || self.by_entry_time.len() != len
        {
            return Err(MempoolError::internal("index sizes disagree"));
        }
        Ok(())
    }
}

fn chain_error(message: String) -> MempoolError {
    MempoolError::new(MempoolErrorKind::TooLongMempoolChain, message)
}

fn info_for(entry: &MempoolEntry) -> TxMempoolInfo {
    TxMempoolInfo {
        tx: Arc::clone(entry.tx()),
        time: entry.time(),
        fee_rate: entry.fee_rate(),
        fee_delta: entry.fee_delta(),
    }
}

pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::LockPoints;
    use ledgerd_chainstate::{Coin, EmptyCoinsView};
    use ledgerd_primitives::transaction::{TxIn, TxOut};

    fn tx_spending(prevouts: &[OutPoint], outputs: usize, salt: u8) -> Transaction {
        Transaction {
            version: 1,
            vin: prevouts
                .iter()
                .map(|prevout| TxIn::new(*prevout, vec![salt; 20]))
                .collect(),
            vout: (0..outputs)
                .map(|_| TxOut {
                    value: 1000,
                    script_pubkey: vec![0x51],
                })
                .collect(),
            lock_time: 0,
        }
    }

    fn entry(tx: &Transaction, fee: Amount, time: i64) -> MempoolEntry {
        MempoolEntry::new(Arc::new(tx.clone()), fee, time, 1, false, 1, LockPoints::default())
    }

    fn add(pool: &mut Mempool, tx: &Transaction, fee: Amount, time: i64) {
        let entry = entry(tx, fee, time);
        let ancestors = pool
            .calculate_ancestors(&entry, &MempoolLimits::unlimited())
            .expect("ancestors");
        pool.add_unchecked(entry, &ancestors);
    }

    fn confirmed(byte: u8) -> OutPoint {
        OutPoint::new([byte; 32], 0)
    }

    /// A -> B -> C, one output each.
    fn chain(pool: &mut Mempool) -> (Transaction, Transaction, Transaction) {
        let a = tx_spending(&[confirmed(1)], 1, 1);
        let b = tx_spending(&[OutPoint::new(a.txid(), 0)], 1, 2);
        let c = tx_spending(&[OutPoint::new(b.txid(), 0)], 1, 3);
        add(pool, &a, 1000, 10);
        add(pool, &b, 2000, 11);
        add(pool, &c, 3000, 12);
        (a, b, c)
    }

    #[test]
    fn chain_aggregates_follow_links() {
        let mut pool = Mempool::new(&MempoolPolicy::default());
        let (a, b, c) = chain(&mut pool);
        let root = pool.entry(&a.txid()).expect("a");
        assert_eq!(root.count_with_descendants(), 3);
        assert_eq!(root.mod_fees_with_descendants(), 6000);
        let tail = pool.entry(&c.txid()).expect("c");
        assert_eq!(tail.count_with_ancestors(), 3);
        assert_eq!(tail.sigops_with_ancestors(), 3);
        assert_eq!(
            pool.parents(&b.txid()).expect("links"),
            &BTreeSet::from([a.txid()])
        );
        assert_eq!(pool.spender(&OutPoint::new(b.txid(), 0)), Some(c.txid()));
        assert_eq!(pool.query_hashes(), vec![a.txid(), b.txid(), c.txid()]);
        assert!(!pool.has_no_inputs_of(&c));
        assert!(pool.transaction_within_chain_limit(&b.txid(), 3));
        assert!(!pool.transaction_within_chain_limit(&b.txid(), 2));
        pool.check_structure().expect("consistent");
    }

    #[test]
    fn ancestor_limits_reject_without_mutation() {
        let mut pool = Mempool::new(&MempoolPolicy::default());
        let (_, _, c) = chain(&mut pool);
        let d = tx_spending(&[OutPoint::new(c.txid(), 0)], 1, 4);
        let candidate = entry(&d, 100, 20);
        let before = (pool.size(), pool.transactions_updated(), pool.total_tx_size());

        let count_limit = MempoolLimits {
            ancestor_count: 3,
            ..MempoolLimits::default()
        };
        let err = pool
            .calculate_ancestors(&candidate, &count_limit)
            .expect_err("ancestor count");
        assert_eq!(err.kind, MempoolErrorKind::TooLongMempoolChain);

        let descendant_limit = MempoolLimits {
            descendant_count: 3,
            ..MempoolLimits::default()
        };
        assert!(pool.calculate_ancestors(&candidate, &descendant_limit).is_err());

        let size_limit = MempoolLimits {
            ancestor_size: candidate.size() * 2,
            ..MempoolLimits::default()
        };
        assert!(pool.calculate_ancestors(&candidate, &size_limit).is_err());

        assert_eq!(
            before,
            (pool.size(), pool.transactions_updated(), pool.total_tx_size())
        );
        let ancestors = pool
            .calculate_ancestors(&candidate, &MempoolLimits::default())
            .expect("default limits");
        assert_eq!(ancestors.len(), 3);
        pool.check_structure().expect("consistent");
    }

    #[test]
    fn remove_recursive_takes_descendants() {
        let mut pool = Mempool::new(&MempoolPolicy::default());
        let (a, _, _) = chain(&mut pool);
        let removed = pool.remove_recursive(&a, RemovalReason::Conflict);
        assert_eq!(removed.len(), 3);
        assert!(pool.is_empty());
        assert_eq!(pool.total_tx_size(), 0);
        assert_eq!(pool.dynamic_memory_usage(), 0);
        assert!(!pool.is_spent(&confirmed(1)));
    }

    #[test]
    fn remove_recursive_of_unpooled_tx_takes_spenders() {
        let mut pool = Mempool::new(&MempoolPolicy::default());
        let parent = tx_spending(&[confirmed(9)], 2, 9);
        let left = tx_spending(&[OutPoint::new(parent.txid(), 0)], 1, 10);
        let right = tx_spending(&[OutPoint::new(parent.txid(), 1)], 1, 11);
        let other = tx_spending(&[confirmed(8)], 1, 12);
        add(&mut pool, &left, 100, 1);
        add(&mut pool, &right, 100, 1);
        add(&mut pool, &other, 100, 1);
        let removed = pool.remove_recursive(&parent, RemovalReason::Conflict);
        assert_eq!(removed.len(), 2);
        assert_eq!(pool.query_hashes(), vec![other.txid()]);
        pool.check_structure().expect("consistent");
    }

    #[test]
    fn removing_a_branch_keeps_aggregates_exact() {
        let mut pool = Mempool::new(&MempoolPolicy::default());
        // root with two children, joined again by a grandchild
        let root = tx_spending(&[confirmed(1)], 2, 1);
        let left = tx_spending(&[OutPoint::new(root.txid(), 0)], 1, 2);
        let right = tx_spending(&[OutPoint::new(root.txid(), 1)], 2, 3);
        let join = tx_spending(
            &[OutPoint::new(left.txid(), 0), OutPoint::new(right.txid(), 0)],
            1,
            4,
        );
        let tail = tx_spending(&[OutPoint::new(right.txid(), 1)], 1, 5);
        for (tx, fee) in [(&root, 500), (&left, 700), (&right, 900), (&join, 1100), (&tail, 1300)] {
            add(&mut pool, tx, fee, 1);
        }
        pool.check_structure().expect("before");
        assert_eq!(pool.entry(&join.txid()).expect("join").count_with_ancestors(), 4);

        let removed = pool.remove_recursive(&left, RemovalReason::Unknown);
        assert_eq!(removed.len(), 2);
        pool.check_structure().expect("after");
        let root_entry = pool.entry(&root.txid()).expect("root");
        assert_eq!(root_entry.count_with_descendants(), 3);
        assert_eq!(root_entry.mod_fees_with_descendants(), 500 + 900 + 1300);
        assert_eq!(
            root_entry.size_with_descendants(),
            root_entry.size()
                + pool.entry(&right.txid()).expect("right").size()
                + pool.entry(&tail.txid()).expect("tail").size()
        );
    }

    #[test]
    fn block_removal_updates_descendants_and_drops_conflicts() {
        let mut pool = Mempool::new(&MempoolPolicy::default());
        let (a, b, c) = chain(&mut pool);
        let conflict = tx_spending(&[confirmed(2)], 1, 7);
        add(&mut pool, &conflict, 50, 5);
        pool.prioritise_transaction(a.txid(), 10);

        let mined_double_spend = tx_spending(&[confirmed(2)], 1, 8);
        let conflicted = pool.remove_for_block(&[a.clone(), mined_double_spend], 5);
        assert_eq!(conflicted.len(), 1);
        assert_eq!(conflicted[0].txid(), conflict.txid());
        assert!(!pool.exists(&a.txid()));
        assert_eq!(pool.apply_delta(&a.txid()), 0);
        let b_entry = pool.entry(&b.txid()).expect("b");
        assert_eq!(b_entry.count_with_ancestors(), 1);
        assert!(pool.parents(&b.txid()).expect("links").is_empty());
        assert_eq!(pool.entry(&c.txid()).expect("c").count_with_ancestors(), 2);
        pool.check_structure().expect("consistent");
    }

    #[test]
    fn trim_raises_min_fee_which_then_decays() {
        let policy = MempoolPolicy::default();
        let mut pool = Mempool::new(&policy);
        pool.set_mock_time(Some(1_000_000));
        let cheapest = tx_spending(&[confirmed(1)], 1, 1);
        let cheap = tx_spending(&[confirmed(3)], 1, 3);
        let rich = tx_spending(&[confirmed(2)], 1, 2);
        add(&mut pool, &cheapest, 100, 1);
        add(&mut pool, &cheap, 400, 1);
        add(&mut pool, &rich, 50_000, 1);

        let uncache = pool.trim_to_size(pool.dynamic_memory_usage() - 1);
        assert_eq!(uncache, vec![confirmed(1)]);
        assert!(!pool.exists(&cheapest.txid()));
        // a single eviction leaves the floor alone
        assert_eq!(pool.get_min_fee(policy.max_mempool_bytes), FeeRate::ZERO);

        let limit = pool.dynamic_memory_usage() - 1;
        assert_eq!(pool.trim_to_size(limit), vec![confirmed(3)]);
        assert!(pool.exists(&rich.txid()));

        let cheap_entry = entry(&cheap, 400, 1);
        let bumped = FeeRate::new(400, cheap_entry.size() as usize)
            .saturating_add(policy.incremental_relay_fee);
        // no block yet, so no decay
        pool.set_mock_time(Some(1_000_000 + ROLLING_FEE_HALFLIFE));
        assert_eq!(pool.get_min_fee(limit), bumped);

        pool.remove_for_block(&[], 2);
        pool.set_mock_time(Some(1_000_000 + ROLLING_FEE_HALFLIFE + 5));
        assert_eq!(pool.get_min_fee(limit), bumped);
        pool.set_mock_time(Some(1_000_000 + 2 * ROLLING_FEE_HALFLIFE));
        let decayed = pool.get_min_fee(limit);
        assert!(decayed < bumped);
        assert!(decayed >= policy.incremental_relay_fee);

        pool.set_mock_time(Some(1_000_000 + 40 * ROLLING_FEE_HALFLIFE));
        assert_eq!(pool.get_min_fee(limit), FeeRate::ZERO);
    }

    #[test]
    fn eviction_spike_at_most_doubles_the_floor() {
        let mut pool = Mempool::new(&MempoolPolicy::default());
        pool.set_mock_time(Some(1_000_000));
        pool.track_package_removed(FeeRate::from_sat_per_kb(5_000));
        assert_eq!(pool.get_min_fee(usize::MAX), FeeRate::ZERO);

        pool.track_package_removed(FeeRate::from_sat_per_kb(4_000));
        assert_eq!(pool.get_min_fee(usize::MAX), FeeRate::from_sat_per_kb(5_000));

        pool.track_package_removed(FeeRate::from_sat_per_kb(1_000_000));
        assert_eq!(pool.get_min_fee(usize::MAX), FeeRate::from_sat_per_kb(10_000));

        // the history keeps only the newest rates
        for _ in 0..RECENT_REMOVED_HISTORY {
            pool.track_package_removed(FeeRate::from_sat_per_kb(1_000));
        }
        assert_eq!(pool.recent_removed_rates.len(), RECENT_REMOVED_HISTORY);
        assert_eq!(pool.get_min_fee(usize::MAX), FeeRate::from_sat_per_kb(10_000));
    }

    #[test]
    fn trim_stops_at_iteration_cap() {
        let mut pool = Mempool::new(&MempoolPolicy::default());
        for byte in 1..=3u8 {
            add(&mut pool, &tx_spending(&[confirmed(byte)], 1, byte), 100, 1);
        }
        let uncache = pool.trim_with_cap(0, 2);
        assert_eq!(uncache.len(), 2);
        assert_eq!(pool.size(), 1);
        pool.check_structure().expect("consistent");

        pool.trim_to_size(0);
        assert!(pool.is_empty());
    }

    #[test]
    fn deep_cheap_package_is_rejected() {
        let mut pool = Mempool::new(&MempoolPolicy::default());
        let mut prevout = confirmed(1);
        let mut tip = None;
        for salt in 0..=PACKAGE_ANCESTOR_THRESHOLD as u8 {
            let tx = tx_spending(&[prevout], 1, salt);
            add(&mut pool, &tx, 10, 1);
            prevout = OutPoint::new(tx.txid(), 0);
            if salt as usize == PACKAGE_ANCESTOR_THRESHOLD - 1 {
                tip = Some(prevout);
            }
        }

        let child = tx_spending(&[prevout], 1, 0x40);
        let err = pool
            .calculate_ancestors(&entry(&child, 10, 2), &MempoolLimits::default())
            .expect_err("package floor");
        assert_eq!(err.kind, MempoolErrorKind::TooLongMempoolChain);
        assert!(err.message.contains("package feerate too low"));

        // a child paying for the whole package gets in
        let ancestors = pool
            .calculate_ancestors(&entry(&child, 100_000, 2), &MempoolLimits::default())
            .expect("paid package");
        assert_eq!(ancestors.len(), PACKAGE_ANCESTOR_THRESHOLD + 1);
        assert!(pool
            .calculate_ancestors(&entry(&child, 10, 2), &MempoolLimits::unlimited())
            .is_ok());

        // exactly at the threshold the floor does not apply
        let shallow = tx_spending(&[tip.expect("sixth link")], 1, 0x41);
        let ancestors = pool
            .calculate_ancestors(&entry(&shallow, 10, 2), &MempoolLimits::default())
            .expect("shallow package");
        assert_eq!(ancestors.len(), PACKAGE_ANCESTOR_THRESHOLD);
    }

    #[test]
    fn expire_drops_old_entries_and_descendants() {
        let mut pool = Mempool::new(&MempoolPolicy::default());
        let (a, _, _) = chain(&mut pool);
        let fresh = tx_spending(&[confirmed(5)], 1, 5);
        add(&mut pool, &fresh, 10, 100);
        assert_eq!(pool.expire(11), 3);
        assert!(!pool.exists(&a.txid()));
        assert!(pool.exists(&fresh.txid()));
        assert_eq!(pool.expire(11), 0);
    }

    #[test]
    fn prioritisation_moves_package_fees() {
        let mut pool = Mempool::new(&MempoolPolicy::default());
        let (a, b, c) = chain(&mut pool);
        pool.prioritise_transaction(b.txid(), 5000);
        assert_eq!(pool.entry(&b.txid()).expect("b").modified_fee(), 7000);
        assert_eq!(pool.entry(&a.txid()).expect("a").mod_fees_with_descendants(), 11_000);
        assert_eq!(pool.entry(&c.txid()).expect("c").mod_fees_with_ancestors(), 11_000);
        pool.check_structure().expect("consistent");

        pool.prioritise_transaction(c.txid(), MAX_PRIORITISATION_DELTA);
        pool.prioritise_transaction(c.txid(), MAX_PRIORITISATION_DELTA);
        assert_eq!(pool.apply_delta(&c.txid()), MAX_PRIORITISATION_DELTA);

        let later = tx_spending(&[confirmed(6)], 1, 6);
        pool.prioritise_transaction(later.txid(), 42);
        add(&mut pool, &later, 8, 3);
        assert_eq!(pool.entry(&later.txid()).expect("later").modified_fee(), 50);
        pool.check_structure().expect("consistent");
    }

    #[test]
    fn ancestor_score_orders_packages() {
        let mut pool = Mempool::new(&MempoolPolicy::default());
        let poor_parent = tx_spending(&[confirmed(1)], 1, 1);
        let rich_child = tx_spending(&[OutPoint::new(poor_parent.txid(), 0)], 1, 2);
        let middling = tx_spending(&[confirmed(3)], 1, 3);
        add(&mut pool, &poor_parent, 10, 1);
        add(&mut pool, &rich_child, 100_000, 1);
        add(&mut pool, &middling, 5_000, 1);
        let order: Vec<Hash256> = pool.iter_by_ancestor_score().map(|e| e.txid()).collect();
        assert_eq!(order[0], rich_child.txid());
        assert_eq!(order[1], middling.txid());
        let worst = pool.iter_by_descendant_score().next().expect("worst");
        assert_eq!(worst.txid(), middling.txid());
    }

    #[test]
    fn readded_parents_relink_children() {
        let mut pool = Mempool::new(&MempoolPolicy::default());
        let parent = tx_spending(&[confirmed(1)], 1, 1);
        let child = tx_spending(&[OutPoint::new(parent.txid(), 0)], 1, 2);
        add(&mut pool, &child, 300, 1);
        add(&mut pool, &parent, 200, 1);
        assert!(pool.children(&parent.txid()).expect("links").is_empty());

        pool.update_transactions_from_block(&[parent.txid()]);
        assert_eq!(
            pool.children(&parent.txid()).expect("links"),
            &BTreeSet::from([child.txid()])
        );
        assert_eq!(pool.entry(&child.txid()).expect("child").count_with_ancestors(), 2);
        assert_eq!(
            pool.entry(&parent.txid()).expect("parent").mod_fees_with_descendants(),
            500
        );
        pool.check_structure().expect("consistent");
    }

    #[test]
    fn reorg_drops_immature_and_nonfinal_spends() {
        let mut pool = Mempool::new(&MempoolPolicy::default());
        let coinbase_spend = tx_spending(&[confirmed(1)], 1, 1);
        let plain = tx_spending(&[confirmed(2)], 1, 2);
        let locked = tx_spending(&[confirmed(3)], 1, 3);
        for tx in [&coinbase_spend, &plain, &locked] {
            let spends_coinbase = tx.txid() == coinbase_spend.txid();
            let entry = MempoolEntry::new(
                Arc::new(tx.clone()),
                10,
                1,
                1,
                spends_coinbase,
                1,
                LockPoints::default(),
            );
            let ancestors = pool
                .calculate_ancestors(&entry, &MempoolLimits::default())
                .expect("ancestors");
            pool.add_unchecked(entry, &ancestors);
        }
        let mut coins = CoinsCache::new(EmptyCoinsView);
        coins
            .add_coin(
                confirmed(1),
                Coin::new(
                    TxOut {
                        value: 5000,
                        script_pubkey: vec![0x51],
                    },
                    50,
                    true,
                ),
                false,
            )
            .expect("add");
        let locked_id = locked.txid();
        let removed = pool
            .remove_for_reorg(&mut coins, 60, |entry| entry.txid() != locked_id)
            .expect("reorg");
        assert_eq!(removed, 2);
        assert_eq!(pool.query_hashes(), vec![plain.txid()]);
    }

    #[test]
    fn sampled_check_verifies_inputs() {
        let policy = MempoolPolicy {
            check_ratio: 1.0,
            ..MempoolPolicy::default()
        };
        let mut pool = Mempool::new(&policy);
        let a = tx_spending(&[confirmed(1)], 1, 1);
        let b = tx_spending(&[OutPoint::new(a.txid(), 0)], 1, 2);
        add(&mut pool, &a, 1000, 1);
        add(&mut pool, &b, 0, 2);

        let mut coins = CoinsCache::new(EmptyCoinsView);
        assert!(pool.check(&mut coins, 10).is_err());
        coins
            .add_coin(
                confirmed(1),
                Coin::new(
                    TxOut {
                        value: 2000,
                        script_pubkey: vec![0x51],
                    },
                    1,
                    false,
                ),
                false,
            )
            .expect("add");
        pool.check(&mut coins, 10).expect("consistent");
        assert!(coins.have_coin(&confirmed(1)).expect("have"));

        pool.prioritise_transaction(b.txid(), 1);
        pool.check(&mut coins, 10).expect("deltas do not change paid fees");
        let unchecked = Mempool::new(&MempoolPolicy::default());
        assert!(unchecked.check(&mut CoinsCache::new(EmptyCoinsView), 10).is_ok());
    }
}
