//! In-memory arena of every known block header.
//!
//! Entries are addressed by [`EntryId`] and never removed while the node runs.
//! Each entry carries its cumulative chain work, a validity tier and a skip
//! link so ancestor lookups take a logarithmic number of hops.

use std::collections::{BTreeSet, HashMap};

use ledgerd_consensus::constants::MEDIAN_TIME_SPAN;
use ledgerd_consensus::Hash256;
use ledgerd_pow::difficulty::{add_work, block_proof};
use ledgerd_pow::PowError;
use ledgerd_primitives::block::BlockHeader;
use ledgerd_primitives::encoding::{DecodeError, Decoder, Encoder};
use ledgerd_storage::{Column, KeyValueStore, StoreError, WriteBatch};
use primitive_types::U256;
use smallvec::SmallVec;

pub const BLOCK_VALID_UNKNOWN: u32 = 0;
pub const BLOCK_VALID_HEADER: u32 = 1;
pub const BLOCK_VALID_TREE: u32 = 2;
pub const BLOCK_VALID_TRANSACTIONS: u32 = 3;
pub const BLOCK_VALID_CHAIN: u32 = 4;
pub const BLOCK_VALID_SCRIPTS: u32 = 5;
pub const BLOCK_VALID_MASK: u32 = 7;

pub const BLOCK_HAVE_DATA: u32 = 8;
pub const BLOCK_HAVE_UNDO: u32 = 16;

pub const BLOCK_FAILED_VALID: u32 = 32;
pub const BLOCK_FAILED_CHILD: u32 = 64;
pub const BLOCK_FAILED_MASK: u32 = BLOCK_FAILED_VALID | BLOCK_FAILED_CHILD;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u32)]
pub enum Validity {
    Unknown = BLOCK_VALID_UNKNOWN,
    /// Parsed, version ok, hash satisfies claimed PoW.
    Header = BLOCK_VALID_HEADER,
    /// Parent found and contextual header checks passed.
    Tree = BLOCK_VALID_TREE,
    /// Body seen and context-free block checks passed.
    Transactions = BLOCK_VALID_TRANSACTIONS,
    /// Outputs spent and created without scripts being checked.
    Chain = BLOCK_VALID_CHAIN,
    /// Scripts checked too.
    Scripts = BLOCK_VALID_SCRIPTS,
}

impl Validity {
    pub fn from_status(status: u32) -> Self {
        match status & BLOCK_VALID_MASK {
            BLOCK_VALID_HEADER => Validity::Header,
            BLOCK_VALID_TREE => Validity::Tree,
            BLOCK_VALID_TRANSACTIONS => Validity::Transactions,
            BLOCK_VALID_CHAIN => Validity::Chain,
            BLOCK_VALID_SCRIPTS => Validity::Scripts,
            _ => Validity::Unknown,
        }
    }

    pub fn bits(self) -> u32 {
        self as u32
    }
}

#[derive(Debug)]
pub enum BlockIndexError {
    /// The header's parent is not known yet.
    OrphanHeader(Hash256),
    WorkOverflow,
    Corrupt(&'static str),
    Store(StoreError),
    Pow(PowError),
}

impl std::fmt::Display for BlockIndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockIndexError::OrphanHeader(prev) => write!(
                f,
                "header parent {} not in block index",
                ledgerd_consensus::hash256_to_hex(prev)
            ),
            BlockIndexError::WorkOverflow => write!(f, "cumulative chain work overflow"),
            BlockIndexError::Corrupt(message) => write!(f, "corrupt block index: {message}"),
            BlockIndexError::Store(err) => write!(f, "{err}"),
            BlockIndexError::Pow(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for BlockIndexError {}

impl From<StoreError> for BlockIndexError {
    fn from(err: StoreError) -> Self {
        BlockIndexError::Store(err)
    }
}

impl From<PowError> for BlockIndexError {
    fn from(err: PowError) -> Self {
        BlockIndexError::Pow(err)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntryId(u32);

impl EntryId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug)]
pub struct BlockIndexEntry {
    pub hash: Hash256,
    pub prev: Option<EntryId>,
    pub skip: Option<EntryId>,
    pub height: i32,
    pub chain_work: U256,
    pub status: u32,
    pub version: i32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    /// Transactions in this block; zero until the body is known.
    pub tx_count: u32,
    /// Transactions in the chain up to and including this block; non-zero
    /// only when every ancestor's body is known too.
    pub chain_tx: u64,
    /// Order in which bodies arrived; earlier wins among equal-work tips.
    pub sequence_id: i32,
    pub time_max: u32,
}

impl BlockIndexEntry {
    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_block: self.prev_hash,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }

    pub fn validity(&self) -> Validity {
        Validity::from_status(self.status)
    }

    pub fn is_valid(&self, tier: Validity) -> bool {
        !self.is_failed() && self.validity() >= tier
    }

    pub fn is_failed(&self) -> bool {
        self.status & BLOCK_FAILED_MASK != 0
    }

    pub fn have_data(&self) -> bool {
        self.status & BLOCK_HAVE_DATA != 0
    }

    pub fn have_undo(&self) -> bool {
        self.status & BLOCK_HAVE_UNDO != 0
    }
}

fn invert_lowest_one(value: i32) -> i32 {
    value & value.saturating_sub(1)
}

/// Height the skip link of an entry at `height` points to.
fn skip_height(height: i32) -> i32 {
    if height < 2 {
        0
    } else if (height & 1) != 0 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct CandidateKey {
    work: U256,
    sequence_id: i32,
    id: EntryId,
}

impl Ord for CandidateKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .work
            .cmp(&self.work)
            .then(self.sequence_id.cmp(&other.sequence_id))
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for CandidateKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub struct BlockIndexTree {
    entries: Vec<BlockIndexEntry>,
    children: Vec<SmallVec<[EntryId; 2]>>,
    by_hash: HashMap<Hash256, EntryId>,
    candidates: BTreeSet<CandidateKey>,
    dirty: BTreeSet<EntryId>,
    best_header: Option<EntryId>,
    next_sequence_id: i32,
}

impl BlockIndexTree {
    pub fn new() -> Self {
        Self {
            next_sequence_id: 1,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, hash: &Hash256) -> Option<EntryId> {
        self.by_hash.get(hash).copied()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn entry(&self, id: EntryId) -> &BlockIndexEntry {
        &self.entries[id.index()]
    }

    pub fn genesis(&self) -> Option<EntryId> {
        if self.entries.is_empty() {
            None
        } else {
            Some(EntryId(0))
        }
    }

    /// Most-work header seen that is not marked failed.
    pub fn best_header(&self) -> Option<EntryId> {
        self.best_header
    }

    /// Adds `header` to the tree, or returns the existing entry for it.
    pub fn insert(&mut self, header: &BlockHeader) -> Result<EntryId, BlockIndexError> {
        let hash = header.hash();
        if let Some(id) = self.by_hash.get(&hash) {
            return Ok(*id);
        }
        let prev = if header.prev_block == [0u8; 32] && self.entries.is_empty() {
            None
        } else {
            Some(
                self.get(&header.prev_block)
                    .ok_or(BlockIndexError::OrphanHeader(header.prev_block))?,
            )
        };
        let proof = block_proof(header.bits).map_err(PowError::from)?;
        let id = self.push_entry(hash, header, prev, proof)?;
        let entry = &mut self.entries[id.index()];
        if entry.status & BLOCK_VALID_MASK < BLOCK_VALID_TREE {
            entry.status = (entry.status & !BLOCK_VALID_MASK) | BLOCK_VALID_TREE;
        }
        self.dirty.insert(id);
        self.update_best_header(id);
        Ok(id)
    }

    fn push_entry(
        &mut self,
        hash: Hash256,
        header: &BlockHeader,
        prev: Option<EntryId>,
        proof: U256,
    ) -> Result<EntryId, BlockIndexError> {
        let raw_id =
            u32::try_from(self.entries.len()).map_err(|_| BlockIndexError::Corrupt("arena full"))?;
        let id = EntryId(raw_id);
        let (height, parent_work, status, time_max) = match prev {
            Some(parent) => {
                let parent = self.entry(parent);
                let inherited = if parent.is_failed() {
                    BLOCK_FAILED_CHILD
                } else {
                    0
                };
                (
                    parent.height + 1,
                    parent.chain_work,
                    inherited,
                    parent.time_max.max(header.time),
                )
            }
            None => (0, U256::zero(), 0, header.time),
        };
        let chain_work = add_work(parent_work, proof).ok_or(BlockIndexError::WorkOverflow)?;
        let skip = match prev {
            Some(parent) => self.ancestor_at(parent, skip_height(height)),
            None => None,
        };
        self.entries.push(BlockIndexEntry {
            hash,
            prev,
            skip,
            height,
            chain_work,
            status,
            version: header.version,
            prev_hash: header.prev_block,
            merkle_root: header.merkle_root,
            time: header.time,
            bits: header.bits,
            nonce: header.nonce,
            tx_count: 0,
            chain_tx: 0,
            sequence_id: 0,
            time_max,
        });
        self.children.push(SmallVec::new());
        if let Some(parent) = prev {
            self.children[parent.index()].push(id);
        }
        self.by_hash.insert(hash, id);
        Ok(id)
    }

    /// Ancestor of `id` at `height`, or `None` when `height` is out of range.
    pub fn ancestor_at(&self, id: EntryId, height: i32) -> Option<EntryId> {
        self.ancestor_walk(id, height).0
    }

    fn ancestor_walk(&self, id: EntryId, height: i32) -> (Option<EntryId>, usize) {
        let start = self.entry(id);
        if height > start.height || height < 0 {
            return (None, 0);
        }
        let mut walk = id;
        let mut walk_height = start.height;
        let mut hops = 0usize;
        while walk_height > height {
            let entry = self.entry(walk);
            let height_skip = skip_height(walk_height);
            let height_skip_prev = skip_height(walk_height - 1);
            let take_skip = height_skip == height
                || (height_skip > height
                    && !(height_skip_prev < height_skip - 2 && height_skip_prev >= height));
            match (entry.skip, entry.prev) {
                (Some(skip), _) if take_skip => {
                    walk = skip;
                    walk_height = height_skip;
                }
                (_, Some(prev)) => {
                    walk = prev;
                    walk_height -= 1;
                }
                (_, None) => return (None, hops),
            }
            hops += 1;
        }
        (Some(walk), hops)
    }

    /// Deepest entry that is an ancestor of both `a` and `b` (or either one
    /// itself). All entries descend from the same root, so one always exists.
    pub fn lowest_common_ancestor(&self, a: EntryId, b: EntryId) -> EntryId {
        let height_a = self.entry(a).height;
        let height_b = self.entry(b).height;
        let mut a = if height_a > height_b {
            self.ancestor_at(a, height_b).unwrap_or(a)
        } else {
            a
        };
        let mut b = if height_b > height_a {
            self.ancestor_at(b, height_a).unwrap_or(b)
        } else {
            b
        };
        while a != b {
            let entry_a = self.entry(a);
            let entry_b = self.entry(b);
            let next = match (entry_a.skip, entry_b.skip) {
                (Some(skip_a), Some(skip_b)) if skip_a != skip_b => (skip_a, skip_b),
                _ => match (entry_a.prev, entry_b.prev) {
                    (Some(prev_a), Some(prev_b)) => (prev_a, prev_b),
                    _ => break,
                },
            };
            a = next.0;
            b = next.1;
        }
        a
    }

    /// Raises the validity tier of `id`. Returns false if the entry is
    /// failed or already at `tier` or higher.
    pub fn raise_validity(&mut self, id: EntryId, tier: Validity) -> bool {
        let entry = &mut self.entries[id.index()];
        if entry.is_failed() {
            return false;
        }
        if entry.status & BLOCK_VALID_MASK >= tier.bits() {
            return false;
        }
        entry.status = (entry.status & !BLOCK_VALID_MASK) | tier.bits();
        self.dirty.insert(id);
        true
    }

    /// Failure markers propagate to every known descendant eagerly and to new
    /// children on insert, so this is a flag check.
    pub fn is_tainted(&self, id: EntryId) -> bool {
        self.entry(id).is_failed()
    }

    pub fn mark_failed(&mut self, id: EntryId) {
        self.entries[id.index()].status |= BLOCK_FAILED_VALID;
        self.dirty.insert(id);
        self.remove_candidate(id);
        let mut stack: Vec<EntryId> = self.children[id.index()].to_vec();
        while let Some(child) = stack.pop() {
            self.entries[child.index()].status |= BLOCK_FAILED_CHILD;
            self.dirty.insert(child);
            self.remove_candidate(child);
            stack.extend(self.children[child.index()].iter().copied());
        }
        if self.best_header.is_some_and(|best| self.is_tainted(best)) {
            self.recompute_best_header();
        }
    }

    /// Clears failure markers on `id`, its descendants and its ancestors.
    pub fn reconsider(&mut self, id: EntryId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            self.clear_failure(current);
            stack.extend(self.children[current.index()].iter().copied());
        }
        let mut walk = self.entry(id).prev;
        while let Some(current) = walk {
            self.clear_failure(current);
            walk = self.entry(current).prev;
        }
        self.recompute_best_header();
    }

    fn clear_failure(&mut self, id: EntryId) {
        let entry = &mut self.entries[id.index()];
        if entry.status & BLOCK_FAILED_MASK == 0 {
            return;
        }
        entry.status &= !BLOCK_FAILED_MASK;
        self.dirty.insert(id);
        self.try_add_candidate(id);
    }

    /// Records that the body of `id` is stored. Links the entry (and any
    /// descendants waiting on it) into the candidate set once every ancestor
    /// body is present.
    pub fn set_have_data(&mut self, id: EntryId, tx_count: u32) {
        {
            let entry = &mut self.entries[id.index()];
            entry.tx_count = tx_count;
            entry.chain_tx = 0;
            entry.status |= BLOCK_HAVE_DATA;
        }
        self.raise_validity(id, Validity::Transactions);
        self.dirty.insert(id);

        let linked = match self.entry(id).prev {
            None => true,
            Some(parent) => self.entry(parent).chain_tx > 0,
        };
        if !linked {
            return;
        }
        let mut queue = std::collections::VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            let parent_chain_tx = self
                .entry(current)
                .prev
                .map(|parent| self.entry(parent).chain_tx)
                .unwrap_or(0);
            let sequence_id = self.next_sequence_id;
            self.next_sequence_id = self.next_sequence_id.saturating_add(1);
            {
                let entry = &mut self.entries[current.index()];
                entry.chain_tx = parent_chain_tx + u64::from(entry.tx_count);
                entry.sequence_id = sequence_id;
            }
            self.try_add_candidate(current);
            for child in self.children[current.index()].iter() {
                let child_entry = self.entry(*child);
                if child_entry.have_data() && child_entry.chain_tx == 0 {
                    queue.push_back(*child);
                }
            }
        }
    }

    pub fn set_have_undo(&mut self, id: EntryId) {
        self.entries[id.index()].status |= BLOCK_HAVE_UNDO;
        self.dirty.insert(id);
    }

    fn candidate_key(&self, id: EntryId) -> CandidateKey {
        let entry = self.entry(id);
        CandidateKey {
            work: entry.chain_work,
            sequence_id: entry.sequence_id,
            id,
        }
    }

    fn try_add_candidate(&mut self, id: EntryId) {
        let entry = self.entry(id);
        if entry.chain_tx == 0 || !entry.is_valid(Validity::Transactions) {
            return;
        }
        let key = self.candidate_key(id);
        self.candidates.insert(key);
    }

    pub fn remove_candidate(&mut self, id: EntryId) {
        let key = self.candidate_key(id);
        self.candidates.remove(&key);
    }

    pub fn is_candidate(&self, id: EntryId) -> bool {
        self.candidates.contains(&self.candidate_key(id))
    }

    /// Candidate tips, most work first.
    pub fn candidates(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.candidates.iter().map(|key| key.id)
    }

    pub fn best_candidate(&self) -> Option<EntryId> {
        self.candidates.iter().next().map(|key| key.id)
    }

    /// Re-adds every linked, unfailed entry with at least the work of `tip`.
    /// Needed after the active chain shrinks, since pruning dropped them.
    pub fn restore_candidates(&mut self, tip: EntryId) {
        let floor = self.entry(tip).chain_work;
        for raw in 0..self.entries.len() {
            let id = EntryId(raw as u32);
            let entry = self.entry(id);
            if entry.chain_work >= floor && !entry.is_failed() {
                self.try_add_candidate(id);
            }
        }
    }

    /// Drops every candidate that ranks below `tip`.
    pub fn prune_candidates(&mut self, tip: EntryId) {
        let tip_key = self.candidate_key(tip);
        let worse: Vec<CandidateKey> = self
            .candidates
            .range(tip_key..)
            .filter(|key| key.id != tip)
            .copied()
            .collect();
        for key in worse {
            self.candidates.remove(&key);
        }
    }

    pub fn median_time_past(&self, id: EntryId) -> i64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut walk = Some(id);
        while let Some(current) = walk {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            let entry = self.entry(current);
            times.push(i64::from(entry.time));
            walk = entry.prev;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    fn update_best_header(&mut self, id: EntryId) {
        if self.is_tainted(id) {
            return;
        }
        let better = match self.best_header {
            None => true,
            Some(best) => self.entry(id).chain_work > self.entry(best).chain_work,
        };
        if better {
            self.best_header = Some(id);
        }
    }

    fn recompute_best_header(&mut self) {
        self.best_header = None;
        for raw in 0..self.entries.len() {
            self.update_best_header(EntryId(raw as u32));
        }
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Serializes every modified entry into `batch`. The dirty set is kept
    /// until [`BlockIndexTree::mark_clean`] confirms the batch was committed.
    pub fn write_dirty(&self, batch: &mut WriteBatch) -> usize {
        for id in &self.dirty {
            let entry = self.entry(*id);
            batch.put(Column::BlockIndex, entry.hash, encode_entry(entry));
        }
        self.dirty.len()
    }

    pub fn mark_clean(&mut self) {
        self.dirty.clear();
    }

    /// Rebuilds the tree from every persisted entry.
    pub fn load<S: KeyValueStore + ?Sized>(store: &S) -> Result<Self, BlockIndexError> {
        let mut records = Vec::new();
        for (key, value) in store.scan_prefix(Column::BlockIndex, &[])? {
            let record =
                decode_entry(&value).map_err(|_| BlockIndexError::Corrupt("undecodable entry"))?;
            if key.as_slice() != record.header.hash().as_slice() {
                return Err(BlockIndexError::Corrupt("entry key does not match header"));
            }
            records.push(record);
        }
        records.sort_by_key(|record| record.height);

        let mut tree = Self::new();
        for record in records {
            let prev = if record.height == 0 {
                if !tree.entries.is_empty() {
                    return Err(BlockIndexError::Corrupt("multiple genesis entries"));
                }
                None
            } else {
                let parent = tree
                    .get(&record.header.prev_block)
                    .ok_or(BlockIndexError::Corrupt("entry parent missing"))?;
                if tree.entry(parent).height + 1 != record.height {
                    return Err(BlockIndexError::Corrupt("entry height does not follow parent"));
                }
                Some(parent)
            };
            let proof = block_proof(record.header.bits)
                .map_err(|_| BlockIndexError::Corrupt("entry has invalid bits"))?;
            let id = tree
                .push_entry(record.header.hash(), &record.header, prev, proof)
                .map_err(|err| match err {
                    BlockIndexError::WorkOverflow => BlockIndexError::Corrupt("chain work overflow"),
                    other => other,
                })?;
            let entry = &mut tree.entries[id.index()];
            entry.status |= record.status;
            entry.tx_count = record.tx_count;
        }

        for raw in 0..tree.entries.len() {
            let id = EntryId(raw as u32);
            let parent_chain_tx = match tree.entry(id).prev {
                None => Some(0),
                Some(parent) => {
                    let chain_tx = tree.entry(parent).chain_tx;
                    (chain_tx > 0).then_some(chain_tx)
                }
            };
            let entry = &mut tree.entries[raw];
            if entry.have_data() {
                if let Some(parent_chain_tx) = parent_chain_tx {
                    entry.chain_tx = parent_chain_tx + u64::from(entry.tx_count);
                }
            }
            tree.try_add_candidate(id);
            tree.update_best_header(id);
        }
        Ok(tree)
    }
}

struct EntryRecord {
    header: BlockHeader,
    height: i32,
    status: u32,
    tx_count: u32,
}

fn encode_entry(entry: &BlockIndexEntry) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(92);
    encoder.write_bytes(&entry.header().consensus_encode());
    encoder.write_i32_le(entry.height);
    encoder.write_u32_le(entry.status);
    encoder.write_u32_le(entry.tx_count);
    encoder.into_inner()
}

fn decode_entry(bytes: &[u8]) -> Result<EntryRecord, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let header = BlockHeader::consensus_decode_from(&mut decoder)?;
    let height = decoder.read_i32_le()?;
    let status = decoder.read_u32_le()?;
    let tx_count = decoder.read_u32_le()?;
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    if height < 0 {
        return Err(DecodeError::InvalidData("negative height"));
    }
    Ok(EntryRecord {
        header,
        height,
        status,
        tx_count,
    })
}
