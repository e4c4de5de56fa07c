//! The active chain: one block index entry per height, genesis to tip.

use ledgerd_consensus::constants::DEFAULT_MAX_FORK_TRAVERSAL;
use ledgerd_consensus::Hash256;

use crate::blockindex::{BlockIndexTree, EntryId};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ForkError {
    /// Walked `limit` parent hops without reaching the active chain.
    TraversalLimit { limit: usize },
    /// The entry shares no block with the active chain (empty chain).
    NoCommonAncestor,
}

impl std::fmt::Display for ForkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForkError::TraversalLimit { limit } => {
                write!(f, "fork point deeper than {limit} blocks")
            }
            ForkError::NoCommonAncestor => write!(f, "no common ancestor with active chain"),
        }
    }
}

impl std::error::Error for ForkError {}

#[derive(Clone, Debug)]
pub struct ActiveChain {
    entries: Vec<EntryId>,
    max_fork_traversal: usize,
}

impl Default for ActiveChain {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FORK_TRAVERSAL)
    }
}

impl ActiveChain {
    pub fn new(max_fork_traversal: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_fork_traversal,
        }
    }

    pub fn max_fork_traversal(&self) -> usize {
        self.max_fork_traversal
    }

    pub fn set_max_fork_traversal(&mut self, limit: usize) {
        self.max_fork_traversal = limit;
    }

    pub fn genesis(&self) -> Option<EntryId> {
        self.entries.first().copied()
    }

    pub fn tip(&self) -> Option<EntryId> {
        self.entries.last().copied()
    }

    /// Height of the tip, -1 when empty.
    pub fn height(&self) -> i32 {
        self.entries.len() as i32 - 1
    }

    pub fn at(&self, height: i32) -> Option<EntryId> {
        if height < 0 {
            return None;
        }
        self.entries.get(height as usize).copied()
    }

    pub fn contains(&self, tree: &BlockIndexTree, id: EntryId) -> bool {
        self.at(tree.entry(id).height) == Some(id)
    }

    /// Successor of `id` on the active chain.
    pub fn next(&self, tree: &BlockIndexTree, id: EntryId) -> Option<EntryId> {
        if self.contains(tree, id) {
            self.at(tree.entry(id).height + 1)
        } else {
            None
        }
    }

    /// Makes `tip` the last element, rewriting slots only back to the point
    /// where the old and new chains agree. `None` clears the chain.
    pub fn set_tip(&mut self, tree: &BlockIndexTree, tip: Option<EntryId>) {
        let Some(tip) = tip else {
            self.entries.clear();
            return;
        };
        let height = tree.entry(tip).height as usize;
        self.entries.truncate(height + 1);
        let mut missing = Vec::new();
        let mut walk = Some(tip);
        while let Some(id) = walk {
            let slot = tree.entry(id).height as usize;
            if self.entries.get(slot) == Some(&id) {
                break;
            }
            missing.push(id);
            walk = tree.entry(id).prev;
        }
        if let Some(lowest) = missing.last() {
            self.entries.truncate(tree.entry(*lowest).height as usize);
        }
        self.entries.extend(missing.into_iter().rev());
    }

    /// Block locator starting at `from` (the tip when `None`): the first ten
    /// hashes step back one block each, then the step doubles; genesis is
    /// always last.
    pub fn locator(&self, tree: &BlockIndexTree, from: Option<EntryId>) -> Vec<Hash256> {
        let mut hashes = Vec::with_capacity(32);
        let mut step = 1i32;
        let mut walk = from.or_else(|| self.tip());
        while let Some(id) = walk {
            let entry = tree.entry(id);
            hashes.push(entry.hash);
            if entry.height == 0 {
                break;
            }
            let height = (entry.height - step).max(0);
            walk = if self.contains(tree, id) {
                self.at(height)
            } else {
                tree.ancestor_at(id, height)
            };
            if hashes.len() > 10 {
                step = step.saturating_mul(2);
            }
        }
        hashes
    }

    /// Most recent common block of `id`'s chain and the active chain, giving
    /// up after the configured number of parent hops.
    pub fn find_fork(&self, tree: &BlockIndexTree, id: EntryId) -> Option<EntryId> {
        match self.find_fork_checked(tree, id) {
            Ok(fork) => Some(fork),
            Err(ForkError::TraversalLimit { limit }) => {
                ledgerd_log::log_debug!("find_fork: traversal limit of {limit} blocks reached");
                None
            }
            Err(ForkError::NoCommonAncestor) => None,
        }
    }

    pub fn find_fork_checked(
        &self,
        tree: &BlockIndexTree,
        id: EntryId,
    ) -> Result<EntryId, ForkError> {
        let chain_height = self.height();
        if chain_height < 0 {
            return Err(ForkError::NoCommonAncestor);
        }
        let mut walk = if tree.entry(id).height > chain_height {
            tree.ancestor_at(id, chain_height)
        } else {
            Some(id)
        };
        let mut hops = 0usize;
        while let Some(current) = walk {
            if self.contains(tree, current) {
                return Ok(current);
            }
            walk = tree.entry(current).prev;
            hops += 1;
            if hops > self.max_fork_traversal {
                return Err(ForkError::TraversalLimit {
                    limit: self.max_fork_traversal,
                });
            }
        }
        Err(ForkError::NoCommonAncestor)
    }

    /// First active entry whose `time_max` is at least `time`.
    pub fn find_earliest_at_least(&self, tree: &BlockIndexTree, time: u32) -> Option<EntryId> {
        let index = self
            .entries
            .partition_point(|id| tree.entry(*id).time_max < time);
        self.entries.get(index).copied()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = EntryId> + '_ {
        self.entries.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerd_primitives::block::BlockHeader;

    fn extend(
        tree: &mut BlockIndexTree,
        from: Option<EntryId>,
        len: usize,
        tag: u32,
    ) -> Vec<EntryId> {
        let mut prev = from.map(|id| tree.entry(id).hash).unwrap_or([0u8; 32]);
        let mut out = Vec::new();
        for i in 0..len {
            let header = BlockHeader {
                version: 4,
                prev_block: prev,
                merkle_root: [tag as u8; 32],
                time: 1_600_000_000 + i as u32 * 60,
                bits: 0x207fffff,
                nonce: tag * 100_000 + i as u32,
            };
            let id = tree.insert(&header).expect("insert");
            prev = tree.entry(id).hash;
            out.push(id);
        }
        out
    }

    #[test]
    fn set_tip_switches_between_forks() {
        let mut tree = BlockIndexTree::new();
        let main = extend(&mut tree, None, 20, 1);
        let fork = extend(&mut tree, Some(main[9]), 15, 2);
        let mut chain = ActiveChain::default();
        assert_eq!(chain.height(), -1);
        assert_eq!(chain.tip(), None);

        chain.set_tip(&tree, Some(main[19]));
        assert_eq!(chain.height(), 19);
        assert_eq!(chain.genesis(), Some(main[0]));
        assert!(chain.contains(&tree, main[5]));
        assert_eq!(chain.next(&tree, main[5]), Some(main[6]));

        chain.set_tip(&tree, Some(fork[14]));
        assert_eq!(chain.height(), 24);
        assert_eq!(chain.at(9), Some(main[9]));
        assert_eq!(chain.at(10), Some(fork[0]));
        assert!(!chain.contains(&tree, main[15]));
        for (height, id) in chain.iter().enumerate().skip(1) {
            assert_eq!(tree.entry(id).prev, chain.at(height as i32 - 1));
        }

        chain.set_tip(&tree, Some(main[3]));
        assert_eq!(chain.height(), 3);
        assert_eq!(chain.tip(), Some(main[3]));

        chain.set_tip(&tree, None);
        assert_eq!(chain.height(), -1);
    }

    #[test]
    fn locator_steps_double_after_ten() {
        let mut tree = BlockIndexTree::new();
        let main = extend(&mut tree, None, 100, 3);
        let mut chain = ActiveChain::default();
        chain.set_tip(&tree, Some(main[99]));
        let locator = chain.locator(&tree, None);
        let heights: Vec<i32> = locator
            .iter()
            .map(|hash| tree.entry(tree.get(hash).expect("known")).height)
            .collect();
        assert_eq!(
            heights,
            vec![99, 98, 97, 96, 95, 94, 93, 92, 91, 90, 89, 88, 86, 82, 74, 58, 26, 0]
        );
    }

    #[test]
    fn find_fork_respects_traversal_limit() {
        let mut tree = BlockIndexTree::new();
        let main = extend(&mut tree, None, 30, 4);
        let fork = extend(&mut tree, Some(main[9]), 10, 5);
        let mut chain = ActiveChain::new(10);
        chain.set_tip(&tree, Some(main[29]));

        // fork tip at height 19 needs ten parent hops to reach main[9]
        assert_eq!(chain.find_fork(&tree, fork[9]), Some(main[9]));
        chain.set_max_fork_traversal(9);
        assert_eq!(chain.find_fork(&tree, fork[9]), None);
        assert_eq!(
            chain.find_fork_checked(&tree, fork[9]),
            Err(ForkError::TraversalLimit { limit: 9 })
        );
        assert_eq!(chain.find_fork(&tree, main[12]), Some(main[12]));

        let empty = ActiveChain::default();
        assert_eq!(
            empty.find_fork_checked(&tree, main[1]),
            Err(ForkError::NoCommonAncestor)
        );
    }

    #[test]
    fn find_fork_drops_to_chain_height_first() {
        let mut tree = BlockIndexTree::new();
        let main = extend(&mut tree, None, 10, 6);
        let longer = extend(&mut tree, Some(main[9]), 5_000, 7);
        let mut chain = ActiveChain::new(1);
        chain.set_tip(&tree, Some(main[9]));
        assert_eq!(chain.find_fork(&tree, longer[4_999]), Some(main[9]));
    }

    #[test]
    fn earliest_at_least_uses_time_max() {
        let mut tree = BlockIndexTree::new();
        let main = extend(&mut tree, None, 10, 8);
        let mut chain = ActiveChain::default();
        chain.set_tip(&tree, Some(main[9]));
        assert_eq!(chain.find_earliest_at_least(&tree, 0), Some(main[0]));
        assert_eq!(
            chain.find_earliest_at_least(&tree, 1_600_000_000 + 121),
            Some(main[3])
        );
        assert_eq!(chain.find_earliest_at_least(&tree, u32::MAX), None);
    }
}
