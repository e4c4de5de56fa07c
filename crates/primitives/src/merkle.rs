//! Merkle root computation with duplicate-subtree detection.

use ledgerd_consensus::Hash256;

use crate::block::Block;
use crate::hash::hash_pair;

/// Returns the merkle root of `leaves` and whether two identical adjacent
/// nodes were hashed together at any level. Such a tree has the same root as
/// a different transaction list, so blocks that trigger it are rejected.
pub fn merkle_root(leaves: &[Hash256]) -> (Hash256, bool) {
    if leaves.is_empty() {
        return ([0u8; 32], false);
    }
    let mut level: Vec<Hash256> = leaves.to_vec();
    let mut mutated = false;
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            if pair.len() == 2 && left == right {
                mutated = true;
            }
            next.push(hash_pair(left, right));
        }
        level = next;
    }
    (level[0], mutated)
}

pub fn block_merkle_root(block: &Block) -> (Hash256, bool) {
    let leaves: Vec<Hash256> = block.transactions.iter().map(|tx| tx.txid()).collect();
    merkle_root(&leaves)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_leaf_is_root() {
        let leaf = [3u8; 32];
        assert_eq!(merkle_root(&[leaf]), (leaf, false));
    }

    #[test]
    fn odd_level_duplicates_last() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        let (root, mutated) = merkle_root(&[a, b, c]);
        let expected = hash_pair(&hash_pair(&a, &b), &hash_pair(&c, &c));
        assert_eq!(root, expected);
        assert!(!mutated);

        let (same_root, mutated) = merkle_root(&[a, b, c, c]);
        assert_eq!(same_root, root);
        assert!(mutated);
    }
}
