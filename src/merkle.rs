//! Merkle tree over a block's transactions, with inclusion proofs.
//!
//! Leaves are `SHA-256(serialize(tx))` in block order. A level of odd length
//! duplicates its last hash when pairing; the stored levels are unpadded, so
//! a proof step whose sibling index falls off the end clamps back onto the
//! leaf itself (the duplicated-hash case).

use serde::{Deserialize, Serialize};

use crate::crypto::sha256;
use crate::transaction::Transaction;
use crate::Hash;

/// Errors from tree construction and proof generation.
#[derive(Clone, Debug, thiserror::Error)]
pub enum MerkleError {
    #[error("cannot build a merkle tree over zero transactions")]
    EmptyTransactions,
    #[error("leaf index {index} out of range ({len} leaves)")]
    IndexOutOfRange { index: usize, len: usize },
}

/// One step of an inclusion proof: the sibling hash and which side it sits on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub hash: Hash,
    /// True when the sibling is the left child at this level.
    pub is_left: bool,
}

/// A self-contained inclusion proof for one transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub tx_hash: Hash,
    pub path: Vec<ProofStep>,
    pub merkle_root: Hash,
}

fn combine(left: &Hash, right: &Hash) -> Hash {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    sha256(&buf)
}

/// Merkle tree stored level by level, leaves first.
pub struct MerkleTree {
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    /// Build the tree from a block's transaction list.
    pub fn new(transactions: &[Transaction]) -> Result<Self, MerkleError> {
        let leaves: Vec<Hash> = transactions
            .iter()
            .map(|tx| sha256(&tx.serialize()))
            .collect();
        Self::from_leaves(leaves)
    }

    /// Build the tree from precomputed leaf hashes.
    pub fn from_leaves(leaves: Vec<Hash>) -> Result<Self, MerkleError> {
        if leaves.is_empty() {
            return Err(MerkleError::EmptyTransactions);
        }

        let mut levels = vec![leaves];
        loop {
            let current = levels.last().expect("at least one level");
            let mut parents = Vec::with_capacity(current.len().div_ceil(2));
            let mut i = 0;
            while i < current.len() {
                let left = &current[i];
                // odd level: the last hash pairs with itself
                let right = current.get(i + 1).unwrap_or(left);
                parents.push(combine(left, right));
                i += 2;
            }
            let done = parents.len() == 1;
            levels.push(parents);
            if done {
                break;
            }
        }

        Ok(MerkleTree { levels })
    }

    /// The root hash.
    pub fn root(&self) -> Hash {
        self.levels.last().expect("non-empty tree")[0]
    }

    /// Number of leaves.
    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// Build an inclusion proof for the leaf at `index`.
    pub fn proof(&self, index: usize) -> Result<MerkleProof, MerkleError> {
        let len = self.leaf_count();
        if index >= len {
            return Err(MerkleError::IndexOutOfRange { index, len });
        }

        let mut path = Vec::with_capacity(self.levels.len() - 1);
        let mut i = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let mut sibling = i ^ 1;
            if sibling >= level.len() {
                // duplicated last hash: the node is its own right-hand sibling
                sibling = i;
            }
            path.push(ProofStep {
                hash: level[sibling],
                is_left: sibling < i,
            });
            i /= 2;
        }

        Ok(MerkleProof {
            tx_hash: self.levels[0][index],
            path,
            merkle_root: self.root(),
        })
    }
}

/// Fold the proof path from the leaf upward and compare against the root.
pub fn verify_proof(proof: &MerkleProof) -> bool {
    let mut current = proof.tx_hash;
    for step in &proof.path {
        current = if step.is_left {
            combine(&step.hash, &current)
        } else {
            combine(&current, &step.hash)
        };
    }
    current == proof.merkle_root
}
