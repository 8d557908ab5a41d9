//! Block records: construction by proof-of-work, wire serialization, genesis.

use std::sync::atomic::AtomicBool;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::codec::{CodecError, Reader, Writer};
use crate::constants;
use crate::merkle::{MerkleError, MerkleTree};
use crate::pow::ProofOfWork;
use crate::transaction::Transaction;
use crate::{Hash, ZERO_HASH};

/// Errors from block construction and decoding.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BlockError {
    #[error(transparent)]
    Merkle(#[from] MerkleError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("mining interrupted before a valid nonce was found")]
    Interrupted,
}

/// One sealed block of the chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// Seal time, seconds since the Unix epoch.
    pub timestamp: i64,
    /// First transaction is always a coinbase.
    pub transactions: Vec<Transaction>,
    pub prev_hash: Hash,
    pub hash: Hash,
    pub nonce: i32,
    pub bits: i32,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Block {
    /// Assemble and seal a block: stamp the current time, then search for a
    /// nonce that meets the difficulty. The abort flag is polled between
    /// nonce batches so shutdown can interrupt the search.
    pub fn mine(
        transactions: Vec<Transaction>,
        prev_hash: Hash,
        bits: i32,
        abort: &AtomicBool,
    ) -> Result<Block, BlockError> {
        let mut block = Block {
            timestamp: now_unix(),
            transactions,
            prev_hash,
            hash: ZERO_HASH,
            nonce: 0,
            bits,
        };

        let (nonce, hash) = {
            let pow = ProofOfWork::new(&block)?;
            pow.run(abort).ok_or(BlockError::Interrupted)?
        };
        block.nonce = nonce;
        block.hash = hash;
        Ok(block)
    }

    /// The genesis block: a single coinbase, all-zero predecessor, initial
    /// difficulty.
    pub fn genesis(coinbase: Transaction, abort: &AtomicBool) -> Result<Block, BlockError> {
        Self::mine(vec![coinbase], ZERO_HASH, constants::INITIAL_BITS, abort)
    }

    /// Merkle root over the block's transactions.
    pub fn merkle_root(&self) -> Result<Hash, MerkleError> {
        Ok(MerkleTree::new(&self.transactions)?.root())
    }

    /// Whether the stored hash matches the recomputed header hash.
    pub fn verify_hash(&self) -> bool {
        match ProofOfWork::new(self) {
            Ok(pow) => pow.header_hash() == self.hash,
            Err(_) => false,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_i64(self.timestamp);
        w.put_u32(self.transactions.len() as u32);
        for tx in &self.transactions {
            let tx_bytes = tx.serialize();
            w.put_bytes(&tx_bytes);
        }
        w.put_raw(&self.prev_hash);
        w.put_raw(&self.hash);
        w.put_i32(self.nonce);
        w.put_i32(self.bits);
        w.into_bytes()
    }

    pub fn deserialize(data: &[u8]) -> Result<Block, CodecError> {
        let mut r = Reader::new(data);

        let timestamp = r.i64()?;
        let tx_count = r.u32()?;
        let mut transactions = Vec::with_capacity(tx_count.min(1024) as usize);
        for _ in 0..tx_count {
            let tx_bytes = r.bytes()?;
            transactions.push(Transaction::deserialize(&tx_bytes)?);
        }
        let prev_hash = r.hash()?;
        let hash = r.hash()?;
        let nonce = r.i32()?;
        let bits = r.i32()?;
        r.finish()?;

        Ok(Block {
            timestamp,
            transactions,
            prev_hash,
            hash,
            nonce,
            bits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{address_from_pubkey, Keypair};
    use crate::pow::no_abort;

    fn coinbase() -> Transaction {
        let kp = Keypair::generate();
        let addr = address_from_pubkey(kp.public_key());
        Transaction::new_coinbase(&addr, "", 0).unwrap()
    }

    #[test]
    fn mine_links_and_hashes() {
        let prev = [3u8; 32];
        let block = Block::mine(vec![coinbase()], prev, 8, no_abort()).unwrap();
        assert_eq!(block.prev_hash, prev);
        assert_eq!(block.bits, 8);
        assert!(block.verify_hash());
    }

    #[test]
    fn genesis_has_zero_prev() {
        let block = Block::genesis(coinbase(), no_abort()).unwrap();
        assert_eq!(block.prev_hash, ZERO_HASH);
        assert_eq!(block.bits, constants::INITIAL_BITS);
        assert_eq!(block.transactions.len(), 1);
        assert!(block.transactions[0].is_coinbase());
    }

    #[test]
    fn serialize_roundtrip() {
        let block = Block::mine(vec![coinbase(), coinbase()], [1u8; 32], 8, no_abort()).unwrap();
        let decoded = Block::deserialize(&block.serialize()).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn truncated_block_rejected() {
        let block = Block::mine(vec![coinbase()], [1u8; 32], 8, no_abort()).unwrap();
        let bytes = block.serialize();
        assert!(Block::deserialize(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn tampered_hash_detected() {
        let mut block = Block::mine(vec![coinbase()], [1u8; 32], 8, no_abort()).unwrap();
        block.hash[0] ^= 0xFF;
        assert!(!block.verify_hash());
    }
}
