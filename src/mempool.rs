//! Thread-safe pool of unconfirmed transactions, ordered by fee rate.
//!
//! Process-local and never persisted. The internal mutex is a leaf lock:
//! nothing else is acquired while it is held.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::block::Block;
use crate::transaction::Transaction;

#[derive(Clone, Debug)]
struct MempoolEntry {
    tx: Transaction,
    /// Fee per serialized byte, used for mining order only.
    fee_rate: f64,
}

/// The unconfirmed transaction pool.
#[derive(Default)]
pub struct Mempool {
    entries: Mutex<HashMap<String, MempoolEntry>>,
}

impl Mempool {
    pub fn new() -> Self {
        Mempool::default()
    }

    /// Insert a transaction. Re-adding an existing txid replaces its metadata.
    pub fn add(&self, tx: Transaction, fee_rate: f64) {
        let txid = tx.id_hex();
        let mut entries = self.entries.lock().expect("mempool lock");
        entries.insert(txid.clone(), MempoolEntry { tx, fee_rate });
        tracing::debug!(
            "Mempool added {} fee_rate={:.4} raf/byte ({} total)",
            &txid[..16.min(txid.len())],
            fee_rate,
            entries.len()
        );
    }

    /// Drop every transaction that was confirmed in `block`.
    pub fn remove_block(&self, block: &Block) {
        let mut entries = self.entries.lock().expect("mempool lock");
        for tx in &block.transactions {
            if entries.remove(&tx.id_hex()).is_some() {
                tracing::debug!("Mempool removed mined transaction {}", tx.id_hex());
            }
        }
    }

    /// All transactions, highest fee rate first.
    pub fn by_fee_rate_desc(&self) -> Vec<Transaction> {
        let entries = self.entries.lock().expect("mempool lock");
        let mut sorted: Vec<&MempoolEntry> = entries.values().collect();
        sorted.sort_by(|a, b| {
            b.fee_rate
                .partial_cmp(&a.fee_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        sorted.into_iter().map(|e| e.tx.clone()).collect()
    }

    /// Hex ids of every pooled transaction.
    pub fn transaction_ids(&self) -> Vec<String> {
        let entries = self.entries.lock().expect("mempool lock");
        entries.keys().cloned().collect()
    }

    pub fn find(&self, txid: &str) -> Option<Transaction> {
        let entries = self.entries.lock().expect("mempool lock");
        entries.get(txid).map(|e| e.tx.clone())
    }

    pub fn contains(&self, txid: &str) -> bool {
        let entries = self.entries.lock().expect("mempool lock");
        entries.contains_key(txid)
    }

    pub fn count(&self) -> usize {
        let entries = self.entries.lock().expect("mempool lock");
        entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{address_from_pubkey, Keypair};
    use crate::pow::no_abort;
    use crate::ZERO_HASH;

    fn tx(tag: &str) -> Transaction {
        let kp = Keypair::generate();
        let addr = address_from_pubkey(kp.public_key());
        Transaction::new_coinbase(&addr, tag, 0).unwrap()
    }

    #[test]
    fn add_find_contains() {
        let pool = Mempool::new();
        let t = tx("a");
        let id = t.id_hex();

        assert!(!pool.contains(&id));
        pool.add(t.clone(), 0.5);
        assert!(pool.contains(&id));
        assert_eq!(pool.find(&id).unwrap().id, t.id);
        assert_eq!(pool.count(), 1);
    }

    #[test]
    fn readd_is_idempotent() {
        let pool = Mempool::new();
        let t = tx("a");
        pool.add(t.clone(), 0.5);
        pool.add(t, 0.9);
        assert_eq!(pool.count(), 1);
    }

    #[test]
    fn ordered_by_fee_rate() {
        let pool = Mempool::new();
        let low = tx("low");
        let mid = tx("mid");
        let high = tx("high");
        pool.add(low.clone(), 0.1);
        pool.add(high.clone(), 2.0);
        pool.add(mid.clone(), 1.0);

        let sorted = pool.by_fee_rate_desc();
        assert_eq!(sorted[0].id, high.id);
        assert_eq!(sorted[1].id, mid.id);
        assert_eq!(sorted[2].id, low.id);
    }

    #[test]
    fn remove_block_clears_mined() {
        let pool = Mempool::new();
        let mined = tx("mined");
        let kept = tx("kept");
        pool.add(mined.clone(), 1.0);
        pool.add(kept.clone(), 1.0);

        let block = crate::block::Block::mine(vec![mined], ZERO_HASH, 8, no_abort()).unwrap();
        pool.remove_block(&block);

        assert_eq!(pool.count(), 1);
        assert!(pool.contains(&kept.id_hex()));
    }

    #[test]
    fn ids_listed() {
        let pool = Mempool::new();
        let t = tx("a");
        pool.add(t.clone(), 0.0);
        assert_eq!(pool.transaction_ids(), vec![t.id_hex()]);
    }
}
