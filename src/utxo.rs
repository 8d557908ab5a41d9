//! UTXO index: a rebuildable secondary view over the chain store.
//!
//! Spendable outputs live under `u‖txid` keys as [`TxOutputs`] maps keyed by
//! original output index. The index borrows the chain's store handle; it is
//! never a second open of the database.

use std::collections::HashMap;

use crate::block::Block;
use crate::chain::{utxo_key, Blockchain, ChainError, UTXO_PREFIX};
use crate::crypto;
use crate::transaction::{Transaction, TxError, TxInput, TxOutput, TxOutputs};

/// Operations over the unspent-output index.
pub struct UtxoSet<'a> {
    chain: &'a Blockchain,
}

impl<'a> UtxoSet<'a> {
    pub fn new(chain: &'a Blockchain) -> Self {
        UtxoSet { chain }
    }

    /// Drop every `u`-prefixed entry and rebuild the index from the chain.
    pub fn reindex(&self) -> Result<(), ChainError> {
        let mut deletes = sled::Batch::default();
        for entry in self.chain.db.scan_prefix([UTXO_PREFIX]) {
            let (key, _) = entry?;
            deletes.remove(key);
        }
        self.chain.db.apply_batch(deletes)?;

        let utxo = self.chain.find_utxo()?;

        let mut writes = sled::Batch::default();
        for (txid_hex, outs) in &utxo {
            let txid = hex::decode(txid_hex)
                .expect("index keys are produced by hex::encode");
            writes.insert(utxo_key(&txid), outs.serialize());
        }
        self.chain.db.apply_batch(writes)?;
        Ok(())
    }

    /// Fold one confirmed block into the index: erase the outputs its inputs
    /// spend (preserving the surviving indices), then record the outputs of
    /// every transaction in the block. All edits land in one batch.
    pub fn update(&self, block: &Block) -> Result<(), ChainError> {
        let mut batch = sled::Batch::default();
        // entries already modified by an earlier input of this same block,
        // so a second spend of the same prev-tx sees the reduced map
        let mut pending: HashMap<Vec<u8>, TxOutputs> = HashMap::new();

        for tx in &block.transactions {
            if !tx.is_coinbase() {
                for vin in &tx.vin {
                    let mut outs = match pending.remove(&vin.txid) {
                        Some(outs) => outs,
                        None => match self.chain.db.get(utxo_key(&vin.txid))? {
                            Some(bytes) => TxOutputs::deserialize(&bytes)?,
                            None => continue,
                        },
                    };

                    outs.outputs.remove(&(vin.vout as u32));
                    if outs.outputs.is_empty() {
                        batch.remove(utxo_key(&vin.txid));
                    } else {
                        batch.insert(utxo_key(&vin.txid), outs.serialize());
                        pending.insert(vin.txid.clone(), outs);
                    }
                }
            }

            let mut new_outputs = TxOutputs::default();
            for (idx, out) in tx.vout.iter().enumerate() {
                new_outputs.outputs.insert(idx as u32, out.clone());
            }
            batch.insert(utxo_key(&tx.id), new_outputs.serialize());
        }

        self.chain.db.apply_batch(batch)?;
        Ok(())
    }

    /// Every unspent output locked to `pub_key_hash`.
    pub fn find_utxo(&self, pub_key_hash: &[u8]) -> Result<Vec<TxOutput>, ChainError> {
        let mut utxos = Vec::new();
        for entry in self.chain.db.scan_prefix([UTXO_PREFIX]) {
            let (_, value) = entry?;
            let outs = TxOutputs::deserialize(&value)?;
            for out in outs.outputs.values() {
                if out.is_locked_with(pub_key_hash) {
                    utxos.push(out.clone());
                }
            }
        }
        Ok(utxos)
    }

    /// Accumulate outputs locked to `pub_key_hash` in store order until
    /// `amount` is covered. Returns the accumulated value and the selected
    /// output indices per hex txid.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: i64,
    ) -> Result<(i64, HashMap<String, Vec<u32>>), ChainError> {
        let mut selected: HashMap<String, Vec<u32>> = HashMap::new();
        let mut accumulated = 0i64;

        'scan: for entry in self.chain.db.scan_prefix([UTXO_PREFIX]) {
            let (key, value) = entry?;
            let txid_hex = hex::encode(&key[1..]);
            let outs = TxOutputs::deserialize(&value)?;

            for (idx, out) in &outs.outputs {
                if out.is_locked_with(pub_key_hash) && accumulated < amount {
                    accumulated += out.value;
                    selected.entry(txid_hex.clone()).or_default().push(*idx);
                    if accumulated >= amount {
                        break 'scan;
                    }
                }
            }
        }

        Ok((accumulated, selected))
    }

    /// Number of transactions with at least one unspent output.
    pub fn count_transactions(&self) -> Result<usize, ChainError> {
        let mut count = 0;
        for entry in self.chain.db.scan_prefix([UTXO_PREFIX]) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Build an unsigned transfer of `amount` from the owner of `pub_key` to
    /// `to`, with change back to the sender. The caller signs it afterwards.
    pub fn new_transaction(
        &self,
        pub_key: &[u8],
        to: &str,
        amount: i64,
    ) -> Result<Transaction, ChainError> {
        let pub_key_hash = crypto::hash_pubkey(pub_key);
        let (accumulated, selected) = self.find_spendable_outputs(&pub_key_hash, amount)?;

        if accumulated < amount {
            return Err(ChainError::Tx(TxError::InsufficientFunds {
                available: accumulated,
                required: amount,
            }));
        }

        let mut vin = Vec::new();
        for (txid_hex, indices) in &selected {
            let txid = hex::decode(txid_hex)
                .expect("selection keys are produced by hex::encode");
            for idx in indices {
                vin.push(TxInput {
                    txid: txid.clone(),
                    vout: *idx as i32,
                    signature: Vec::new(),
                    pub_key: pub_key.to_vec(),
                });
            }
        }

        let mut vout = vec![TxOutput::locked_to(amount, to).map_err(TxError::from)?];
        if accumulated > amount {
            let change_addr = crypto::address_from_pubkey(pub_key);
            vout.push(TxOutput::locked_to(accumulated - amount, &change_addr)
                .map_err(TxError::from)?);
        }

        let mut tx = Transaction {
            id: [0u8; 32],
            vin,
            vout,
        };
        tx.set_id();
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pow::no_abort;
    use crate::wallet::Wallet;
    use crate::ZERO_HASH;

    fn fresh_chain(wallet: &Wallet) -> (tempfile::TempDir, Blockchain) {
        let dir = tempfile::tempdir().unwrap();
        let chain = Blockchain::create(&dir.path().join("blocks"), &wallet.address()).unwrap();
        UtxoSet::new(&chain).reindex().unwrap();
        (dir, chain)
    }

    fn balance(chain: &Blockchain, wallet: &Wallet) -> i64 {
        UtxoSet::new(chain)
            .find_utxo(&crypto::hash_pubkey(wallet.public_key()))
            .unwrap()
            .iter()
            .map(|o| o.value)
            .sum()
    }

    #[test]
    fn reindex_after_genesis() {
        let alice = Wallet::new();
        let (_dir, chain) = fresh_chain(&alice);

        assert_eq!(UtxoSet::new(&chain).count_transactions().unwrap(), 1);
        assert_eq!(balance(&chain, &alice), 10);
    }

    #[test]
    fn spend_moves_balance() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let (_dir, mut chain) = fresh_chain(&alice);

        let utxo = UtxoSet::new(&chain);
        let mut tx = utxo.new_transaction(alice.public_key(), &bob.address(), 3).unwrap();
        chain.sign_transaction(&mut tx, &alice).unwrap();

        let coinbase = Transaction::new_coinbase(&alice.address(), "", 1).unwrap();
        let block = chain.mine_block(vec![coinbase, tx], no_abort()).unwrap();
        UtxoSet::new(&chain).update(&block).unwrap();

        // genesis 10 spent, change 7 back, fresh coinbase 10
        assert_eq!(balance(&chain, &alice), 17);
        assert_eq!(balance(&chain, &bob), 3);
    }

    #[test]
    fn insufficient_funds_reported() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let (_dir, chain) = fresh_chain(&alice);

        let err = UtxoSet::new(&chain)
            .new_transaction(alice.public_key(), &bob.address(), 1000)
            .unwrap_err();
        match err {
            ChainError::Tx(TxError::InsufficientFunds {
                available,
                required,
            }) => {
                assert_eq!(available, 10);
                assert_eq!(required, 1000);
            }
            other => panic!("expected InsufficientFunds, got {:?}", other),
        }
    }

    #[test]
    fn update_equals_reindex() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let (_dir, mut chain) = fresh_chain(&alice);

        let mut tx = UtxoSet::new(&chain)
            .new_transaction(alice.public_key(), &bob.address(), 4)
            .unwrap();
        chain.sign_transaction(&mut tx, &alice).unwrap();
        let cb = Transaction::new_coinbase(&bob.address(), "", 1).unwrap();
        let block = chain.mine_block(vec![cb, tx], no_abort()).unwrap();
        UtxoSet::new(&chain).update(&block).unwrap();

        let incremental_alice = balance(&chain, &alice);
        let incremental_bob = balance(&chain, &bob);

        UtxoSet::new(&chain).reindex().unwrap();
        assert_eq!(balance(&chain, &alice), incremental_alice);
        assert_eq!(balance(&chain, &bob), incremental_bob);
    }

    #[test]
    fn partial_spend_preserves_indices() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let (_dir, chain) = fresh_chain(&alice);
        let alice_hash = crypto::hash_pubkey(alice.public_key()).to_vec();

        // plant a funding entry with three outputs at indices 0, 1, 2
        let mut funding = TxOutputs::default();
        for idx in 0..3u32 {
            funding.outputs.insert(
                idx,
                TxOutput {
                    value: (idx as i64 + 1) * 5,
                    pub_key_hash: alice_hash.clone(),
                },
            );
        }
        let funding_txid = vec![0xAB; 32];
        chain
            .db
            .insert(utxo_key(&funding_txid), funding.serialize())
            .unwrap();

        // one transaction spends outputs 0 and 2 through two inputs
        let mut spender = Transaction {
            id: [0u8; 32],
            vin: vec![
                TxInput {
                    txid: funding_txid.clone(),
                    vout: 0,
                    signature: Vec::new(),
                    pub_key: alice.public_key().to_vec(),
                },
                TxInput {
                    txid: funding_txid.clone(),
                    vout: 2,
                    signature: Vec::new(),
                    pub_key: alice.public_key().to_vec(),
                },
            ],
            vout: vec![TxOutput {
                value: 20,
                pub_key_hash: crypto::hash_pubkey(bob.public_key()).to_vec(),
            }],
        };
        spender.set_id();

        let coinbase = Transaction::new_coinbase(&alice.address(), "", 1).unwrap();
        let block = Block {
            timestamp: 1,
            transactions: vec![coinbase, spender],
            prev_hash: chain.tip(),
            hash: ZERO_HASH,
            nonce: 0,
            bits: 8,
        };
        UtxoSet::new(&chain).update(&block).unwrap();

        let remaining = chain.db.get(utxo_key(&funding_txid)).unwrap().unwrap();
        let outs = TxOutputs::deserialize(&remaining).unwrap();
        // only the untouched output survives, under its original index
        assert_eq!(outs.outputs.keys().copied().collect::<Vec<_>>(), [1]);
        assert_eq!(outs.outputs[&1].value, 10);
    }

    #[test]
    fn spending_last_output_deletes_entry() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let (_dir, mut chain) = fresh_chain(&alice);
        let genesis_coinbase_id = chain
            .get_block(&chain.tip())
            .unwrap()
            .transactions[0]
            .id
            .to_vec();

        // spend the whole genesis output: no change output
        let mut tx = UtxoSet::new(&chain)
            .new_transaction(alice.public_key(), &bob.address(), 10)
            .unwrap();
        chain.sign_transaction(&mut tx, &alice).unwrap();
        let cb = Transaction::new_coinbase(&bob.address(), "", 1).unwrap();
        let block = chain.mine_block(vec![cb, tx], no_abort()).unwrap();
        UtxoSet::new(&chain).update(&block).unwrap();

        assert!(chain.db.get(utxo_key(&genesis_coinbase_id)).unwrap().is_none());
        assert_eq!(balance(&chain, &alice), 0);
        // 10 transferred plus the block's own coinbase
        assert_eq!(balance(&chain, &bob), 20);
    }

    #[test]
    fn find_spendable_stops_at_amount() {
        let alice = Wallet::new();
        let (_dir, mut chain) = fresh_chain(&alice);
        // add a second coinbase so alice holds two outputs of 10
        let cb = Transaction::new_coinbase(&alice.address(), "more", 1).unwrap();
        let block = chain.mine_block(vec![cb], no_abort()).unwrap();
        UtxoSet::new(&chain).update(&block).unwrap();

        let pkh = crypto::hash_pubkey(alice.public_key());
        let (acc, selected) = UtxoSet::new(&chain)
            .find_spendable_outputs(&pkh, 5)
            .unwrap();
        assert_eq!(acc, 10);
        assert_eq!(selected.values().map(|v| v.len()).sum::<usize>(), 1);
    }
}
