//! Persistent blockchain: block store, tip management, difficulty
//! retargeting, and transaction lookup/signing/verification.
//!
//! Backed by a single sled tree with four key prefixes:
//! `l` → tip hash, `b‖hash` → serialized block, `h‖hash` → 4-byte LE height,
//! `u‖txid` → serialized unspent outputs (maintained by [`crate::utxo`]).
//! Every multi-key mutation goes through one atomic batch; the in-memory tip
//! advances only after the batch lands.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;

use crate::block::{Block, BlockError};
use crate::codec::CodecError;
use crate::constants;
use crate::crypto::Signer;
use crate::merkle::MerkleError;
use crate::pow::{ProofOfWork, U512};
use crate::transaction::{Transaction, TxError, TxOutputs};
use crate::{Hash, ZERO_HASH};

/// Key of the current tip hash.
const TIP_KEY: &[u8] = b"l";
/// Prefix of block records.
const BLOCK_PREFIX: u8 = b'b';
/// Prefix of height records.
const HEIGHT_PREFIX: u8 = b'h';
/// Prefix of UTXO records.
pub(crate) const UTXO_PREFIX: u8 = b'u';

pub(crate) fn block_key(hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(BLOCK_PREFIX);
    key.extend_from_slice(hash);
    key
}

fn height_key(hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(HEIGHT_PREFIX);
    key.extend_from_slice(hash);
    key
}

pub(crate) fn utxo_key(txid: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + txid.len());
    key.push(UTXO_PREFIX);
    key.extend_from_slice(txid);
    key
}

/// Errors from chain operations.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("no blockchain found; create one first")]
    NoChain,
    #[error("blockchain already exists")]
    AlreadyExists,
    #[error("block not found")]
    BlockNotFound,
    #[error("transaction {0} not found")]
    TxNotFound(String),
    #[error("block does not extend the current tip")]
    TipMismatch,
    #[error("invalid block: {0}")]
    InvalidBlock(String),
    #[error("mining interrupted")]
    Interrupted,
    #[error("storage error: {0}")]
    Store(#[from] sled::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Tx(#[from] TxError),
}

impl From<BlockError> for ChainError {
    fn from(e: BlockError) -> Self {
        match e {
            BlockError::Interrupted => ChainError::Interrupted,
            BlockError::Merkle(m) => ChainError::InvalidBlock(m.to_string()),
            BlockError::Codec(c) => ChainError::Codec(c),
        }
    }
}

impl From<MerkleError> for ChainError {
    fn from(e: MerkleError) -> Self {
        ChainError::InvalidBlock(e.to_string())
    }
}

/// The persistent chain. Owns the store handle for the node's lifetime; the
/// UTXO index borrows it rather than opening the database a second time.
pub struct Blockchain {
    pub(crate) db: sled::Db,
    tip: Hash,
    tip_height: i32,
}

impl Blockchain {
    /// Create a new chain at `path`, mining the genesis block whose coinbase
    /// pays `address`. Fails with `AlreadyExists` when a chain is present.
    pub fn create(path: &Path, address: &str) -> Result<Self, ChainError> {
        let db = sled::open(path)?;
        if db.get(TIP_KEY)?.is_some() {
            return Err(ChainError::AlreadyExists);
        }

        let coinbase = Transaction::new_coinbase(address, constants::GENESIS_COINBASE_DATA, 0)?;
        let genesis = Block::genesis(coinbase, crate::pow::no_abort())?;

        let mut batch = sled::Batch::default();
        batch.insert(block_key(&genesis.hash), genesis.serialize());
        batch.insert(TIP_KEY, &genesis.hash[..]);
        batch.insert(height_key(&genesis.hash), &0u32.to_le_bytes()[..]);
        db.apply_batch(batch)?;

        tracing::info!(
            "Created blockchain, genesis {} pays {}",
            hex::encode(genesis.hash),
            address
        );

        Ok(Blockchain {
            db,
            tip: genesis.hash,
            tip_height: 0,
        })
    }

    /// Open an existing chain at `path`. Fails with `NoChain` when no tip
    /// pointer has been written yet.
    pub fn open(path: &Path) -> Result<Self, ChainError> {
        let db = sled::open(path)?;
        let tip_bytes = db.get(TIP_KEY)?.ok_or(ChainError::NoChain)?;
        let tip: Hash = tip_bytes
            .as_ref()
            .try_into()
            .map_err(|_| ChainError::InvalidBlock("malformed tip pointer".into()))?;

        let height_bytes = db.get(height_key(&tip))?.ok_or(ChainError::NoChain)?;
        let height_arr: [u8; 4] = height_bytes
            .as_ref()
            .try_into()
            .map_err(|_| ChainError::InvalidBlock("malformed height record".into()))?;
        let tip_height = u32::from_le_bytes(height_arr) as i32;

        Ok(Blockchain {
            db,
            tip,
            tip_height,
        })
    }

    /// Current tip hash.
    pub fn tip(&self) -> Hash {
        self.tip
    }

    /// Cached tip height (genesis = 0).
    pub fn height(&self) -> i32 {
        self.tip_height
    }

    /// Stored height of a block, or −1 when unknown.
    pub fn height_of(&self, hash: &Hash) -> i32 {
        match self.db.get(height_key(hash)) {
            Ok(Some(bytes)) => match <[u8; 4]>::try_from(bytes.as_ref()) {
                Ok(arr) => u32::from_le_bytes(arr) as i32,
                Err(_) => -1,
            },
            _ => -1,
        }
    }

    fn write_block(&mut self, block: &Block, serialized: Vec<u8>) -> Result<(), ChainError> {
        let new_height = self.tip_height + 1;
        let mut batch = sled::Batch::default();
        batch.insert(block_key(&block.hash), serialized);
        batch.insert(TIP_KEY, &block.hash[..]);
        batch.insert(height_key(&block.hash), &(new_height as u32).to_le_bytes()[..]);
        self.db.apply_batch(batch)?;

        self.tip = block.hash;
        self.tip_height = new_height;
        Ok(())
    }

    /// Verify the given transactions, seal them into a block extending the
    /// tip at the correct difficulty, and persist it. Transactions may spend
    /// outputs of earlier transactions in the same list.
    pub fn mine_block(
        &mut self,
        transactions: Vec<Transaction>,
        abort: &AtomicBool,
    ) -> Result<Block, ChainError> {
        let mut ctx: HashMap<String, Transaction> = HashMap::new();
        for tx in &transactions {
            if !tx.is_coinbase() && !self.verify_transaction_with(tx, &ctx)? {
                return Err(ChainError::InvalidBlock(format!(
                    "contains invalid transaction {}",
                    tx.id_hex()
                )));
            }
            ctx.insert(tx.id_hex(), tx.clone());
        }

        let next_bits = self.next_work_required(self.tip_height + 1)?;
        let block = Block::mine(transactions, self.tip, next_bits, abort)?;

        let serialized = block.serialize();
        self.write_block(&block, serialized)?;
        Ok(block)
    }

    /// Append a block received from a peer. Returns `false` without side
    /// effects when the block is already stored.
    pub fn add_block(&mut self, block: &Block) -> Result<bool, ChainError> {
        if block.transactions.is_empty() {
            return Err(ChainError::InvalidBlock("no transactions".into()));
        }
        if !block.transactions[0].is_coinbase() {
            return Err(ChainError::InvalidBlock("first transaction not a coinbase".into()));
        }
        if block.transactions.len() > constants::MAX_BLOCK_TXS {
            return Err(ChainError::InvalidBlock(format!(
                "{} transactions exceeds cap of {}",
                block.transactions.len(),
                constants::MAX_BLOCK_TXS
            )));
        }
        let serialized = block.serialize();
        if serialized.len() > constants::MAX_BLOCK_SIZE {
            return Err(ChainError::InvalidBlock(format!(
                "{} bytes exceeds maximum block size",
                serialized.len()
            )));
        }

        if block.prev_hash != self.tip {
            return Err(ChainError::TipMismatch);
        }
        if self.db.get(block_key(&block.hash))?.is_some() {
            return Ok(false);
        }

        if !block.verify_hash() {
            return Err(ChainError::InvalidBlock("stored hash does not match header".into()));
        }
        let pow = ProofOfWork::new(block)?;
        if !pow.validate() {
            return Err(ChainError::InvalidBlock("insufficient proof of work".into()));
        }

        self.write_block(block, serialized)?;
        Ok(true)
    }

    /// Fetch a block by hash.
    pub fn get_block(&self, hash: &Hash) -> Result<Block, ChainError> {
        let bytes = self
            .db
            .get(block_key(hash))?
            .ok_or(ChainError::BlockNotFound)?;
        Ok(Block::deserialize(&bytes)?)
    }

    /// All block hashes strictly after `after`, oldest first. Empty when
    /// `after` is the tip or is not on this chain at all.
    pub fn block_hashes_after(&self, after: &Hash) -> Result<Vec<Hash>, ChainError> {
        let mut hashes = Vec::new();
        for block in self.iter() {
            hashes.push(block?.hash);
        }
        hashes.reverse();

        match hashes.iter().position(|h| h == after) {
            Some(pos) => Ok(hashes[pos + 1..].to_vec()),
            None => Ok(Vec::new()),
        }
    }

    /// Iterate blocks from the tip back to genesis.
    pub fn iter(&self) -> ChainIterator<'_> {
        ChainIterator {
            chain: self,
            current: self.tip,
        }
    }

    /// Difficulty for the block about to be mined at `next_height`.
    pub fn next_work_required(&self, next_height: i32) -> Result<i32, ChainError> {
        if self.tip == ZERO_HASH {
            return Ok(constants::INITIAL_BITS);
        }

        let tip_block = self.get_block(&self.tip)?;
        if next_height % constants::RETARGET_INTERVAL != 0 {
            return Ok(tip_block.bits);
        }

        // walk back to the anchor block at the start of the interval
        let mut anchor_hash = self.tip;
        for _ in 0..constants::RETARGET_INTERVAL - 1 {
            let block = self.get_block(&anchor_hash)?;
            anchor_hash = block.prev_hash;
            if anchor_hash == ZERO_HASH {
                return Ok(tip_block.bits);
            }
        }
        let anchor = self.get_block(&anchor_hash)?;

        let actual = (tip_block.timestamp - anchor.timestamp)
            .clamp(constants::TARGET_TIMESPAN / 4, constants::TARGET_TIMESPAN * 4);

        // newTarget = oldTarget * actual / expected, in 512 bits to survive
        // the intermediate product
        let old_target = U512::one() << (256 - tip_block.bits) as usize;
        let new_target = old_target * U512::from(actual as u64)
            / U512::from(constants::TARGET_TIMESPAN as u64);

        let new_bits =
            (257 - new_target.bits() as i32).clamp(constants::MIN_BITS, constants::MAX_BITS);

        tracing::info!(
            "Retarget at height {}: bits {} -> {} (actual={}s, expected={}s)",
            next_height,
            tip_block.bits,
            new_bits,
            actual,
            constants::TARGET_TIMESPAN
        );
        Ok(new_bits)
    }

    /// All unspent outputs across the chain, keyed by hex txid.
    pub fn find_utxo(&self) -> Result<HashMap<String, TxOutputs>, ChainError> {
        let mut utxo: HashMap<String, TxOutputs> = HashMap::new();
        let mut spent: HashMap<String, Vec<i32>> = HashMap::new();

        for block in self.iter() {
            let block = block?;
            for tx in &block.transactions {
                let txid = tx.id_hex();

                if !utxo.contains_key(&txid) {
                    let mut outs = TxOutputs::default();
                    for (idx, out) in tx.vout.iter().enumerate() {
                        let was_spent = spent
                            .get(&txid)
                            .is_some_and(|v| v.contains(&(idx as i32)));
                        if !was_spent {
                            outs.outputs.insert(idx as u32, out.clone());
                        }
                    }
                    if !outs.outputs.is_empty() {
                        utxo.insert(txid, outs);
                    }
                }

                if !tx.is_coinbase() {
                    for vin in &tx.vin {
                        spent
                            .entry(hex::encode(&vin.txid))
                            .or_default()
                            .push(vin.vout);
                    }
                }
            }
        }
        Ok(utxo)
    }

    /// Find a confirmed transaction by id.
    pub fn find_transaction(&self, id: &[u8]) -> Result<Transaction, ChainError> {
        for block in self.iter() {
            let block = block?;
            for tx in &block.transactions {
                if tx.id.as_slice() == id {
                    return Ok(tx.clone());
                }
            }
        }
        Err(ChainError::TxNotFound(hex::encode(id)))
    }

    /// Collect the previous transactions referenced by `tx`, consulting
    /// `block_ctx` before the chain.
    fn referenced_txs(
        &self,
        tx: &Transaction,
        block_ctx: &HashMap<String, Transaction>,
    ) -> Result<HashMap<String, Transaction>, ChainError> {
        let mut prev_txs = HashMap::new();
        for vin in &tx.vin {
            let txid_hex = hex::encode(&vin.txid);
            if prev_txs.contains_key(&txid_hex) {
                continue;
            }
            let prev = match block_ctx.get(&txid_hex) {
                Some(found) => found.clone(),
                None => self
                    .find_transaction(&vin.txid)
                    .map_err(|_| TxError::UnknownInput(txid_hex.clone()))?,
            };
            prev_txs.insert(txid_hex, prev);
        }
        Ok(prev_txs)
    }

    /// Sign every input of `tx` with the wallet-supplied signer.
    pub fn sign_transaction(
        &self,
        tx: &mut Transaction,
        signer: &dyn Signer,
    ) -> Result<(), ChainError> {
        let prev_txs = self.referenced_txs(tx, &HashMap::new())?;
        tx.sign(signer, &prev_txs)?;
        Ok(())
    }

    /// Verify `tx` against the chain alone.
    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool, ChainError> {
        self.verify_transaction_with(tx, &HashMap::new())
    }

    /// Verify `tx`, resolving inputs first against other transactions of the
    /// candidate block, then against the chain.
    pub fn verify_transaction_with(
        &self,
        tx: &Transaction,
        block_ctx: &HashMap<String, Transaction>,
    ) -> Result<bool, ChainError> {
        if tx.is_coinbase() {
            return Ok(true);
        }
        if tx.vin.is_empty() || tx.vout.is_empty() {
            return Ok(false);
        }

        let prev_txs = self.referenced_txs(tx, block_ctx)?;
        Ok(tx.verify(&prev_txs)?)
    }

    /// Fee of `tx` given the chain state; 0 for coinbases.
    pub fn transaction_fee(&self, tx: &Transaction) -> Result<i64, ChainError> {
        if tx.is_coinbase() {
            return Ok(0);
        }
        let prev_txs = self.referenced_txs(tx, &HashMap::new())?;
        Ok(tx.calculate_fee(&prev_txs)?)
    }
}

/// Walks the chain tip-first until the all-zero predecessor of genesis.
pub struct ChainIterator<'a> {
    chain: &'a Blockchain,
    current: Hash,
}

impl Iterator for ChainIterator<'_> {
    type Item = Result<Block, ChainError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current == ZERO_HASH {
            return None;
        }
        match self.chain.get_block(&self.current) {
            Ok(block) => {
                self.current = block.prev_hash;
                Some(Ok(block))
            }
            Err(e) => {
                self.current = ZERO_HASH;
                Some(Err(e))
            }
        }
    }
}
