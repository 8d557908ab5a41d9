//! # rafcoin
//!
//! A from-scratch proof-of-work cryptocurrency node:
//! - **UTXO ledger** — ECDSA/secp256k1-signed transactions over unspent outputs
//! - **Proof-of-work chain** — SHA-256 nonce search with periodic difficulty retargeting
//! - **P2P gossip** — version/verack handshake, inv-driven block and tx propagation,
//!   initial block download, ping/pong liveness
//! - **Mining** — background assembly of mempool transactions into sealed blocks
//! - **JSON-RPC** — localhost query and control surface for tooling

pub mod block;
pub mod chain;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod mempool;
pub mod merkle;
pub mod node;
pub mod peer;
pub mod pow;
pub mod protocol;
pub mod rpc;
pub mod transaction;
pub mod utxo;
pub mod wallet;

/// Protocol constants
pub mod constants {
    /// Base block reward (in raf).
    pub const SUBSIDY: i64 = 10;
    /// Number of blocks between subsidy halvings.
    pub const HALVING_INTERVAL: i32 = 210_000;

    /// Block subsidy at a given height: halved every `HALVING_INTERVAL` blocks.
    pub const fn block_subsidy(height: i32) -> i64 {
        let halvings = height / HALVING_INTERVAL;
        if halvings >= 64 {
            return 0;
        }
        SUBSIDY >> halvings
    }

    /// Difficulty of the genesis block and of every block until the first retarget.
    pub const INITIAL_BITS: i32 = 17;
    /// Retarget the difficulty every this many blocks.
    pub const RETARGET_INTERVAL: i32 = 2016;
    /// Expected wall-clock seconds per retarget interval (10-minute blocks).
    pub const TARGET_TIMESPAN: i64 = 2016 * 600;
    /// Easiest permitted target exponent.
    pub const MIN_BITS: i32 = 1;
    /// Hardest permitted target exponent.
    pub const MAX_BITS: i32 = 255;

    /// Maximum serialized block size in bytes (1 MB).
    pub const MAX_BLOCK_SIZE: usize = 1_000_000;
    /// Maximum number of transactions per block.
    pub const MAX_BLOCK_TXS: usize = 5_000;

    /// Coinbase payload of the genesis block.
    pub const GENESIS_COINBASE_DATA: &str =
        "The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

    /// Network magic prefixing every wire frame.
    pub const MAGIC: [u8; 4] = [0xCA, 0xFE, 0xBA, 0xBE];
    /// Maximum accepted wire payload (32 MiB); larger payloads abort the connection.
    pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024 * 1024;
    /// P2P protocol version advertised in `version` messages.
    pub const PROTOCOL_VERSION: i32 = 1;
    /// Service flag: full network node.
    pub const NODE_NETWORK: u64 = 1;
    /// User agent advertised in `version` messages.
    pub const USER_AGENT: &str = "/rafcoin:0.1.0/";

    /// Maximum number of simultaneous peer connections.
    pub const MAX_PEERS: usize = 125;
    /// Seconds between liveness pings to each peer.
    pub const PING_INTERVAL_SECS: u64 = 120;
    /// Seconds to wait for a matching pong before disconnecting.
    pub const PING_TIMEOUT_SECS: u64 = 30;
    /// Socket receive timeout in seconds.
    pub const PEER_RECV_TIMEOUT_SECS: u64 = 90;
    /// Socket send timeout in seconds.
    pub const PEER_SEND_TIMEOUT_SECS: u64 = 30;
    /// Seconds between sweeps of disconnected peers.
    pub const CLEANUP_INTERVAL_SECS: u64 = 30;
    /// Upper bound on the miner's wait for a mempool signal.
    pub const MINER_WAKE_SECS: u64 = 60;

    /// Default P2P listen port.
    pub const DEFAULT_P2P_PORT: u16 = 9333;
    /// Default JSON-RPC listen port (localhost only).
    pub const DEFAULT_RPC_PORT: u16 = 9334;
    /// Default data directory.
    pub const DEFAULT_DATA_DIR: &str = "./data";
}

/// 32-byte hash used throughout the protocol.
pub type Hash = [u8; 32];

/// The all-zero hash marking the predecessor of the genesis block.
pub const ZERO_HASH: Hash = [0u8; 32];

#[cfg(test)]
mod tests {
    use super::constants::*;

    #[test]
    fn subsidy_halves() {
        assert_eq!(block_subsidy(0), 10);
        assert_eq!(block_subsidy(HALVING_INTERVAL - 1), 10);
        assert_eq!(block_subsidy(HALVING_INTERVAL), 5);
        assert_eq!(block_subsidy(2 * HALVING_INTERVAL), 2);
        assert_eq!(block_subsidy(3 * HALVING_INTERVAL), 1);
        assert_eq!(block_subsidy(4 * HALVING_INTERVAL), 0);
    }

    #[test]
    fn subsidy_zero_after_64_halvings() {
        assert_eq!(block_subsidy(64 * HALVING_INTERVAL), 0);
    }
}
