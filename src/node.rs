//! Node runtime: the concurrent composition of chain, mempool, peers, miner,
//! and RPC.
//!
//! Each peer gets two tasks: a reader that deserializes frames and dispatches
//! them, and a monitor that pings on an interval and disconnects on a missed
//! or mismatched pong. A cleanup task reaps disconnected peers; the miner
//! task sleeps on a notification from the mempool with a periodic fallback
//! wake. Lock order, outermost first: peer map, chain slot, miner wake,
//! per-peer pong slot, mempool.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::block::Block;
use crate::chain::{Blockchain, ChainError};
use crate::config;
use crate::constants;
use crate::mempool::Mempool;
use crate::peer::{Peer, PeerReceiver};
use crate::pow::ProofOfWork;
use crate::protocol::{
    commands, GetBlocksPayload, InvItem, InvPayload, InvType, Message, PingPayload,
    ProtocolError, VersionPayload,
};
use crate::transaction::Transaction;
use crate::utxo::UtxoSet;
use crate::Hash;

/// Errors surfaced by the node and its RPC handlers.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Peer(#[from] crate::peer::PeerError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("node is syncing; try again later")]
    Busy,
    #[error("invalid seed address '{0}'; expected IP:PORT")]
    InvalidSeedAddr(String),
}

/// Node configuration, resolved from CLI flags and the optional config file.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub listen_ip: Ipv4Addr,
    pub port: u16,
    pub rpc_port: u16,
    pub seed: Option<String>,
    pub miner_address: Option<String>,
    pub data_dir: PathBuf,
}

/// Handshake progress and the facts a peer's `version` told us.
pub(crate) struct Handshake {
    pub(crate) version_sent: bool,
    pub(crate) version_received: bool,
    pub(crate) complete: bool,
    pub(crate) remote_height: i32,
    pub(crate) services: u64,
    pub(crate) user_agent: String,
    pub(crate) protocol_version: i32,
}

impl Default for Handshake {
    fn default() -> Self {
        Handshake {
            version_sent: false,
            version_received: false,
            complete: false,
            remote_height: -1,
            services: 0,
            user_agent: String::new(),
            protocol_version: 0,
        }
    }
}

struct PongSlot {
    nonce: u64,
    signaled: bool,
}

/// Everything the node tracks for one connection.
pub(crate) struct PeerState {
    pub(crate) peer: Arc<Peer>,
    pub(crate) handshake: StdMutex<Handshake>,
    pong: StdMutex<PongSlot>,
    pong_notify: Notify,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl PeerState {
    fn new(peer: Arc<Peer>) -> Arc<Self> {
        Arc::new(PeerState {
            peer,
            handshake: StdMutex::new(Handshake::default()),
            pong: StdMutex::new(PongSlot {
                nonce: 0,
                signaled: false,
            }),
            pong_notify: Notify::new(),
            tasks: StdMutex::new(Vec::new()),
        })
    }

    fn addr_string(&self) -> String {
        self.peer.addr().to_string()
    }

    fn signal_pong(&self, nonce: u64) {
        {
            let mut slot = self.pong.lock().expect("pong lock");
            slot.nonce = nonce;
            slot.signaled = true;
        }
        self.pong_notify.notify_one();
    }

    /// Wake the monitor so it observes the dead connection and exits.
    fn wake_monitor(&self) {
        {
            let mut slot = self.pong.lock().expect("pong lock");
            slot.signaled = true;
        }
        self.pong_notify.notify_one();
    }

    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.tasks.lock().expect("tasks lock"))
    }
}

/// The open chain plus the identity of the at-most-one sync source.
pub(crate) struct ChainSlot {
    pub(crate) chain: Option<Blockchain>,
    pub(crate) sync_peer: Option<String>,
}

pub(crate) struct NodeInner {
    pub(crate) config: NodeConfig,
    pub(crate) chain: tokio::sync::Mutex<ChainSlot>,
    pub(crate) height: AtomicI32,
    pub(crate) syncing: AtomicBool,
    shutting_down: AtomicBool,
    pub(crate) shutdown: CancellationToken,
    pub(crate) mempool: Mempool,
    pub(crate) miner_wake: Notify,
    peers: tokio::sync::Mutex<HashMap<String, Arc<PeerState>>>,
}

/// Handle to a running (or startable) node. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

fn plain_message(command: &str, payload: Vec<u8>) -> Message {
    Message::new(command, payload).expect("command fits the frame")
}

impl Node {
    /// Set up a node: open the chain if one exists at the data directory.
    pub fn new(config: NodeConfig) -> Result<Self, NodeError> {
        let chain = match Blockchain::open(&config::blocks_path(&config.data_dir)) {
            Ok(chain) => Some(chain),
            Err(ChainError::NoChain) => {
                tracing::info!("No blockchain yet; create one to enable mining and sync");
                None
            }
            Err(e) => {
                tracing::warn!("Could not open blockchain: {}", e);
                None
            }
        };
        let height = chain.as_ref().map_or(-1, |c| c.height());

        Ok(Node {
            inner: Arc::new(NodeInner {
                config,
                chain: tokio::sync::Mutex::new(ChainSlot {
                    chain,
                    sync_peer: None,
                }),
                height: AtomicI32::new(height),
                syncing: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                mempool: Mempool::new(),
                miner_wake: Notify::new(),
                peers: tokio::sync::Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Current cached chain height (−1 before a chain exists).
    pub fn height(&self) -> i32 {
        self.inner.height.load(Ordering::Acquire)
    }

    /// Whether initial block download is in progress.
    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::Acquire)
    }

    /// Number of tracked peer connections.
    pub async fn peer_count(&self) -> usize {
        self.inner.peers.lock().await.len()
    }

    /// Request shutdown; `run` tears everything down and returns.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
    }

    /// Run the node until `stop` is called: RPC server, cleanup task,
    /// optional miner, optional seed connection, then the accept loop.
    pub async fn run(&self) -> Result<(), NodeError> {
        let inner = &self.inner;
        let listener =
            TcpListener::bind((inner.config.listen_ip, inner.config.port)).await?;
        tracing::info!("Node listening on {}", listener.local_addr()?);
        tracing::info!("Blockchain height: {}", self.height());

        let rpc_listener =
            TcpListener::bind((Ipv4Addr::LOCALHOST, inner.config.rpc_port)).await?;
        let rpc_task = tokio::spawn(crate::rpc::serve(rpc_listener, self.clone()));

        let cleanup_task = tokio::spawn(cleanup_loop(Arc::clone(inner)));

        let miner_task = inner.config.miner_address.clone().map(|address| {
            tracing::info!("Background miner enabled (reward -> {})", address);
            tokio::spawn(miner_loop(Arc::clone(inner), address))
        });

        if let Some(seed) = inner.config.seed.clone() {
            if let Err(e) = self.connect_to_seed(&seed).await {
                tracing::warn!("Failed to connect to seed {}: {}", seed, e);
            }
        }

        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.accept_peer(stream, addr).await,
                    Err(e) => {
                        if !inner.is_shutting_down() {
                            tracing::warn!("Accept error: {}", e);
                        }
                    }
                }
            }
        }

        inner.teardown().await;
        let _ = cleanup_task.await;
        if let Some(task) = miner_task {
            let _ = task.await;
        }
        let _ = rpc_task.await;
        tracing::info!("Node stopped");
        Ok(())
    }

    async fn accept_peer(&self, stream: TcpStream, addr: SocketAddr) {
        let inner = &self.inner;
        {
            let peers = inner.peers.lock().await;
            if peers.len() >= constants::MAX_PEERS {
                tracing::info!(
                    "Max peers reached ({}), rejecting connection from {}",
                    constants::MAX_PEERS,
                    addr
                );
                return;
            }
        }

        let (peer, receiver) = Peer::from_stream(stream, addr);
        let state = PeerState::new(peer);
        inner
            .peers
            .lock()
            .await
            .insert(state.addr_string(), Arc::clone(&state));
        spawn_peer_tasks(inner, state, receiver);
        tracing::info!("Accepted peer {}", addr);
    }

    /// One outbound connection to the configured seed; the outbound side
    /// opens the handshake by sending `version` first.
    pub async fn connect_to_seed(&self, seed: &str) -> Result<(), NodeError> {
        let addr: SocketAddr = seed
            .parse()
            .map_err(|_| NodeError::InvalidSeedAddr(seed.to_string()))?;

        let (peer, receiver) = Peer::connect(addr).await?;
        let state = PeerState::new(peer);
        self.inner.send_version(&state).await?;

        self.inner
            .peers
            .lock()
            .await
            .insert(state.addr_string(), Arc::clone(&state));
        spawn_peer_tasks(&self.inner, state, receiver);
        Ok(())
    }

    /// Mine one block from the current mempool; used by the miner task and
    /// the `mine` RPC. Fails with `Busy` during initial block download.
    pub async fn mine_block(&self, address: &str) -> Result<(Hash, i32), NodeError> {
        self.inner.mine_block(address).await
    }
}

impl NodeInner {
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    async fn teardown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.shutdown.cancel();
        self.miner_wake.notify_waiters();

        let peers: Vec<Arc<PeerState>> = {
            let mut map = self.peers.lock().await;
            map.drain().map(|(_, state)| state).collect()
        };
        for state in &peers {
            state.peer.disconnect().await;
            state.wake_monitor();
        }
        for state in peers {
            for handle in state.take_tasks() {
                let _ = handle.await;
            }
        }
    }

    // ── handshake ──

    async fn send_version(&self, state: &Arc<PeerState>) -> Result<(), NodeError> {
        let remote = state.peer.addr();
        let remote_ip = match remote.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(ip) => ip.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
        };

        let height = self.height.load(Ordering::Acquire);
        let payload = VersionPayload::new(
            (remote_ip, remote.port()),
            (self.config.listen_ip, self.config.port),
            height,
            true,
        );
        let msg = Message::new(commands::VERSION, payload.serialize()?)?;
        state.peer.send(&msg).await?;
        state.handshake.lock().expect("handshake lock").version_sent = true;

        tracing::info!("Sent version (height={}) to {}", height, remote);
        Ok(())
    }

    async fn handle_version(&self, state: &Arc<PeerState>, payload: &[u8]) {
        let version = match VersionPayload::deserialize(payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Dropping malformed version from {}: {}", state.addr_string(), e);
                return;
            }
        };
        let addr = state.addr_string();

        let need_version = {
            let mut hs = state.handshake.lock().expect("handshake lock");
            hs.version_received = true;
            hs.remote_height = version.start_height;
            hs.services = version.services;
            hs.user_agent = version.user_agent.clone();
            hs.protocol_version = version.version;
            !hs.version_sent
        };

        tracing::info!(
            "Received version from {} (height={}, agent={})",
            addr,
            version.start_height,
            version.user_agent
        );

        // reply with our own version if we are the receiving side
        if need_version {
            if let Err(e) = self.send_version(state).await {
                tracing::warn!("Failed to send version to {}: {}", addr, e);
                return;
            }
        }

        if let Err(e) = state
            .peer
            .send(&plain_message(commands::VERACK, Vec::new()))
            .await
        {
            tracing::warn!("Failed to send verack to {}: {}", addr, e);
            return;
        }
        tracing::info!("Sent verack to {}", addr);

        let our_height = self.height.load(Ordering::Acquire);
        if version.start_height > our_height {
            tracing::info!(
                "Peer {} has more blocks ({} vs our {})",
                addr,
                version.start_height,
                our_height
            );
            self.maybe_begin_sync(state, &addr).await;
        } else if version.start_height < our_height {
            // the peer will pull from us with getblocks
            tracing::info!(
                "We have more blocks than {} ({} vs their {})",
                addr,
                our_height,
                version.start_height
            );
        } else {
            tracing::debug!("Same height as {}", addr);
        }
    }

    /// Become the sync client of `state` unless a sync is already running.
    /// The first higher peer wins; the check is repeated under the chain
    /// lock to serialize racing version handlers.
    async fn maybe_begin_sync(&self, state: &Arc<PeerState>, addr: &str) {
        if self.syncing.load(Ordering::Acquire) {
            return;
        }

        let request = {
            let mut slot = self.chain.lock().await;
            if self.syncing.load(Ordering::Acquire) {
                None
            } else if let Some(chain) = slot.chain.as_ref() {
                let tip = chain.tip();
                self.syncing.store(true, Ordering::Release);
                slot.sync_peer = Some(addr.to_string());
                Some(GetBlocksPayload { tip_hash: tip })
            } else {
                None
            }
        };

        if let Some(get_blocks) = request {
            let msg = plain_message(commands::GETBLOCKS, get_blocks.serialize());
            match state.peer.send(&msg).await {
                Ok(()) => tracing::info!("Sent getblocks to {}", addr),
                Err(e) => {
                    tracing::warn!("Failed to send getblocks to {}: {}", addr, e);
                    self.clear_sync_if_peer(addr).await;
                }
            }
        }
    }

    async fn clear_sync_if_peer(&self, addr: &str) {
        let mut slot = self.chain.lock().await;
        if slot.sync_peer.as_deref() == Some(addr) {
            slot.sync_peer = None;
            self.syncing.store(false, Ordering::Release);
            tracing::warn!("Sync source {} is gone; sync reset", addr);
        }
    }

    fn handle_verack(&self, state: &Arc<PeerState>) {
        let (user_agent, protocol_version, services) = {
            let mut hs = state.handshake.lock().expect("handshake lock");
            hs.complete = true;
            (hs.user_agent.clone(), hs.protocol_version, hs.services)
        };
        tracing::info!(
            "Handshake complete with {} (agent={}, protocol={}, services={})",
            state.addr_string(),
            user_agent,
            protocol_version,
            services
        );
    }

    // ── liveness ──

    async fn handle_ping(&self, state: &Arc<PeerState>, payload: &[u8]) {
        let ping = match PingPayload::deserialize(payload) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Dropping malformed ping from {}: {}", state.addr_string(), e);
                return;
            }
        };
        let pong = plain_message(commands::PONG, ping.serialize());
        if state.peer.send(&pong).await.is_ok() {
            tracing::debug!("Replied pong to {}", state.addr_string());
        }
    }

    fn handle_pong(&self, state: &Arc<PeerState>, payload: &[u8]) {
        match PingPayload::deserialize(payload) {
            Ok(pong) => state.signal_pong(pong.nonce),
            Err(e) => {
                tracing::warn!("Dropping malformed pong from {}: {}", state.addr_string(), e);
            }
        }
    }

    // ── inventory ──

    async fn handle_inv(&self, state: &Arc<PeerState>, payload: &[u8]) {
        let inv = match InvPayload::deserialize(payload) {
            Ok(i) => i,
            Err(e) => {
                tracing::warn!("Dropping malformed inv from {}: {}", state.addr_string(), e);
                return;
            }
        };
        tracing::debug!(
            "Received inv with {} item(s) from {}",
            inv.items.len(),
            state.addr_string()
        );

        // request only what we don't already have
        let mut to_request = Vec::new();
        {
            let slot = self.chain.lock().await;
            for item in inv.items {
                match item.inv_type {
                    InvType::Tx => {
                        let txid = hex::encode(&item.hash);
                        if self.mempool.contains(&txid) {
                            tracing::debug!(
                                "Already have tx {}, skipping",
                                &txid[..16.min(txid.len())]
                            );
                        } else {
                            to_request.push(item);
                        }
                    }
                    InvType::Block => {
                        let stored = match <Hash>::try_from(item.hash.as_slice()) {
                            Ok(hash) => slot
                                .chain
                                .as_ref()
                                .is_some_and(|chain| chain.height_of(&hash) >= 0),
                            Err(_) => false,
                        };
                        if stored {
                            tracing::debug!(
                                "Already have block {}..., skipping",
                                &hex::encode(&item.hash)[..16.min(item.hash.len() * 2)]
                            );
                        } else {
                            to_request.push(item);
                        }
                    }
                }
            }
        }
        if to_request.is_empty() {
            return;
        }

        let count = to_request.len();
        let payload = match InvPayload::new(to_request) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Cannot build getdata: {}", e);
                return;
            }
        };
        let msg = plain_message(commands::GETDATA, payload.serialize());
        if state.peer.send(&msg).await.is_ok() {
            tracing::debug!("Sent getdata for {} item(s) to {}", count, state.addr_string());
        }
    }

    async fn handle_getblocks(&self, state: &Arc<PeerState>, payload: &[u8]) {
        let get_blocks = match GetBlocksPayload::deserialize(payload) {
            Ok(g) => g,
            Err(e) => {
                tracing::warn!(
                    "Dropping malformed getblocks from {}: {}",
                    state.addr_string(),
                    e
                );
                return;
            }
        };

        let result = {
            let slot = self.chain.lock().await;
            match slot.chain.as_ref() {
                Some(chain) => match chain.block_hashes_after(&get_blocks.tip_hash) {
                    Ok(hashes) => Some((hashes, chain.tip())),
                    Err(e) => {
                        tracing::warn!("getblocks walk failed: {}", e);
                        None
                    }
                },
                None => {
                    tracing::warn!("Cannot handle getblocks: no blockchain");
                    None
                }
            }
        };
        let Some((hashes, tip)) = result else { return };

        if hashes.is_empty() {
            if get_blocks.tip_hash != tip {
                tracing::warn!(
                    "No common ancestor with {} (their tip: {}...)",
                    state.addr_string(),
                    &hex::encode(get_blocks.tip_hash)[..16]
                );
            } else {
                tracing::debug!("Peer {} is already up to date", state.addr_string());
            }
            return;
        }

        // the inv count field is one byte; longer suffixes go out in batches
        // as the peer's tip advances
        let total = hashes.len();
        let items: Vec<InvItem> = hashes
            .into_iter()
            .take(u8::MAX as usize)
            .map(InvItem::block)
            .collect();
        if total > items.len() {
            tracing::debug!("Truncating inv to {} of {} hashes", items.len(), total);
        }

        let count = items.len();
        let payload = match InvPayload::new(items) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Cannot build inv: {}", e);
                return;
            }
        };
        let msg = plain_message(commands::INV, payload.serialize());
        if state.peer.send(&msg).await.is_ok() {
            tracing::info!(
                "Sent inv with {} block hash(es) to {}",
                count,
                state.addr_string()
            );
        }
    }

    async fn handle_getdata(&self, state: &Arc<PeerState>, payload: &[u8]) {
        let get_data = match InvPayload::deserialize(payload) {
            Ok(g) => g,
            Err(e) => {
                tracing::warn!(
                    "Dropping malformed getdata from {}: {}",
                    state.addr_string(),
                    e
                );
                return;
            }
        };
        tracing::debug!(
            "Received getdata for {} item(s) from {}",
            get_data.items.len(),
            state.addr_string()
        );

        let mut block_hashes: Vec<Hash> = Vec::new();
        let mut tx_hashes: Vec<Vec<u8>> = Vec::new();
        for item in get_data.items {
            match item.inv_type {
                InvType::Block => {
                    if let Ok(hash) = <Hash>::try_from(item.hash.as_slice()) {
                        block_hashes.push(hash);
                    }
                }
                InvType::Tx => tx_hashes.push(item.hash),
            }
        }

        // gather all requested blocks under one lock, send outside it
        let blocks: Vec<Block> = {
            let slot = self.chain.lock().await;
            match slot.chain.as_ref() {
                Some(chain) => block_hashes
                    .iter()
                    .filter_map(|hash| match chain.get_block(hash) {
                        Ok(block) => Some(block),
                        Err(_) => {
                            tracing::warn!("Block {}... not found", &hex::encode(hash)[..16]);
                            None
                        }
                    })
                    .collect(),
                None => Vec::new(),
            }
        };

        for block in &blocks {
            let msg = plain_message(commands::BLOCK, block.serialize());
            if state.peer.send(&msg).await.is_ok() {
                tracing::debug!(
                    "Sent block {}... to {}",
                    &hex::encode(block.hash)[..16],
                    state.addr_string()
                );
            }
        }

        for hash in &tx_hashes {
            let txid = hex::encode(hash);
            if let Some(tx) = self.mempool.find(&txid) {
                let msg = plain_message(commands::TX, tx.serialize());
                if state.peer.send(&msg).await.is_ok() {
                    tracing::debug!("Sent tx {}... to {}", &txid[..16], state.addr_string());
                }
            }
            // unknown requests are silently dropped
        }
    }

    // ── transaction propagation ──

    /// Structural sanity: a coinbase stands alone; anything else needs at
    /// least one input and one output. Signature checks happen when the tx
    /// is selected for a block.
    fn transaction_shape_ok(tx: &Transaction) -> bool {
        tx.is_coinbase() || (!tx.vin.is_empty() && !tx.vout.is_empty())
    }

    async fn fee_rate_of(&self, tx: &Transaction) -> f64 {
        let size = tx.serialize().len();
        if size == 0 {
            return 0.0;
        }
        let slot = self.chain.lock().await;
        match slot.chain.as_ref() {
            Some(chain) => match chain.transaction_fee(tx) {
                Ok(fee) => fee as f64 / size as f64,
                Err(_) => 0.0,
            },
            None => 0.0,
        }
    }

    async fn handle_tx(&self, state: &Arc<PeerState>, payload: &[u8]) {
        let tx = match Transaction::deserialize(payload) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("Failed to deserialize tx from {}: {}", state.addr_string(), e);
                return;
            }
        };
        let txid = tx.id_hex();
        tracing::info!("Received transaction {} from {}", txid, state.addr_string());

        if self.mempool.contains(&txid) {
            tracing::debug!("Already have tx {}..., ignoring", &txid[..16]);
            return;
        }
        if !Self::transaction_shape_ok(&tx) {
            tracing::warn!("Rejected invalid transaction {}", txid);
            return;
        }

        let fee_rate = self.fee_rate_of(&tx).await;
        self.mempool.add(tx.clone(), fee_rate);
        self.miner_wake.notify_one();
        self.relay_transaction(&tx, Some(&state.addr_string())).await;
    }

    /// Announce a transaction to every handshake-complete peer except the
    /// one it came from.
    pub(crate) async fn relay_transaction(&self, tx: &Transaction, source: Option<&str>) {
        let payload = InvPayload::new(vec![InvItem::tx(tx.id)]).expect("single item");
        let msg = plain_message(commands::INV, payload.serialize());

        let peers = self.peers.lock().await;
        for (addr, state) in peers.iter() {
            if !state.peer.is_connected() {
                continue;
            }
            if !state.handshake.lock().expect("handshake lock").complete {
                continue;
            }
            if source == Some(addr.as_str()) {
                continue;
            }
            match state.peer.send(&msg).await {
                Ok(()) => tracing::debug!(
                    "Relayed tx {}... inv to {}",
                    &tx.id_hex()[..16],
                    addr
                ),
                Err(e) => tracing::warn!("Failed to relay tx inv to {}: {}", addr, e),
            }
        }
    }

    async fn broadcast_block(&self, block: &Block) {
        let payload = InvPayload::new(vec![InvItem::block(block.hash)]).expect("single item");
        let msg = plain_message(commands::INV, payload.serialize());
        let hash_hex = hex::encode(block.hash);

        let peers = self.peers.lock().await;
        for (addr, state) in peers.iter() {
            if !state.peer.is_connected() {
                continue;
            }
            if !state.handshake.lock().expect("handshake lock").complete {
                continue;
            }
            match state.peer.send(&msg).await {
                Ok(()) => tracing::info!("Announced block {}... to {}", &hash_hex[..16], addr),
                Err(e) => tracing::warn!("Failed to announce block to {}: {}", addr, e),
            }
        }
    }

    // ── block acceptance ──

    async fn handle_block(&self, state: &Arc<PeerState>, payload: &[u8]) {
        let block = match Block::deserialize(payload) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(
                    "Failed to deserialize block from {}: {}",
                    state.addr_string(),
                    e
                );
                return;
            }
        };
        let hash_hex = hex::encode(block.hash);
        tracing::info!("Received block {} from {}", hash_hex, state.addr_string());

        // proof of work and structure, before touching the chain lock
        let pow_ok = match ProofOfWork::new(&block) {
            Ok(pow) => pow.validate() && block.verify_hash(),
            Err(_) => false,
        };
        if !pow_ok {
            tracing::warn!("Rejected invalid block {}", hash_hex);
            return;
        }
        for tx in &block.transactions {
            if !Self::transaction_shape_ok(tx) {
                tracing::warn!(
                    "Rejected block {}: contains invalid transaction {}",
                    hash_hex,
                    tx.id_hex()
                );
                return;
            }
        }

        let mut slot = self.chain.lock().await;
        let Some(chain) = slot.chain.as_mut() else {
            tracing::warn!("Cannot store block: no blockchain");
            return;
        };

        match chain.add_block(&block) {
            Err(e) => {
                tracing::warn!("Rejected block {}: {}", hash_hex, e);
                return;
            }
            Ok(false) => {
                tracing::debug!("Already have block {}...", &hash_hex[..16]);
            }
            Ok(true) => {
                // during IBD the index is rebuilt once at the end
                if !self.syncing.load(Ordering::Acquire) {
                    if let Err(e) = UtxoSet::new(chain).update(&block) {
                        tracing::error!("UTXO update failed for {}: {}", hash_hex, e);
                    }
                }
                self.mempool.remove_block(&block);
                self.height.store(chain.height(), Ordering::Release);
                tracing::info!(
                    "Stored block {}... (height={})",
                    &hash_hex[..16],
                    chain.height()
                );
            }
        }

        // sync completion check, still under the chain lock
        if self.syncing.load(Ordering::Acquire)
            && slot.sync_peer.as_deref() == Some(state.addr_string().as_str())
        {
            let remote_height = state
                .handshake
                .lock()
                .expect("handshake lock")
                .remote_height;
            let height = self.height.load(Ordering::Acquire);
            if height >= remote_height {
                tracing::info!("Sync complete, reindexing UTXO set...");
                if let Some(chain) = slot.chain.as_ref() {
                    match UtxoSet::new(chain).reindex() {
                        Ok(()) => tracing::info!(
                            "UTXO reindex complete; chain is up to date at height {}",
                            height
                        ),
                        Err(e) => tracing::error!("UTXO reindex failed: {}", e),
                    }
                }
                self.syncing.store(false, Ordering::Release);
                slot.sync_peer = None;
            }
        }
    }

    // ── mining ──

    async fn mine_block(&self, address: &str) -> Result<(Hash, i32), NodeError> {
        if self.syncing.load(Ordering::Acquire) {
            return Err(NodeError::Busy);
        }

        let snapshot = self.mempool.by_fee_rate_desc();

        let mut slot = self.chain.lock().await;
        let chain = slot.chain.as_mut().ok_or(ChainError::NoChain)?;

        let next_height = chain.height() + 1;
        let coinbase =
            Transaction::new_coinbase(address, "", next_height).map_err(ChainError::from)?;

        let mut ctx: HashMap<String, Transaction> = HashMap::new();
        ctx.insert(coinbase.id_hex(), coinbase.clone());
        // outputs consumed by transactions already selected for this block
        let mut spent: std::collections::HashSet<(String, i32)> = std::collections::HashSet::new();
        // header fields plus the transaction count
        let mut size = 84 + 4 + coinbase.serialize().len();
        let mut txs = vec![coinbase];

        for tx in snapshot {
            if txs.len() >= constants::MAX_BLOCK_TXS {
                tracing::debug!("Block tx cap reached, leaving the rest in the mempool");
                break;
            }
            let tx_size = tx.serialize().len();
            if size + 4 + tx_size > constants::MAX_BLOCK_SIZE {
                tracing::debug!("Block size cap reached, leaving the rest in the mempool");
                break;
            }
            let conflict = tx
                .vin
                .iter()
                .any(|vin| spent.contains(&(hex::encode(&vin.txid), vin.vout)));
            if conflict {
                tracing::warn!(
                    "Dropping double-spending tx {}...",
                    &tx.id_hex()[..16]
                );
                continue;
            }
            match chain.verify_transaction_with(&tx, &ctx) {
                Ok(true) => {
                    size += 4 + tx_size;
                    for vin in &tx.vin {
                        spent.insert((hex::encode(&vin.txid), vin.vout));
                    }
                    ctx.insert(tx.id_hex(), tx.clone());
                    txs.push(tx);
                }
                Ok(false) => {
                    tracing::warn!("Dropping invalid tx {}...", &tx.id_hex()[..16]);
                }
                Err(e) => {
                    tracing::warn!("Dropping unresolvable tx {}...: {}", &tx.id_hex()[..16], e);
                }
            }
        }

        tracing::info!("Starting PoW with {} mempool tx(s)...", txs.len() - 1);
        let block = chain.mine_block(txs, &self.shutting_down)?;

        UtxoSet::new(chain).update(&block)?;
        self.mempool.remove_block(&block);
        self.height.store(chain.height(), Ordering::Release);
        let height = chain.height();
        let hash = block.hash;
        drop(slot);

        tracing::info!("Mined block {}... (height={})", &hex::encode(hash)[..16], height);
        self.broadcast_block(&block).await;
        Ok((hash, height))
    }

    // ── dispatch ──

    async fn dispatch(&self, state: &Arc<PeerState>, msg: Message) {
        match msg.command_str() {
            commands::VERSION => self.handle_version(state, msg.payload()).await,
            commands::VERACK => self.handle_verack(state),
            commands::PING => self.handle_ping(state, msg.payload()).await,
            commands::PONG => self.handle_pong(state, msg.payload()),
            commands::INV => self.handle_inv(state, msg.payload()).await,
            commands::GETBLOCKS => self.handle_getblocks(state, msg.payload()).await,
            commands::GETDATA => self.handle_getdata(state, msg.payload()).await,
            commands::TX => self.handle_tx(state, msg.payload()).await,
            commands::BLOCK => self.handle_block(state, msg.payload()).await,
            other => {
                tracing::debug!("Unknown command '{}' from {}", other, state.addr_string());
            }
        }
    }
}

/// Spawn the reader and liveness monitor for one peer.
fn spawn_peer_tasks(inner: &Arc<NodeInner>, state: Arc<PeerState>, mut receiver: PeerReceiver) {
    let reader = {
        let inner = Arc::clone(inner);
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                if inner.is_shutting_down() || !state.peer.is_connected() {
                    break;
                }
                match receiver.receive().await {
                    Ok(msg) => inner.dispatch(&state, msg).await,
                    Err(e) => {
                        if !inner.is_shutting_down() {
                            tracing::info!("Peer {} disconnected: {}", state.addr_string(), e);
                        }
                        break;
                    }
                }
            }
            state.peer.disconnect().await;
            state.wake_monitor();
            // an interrupted initial block download may be resumed by the
            // next higher peer
            inner.clear_sync_if_peer(&state.addr_string()).await;
        })
    };

    let monitor = {
        let inner = Arc::clone(inner);
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            monitor_peer(inner, state).await;
        })
    };

    let mut tasks = state.tasks.lock().expect("tasks lock");
    tasks.push(reader);
    tasks.push(monitor);
}

/// Ping the peer on an interval and disconnect it on a missing or
/// mismatched pong.
async fn monitor_peer(inner: Arc<NodeInner>, state: Arc<PeerState>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = state.peer.wait_closed() => break,
            _ = tokio::time::sleep(Duration::from_secs(constants::PING_INTERVAL_SECS)) => {}
        }
        if inner.is_shutting_down() || !state.peer.is_connected() {
            break;
        }

        let ping = PingPayload::random();
        {
            let mut slot = state.pong.lock().expect("pong lock");
            slot.signaled = false;
        }
        let msg = plain_message(commands::PING, ping.serialize());
        if let Err(e) = state.peer.send(&msg).await {
            tracing::warn!("Failed to send ping to {}: {}", state.addr_string(), e);
            state.peer.disconnect().await;
            break;
        }
        tracing::debug!("Sent ping to {}", state.addr_string());

        // wait for the matching pong, tolerating spurious wakes
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(constants::PING_TIMEOUT_SECS);
        let answered = loop {
            if state.pong.lock().expect("pong lock").signaled {
                break true;
            }
            if tokio::time::Instant::now() >= deadline {
                break false;
            }
            let _ = tokio::time::timeout_at(deadline, state.pong_notify.notified()).await;
        };

        if !state.peer.is_connected() {
            break;
        }
        if !answered {
            tracing::warn!(
                "Peer {} sent no pong for {}s, disconnecting",
                state.addr_string(),
                constants::PING_TIMEOUT_SECS
            );
            state.peer.disconnect().await;
            break;
        }
        let nonce = state.pong.lock().expect("pong lock").nonce;
        if nonce != ping.nonce {
            tracing::warn!(
                "Pong nonce mismatch from {} (expected {}, got {}), disconnecting",
                state.addr_string(),
                ping.nonce,
                nonce
            );
            state.peer.disconnect().await;
            break;
        }
        tracing::debug!("Got pong from {}", state.addr_string());
    }
}

/// Periodically drop disconnected peers from the map and reap their tasks
/// outside the lock.
async fn cleanup_loop(inner: Arc<NodeInner>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(constants::CLEANUP_INTERVAL_SECS)) => {}
        }

        let mut dropped: Vec<Arc<PeerState>> = Vec::new();
        {
            let mut peers = inner.peers.lock().await;
            peers.retain(|_, state| {
                if state.peer.is_connected() {
                    true
                } else {
                    dropped.push(Arc::clone(state));
                    false
                }
            });
        }
        if dropped.is_empty() {
            continue;
        }

        for state in &dropped {
            state.wake_monitor();
        }
        for state in &dropped {
            for handle in state.take_tasks() {
                let _ = handle.await;
            }
        }
        tracing::info!("Cleaned up {} disconnected peer(s)", dropped.len());
    }
}

/// Sleep until a transaction arrives or the fallback timer fires, then mine.
async fn miner_loop(inner: Arc<NodeInner>, address: String) {
    tracing::info!("Background mining task started (reward -> {})", address);
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = inner.miner_wake.notified() => {}
            _ = tokio::time::sleep(Duration::from_secs(constants::MINER_WAKE_SECS)) => {}
        }
        if inner.is_shutting_down() {
            break;
        }
        if inner.mempool.count() == 0 || inner.syncing.load(Ordering::Acquire) {
            continue;
        }

        tracing::info!("{} tx(s) pending, mining...", inner.mempool.count());
        if let Err(e) = inner.mine_block(&address).await {
            // the chain may have moved mid-cycle; retry on the next wake
            tracing::warn!("Mining cycle error: {}", e);
        }
    }
    tracing::info!("Background mining task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coinbase_tx() -> Transaction {
        let wallet = crate::wallet::Wallet::new();
        Transaction::new_coinbase(&wallet.address(), "", 0).unwrap()
    }

    #[test]
    fn coinbase_shape_accepted() {
        assert!(NodeInner::transaction_shape_ok(&coinbase_tx()));
    }

    #[test]
    fn empty_tx_shape_rejected() {
        let mut tx = coinbase_tx();
        tx.vin.clear();
        tx.set_id();
        assert!(!NodeInner::transaction_shape_ok(&tx));

        let mut tx = coinbase_tx();
        tx.vin[0].vout = 0; // no longer a coinbase marker
        tx.vout.clear();
        tx.set_id();
        assert!(!NodeInner::transaction_shape_ok(&tx));
    }

    #[test]
    fn handshake_defaults() {
        let hs = Handshake::default();
        assert!(!hs.version_sent && !hs.version_received && !hs.complete);
        assert_eq!(hs.remote_height, -1);
    }
}
