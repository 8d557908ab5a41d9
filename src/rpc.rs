//! Line-delimited JSON-RPC 2.0 over TCP, bound to localhost only.
//!
//! One request per connection: read a line, dispatch against the method
//! registry, write the response line, close. A client helper for tooling and
//! tests lives at the bottom.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::config;
use crate::crypto;
use crate::merkle::MerkleTree;
use crate::node::{Node, NodeError};
use crate::utxo::UtxoSet;
use crate::wallet::WalletStore;

/// JSON-RPC error kinds with their standard codes.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Parse error")]
    Parse,
    #[error("Method not found: {0}")]
    MethodNotFound(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RpcError {
    fn code(&self) -> i64 {
        match self {
            RpcError::Parse => -32700,
            RpcError::MethodNotFound(_) => -32601,
            RpcError::Internal(_) => -32603,
        }
    }

    fn internal(e: impl std::fmt::Display) -> Self {
        RpcError::Internal(e.to_string())
    }
}

/// Per-request socket timeout.
const RPC_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Accept loop; runs until the node's shutdown token fires.
pub(crate) async fn serve(listener: TcpListener, node: Node) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("JSON-RPC server listening on {}", addr);
    }

    loop {
        tokio::select! {
            _ = node.inner.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let node = node.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, node).await;
                    });
                }
                Err(e) => {
                    if !node.inner.is_shutting_down() {
                        tracing::warn!("RPC accept error: {}", e);
                    }
                }
            }
        }
    }
    tracing::info!("JSON-RPC server stopped");
}

async fn handle_connection(stream: TcpStream, node: Node) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    match tokio::time::timeout(RPC_IO_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(Ok(n)) if n > 0 => {}
        _ => return,
    }

    let response = process_request(&node, &line).await;
    let mut out = response.to_string();
    out.push('\n');
    let _ = tokio::time::timeout(RPC_IO_TIMEOUT, write_half.write_all(out.as_bytes())).await;
}

/// Parse one request line and produce the JSON-RPC 2.0 response value.
pub(crate) async fn process_request(node: &Node, line: &str) -> Value {
    let request: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return error_response(Value::Null, &RpcError::Parse),
    };

    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    // normalise an empty positional list to named-parameter form
    let mut params = request.get("params").cloned().unwrap_or_else(|| json!({}));
    if params.as_array().is_some_and(Vec::is_empty) {
        params = json!({});
    }

    match dispatch(node, &method, params).await {
        Ok(result) => json!({ "jsonrpc": "2.0", "result": result, "id": id }),
        Err(e @ RpcError::MethodNotFound(_)) => error_response(id, &e),
        Err(e) => error_response(Value::Null, &e),
    }
}

fn error_response(id: Value, error: &RpcError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "error": { "code": error.code(), "message": error.to_string() },
        "id": id,
    })
}

/// The method registry.
async fn dispatch(node: &Node, method: &str, params: Value) -> Result<Value, RpcError> {
    match method {
        "getmempool" => {
            let ids = node.inner.mempool.transaction_ids();
            Ok(json!({ "size": ids.len(), "transactions": ids }))
        }
        "getblockcount" => Ok(json!(node.height())),
        "getsyncing" => get_syncing(node).await,
        "sendtx" => send_tx(node, &params).await,
        "mine" => mine(node, &params).await,
        "getmerkleproof" => merkle_proof(node, &params).await,
        other => Err(RpcError::MethodNotFound(other.to_string())),
    }
}

async fn get_syncing(node: &Node) -> Result<Value, RpcError> {
    let syncing = node.is_syncing();
    let mut result = json!({ "syncing": syncing, "height": node.height() });
    if syncing {
        let slot = node.inner.chain.lock().await;
        if let Some(peer) = &slot.sync_peer {
            result["syncPeer"] = json!(peer);
        }
    }
    Ok(result)
}

fn str_param<'a>(params: &'a Value, key: &str) -> Result<&'a str, RpcError> {
    match params.get(key).and_then(Value::as_str) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(RpcError::Internal(format!("Missing '{}' parameter", key))),
    }
}

/// Build, sign, and submit a transfer from a local wallet, then relay it.
async fn send_tx(node: &Node, params: &Value) -> Result<Value, RpcError> {
    let from = str_param(params, "from")?;
    let to = str_param(params, "to")?;
    let amount = params.get("amount").and_then(Value::as_i64).unwrap_or(0);

    if amount <= 0 {
        return Err(RpcError::Internal("'amount' must be positive".into()));
    }
    if !crypto::validate_address(from) {
        return Err(RpcError::Internal("Invalid 'from' address".into()));
    }
    if !crypto::validate_address(to) {
        return Err(RpcError::Internal("Invalid 'to' address".into()));
    }

    let wallets = WalletStore::load(&config::wallet_path(&node.inner.config.data_dir))
        .map_err(RpcError::internal)?;
    let wallet = wallets.get(from).map_err(RpcError::internal)?;

    let (tx, fee) = {
        let slot = node.inner.chain.lock().await;
        let chain = slot
            .chain
            .as_ref()
            .ok_or_else(|| RpcError::Internal("No blockchain available".into()))?;

        let mut tx = UtxoSet::new(chain)
            .new_transaction(wallet.public_key(), to, amount)
            .map_err(RpcError::internal)?;
        chain
            .sign_transaction(&mut tx, wallet)
            .map_err(RpcError::internal)?;
        let fee = chain.transaction_fee(&tx).unwrap_or(0);
        (tx, fee)
    };

    let txid = tx.id_hex();
    if node.inner.mempool.contains(&txid) {
        return Ok(json!({ "txid": txid, "status": "already in mempool" }));
    }

    let fee_rate = fee as f64 / tx.serialize().len() as f64;
    node.inner.mempool.add(tx.clone(), fee_rate);
    node.inner.miner_wake.notify_one();
    node.inner.relay_transaction(&tx, None).await;

    tracing::info!("sendtx: submitted tx {}", txid);
    Ok(json!({ "txid": txid }))
}

/// Mine one block synchronously from the current mempool.
async fn mine(node: &Node, params: &Value) -> Result<Value, RpcError> {
    let address = str_param(params, "address")?;
    if !crypto::validate_address(address) {
        return Err(RpcError::Internal("Invalid miner address".into()));
    }

    match node.mine_block(address).await {
        Ok((hash, height)) => Ok(json!({ "hash": hex::encode(hash), "height": height })),
        Err(NodeError::Busy) => Err(RpcError::Internal("Currently syncing, cannot mine".into())),
        Err(e) => Err(RpcError::internal(e)),
    }
}

/// Inclusion proof for a confirmed transaction.
async fn merkle_proof(node: &Node, params: &Value) -> Result<Value, RpcError> {
    let txid_hex = str_param(params, "txid")?;
    let txid = hex::decode(txid_hex).map_err(RpcError::internal)?;

    let slot = node.inner.chain.lock().await;
    let chain = slot
        .chain
        .as_ref()
        .ok_or_else(|| RpcError::Internal("No blockchain available".into()))?;

    for block in chain.iter() {
        let block = block.map_err(RpcError::internal)?;
        let Some(index) = block
            .transactions
            .iter()
            .position(|tx| tx.id.as_slice() == txid.as_slice())
        else {
            continue;
        };

        let tree = MerkleTree::new(&block.transactions).map_err(RpcError::internal)?;
        let proof = tree.proof(index).map_err(RpcError::internal)?;
        let path: Vec<Value> = proof
            .path
            .iter()
            .map(|step| json!({ "hash": hex::encode(step.hash), "isLeft": step.is_left }))
            .collect();
        return Ok(json!({
            "txHash": hex::encode(proof.tx_hash),
            "merkleRoot": hex::encode(proof.merkle_root),
            "block": hex::encode(block.hash),
            "path": path,
        }));
    }

    Err(RpcError::Internal(format!(
        "Transaction {} not found",
        txid_hex
    )))
}

// ── client ──

/// Call a method on a local node, for tooling and tests.
pub async fn call(port: u16, method: &str, params: Value) -> Result<Value, RpcError> {
    let stream = tokio::time::timeout(
        RPC_IO_TIMEOUT,
        TcpStream::connect((Ipv4Addr::LOCALHOST, port)),
    )
    .await
    .map_err(|_| RpcError::Internal("RPC connect timeout".into()))?
    .map_err(RpcError::internal)?;

    let (read_half, mut write_half) = stream.into_split();

    let request = json!({ "jsonrpc": "2.0", "method": method, "params": params, "id": 1 });
    let mut line = request.to_string();
    line.push('\n');
    tokio::time::timeout(RPC_IO_TIMEOUT, write_half.write_all(line.as_bytes()))
        .await
        .map_err(|_| RpcError::Internal("RPC send timeout".into()))?
        .map_err(RpcError::internal)?;

    let mut reader = BufReader::new(read_half);
    let mut response_line = String::new();
    tokio::time::timeout(RPC_IO_TIMEOUT, reader.read_line(&mut response_line))
        .await
        .map_err(|_| RpcError::Internal("RPC receive timeout".into()))?
        .map_err(RpcError::internal)?;

    let response: Value = serde_json::from_str(&response_line).map_err(|_| RpcError::Parse)?;
    if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Unknown error");
        return Err(RpcError::Internal(message.to_string()));
    }
    Ok(response.get("result").cloned().unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeConfig;

    fn idle_node() -> (tempfile::TempDir, Node) {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            listen_ip: Ipv4Addr::LOCALHOST,
            port: 0,
            rpc_port: 0,
            seed: None,
            miner_address: None,
            data_dir: dir.path().to_path_buf(),
        };
        (dir, Node::new(config).unwrap())
    }

    #[tokio::test]
    async fn parse_error_has_standard_code() {
        let (_dir, node) = idle_node();
        let response = process_request(&node, "this is not json").await;
        assert_eq!(response["error"]["code"], -32700);
        assert!(response["id"].is_null());
    }

    #[tokio::test]
    async fn unknown_method_reported() {
        let (_dir, node) = idle_node();
        let response =
            process_request(&node, r#"{"jsonrpc":"2.0","method":"nope","id":7}"#).await;
        assert_eq!(response["error"]["code"], -32601);
        assert_eq!(response["id"], 7);
    }

    #[tokio::test]
    async fn getblockcount_without_chain() {
        let (_dir, node) = idle_node();
        let response =
            process_request(&node, r#"{"jsonrpc":"2.0","method":"getblockcount","id":1}"#).await;
        assert_eq!(response["result"], -1);
    }

    #[tokio::test]
    async fn getmempool_empty() {
        let (_dir, node) = idle_node();
        let response =
            process_request(&node, r#"{"jsonrpc":"2.0","method":"getmempool","id":1}"#).await;
        assert_eq!(response["result"]["size"], 0);
        assert!(response["result"]["transactions"]
            .as_array()
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn getsyncing_idle() {
        let (_dir, node) = idle_node();
        let response =
            process_request(&node, r#"{"jsonrpc":"2.0","method":"getsyncing","id":1}"#).await;
        assert_eq!(response["result"]["syncing"], false);
        assert!(response["result"].get("syncPeer").is_none());
    }

    #[tokio::test]
    async fn sendtx_requires_parameters() {
        let (_dir, node) = idle_node();
        let response = process_request(
            &node,
            r#"{"jsonrpc":"2.0","method":"sendtx","params":{"to":"x"},"id":1}"#,
        )
        .await;
        assert_eq!(response["error"]["code"], -32603);
        assert!(response["error"]["message"]
            .as_str()
            .unwrap()
            .contains("'from'"));
    }

    #[tokio::test]
    async fn mine_rejects_bad_address() {
        let (_dir, node) = idle_node();
        let response = process_request(
            &node,
            r#"{"jsonrpc":"2.0","method":"mine","params":{"address":"0notbase58"},"id":1}"#,
        )
        .await;
        assert_eq!(response["error"]["code"], -32603);
    }
}
