//! One TCP connection to a remote node: framed send and receive with
//! timeouts.
//!
//! The write half lives behind an async mutex so handlers, the liveness
//! monitor, and broadcasts can all send; the read half is owned by the
//! single reader task through [`PeerReceiver`]. Any I/O or framing error
//! marks the connection disconnected, and `disconnect` wakes a blocked
//! reader immediately.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::constants;
use crate::protocol::{FrameHeader, Message, ProtocolError, HEADER_SIZE};

/// Errors from peer I/O.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("connection closed by {0}")]
    Closed(SocketAddr),
    #[error("timed out talking to {0}")]
    Timeout(SocketAddr),
    #[error("not connected to {0}")]
    NotConnected(SocketAddr),
    #[error("I/O error with {0}: {1}")]
    Io(SocketAddr, String),
    #[error("protocol violation from {0}: {1}")]
    Protocol(SocketAddr, ProtocolError),
}

/// The shared half of a peer connection: address, write side, liveness flag.
pub struct Peer {
    addr: SocketAddr,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    connected: AtomicBool,
    closed: Notify,
}

/// The exclusive read side, held by the peer's reader task.
pub struct PeerReceiver {
    peer: Arc<Peer>,
    reader: OwnedReadHalf,
}

impl Peer {
    /// Wrap an accepted or connected stream.
    pub fn from_stream(stream: TcpStream, addr: SocketAddr) -> (Arc<Peer>, PeerReceiver) {
        let (reader, writer) = stream.into_split();
        let peer = Arc::new(Peer {
            addr,
            writer: tokio::sync::Mutex::new(writer),
            connected: AtomicBool::new(true),
            closed: Notify::new(),
        });
        let receiver = PeerReceiver {
            peer: Arc::clone(&peer),
            reader,
        };
        (peer, receiver)
    }

    /// Open an outbound connection.
    pub async fn connect(addr: SocketAddr) -> Result<(Arc<Peer>, PeerReceiver), PeerError> {
        let timeout = Duration::from_secs(constants::PEER_SEND_TIMEOUT_SECS);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::Timeout(addr))?
            .map_err(|e| PeerError::Io(addr, e.to_string()))?;
        tracing::info!("Connected to {}", addr);
        Ok(Self::from_stream(stream, addr))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
        self.closed.notify_waiters();
    }

    /// Resolve once the connection is torn down; immediately if it already is.
    pub async fn wait_closed(&self) {
        let mut closed = std::pin::pin!(self.closed.notified());
        closed.as_mut().enable();
        if !self.is_connected() {
            return;
        }
        closed.await;
    }

    /// Tear the connection down and wake a reader blocked in `receive`.
    pub async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            tracing::debug!("Disconnecting peer {}", self.addr);
        }
        self.closed.notify_waiters();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Serialize and write a whole frame, bounded by the send timeout.
    pub async fn send(&self, msg: &Message) -> Result<(), PeerError> {
        if !self.is_connected() {
            return Err(PeerError::NotConnected(self.addr));
        }

        let bytes = msg.serialize();
        let timeout = Duration::from_secs(constants::PEER_SEND_TIMEOUT_SECS);
        let mut writer = self.writer.lock().await;

        match tokio::time::timeout(timeout, writer.write_all(&bytes)).await {
            Err(_) => {
                self.mark_disconnected();
                Err(PeerError::Timeout(self.addr))
            }
            Ok(Err(e)) => {
                self.mark_disconnected();
                Err(PeerError::Io(self.addr, e.to_string()))
            }
            Ok(Ok(())) => {
                tracing::trace!(
                    "Sent {} to {} ({} bytes)",
                    msg.command_str(),
                    self.addr,
                    bytes.len()
                );
                Ok(())
            }
        }
    }
}

async fn read_frame(reader: &mut OwnedReadHalf, addr: SocketAddr) -> Result<Message, PeerError> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut header_bytes)
        .await
        .map_err(|e| map_read_err(e, addr))?;

    let header = FrameHeader::parse(&header_bytes).map_err(|e| PeerError::Protocol(addr, e))?;

    let mut payload = vec![0u8; header.payload_len];
    if header.payload_len > 0 {
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| map_read_err(e, addr))?;
    }

    header
        .into_message(payload)
        .map_err(|e| PeerError::Protocol(addr, e))
}

fn map_read_err(e: std::io::Error, addr: SocketAddr) -> PeerError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        PeerError::Closed(addr)
    } else {
        PeerError::Io(addr, e.to_string())
    }
}

impl PeerReceiver {
    pub fn addr(&self) -> SocketAddr {
        self.peer.addr
    }

    /// Read one whole frame: exact header, then exact payload. Checksum,
    /// magic, and size violations — like timeouts and closed sockets — mark
    /// the connection disconnected and surface as typed errors.
    pub async fn receive(&mut self) -> Result<Message, PeerError> {
        let peer = Arc::clone(&self.peer);

        // register for the close signal before checking the flag, so a
        // disconnect racing this call cannot slip between the two
        let mut closed = std::pin::pin!(peer.closed.notified());
        closed.as_mut().enable();
        if !peer.is_connected() {
            return Err(PeerError::NotConnected(peer.addr));
        }

        let timeout = Duration::from_secs(constants::PEER_RECV_TIMEOUT_SECS);
        let result = tokio::select! {
            _ = &mut closed => Err(PeerError::Closed(peer.addr)),
            read = tokio::time::timeout(timeout, read_frame(&mut self.reader, peer.addr)) => {
                match read {
                    Err(_) => Err(PeerError::Timeout(peer.addr)),
                    Ok(inner) => inner,
                }
            }
        };

        match &result {
            Ok(msg) => {
                tracing::trace!("Received {} from {}", msg.command_str(), peer.addr);
            }
            Err(_) => peer.mark_disconnected(),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::commands;
    use tokio::net::TcpListener;

    async fn pair() -> ((Arc<Peer>, PeerReceiver), (Arc<Peer>, PeerReceiver)) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move { Peer::connect(addr).await.unwrap() });
        let (stream, remote) = listener.accept().await.unwrap();
        let server = Peer::from_stream(stream, remote);
        (client.await.unwrap(), server)
    }

    #[tokio::test]
    async fn send_and_receive_frame() {
        let ((client, _client_rx), (_server, mut server_rx)) = pair().await;

        let msg = Message::new(commands::PING, vec![9; 8]).unwrap();
        client.send(&msg).await.unwrap();

        let received = server_rx.receive().await.unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn peer_close_surfaces_as_closed() {
        let ((client, client_rx), (_server, mut server_rx)) = pair().await;

        client.disconnect().await;
        drop(client_rx);

        match server_rx.receive().await {
            Err(PeerError::Closed(_)) => {}
            other => panic!("expected Closed, got {:?}", other),
        }
        assert!(!server_rx.peer.is_connected());
    }

    #[tokio::test]
    async fn corrupt_magic_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let writer = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let msg = Message::new(commands::PING, vec![1; 8]).unwrap();
            let mut bytes = msg.serialize();
            bytes[0] ^= 0xFF;
            stream.write_all(&bytes).await.unwrap();
            // hold the socket open so the reader sees bad magic, not EOF
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let (stream, remote) = listener.accept().await.unwrap();
        let (peer, mut rx) = Peer::from_stream(stream, remote);

        match rx.receive().await {
            Err(PeerError::Protocol(_, ProtocolError::BadMagic)) => {}
            other => panic!("expected BadMagic, got {:?}", other),
        }
        assert!(!peer.is_connected());
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_checksum_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let writer = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let msg = Message::new(commands::TX, vec![1; 16]).unwrap();
            let mut bytes = msg.serialize();
            let last = bytes.len() - 1;
            bytes[last] ^= 0xFF; // flip a payload byte, checksum now stale
            stream.write_all(&bytes).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let (stream, remote) = listener.accept().await.unwrap();
        let (_peer, mut rx) = Peer::from_stream(stream, remote);

        match rx.receive().await {
            Err(PeerError::Protocol(_, ProtocolError::ChecksumMismatch)) => {}
            other => panic!("expected ChecksumMismatch, got {:?}", other),
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_unblocks_reader() {
        let ((_client, _client_rx), (server, mut server_rx)) = pair().await;

        let reader = tokio::spawn(async move { server_rx.receive().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.disconnect().await;

        let result = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("reader should unblock promptly")
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn send_after_disconnect_fails() {
        let ((client, _client_rx), _server) = pair().await;
        client.disconnect().await;

        let msg = Message::new(commands::VERACK, Vec::new()).unwrap();
        assert!(matches!(
            client.send(&msg).await,
            Err(PeerError::NotConnected(_))
        ));
    }
}
