//! P2P wire protocol: message frames and typed payloads.
//!
//! Every frame is `magic(4) ‖ command(12, nul-padded ASCII) ‖ payloadLen(4 LE)
//! ‖ checksum(4) ‖ payload` where the checksum is the first four bytes of the
//! double-SHA-256 of the payload. Integers are little-endian except the port
//! inside [`NetAddr`], which keeps network byte order.

use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::codec::{CodecError, Reader, Writer};
use crate::constants;
use crate::crypto::dsha256;
use crate::Hash;

/// Fixed frame header size: magic + command + length + checksum.
pub const HEADER_SIZE: usize = 24;
/// Fixed width of the command field.
pub const COMMAND_LENGTH: usize = 12;
/// Width of the payload checksum.
pub const CHECKSUM_LENGTH: usize = 4;

/// Wire command names.
pub mod commands {
    pub const VERSION: &str = "version";
    pub const VERACK: &str = "verack";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const INV: &str = "inv";
    pub const GETDATA: &str = "getdata";
    pub const GETBLOCKS: &str = "getblocks";
    pub const BLOCK: &str = "block";
    pub const TX: &str = "tx";
    /// Reserved for future peer-address exchange.
    pub const ADDR: &str = "addr";
}

/// Errors from framing and payload decoding.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown network magic")]
    BadMagic,
    #[error("payload checksum mismatch")]
    ChecksumMismatch,
    #[error("payload of {0} bytes exceeds the 32 MiB limit")]
    OversizePayload(usize),
    #[error("command name exceeds {COMMAND_LENGTH} bytes")]
    CommandTooLong,
    #[error("user agent exceeds 255 bytes")]
    UserAgentTooLong,
    #[error("inventory count exceeds 255")]
    InventoryTooLarge,
    #[error("unknown inventory type {0}")]
    UnknownInvType(u32),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// First four bytes of `DSHA256(payload)`.
pub fn payload_checksum(payload: &[u8]) -> [u8; CHECKSUM_LENGTH] {
    let hash = dsha256(payload);
    let mut out = [0u8; CHECKSUM_LENGTH];
    out.copy_from_slice(&hash[..CHECKSUM_LENGTH]);
    out
}

/// A complete wire message: command plus raw payload bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    command: [u8; COMMAND_LENGTH],
    payload: Vec<u8>,
}

impl Message {
    pub fn new(command: &str, payload: Vec<u8>) -> Result<Self, ProtocolError> {
        if command.len() > COMMAND_LENGTH {
            return Err(ProtocolError::CommandTooLong);
        }
        if payload.len() > constants::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::OversizePayload(payload.len()));
        }
        let mut cmd = [0u8; COMMAND_LENGTH];
        cmd[..command.len()].copy_from_slice(command.as_bytes());
        Ok(Message {
            command: cmd,
            payload,
        })
    }

    /// The command name with nul padding stripped.
    pub fn command_str(&self) -> &str {
        let end = self
            .command
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(COMMAND_LENGTH);
        std::str::from_utf8(&self.command[..end]).unwrap_or("")
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialize the full frame.
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(HEADER_SIZE + self.payload.len());
        w.put_raw(&constants::MAGIC);
        w.put_raw(&self.command);
        w.put_u32(self.payload.len() as u32);
        w.put_raw(&payload_checksum(&self.payload));
        w.put_raw(&self.payload);
        w.into_bytes()
    }
}

/// A parsed frame header; the payload is read separately by the peer layer.
#[derive(Clone, Copy, Debug)]
pub struct FrameHeader {
    command: [u8; COMMAND_LENGTH],
    pub payload_len: usize,
    checksum: [u8; CHECKSUM_LENGTH],
}

impl FrameHeader {
    /// Parse and validate the fixed 24-byte header.
    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> Result<Self, ProtocolError> {
        if bytes[..4] != constants::MAGIC {
            return Err(ProtocolError::BadMagic);
        }
        let mut command = [0u8; COMMAND_LENGTH];
        command.copy_from_slice(&bytes[4..16]);
        let payload_len =
            u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]) as usize;
        let mut checksum = [0u8; CHECKSUM_LENGTH];
        checksum.copy_from_slice(&bytes[20..24]);

        if payload_len > constants::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::OversizePayload(payload_len));
        }
        Ok(FrameHeader {
            command,
            payload_len,
            checksum,
        })
    }

    /// Combine a validated header with its payload, verifying the checksum.
    pub fn into_message(self, payload: Vec<u8>) -> Result<Message, ProtocolError> {
        if payload_checksum(&payload) != self.checksum {
            return Err(ProtocolError::ChecksumMismatch);
        }
        Ok(Message {
            command: self.command,
            payload,
        })
    }
}

// ── NetAddr ──

/// A 26-byte network address: services, IPv4-mapped IPv6 address, and a
/// big-endian port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetAddr {
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetAddr {
    pub fn new(services: u64, ip: Ipv4Addr, port: u16) -> Self {
        let mut mapped = [0u8; 16];
        mapped[10] = 0xFF;
        mapped[11] = 0xFF;
        mapped[12..].copy_from_slice(&ip.octets());
        NetAddr {
            services,
            ip: mapped,
            port,
        }
    }

    fn write(&self, w: &mut Writer) {
        w.put_u64(self.services);
        w.put_raw(&self.ip);
        w.put_u16_be(self.port);
    }

    fn read(r: &mut Reader) -> Result<Self, CodecError> {
        let services = r.u64()?;
        let mut ip = [0u8; 16];
        ip.copy_from_slice(r.raw(16)?);
        let port = r.u16_be()?;
        Ok(NetAddr { services, ip, port })
    }
}

// ── version ──

/// Handshake announcement carrying protocol version and chain height.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionPayload {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetAddr,
    pub addr_from: NetAddr,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl VersionPayload {
    pub fn new(
        receiver: (Ipv4Addr, u16),
        sender: (Ipv4Addr, u16),
        start_height: i32,
        relay: bool,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        VersionPayload {
            version: constants::PROTOCOL_VERSION,
            services: constants::NODE_NETWORK,
            timestamp,
            addr_recv: NetAddr::new(constants::NODE_NETWORK, receiver.0, receiver.1),
            addr_from: NetAddr::new(constants::NODE_NETWORK, sender.0, sender.1),
            nonce: rand::thread_rng().gen(),
            user_agent: constants::USER_AGENT.to_string(),
            start_height,
            relay,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.user_agent.len() > 255 {
            return Err(ProtocolError::UserAgentTooLong);
        }
        let mut w = Writer::new();
        w.put_i32(self.version);
        w.put_u64(self.services);
        w.put_i64(self.timestamp);
        self.addr_recv.write(&mut w);
        self.addr_from.write(&mut w);
        w.put_u64(self.nonce);
        w.put_u8(self.user_agent.len() as u8);
        w.put_raw(self.user_agent.as_bytes());
        w.put_i32(self.start_height);
        w.put_u8(u8::from(self.relay));
        Ok(w.into_bytes())
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);
        let version = r.i32()?;
        let services = r.u64()?;
        let timestamp = r.i64()?;
        let addr_recv = NetAddr::read(&mut r)?;
        let addr_from = NetAddr::read(&mut r)?;
        let nonce = r.u64()?;
        let agent_len = r.u8()? as usize;
        let user_agent = String::from_utf8_lossy(r.raw(agent_len)?).into_owned();
        let start_height = r.i32()?;
        let relay = r.u8()? != 0;
        r.finish()?;
        Ok(VersionPayload {
            version,
            services,
            timestamp,
            addr_recv,
            addr_from,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

// ── inv / getdata ──

/// What an inventory item announces or requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvType {
    Tx = 0,
    Block = 1,
}

impl TryFrom<u32> for InvType {
    type Error = ProtocolError;

    fn try_from(raw: u32) -> Result<Self, ProtocolError> {
        match raw {
            0 => Ok(InvType::Tx),
            1 => Ok(InvType::Block),
            other => Err(ProtocolError::UnknownInvType(other)),
        }
    }
}

/// One announced or requested object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvItem {
    pub inv_type: InvType,
    pub hash: Vec<u8>,
}

impl InvItem {
    pub fn block(hash: Hash) -> Self {
        InvItem {
            inv_type: InvType::Block,
            hash: hash.to_vec(),
        }
    }

    pub fn tx(hash: Hash) -> Self {
        InvItem {
            inv_type: InvType::Tx,
            hash: hash.to_vec(),
        }
    }
}

/// Inventory announcement; the same payload serves `getdata` requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvPayload {
    pub items: Vec<InvItem>,
}

impl InvPayload {
    pub fn new(items: Vec<InvItem>) -> Result<Self, ProtocolError> {
        if items.len() > u8::MAX as usize {
            return Err(ProtocolError::InventoryTooLarge);
        }
        Ok(InvPayload { items })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(self.items.len() as u8);
        for item in &self.items {
            w.put_u32(item.inv_type as u32);
            w.put_bytes(&item.hash);
        }
        w.into_bytes()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);
        let count = r.u8()?;
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let inv_type = InvType::try_from(r.u32()?)?;
            let hash = r.bytes()?;
            items.push(InvItem { inv_type, hash });
        }
        r.finish()?;
        Ok(InvPayload { items })
    }
}

// ── getblocks ──

/// Request for the block hashes following the sender's tip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GetBlocksPayload {
    pub tip_hash: Hash,
}

impl GetBlocksPayload {
    pub fn serialize(&self) -> Vec<u8> {
        self.tip_hash.to_vec()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);
        let tip_hash = r.hash()?;
        r.finish()?;
        Ok(GetBlocksPayload { tip_hash })
    }
}

// ── ping / pong ──

/// Liveness probe; the pong echoes the nonce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PingPayload {
    pub nonce: u64,
}

impl PingPayload {
    pub fn random() -> Self {
        PingPayload {
            nonce: rand::thread_rng().gen(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.nonce.to_le_bytes().to_vec()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);
        let nonce = r.u64()?;
        r.finish()?;
        Ok(PingPayload { nonce })
    }
}
