//! Wire messages for P2P communication
//!
//! Every frame on the wire is `header ‖ payload`. The header is 24 bytes:
//! magic (u32 LE), command (12 bytes, NUL padded ASCII), payload length
//! (u32 LE) and the first four bytes of the payload's double SHA-256.
//! Payloads of the built-in commands are JSON.

use crate::network::constants::{
    CHECKSUM_LEN, CMD_OFFSET, MAX_PAYLOAD_LEN, MSG_CMD_LEN, MSG_HDR_LEN, PROTOCOL_VERSION,
};
use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Header validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Bad magic: expected {expected:#010x}, found {found:#010x}")]
    BadMagic { expected: u32, found: u32 },
    #[error("Payload of {length} bytes exceeds limit of {max}")]
    Oversized { length: usize, max: usize },
    #[error("Truncated header: {0} bytes")]
    Truncated(usize),
}

bitflags! {
    /// Services a node offers, advertised in `version`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ServiceFlags: u64 {
        /// Takes part in consensus
        const VERIFY_NODE = 1;
        /// Only syncs from consensus nodes
        const SERVICE_NODE = 2;
    }
}

/// Commands understood by the built-in protocol handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Version,
    VerAck,
    Ping,
    Pong,
    GetAddr,
    Addr,
    GetHeaders,
    Headers,
    GetData,
    Block,
    Consensus,
    Disconnect,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Version => "version",
            Command::VerAck => "verack",
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::GetAddr => "getaddr",
            Command::Addr => "addr",
            Command::GetHeaders => "getheaders",
            Command::Headers => "headers",
            Command::GetData => "getdata",
            Command::Block => "block",
            Command::Consensus => "consensus",
            Command::Disconnect => "disconnect",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let cmd = match name {
            "version" => Command::Version,
            "verack" => Command::VerAck,
            "ping" => Command::Ping,
            "pong" => Command::Pong,
            "getaddr" => Command::GetAddr,
            "addr" => Command::Addr,
            "getheaders" => Command::GetHeaders,
            "headers" => Command::Headers,
            "getdata" => Command::GetData,
            "block" => Command::Block,
            "consensus" => Command::Consensus,
            "disconnect" => Command::Disconnect,
            _ => return None,
        };
        Some(cmd)
    }
}

/// Fixed-size frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: u32,
    pub command: [u8; MSG_CMD_LEN],
    pub length: u32,
    pub checksum: [u8; CHECKSUM_LEN],
}

impl MessageHeader {
    /// Build the header for a payload
    pub fn new(magic: u32, command: &str, payload: &[u8]) -> Self {
        let mut cmd = [0u8; MSG_CMD_LEN];
        let n = command.len().min(MSG_CMD_LEN);
        cmd[..n].copy_from_slice(&command.as_bytes()[..n]);

        Self {
            magic,
            command: cmd,
            length: payload.len() as u32,
            checksum: checksum(payload),
        }
    }

    /// Parse the first `MSG_HDR_LEN` bytes of `buf`
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < MSG_HDR_LEN {
            return Err(FrameError::Truncated(buf.len()));
        }

        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let mut command = [0u8; MSG_CMD_LEN];
        command.copy_from_slice(&buf[CMD_OFFSET..CMD_OFFSET + MSG_CMD_LEN]);
        let len_at = CMD_OFFSET + MSG_CMD_LEN;
        let length = u32::from_le_bytes([
            buf[len_at],
            buf[len_at + 1],
            buf[len_at + 2],
            buf[len_at + 3],
        ]);
        let mut sum = [0u8; CHECKSUM_LEN];
        sum.copy_from_slice(&buf[len_at + 4..MSG_HDR_LEN]);

        Ok(Self {
            magic,
            command,
            length,
            checksum: sum,
        })
    }

    /// Parse and check magic and length against the limits
    pub fn decode_valid(buf: &[u8], magic: u32) -> Result<Self, FrameError> {
        let header = Self::decode(buf)?;
        if header.magic != magic {
            return Err(FrameError::BadMagic {
                expected: magic,
                found: header.magic,
            });
        }
        if header.payload_len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::Oversized {
                length: header.payload_len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        Ok(header)
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(MSG_HDR_LEN);
        dst.put_u32_le(self.magic);
        dst.put_slice(&self.command);
        dst.put_u32_le(self.length);
        dst.put_slice(&self.checksum);
    }

    pub fn payload_len(&self) -> usize {
        self.length as usize
    }

    /// Command name with the NUL padding stripped
    pub fn command_name(&self) -> &str {
        let end = self
            .command
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(MSG_CMD_LEN);
        std::str::from_utf8(&self.command[..end]).unwrap_or("")
    }

    pub fn command(&self) -> Option<Command> {
        Command::parse(self.command_name())
    }

    pub fn verify_checksum(&self, payload: &[u8]) -> bool {
        self.checksum == checksum(payload)
    }
}

/// First four bytes of SHA-256(SHA-256(payload))
pub fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let first = Sha256::digest(payload);
    let second = Sha256::digest(first);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&second[..CHECKSUM_LEN]);
    out
}

/// Assemble a complete frame from raw payload bytes
pub fn build_frame(magic: u32, command: &str, payload: &[u8]) -> Bytes {
    let header = MessageHeader::new(magic, command, payload);
    let mut buf = BytesMut::with_capacity(MSG_HDR_LEN + payload.len());
    header.encode(&mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

/// Assemble a frame for a built-in command with a JSON payload
pub fn build_message<T: Serialize>(
    magic: u32,
    command: Command,
    payload: &T,
) -> Result<Bytes, serde_json::Error> {
    let data = serde_json::to_vec(payload)?;
    Ok(build_frame(magic, command.as_str(), &data))
}

/// Split a complete frame into its header and payload
pub fn split_frame(frame: &Bytes) -> Result<(MessageHeader, Bytes), FrameError> {
    let header = MessageHeader::decode(frame)?;
    let end = MSG_HDR_LEN + header.payload_len();
    if frame.len() < end {
        return Err(FrameError::Truncated(frame.len()));
    }
    Ok((header, frame.slice(MSG_HDR_LEN..end)))
}

/// Decode a JSON payload
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(payload)
}

/// Handshake message exchanged on connect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionPayload {
    pub version: u32,
    pub services: u64,
    pub timestamp: i64,
    /// Data channel listen port
    pub sync_port: u16,
    /// Consensus channel listen port, 0 when not offered
    pub cons_port: u16,
    /// Sender's node id
    pub nonce: u64,
    pub start_height: u64,
    pub relay: bool,
    /// Sent on the consensus channel to bind it to an existing link
    pub is_consensus: bool,
}

impl VersionPayload {
    pub fn new(nonce: u64, sync_port: u16, cons_port: u16, start_height: u64, relay: bool) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            services: ServiceFlags::VERIFY_NODE.bits(),
            timestamp: chrono::Utc::now().timestamp(),
            sync_port,
            cons_port,
            nonce,
            start_height,
            relay,
            is_consensus: false,
        }
    }
}

/// Ping / pong carry the sender's block height
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeightPayload {
    pub height: u64,
}

/// A neighbor's reachable address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr {
    pub time: i64,
    pub services: u64,
    pub ip: String,
    pub port: u16,
    pub cons_port: u16,
    pub id: u64,
}

impl PeerAddr {
    pub fn to_addr_string(&self) -> String {
        match self.ip.parse::<std::net::IpAddr>() {
            Ok(ip) => std::net::SocketAddr::new(ip, self.port).to_string(),
            Err(_) => format!("{}:{}", self.ip, self.port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrPayload {
    pub addrs: Vec<PeerAddr>,
}

/// Request for headers following a known one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetHeadersPayload {
    pub start_height: u32,
    /// Hex hash of the header at `start_height`
    pub start_hash: String,
    pub count: u32,
}

/// Inventory kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvType {
    Transaction,
    Block,
    Consensus,
}

/// Request for a single inventory item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDataPayload {
    pub inv_type: InvType,
    /// Hex hash of the requested item
    pub hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::constants::NETWORK_MAGIC;

    #[test]
    fn test_header_layout() {
        let frame = build_frame(NETWORK_MAGIC, "ping", b"{}");
        assert_eq!(frame.len(), MSG_HDR_LEN + 2);
        assert_eq!(&frame[..4], &NETWORK_MAGIC.to_le_bytes());
        assert_eq!(&frame[4..8], b"ping");
        assert_eq!(frame[8], 0);
        assert_eq!(&frame[16..20], &2u32.to_le_bytes());

        let header = MessageHeader::decode(&frame).unwrap();
        assert_eq!(header.command_name(), "ping");
        assert_eq!(header.command(), Some(Command::Ping));
        assert!(header.verify_checksum(b"{}"));
        assert!(!header.verify_checksum(b"[]"));
    }

    #[test]
    fn test_decode_valid_rejects_bad_magic() {
        let frame = build_frame(0xdead_beef, "ping", b"");
        let err = MessageHeader::decode_valid(&frame, NETWORK_MAGIC).unwrap_err();
        assert_eq!(
            err,
            FrameError::BadMagic {
                expected: NETWORK_MAGIC,
                found: 0xdead_beef
            }
        );
    }

    #[test]
    fn test_decode_valid_rejects_oversized() {
        let mut header = MessageHeader::new(NETWORK_MAGIC, "block", b"");
        header.length = (MAX_PAYLOAD_LEN + 1) as u32;
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        assert!(matches!(
            MessageHeader::decode_valid(&buf, NETWORK_MAGIC),
            Err(FrameError::Oversized { .. })
        ));
    }

    #[test]
    fn test_build_message_and_split() {
        let version = VersionPayload::new(42, 20338, 0, 7, true);
        let frame = build_message(NETWORK_MAGIC, Command::Version, &version).unwrap();

        let (header, payload) = split_frame(&frame).unwrap();
        assert_eq!(header.command(), Some(Command::Version));
        assert!(header.verify_checksum(&payload));

        let decoded: VersionPayload = decode_payload(&payload).unwrap();
        assert_eq!(decoded.nonce, 42);
        assert_eq!(decoded.start_height, 7);
    }

    #[test]
    fn test_long_command_truncated() {
        let header = MessageHeader::new(NETWORK_MAGIC, "averyverylongcommand", b"");
        assert_eq!(header.command_name(), "averyverylon");
        assert_eq!(header.command(), None);
    }

    #[test]
    fn test_peer_addr_string() {
        let addr = PeerAddr {
            time: 0,
            services: 0,
            ip: "::1".into(),
            port: 20338,
            cons_port: 0,
            id: 1,
        };
        assert_eq!(addr.to_addr_string(), "[::1]:20338");
    }
}
