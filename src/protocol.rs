//! Wire messages of the chunk protocol.
//!
//! Four message codes travel over the framed transport: a status handshake,
//! store and retrieve requests, and a peers list. Payloads are encoded with a
//! bounded bincode configuration (fixed-width big-endian integers,
//! length-prefixed byte strings) so a hostile peer cannot make the decoder
//! allocate more than a frame's worth of memory.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::address::{Address, Key};
use crate::error::ProtocolError;

/// Protocol version carried in the status handshake.
pub const PROTOCOL_VERSION: u64 = 0;

/// Network id carried in the status handshake.
pub const NETWORK_ID: u64 = 0;

/// Hard cap on a frame (code byte plus payload).
pub const MAX_MSG_SIZE: usize = 10 * 1024 * 1024;

/// Decode buffer bound: one frame plus slack for framing overhead.
const MAX_DECODE_SIZE: u64 = MAX_MSG_SIZE as u64 + 4096;

// message codes
pub const STATUS_MSG: u8 = 0;
pub const STORE_REQUEST_MSG: u8 = 1;
pub const RETRIEVE_REQUEST_MSG: u8 = 2;
pub const PEERS_MSG: u8 = 3;

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DECODE_SIZE)
        .with_fixint_encoding()
        .with_big_endian()
}

/// A peer's transport endpoint as advertised on the wire: ip bytes (4 or 16),
/// listen port, and the 64-byte transport public id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr {
    pub ip: Vec<u8>,
    pub port: u16,
    pub id: Vec<u8>,
}

impl PeerAddr {
    pub fn new(ip: IpAddr, port: u16, id: Vec<u8>) -> Self {
        let ip = match ip {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        Self { ip, port, id }
    }

    /// The overlay address of this peer: hash of its public id.
    pub fn address(&self) -> Address {
        Address::hash(&self.id)
    }

    pub fn ip_addr(&self) -> Option<IpAddr> {
        match self.ip.len() {
            4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&self.ip);
                Some(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.ip);
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => None,
        }
    }

    /// Canonical endpoint url, `cnode://<hex id>@ip:port`.
    pub fn url(&self) -> String {
        let host = self
            .ip_addr()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string());
        format!("cnode://{}@{}:{}", hex::encode(&self.id), host, self.port)
    }
}

/// Handshake payload, sent exactly once as the first frame of a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusData {
    pub version: u64,
    pub id: String,
    pub node_id: Vec<u8>,
    pub addr: PeerAddr,
    pub network_id: u64,
    pub caps: Vec<(String, u64)>,
}

/// Placeholder for forwarding/incentive metadata. Carried on the wire as a
/// zero-length structure; decoded and ignored.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {}

/// A chunk being pushed: key, payload, and the id of the retrieve request it
/// answers (zero when unsolicited).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoreRequestData {
    pub key: Key,
    pub data: Vec<u8>,
    pub id: u64,
    pub metadata: Metadata,
}

/// A request for a chunk by key. `timeout` is the requester's deadline in
/// unix nanoseconds; `max_size` is advisory and never enforced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetrieveRequestData {
    pub key: Key,
    pub id: u64,
    pub max_size: u64,
    pub max_peers: u64,
    pub timeout: u64,
}

impl RetrieveRequestData {
    /// Zero-id retrievals do not request forwarding; they only prompt for a
    /// peers message, and double as self-lookups when the key is the
    /// sender's own address.
    pub fn is_lookup(&self) -> bool {
        self.id == 0
    }
}

/// Peer endpoints known to be close to `key`. `timeout` mirrors the
/// responder's forwarding deadline when answering a retrieve miss, zero
/// otherwise.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeersData {
    pub peers: Vec<PeerAddr>,
    pub timeout: u64,
    pub key: Key,
    pub id: u64,
}

/// A decoded protocol message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Status(StatusData),
    Store(StoreRequestData),
    Retrieve(RetrieveRequestData),
    Peers(PeersData),
}

impl Message {
    pub fn code(&self) -> u8 {
        match self {
            Message::Status(_) => STATUS_MSG,
            Message::Store(_) => STORE_REQUEST_MSG,
            Message::Retrieve(_) => RETRIEVE_REQUEST_MSG,
            Message::Peers(_) => PEERS_MSG,
        }
    }

    /// Encode into `(code, payload)` ready for framing.
    pub fn encode(&self) -> Result<(u8, Vec<u8>), ProtocolError> {
        let payload = match self {
            Message::Status(data) => wire_options().serialize(data),
            Message::Store(data) => wire_options().serialize(data),
            Message::Retrieve(data) => wire_options().serialize(data),
            Message::Peers(data) => wire_options().serialize(data),
        }
        .map_err(|err| ProtocolError::Decode(err.to_string()))?;
        Ok((self.code(), payload))
    }

    /// Decode a framed payload for the given code.
    pub fn decode(code: u8, payload: &[u8]) -> Result<Message, ProtocolError> {
        let decode_err = |err: bincode::Error| ProtocolError::Decode(err.to_string());
        match code {
            STATUS_MSG => Ok(Message::Status(
                wire_options().deserialize(payload).map_err(decode_err)?,
            )),
            STORE_REQUEST_MSG => Ok(Message::Store(
                wire_options().deserialize(payload).map_err(decode_err)?,
            )),
            RETRIEVE_REQUEST_MSG => Ok(Message::Retrieve(
                wire_options().deserialize(payload).map_err(decode_err)?,
            )),
            PEERS_MSG => Ok(Message::Peers(
                wire_options().deserialize(payload).map_err(decode_err)?,
            )),
            other => Err(ProtocolError::InvalidMsgCode(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let (code, payload) = msg.encode().expect("encode");
        let decoded = Message::decode(code, &payload).expect("decode");
        assert_eq!(decoded, msg);
    }

    fn peer_addr(seed: u8) -> PeerAddr {
        PeerAddr {
            ip: vec![127, 0, 0, seed],
            port: 30_000 + seed as u16,
            id: vec![seed; 64],
        }
    }

    #[test]
    fn status_roundtrip() {
        roundtrip(Message::Status(StatusData {
            version: PROTOCOL_VERSION,
            id: "chunknet/0.1.0".to_string(),
            node_id: vec![7; 64],
            addr: peer_addr(1),
            network_id: NETWORK_ID,
            caps: vec![("chunk".to_string(), 0)],
        }));
    }

    #[test]
    fn store_roundtrip_boundary_payloads() {
        for len in [0usize, 1, 4096, 4104] {
            let data = vec![0x42u8; len];
            roundtrip(Message::Store(StoreRequestData {
                key: Address::hash(&data),
                data,
                id: 99,
                metadata: Metadata::default(),
            }));
        }
    }

    #[test]
    fn retrieve_roundtrip() {
        roundtrip(Message::Retrieve(RetrieveRequestData {
            key: Address::hash(b"chunk"),
            id: 12,
            max_size: 0,
            max_peers: 5,
            timeout: 1_700_000_000_000_000_000,
        }));
        let lookup = RetrieveRequestData {
            key: Address::hash(b"self"),
            id: 0,
            max_size: 0,
            max_peers: 5,
            timeout: 0,
        };
        assert!(lookup.is_lookup());
    }

    #[test]
    fn peers_roundtrip() {
        roundtrip(Message::Peers(PeersData {
            peers: vec![peer_addr(1), peer_addr(2)],
            timeout: 0,
            key: Address::default(),
            id: 3,
        }));
    }

    #[test]
    fn metadata_is_zero_length_on_the_wire() {
        let empty = Message::Store(StoreRequestData {
            key: Address::hash(&[]),
            data: Vec::new(),
            id: 0,
            metadata: Metadata::default(),
        });
        let (_, payload) = empty.encode().expect("encode");
        // key (32) + data length prefix (8) + id (8); metadata adds nothing
        assert_eq!(payload.len(), 48);
    }

    #[test]
    fn unknown_code_is_rejected() {
        assert!(matches!(
            Message::decode(9, &[]),
            Err(ProtocolError::InvalidMsgCode(9))
        ));
    }

    #[test]
    fn peer_addr_derives_overlay_address() {
        let addr = peer_addr(5);
        assert_eq!(addr.address(), Address::hash(&addr.id));
        assert_eq!(
            addr.url(),
            format!("cnode://{}@127.0.0.5:30005", hex::encode(vec![5u8; 64]))
        );
    }
}
