//! Error taxonomy for the overlay.
//!
//! Protocol errors are session-fatal and carry the reason reported to the
//! remote side before disconnecting. Storage and retrieval errors stay local
//! to the call that produced them; nothing in here is allowed to panic on
//! peer-controlled input.

use thiserror::Error;

use crate::address::Address;

/// Wire-protocol violations. Every variant except [`ProtocolError::Io`]
/// corresponds to one of the enumerated disconnect reasons.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message too long: {0} > {1}")]
    MsgTooLarge(usize, usize),
    #[error("invalid message: {0}")]
    Decode(String),
    #[error("invalid message code: {0}")]
    InvalidMsgCode(u8),
    #[error("protocol version mismatch: {0} (!= {1})")]
    VersionMismatch(u64, u64),
    #[error("network id mismatch: {0} (!= {1})")]
    NetworkIdMismatch(u64, u64),
    #[error("no status message")]
    NoStatusMsg,
    #[error("extra status message")]
    ExtraStatusMsg,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Local chunk-store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The chunk payload does not hash to the key it was submitted under.
    #[error("chunk {0} does not hash to its key")]
    HashMismatch(Address),
    #[error("database: {0}")]
    Db(#[from] sled::Error),
}

/// Failures surfaced by `get`-style retrievals.
#[derive(Debug, Error)]
pub enum RetrieveError {
    /// No peer delivered the chunk within the retrieve timeout.
    #[error("chunk {0} unavailable")]
    ChunkUnavailable(Address),
    /// A fetched chunk did not parse as a valid tree node.
    #[error("chunk {0} is malformed")]
    InvalidChunk(Address),
    /// The node shut down while the retrieval was outstanding.
    #[error("retrieval cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Peer-pool and snapshot failures.
#[derive(Debug, Error)]
pub enum HiveError {
    /// The persisted peer pool belongs to a different node address.
    #[error("peer pool address mismatch: expected {expected}, snapshot has {found}")]
    AddressMismatch { expected: Address, found: Address },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
