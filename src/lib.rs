//! # chunknet
//!
//! A peer-to-peer content-addressed storage overlay: arbitrary byte streams
//! are split into fixed-size chunks, each addressed by the BLAKE3 hash of
//! its content, and retrievable from any participating node by key. Peers
//! form a structured overlay routed by XOR distance and exchange four wire
//! messages (status, store, retrieve, peers) over a framed transport. A
//! two-tier local store — memory LRU over a persistent key-value store —
//! backs each node.
//!
//! The crate is split into modules that can be reused independently:
//!
//! - [`address`]: 256-bit identifiers, the XOR metric and proximity bins.
//! - [`chunker`]: byte streams to Merkle chunk trees and back, with a
//!   random-access [`ChunkReader`].
//! - [`store`]: the [`KVStore`] contract, the disk/memory chunk stores, the
//!   [`ChunkStore`] capability and the durable per-peer request queue.
//! - [`kademlia`]: the proximity-binned routing table with its dynamic
//!   near-zone boundary and the persisted node-record pool.
//! - [`protocol`] and [`framing`]: the wire messages and length-prefixed
//!   frames.
//! - [`session`]: the per-peer protocol state machine and pending-store
//!   push loop.
//! - [`netstore`]: the request router mediating between local storage, the
//!   routing table and remote peers.
//! - [`hive`]: peer lifecycle, reconnects and snapshot persistence.
//! - [`net`]: a TCP [`Transport`] implementation and accept loop.
//!
//! ## Getting started
//!
//! Build the shared state, then feed transport streams into
//! [`run_session`]:
//!
//! ```no_run
//! # async fn start() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use chunknet::*;
//!
//! let cfg = Config::default();
//! let db = sled::open("data/chunks")?;
//! let chunks: Arc<dyn KVStore> = Arc::new(SledKv::new(db.open_tree("chunks")?));
//! let queue: Arc<dyn KVStore> = Arc::new(SledKv::new(db.open_tree("requests")?));
//!
//! let self_addr = PeerAddr::new("127.0.0.1".parse()?, 8500, vec![0u8; 64]);
//! let address = self_addr.address();
//! let local = Arc::new(LocalStore::new(chunks, cfg.mem_cache_cap, cfg.db_cache_cap)?);
//! let kad = Arc::new(tokio::sync::Mutex::new(Kademlia::new(address, &cfg)));
//! let netstore = NetStore::new(cfg, address, local, kad.clone(), RequestQueue::new(queue));
//! let hive = Hive::new(kad);
//!
//! // documents go in and out through the chunker
//! let chunker = TreeChunker::default();
//! let root = chunker.split(b"hello overlay", netstore.as_ref()).await?;
//! let bytes = chunker.join(netstore.clone(), root).await?;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod chunker;
pub mod config;
pub mod error;
pub mod framing;
pub mod hive;
pub mod kademlia;
pub mod net;
pub mod netstore;
pub mod protocol;
pub mod session;
pub mod store;

pub use address::{prox_cmp, proximity, Address, Key};
pub use chunker::{ChunkReader, TreeChunker};
pub use config::Config;
pub use error::{HiveError, ProtocolError, RetrieveError, StoreError};
pub use hive::{Connector, Hive};
pub use kademlia::{Kademlia, NodeRecord};
pub use net::{dial_addr, serve, TcpTransport, Transport};
pub use netstore::{NetStore, NetStoreStatus};
pub use protocol::{Message, PeerAddr, NETWORK_ID, PROTOCOL_VERSION};
pub use session::{run_session, PeerHandle, SessionContext};
pub use store::{ChunkStore, KVStore, LocalStore, RequestQueue, SledKv};
