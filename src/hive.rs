//! The hive: lifecycle of known peers.
//!
//! Tracks the sessions currently connected, feeds them into the routing
//! table, and keeps the table fed: whenever a bucket reports a deficit or
//! the periodic tick fires, the best offline candidates from the record
//! pool are handed to an injected connector for dialing. The record pool is
//! persisted on graceful stop and reloaded on start.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::interval;
use tracing::{debug, warn};

use crate::address::Address;
use crate::error::HiveError;
use crate::kademlia::{Kademlia, Node, NodeRecord};
use crate::protocol::PeersData;
use crate::session::PeerHandle;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Dial candidates requested per refill.
const CONNECT_BATCH: usize = 10;

/// Injected dialer: takes an endpoint url and arranges a connection attempt.
pub type Connector = Arc<dyn Fn(String) + Send + Sync>;

pub struct Hive {
    kad: Arc<Mutex<Kademlia<PeerHandle>>>,
    peers: Mutex<HashMap<Address, PeerHandle>>,
    snapshot: Mutex<Option<PathBuf>>,
    quit: watch::Sender<bool>,
}

impl Hive {
    pub fn new(kad: Arc<Mutex<Kademlia<PeerHandle>>>) -> Arc<Self> {
        let (quit, _) = watch::channel(false);
        Arc::new(Self {
            kad,
            peers: Mutex::new(HashMap::new()),
            snapshot: Mutex::new(None),
            quit,
        })
    }

    /// Load the persisted peer pool (a snapshot for a different address
    /// aborts startup) and start the refill task.
    pub async fn start(
        self: &Arc<Self>,
        snapshot: Option<PathBuf>,
        connector: Connector,
    ) -> Result<(), HiveError> {
        if let Some(path) = &snapshot {
            if path.exists() {
                self.kad.lock().await.load(path)?;
            }
        }
        *self.snapshot.lock().await = snapshot;
        let (tx, rx) = mpsc::unbounded_channel();
        self.kad.lock().await.set_need_peer(tx);
        tokio::spawn(keep_alive(self.clone(), connector, rx, self.quit.subscribe()));
        Ok(())
    }

    /// Register a freshly handshaken session. Returns `false` when the peer
    /// is already connected; a bucket eviction drops the loser's session.
    pub async fn add_peer(&self, handle: PeerHandle) -> bool {
        let mut peers = self.peers.lock().await;
        if peers.contains_key(&handle.addr()) {
            return false;
        }
        peers.insert(handle.addr(), handle.clone());
        let evicted = self.kad.lock().await.add_node(handle);
        if let Some(old) = evicted {
            peers.remove(&old.addr());
            old.drop_peer();
        }
        true
    }

    pub async fn remove_peer(&self, addr: Address) {
        let mut peers = self.peers.lock().await;
        if peers.remove(&addr).is_some() {
            self.kad.lock().await.remove_node(&addr);
        }
    }

    /// Merge endpoints learned from a peers message into the record pool.
    /// Records only; no connections are opened here.
    pub async fn add_peer_entries(&self, data: &PeersData) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let records: Vec<NodeRecord> = data
            .peers
            .iter()
            .map(|peer| NodeRecord {
                address: peer.address(),
                url: peer.url(),
                active: now,
                connected: false,
            })
            .collect();
        self.kad.lock().await.add_node_records(records);
    }

    pub async fn peer(&self, addr: &Address) -> Option<PeerHandle> {
        self.peers.lock().await.get(addr).cloned()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    async fn request_peers(&self, connector: &Connector) {
        let records = { self.kad.lock().await.node_records(CONNECT_BATCH) };
        for record in records {
            debug!(peer = ?record.address, url = %record.url, "dialing known peer");
            (connector)(record.url);
        }
    }

    /// Stop the refill task, signal every session to quit, and persist the
    /// peer pool.
    pub async fn stop(&self) -> Result<(), HiveError> {
        let _ = self.quit.send(true);
        let connected: Vec<PeerHandle> = self.peers.lock().await.values().cloned().collect();
        for peer in connected {
            peer.drop_peer();
        }
        let snapshot = self.snapshot.lock().await.clone();
        if let Some(path) = snapshot {
            if let Err(err) = self.kad.lock().await.save(&path) {
                warn!(%err, "failed to persist peer pool");
                return Err(err);
            }
        }
        Ok(())
    }
}

async fn keep_alive(
    hive: Arc<Hive>,
    connector: Connector,
    mut need_peer: mpsc::UnboundedReceiver<usize>,
    mut quit: watch::Receiver<bool>,
) {
    let mut tick = interval(KEEP_ALIVE_INTERVAL);
    loop {
        tokio::select! {
            _ = quit.changed() => break,
            _ = tick.tick() => hive.request_peers(&connector).await,
            event = need_peer.recv() => match event {
                Some(bin) => {
                    debug!(bin, "bucket lost a peer, requesting candidates");
                    hive.request_peers(&connector).await;
                }
                None => break,
            },
        }
    }
}
