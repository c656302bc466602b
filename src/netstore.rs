//! The net store: routing of store and retrieve requests.
//!
//! A single process-wide coordinator sits between the local chunk store, the
//! routing table and the connected peer sessions. Retrievals that miss
//! locally open an outstanding-request entry that coalesces every interested
//! party — local callers and remote requesters alike — behind one fan-out of
//! retrieve requests to the closest peers; the first store request carrying
//! the chunk resolves them all. A background sweeper expires entries whose
//! deadline passed.
//!
//! The net store is itself a [`ChunkStore`], so the chunker can run directly
//! against the distributed store.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::address::{Address, Key};
use crate::config::Config;
use crate::error::{RetrieveError, StoreError};
use crate::kademlia::Kademlia;
use crate::protocol::{
    Message, Metadata, PeerAddr, PeersData, RetrieveRequestData, StoreRequestData,
};
use crate::session::{fresh_request_id, PeerHandle};
use crate::store::{ChunkStore, LocalStore, RequestQueue};

const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

type LocalWaiter = oneshot::Sender<Result<Vec<u8>, RetrieveError>>;

/// The in-flight record of a chunk retrieval, coalescing every requester of
/// the same key.
struct OutstandingRequest {
    deadline: Instant,
    peer_requesters: Vec<(PeerHandle, u64)>,
    local_waiters: Vec<LocalWaiter>,
    forwarded_to: HashSet<Address>,
}

impl OutstandingRequest {
    fn new(deadline: Instant) -> Self {
        Self {
            deadline,
            peer_requesters: Vec::new(),
            local_waiters: Vec::new(),
            forwarded_to: HashSet::new(),
        }
    }
}

/// Counters exposed for diagnostics and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct NetStoreStatus {
    pub pending: usize,
    pub forwarded_retrieves: u64,
}

fn unix_deadline(timeout: Duration) -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d + timeout).as_nanos() as u64)
        .unwrap_or_default()
}

pub struct NetStore {
    cfg: Config,
    self_addr: Address,
    local: Arc<LocalStore>,
    kad: Arc<Mutex<Kademlia<PeerHandle>>>,
    pending: Mutex<HashMap<Key, OutstandingRequest>>,
    requests: RequestQueue,
    forwarded_retrieves: AtomicU64,
    quit: watch::Sender<bool>,
}

impl NetStore {
    /// Build the coordinator and start its expiry sweeper.
    pub fn new(
        cfg: Config,
        self_addr: Address,
        local: Arc<LocalStore>,
        kad: Arc<Mutex<Kademlia<PeerHandle>>>,
        requests: RequestQueue,
    ) -> Arc<Self> {
        let (quit, quit_rx) = watch::channel(false);
        let store = Arc::new(Self {
            cfg,
            self_addr,
            local,
            kad,
            pending: Mutex::new(HashMap::new()),
            requests,
            forwarded_retrieves: AtomicU64::new(0),
            quit,
        });
        tokio::spawn(sweep_loop(store.clone(), quit_rx));
        store
    }

    pub fn self_addr(&self) -> Address {
        self.self_addr
    }

    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    pub fn requests(&self) -> &RequestQueue {
        &self.requests
    }

    pub fn kad(&self) -> &Arc<Mutex<Kademlia<PeerHandle>>> {
        &self.kad
    }

    pub async fn status(&self) -> NetStoreStatus {
        NetStoreStatus {
            pending: self.pending.lock().await.len(),
            forwarded_retrieves: self.forwarded_retrieves.load(Ordering::Relaxed),
        }
    }

    /// Retrieve a chunk, reaching out to the network on a local miss.
    ///
    /// Concurrent calls for the same key share one outstanding request; each
    /// caller receives the same bytes. Fails with
    /// [`RetrieveError::ChunkUnavailable`] once the retrieve timeout expires
    /// and with [`RetrieveError::Cancelled`] on shutdown.
    pub async fn get(&self, key: Key) -> Result<Vec<u8>, RetrieveError> {
        if let Some(data) = self.local.fetch(&key).await? {
            return Ok(data);
        }
        let (rx, fresh) = {
            let mut pending = self.pending.lock().await;
            // the chunk may have landed between the miss and taking the lock
            if let Some(data) = self.local.fetch(&key).await? {
                return Ok(data);
            }
            let (tx, rx) = oneshot::channel();
            match pending.get_mut(&key) {
                Some(entry) => {
                    entry.local_waiters.push(tx);
                    (rx, false)
                }
                None => {
                    let mut entry =
                        OutstandingRequest::new(Instant::now() + self.cfg.retrieve_timeout);
                    entry.local_waiters.push(tx);
                    pending.insert(key, entry);
                    (rx, true)
                }
            }
        };
        if fresh {
            self.forward_retrieve(key, None).await;
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RetrieveError::Cancelled),
        }
    }

    /// Handle a chunk arriving over the wire (`from` set) or from the local
    /// chunker (`from` empty).
    ///
    /// A chunk that does not hash to its key is dropped: logged and ignored
    /// for remote senders, an error for local callers. First-time arrivals
    /// are stored, wake every coalesced requester, and are queued for push
    /// towards the up-to-fanout closest near-zone peers; repeats are no-ops.
    pub async fn handle_store(
        &self,
        req: StoreRequestData,
        from: Option<&PeerHandle>,
    ) -> Result<(), StoreError> {
        if Address::hash(&req.data) != req.key {
            match from {
                Some(peer) => {
                    warn!(
                        peer = ?peer.addr(),
                        key = ?req.key,
                        "dropping chunk that does not hash to its key"
                    );
                    return Ok(());
                }
                None => return Err(StoreError::HashMismatch(req.key)),
            }
        }
        if self.local.fetch(&req.key).await?.is_some() {
            trace!(key = ?req.key, "chunk already stored");
            return Ok(());
        }
        self.local.insert(req.key, req.data.clone()).await?;

        let resolved = {
            let mut pending = self.pending.lock().await;
            pending.remove(&req.key)
        };
        if let Some(entry) = resolved {
            debug!(
                key = ?req.key,
                local = entry.local_waiters.len(),
                remote = entry.peer_requesters.len(),
                "chunk arrived, resolving outstanding retrieval"
            );
            for waiter in entry.local_waiters {
                let _ = waiter.send(Ok(req.data.clone()));
            }
            for (peer, _) in entry.peer_requesters {
                if let Err(err) = self.requests.enqueue(&peer.addr(), &req.key) {
                    warn!(peer = ?peer.addr(), %err, "failed to queue store for requester");
                }
            }
        }

        // push the chunk onward when it falls into our neighbourhood
        let targets: Vec<PeerHandle> = {
            let kad = self.kad.lock().await;
            let limit = kad.prox_limit();
            kad.nearest(&req.key, self.cfg.fanout)
                .into_iter()
                .filter(|p| from.map_or(true, |f| f.addr() != p.addr()))
                .filter(|p| kad.prox_bin(&p.addr()) >= limit)
                .collect()
        };
        for peer in targets {
            trace!(peer = ?peer.addr(), key = ?req.key, "queueing store forward");
            if let Err(err) = self.requests.enqueue(&peer.addr(), &req.key) {
                warn!(peer = ?peer.addr(), %err, "failed to queue store forward");
            }
        }
        Ok(())
    }

    /// Handle a retrieve request from a peer.
    ///
    /// Zero-id requests only prompt for peers (a self-lookup when the key is
    /// the sender's address). Otherwise a local hit is answered directly
    /// with a store request and nothing is forwarded; a miss joins or opens
    /// an outstanding request, fans out to the closest peers, and always
    /// answers with the nearest peers we know.
    pub async fn handle_retrieve(&self, req: RetrieveRequestData, from: &PeerHandle) {
        if req.is_lookup() {
            let peers = self
                .nearest_addrs(&req.key, self.peer_cap(req.max_peers), from.addr())
                .await;
            trace!(peer = ?from.addr(), returned = peers.len(), "answering lookup with peers");
            from.send(Message::Peers(PeersData {
                peers,
                timeout: 0,
                key: req.key,
                id: req.id,
            }))
            .await;
            return;
        }

        match self.local.fetch(&req.key).await {
            Ok(Some(data)) => {
                trace!(peer = ?from.addr(), key = ?req.key, "serving retrieve from local store");
                from.send(Message::Store(StoreRequestData {
                    key: req.key,
                    data,
                    id: req.id,
                    metadata: Metadata::default(),
                }))
                .await;
            }
            Ok(None) => {
                let fresh = {
                    let mut pending = self.pending.lock().await;
                    match pending.get_mut(&req.key) {
                        Some(entry) => {
                            if !entry
                                .peer_requesters
                                .iter()
                                .any(|(p, _)| p.addr() == from.addr())
                            {
                                entry.peer_requesters.push((from.clone(), req.id));
                            }
                            false
                        }
                        None => {
                            let mut entry = OutstandingRequest::new(
                                Instant::now() + self.cfg.retrieve_timeout,
                            );
                            entry.peer_requesters.push((from.clone(), req.id));
                            pending.insert(req.key, entry);
                            true
                        }
                    }
                };
                if fresh {
                    self.forward_retrieve(req.key, Some(from.addr())).await;
                }
                let peers = self
                    .nearest_addrs(&req.key, self.peer_cap(req.max_peers), from.addr())
                    .await;
                from.send(Message::Peers(PeersData {
                    peers,
                    timeout: unix_deadline(self.cfg.retrieve_timeout),
                    key: req.key,
                    id: req.id,
                }))
                .await;
            }
            Err(err) => warn!(key = ?req.key, %err, "local lookup failed"),
        }
    }

    /// Issue retrieve requests for `key` to the closest connected peers,
    /// skipping `exclude` and peers already asked.
    async fn forward_retrieve(&self, key: Key, exclude: Option<Address>) {
        let targets: Vec<PeerHandle> = {
            let kad = self.kad.lock().await;
            kad.nearest(&key, self.cfg.fanout)
                .into_iter()
                .filter(|p| Some(p.addr()) != exclude)
                .collect()
        };
        if targets.is_empty() {
            debug!(key = ?key, "no peers to forward retrieve request to");
            return;
        }
        let deadline = unix_deadline(self.cfg.retrieve_timeout);
        for peer in targets {
            {
                let mut pending = self.pending.lock().await;
                match pending.get_mut(&key) {
                    Some(entry) => {
                        if !entry.forwarded_to.insert(peer.addr()) {
                            continue;
                        }
                    }
                    // resolved while we were fanning out
                    None => return,
                }
            }
            let req = RetrieveRequestData {
                key,
                id: fresh_request_id(),
                max_size: 0,
                max_peers: self.cfg.fanout as u64,
                timeout: deadline,
            };
            trace!(peer = ?peer.addr(), key = ?key, "forwarding retrieve request");
            if peer.send(Message::Retrieve(req)).await {
                self.forwarded_retrieves.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn nearest_addrs(&self, target: &Address, max: usize, exclude: Address) -> Vec<PeerAddr> {
        let kad = self.kad.lock().await;
        kad.nearest(target, max)
            .into_iter()
            .filter(|p| p.addr() != exclude)
            .map(|p| p.remote().clone())
            .collect()
    }

    fn peer_cap(&self, requested: u64) -> usize {
        if requested == 0 {
            self.cfg.bucket_size
        } else {
            requested.min(self.cfg.bucket_size as u64) as usize
        }
    }

    /// Stop the sweeper, cancel outstanding retrievals, and flush the local
    /// store so it survives a restart.
    pub async fn shutdown(&self) {
        let _ = self.quit.send(true);
        let drained = {
            let mut pending = self.pending.lock().await;
            std::mem::take(&mut *pending)
        };
        for (_, entry) in drained {
            for waiter in entry.local_waiters {
                let _ = waiter.send(Err(RetrieveError::Cancelled));
            }
        }
        if let Err(err) = self.local.flush().await {
            warn!(%err, "failed to flush local store on shutdown");
        }
    }
}

async fn sweep_loop(store: Arc<NetStore>, mut quit: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = quit.changed() => break,
            _ = tick.tick() => {
                let now = Instant::now();
                let expired: Vec<(Key, OutstandingRequest)> = {
                    let mut pending = store.pending.lock().await;
                    let keys: Vec<Key> = pending
                        .iter()
                        .filter(|(_, entry)| entry.deadline <= now)
                        .map(|(key, _)| *key)
                        .collect();
                    keys.into_iter()
                        .filter_map(|key| pending.remove(&key).map(|entry| (key, entry)))
                        .collect()
                };
                for (key, entry) in expired {
                    debug!(key = ?key, "outstanding retrieval expired");
                    for waiter in entry.local_waiters {
                        let _ = waiter.send(Err(RetrieveError::ChunkUnavailable(key)));
                    }
                    // peer requesters run their own timers; nothing to send
                }
            }
        }
    }
}

#[async_trait]
impl ChunkStore for NetStore {
    async fn get(&self, key: &Key) -> Result<Vec<u8>, RetrieveError> {
        NetStore::get(self, *key).await
    }

    async fn put(&self, key: Key, data: Vec<u8>) -> Result<(), StoreError> {
        self.handle_store(
            StoreRequestData {
                key,
                data,
                id: fresh_request_id(),
                metadata: Metadata::default(),
            },
            None,
        )
        .await
    }
}
