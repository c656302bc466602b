use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::split;
use tokio::sync::Mutex;
use tokio::time::sleep;

use chunknet::{
    proximity, run_session, Address, Config, Hive, KVStore, Kademlia, LocalStore, NetStore,
    PeerAddr, RequestQueue, SessionContext, SledKv,
};

/// A full in-process node wired for duplex-stream sessions.
pub struct TestNode {
    pub ctx: SessionContext,
    pub netstore: Arc<NetStore>,
    pub hive: Arc<Hive>,
    pub addr: Address,
    _db: sled::Db,
}

impl TestNode {
    pub async fn new(index: u16, cfg: Config) -> Self {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .expect("temporary sled db");
        Self::build(index, cfg, db, node_id(index as u64)).await
    }

    /// A node with a chosen transport id, for tests that pin the overlay
    /// address relative to another node.
    #[allow(dead_code)]
    pub async fn with_id(index: u16, cfg: Config, node_id: Vec<u8>) -> Self {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .expect("temporary sled db");
        Self::build(index, cfg, db, node_id).await
    }

    /// A node persisting to `dir`, for restart tests. The same `node_id`
    /// must be passed on reopen so the overlay address matches.
    #[allow(dead_code)]
    pub async fn with_dir(index: u16, cfg: Config, dir: &Path, node_id: Vec<u8>) -> Self {
        let db = sled::open(dir).expect("sled dir");
        Self::build(index, cfg, db, node_id).await
    }

    async fn build(index: u16, cfg: Config, db: sled::Db, node_id: Vec<u8>) -> Self {
        let chunks: Arc<dyn KVStore> =
            Arc::new(SledKv::new(db.open_tree("chunks").expect("chunks tree")));
        let queue: Arc<dyn KVStore> =
            Arc::new(SledKv::new(db.open_tree("requests").expect("requests tree")));

        let self_addr = PeerAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            40_000 + index,
            node_id,
        );
        let addr = self_addr.address();
        let local = Arc::new(
            LocalStore::new(chunks, cfg.mem_cache_cap, cfg.db_cache_cap).expect("local store"),
        );
        let kad = Arc::new(Mutex::new(Kademlia::new(addr, &cfg)));
        let netstore = NetStore::new(cfg, addr, local, kad.clone(), RequestQueue::new(queue));
        let hive = Hive::new(kad);
        let ctx = SessionContext {
            netstore: netstore.clone(),
            hive: hive.clone(),
            self_addr,
            client: "chunknet-test/0".to_string(),
        };
        Self {
            ctx,
            netstore,
            hive,
            addr,
            _db: db,
        }
    }

    /// Cancel background tasks and flush storage, releasing the database.
    #[allow(dead_code)]
    pub async fn shutdown(self) {
        self.netstore.shutdown().await;
        // give the sweeper a beat to observe the quit signal before the
        // database handle is dropped
        sleep(Duration::from_millis(100)).await;
    }
}

/// A 64-byte transport id derived from a seed.
pub fn node_id(seed: u64) -> Vec<u8> {
    let mut id = vec![0u8; 64];
    id[..8].copy_from_slice(&seed.to_be_bytes());
    id
}

/// Find a node id whose overlay address lands in `bin` relative to `base`.
#[allow(dead_code)]
pub fn node_id_at_bin(base: &Address, bin: usize) -> Vec<u8> {
    for salt in 0u64.. {
        let mut id = vec![0u8; 64];
        id[..8].copy_from_slice(&salt.to_be_bytes());
        id[8] = 1;
        let addr = Address::hash(&id);
        if proximity(base, &addr) == bin {
            return id;
        }
    }
    unreachable!("address space exhausted");
}

/// Connect two nodes over an in-memory duplex stream and wait until both
/// sessions registered with their hives.
#[allow(dead_code)]
pub async fn connect(a: &TestNode, b: &TestNode) {
    let (sa, sb) = tokio::io::duplex(1 << 20);
    let (ra, wa) = split(sa);
    let (rb, wb) = split(sb);
    tokio::spawn(run_session(a.ctx.clone(), ra, wa));
    tokio::spawn(run_session(b.ctx.clone(), rb, wb));

    for _ in 0..200 {
        if a.hive.peer(&b.addr).await.is_some() && b.hive.peer(&a.addr).await.is_some() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("peers failed to handshake in time");
}

/// Poll `cond` until it holds, panicking after a couple of seconds.
#[allow(dead_code)]
pub async fn wait_until<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if cond().await {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}
