//! Local chunk storage: a memory LRU fronting a persistent key-value store.
//!
//! The persistent layer is abstracted behind [`KVStore`] (byte keys and
//! values, prefix iteration) and implemented on sled trees. [`DbStore`]
//! content-addresses chunks on top of it with a monotonically assigned
//! 64-bit ring index for eviction; [`MemStore`] keeps hot chunks in an LRU;
//! [`LocalStore`] composes the two and enforces the content-addressing
//! contract on every insert.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::trace;

use crate::address::{Address, Key, ADDRESS_LENGTH};
use crate::error::{RetrieveError, StoreError};

/// Byte-keyed persistent storage consumed by the chunk and request stores.
pub trait KVStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;
    /// Iterate entries whose key starts with `prefix`, in key order.
    fn iter_prefix(
        &self,
        prefix: &[u8],
    ) -> Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>), StoreError>> + Send>;
}

/// [`KVStore`] over a sled tree. Sled synchronizes internally, so the handle
/// is freely cloneable and shareable.
#[derive(Clone)]
pub struct SledKv {
    tree: sled::Tree,
}

impl SledKv {
    pub fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }
}

impl KVStore for SledKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.tree.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.tree.remove(key)?;
        Ok(())
    }

    fn iter_prefix(
        &self,
        prefix: &[u8],
    ) -> Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>), StoreError>> + Send> {
        Box::new(self.tree.scan_prefix(prefix).map(|entry| {
            let (k, v) = entry?;
            Ok((k.to_vec(), v.to_vec()))
        }))
    }
}

// key prefixes inside the chunk tree
const KP_DATA: u8 = 0x00;
const KP_INDEX: u8 = 0x01;
const HEADER_KEY: &[u8] = &[0x02];

fn data_key(key: &Key) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + ADDRESS_LENGTH);
    k.push(KP_DATA);
    k.extend_from_slice(key.as_bytes());
    k
}

fn index_key(index: u64) -> Vec<u8> {
    let mut k = Vec::with_capacity(9);
    k.push(KP_INDEX);
    k.extend_from_slice(&index.to_be_bytes());
    k
}

/// Content-addressed persistent chunk store.
///
/// Every chunk gets the next value of a monotonic 64-bit index; once the
/// store holds `capacity` chunks, inserting a new one deletes the chunk with
/// the oldest surviving index. Duplicate inserts are no-ops.
pub struct DbStore {
    kv: Arc<dyn KVStore>,
    capacity: u64,
    next: u64,
    count: u64,
}

impl DbStore {
    pub fn open(kv: Arc<dyn KVStore>, capacity: u64) -> Result<Self, StoreError> {
        let (next, count) = match kv.get(HEADER_KEY)? {
            Some(raw) if raw.len() == 16 => {
                let mut next = [0u8; 8];
                let mut count = [0u8; 8];
                next.copy_from_slice(&raw[..8]);
                count.copy_from_slice(&raw[8..]);
                (u64::from_be_bytes(next), u64::from_be_bytes(count))
            }
            _ => (0, 0),
        };
        Ok(Self {
            kv,
            capacity: capacity.max(1),
            next,
            count,
        })
    }

    fn write_header(&self) -> Result<(), StoreError> {
        let mut raw = [0u8; 16];
        raw[..8].copy_from_slice(&self.next.to_be_bytes());
        raw[8..].copy_from_slice(&self.count.to_be_bytes());
        self.kv.put(HEADER_KEY, &raw)
    }

    pub fn get(&self, key: &Key) -> Result<Option<Vec<u8>>, StoreError> {
        self.kv.get(&data_key(key))
    }

    pub fn contains(&self, key: &Key) -> Result<bool, StoreError> {
        Ok(self.kv.get(&data_key(key))?.is_some())
    }

    pub fn put(&mut self, key: &Key, data: &[u8]) -> Result<(), StoreError> {
        let dk = data_key(key);
        if self.kv.get(&dk)?.is_some() {
            return Ok(());
        }
        while self.count >= self.capacity {
            self.evict_oldest()?;
        }
        self.kv.put(&dk, data)?;
        self.kv.put(&index_key(self.next), key.as_bytes())?;
        self.next += 1;
        self.count += 1;
        self.write_header()
    }

    fn evict_oldest(&mut self) -> Result<(), StoreError> {
        // index keys sort by assignment order, so the first surviving entry
        // is the oldest chunk
        let oldest = self.kv.iter_prefix(&[KP_INDEX]).next();
        match oldest {
            Some(entry) => {
                let (ikey, stored_key) = entry?;
                if stored_key.len() == ADDRESS_LENGTH {
                    let mut raw = [0u8; ADDRESS_LENGTH];
                    raw.copy_from_slice(&stored_key);
                    let key = Address(raw);
                    trace!(chunk = ?key, "evicting oldest chunk from db store");
                    self.kv.delete(&data_key(&key))?;
                }
                self.kv.delete(&ikey)?;
                self.count = self.count.saturating_sub(1);
                Ok(())
            }
            None => {
                self.count = 0;
                Ok(())
            }
        }
    }

    pub fn len(&self) -> u64 {
        self.count
    }
}

/// Bounded in-memory chunk cache with least-recently-used eviction.
pub struct MemStore {
    cache: LruCache<Key, Vec<u8>>,
}

impl MemStore {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity must be non-zero");
        Self {
            cache: LruCache::new(cap),
        }
    }

    /// Insert or refresh a chunk; returns the entry evicted to make room, if
    /// any.
    pub fn insert(&mut self, key: Key, data: Vec<u8>) -> Option<(Key, Vec<u8>)> {
        match self.cache.push(key, data) {
            Some((old_key, old_data)) if old_key != key => Some((old_key, old_data)),
            _ => None,
        }
    }

    pub fn get(&mut self, key: &Key) -> Option<Vec<u8>> {
        self.cache.get(key).cloned()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.cache.contains(key)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    fn entries(&self) -> impl Iterator<Item = (&Key, &Vec<u8>)> {
        self.cache.iter()
    }
}

/// Counts of resident chunks per tier.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalStoreStatus {
    pub mem_entries: usize,
    pub db_entries: u64,
}

struct LocalInner {
    mem: MemStore,
    db: DbStore,
}

/// The node's chunk store: memory LRU over the persistent [`DbStore`].
///
/// Inserts verify the content-addressing contract; chunks displaced from the
/// LRU are written through to disk, and [`LocalStore::flush`] persists the
/// resident set on graceful shutdown so a restarted node can serve its
/// chunks again.
pub struct LocalStore {
    inner: Mutex<LocalInner>,
}

impl LocalStore {
    pub fn new(kv: Arc<dyn KVStore>, mem_cap: usize, db_cap: u64) -> Result<Self, StoreError> {
        Ok(Self {
            inner: Mutex::new(LocalInner {
                mem: MemStore::new(mem_cap),
                db: DbStore::open(kv, db_cap)?,
            }),
        })
    }

    /// Insert a chunk under its content address. Fails with
    /// [`StoreError::HashMismatch`] when `data` does not hash to `key`;
    /// repeated inserts of the same chunk are no-ops.
    pub async fn insert(&self, key: Key, data: Vec<u8>) -> Result<(), StoreError> {
        if Address::hash(&data) != key {
            return Err(StoreError::HashMismatch(key));
        }
        let mut inner = self.inner.lock().await;
        if let Some((evicted_key, evicted_data)) = inner.mem.insert(key, data) {
            if !inner.db.contains(&evicted_key)? {
                inner.db.put(&evicted_key, &evicted_data)?;
            }
        }
        Ok(())
    }

    /// Look a chunk up, promoting disk hits into the LRU.
    pub async fn fetch(&self, key: &Key) -> Result<Option<Vec<u8>>, StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(data) = inner.mem.get(key) {
            return Ok(Some(data));
        }
        match inner.db.get(key)? {
            Some(data) => {
                if let Some((evicted_key, evicted_data)) = inner.mem.insert(*key, data.clone()) {
                    if !inner.db.contains(&evicted_key)? {
                        inner.db.put(&evicted_key, &evicted_data)?;
                    }
                }
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    pub async fn contains(&self, key: &Key) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.mem.contains(key) || inner.db.contains(key)?)
    }

    /// Write every LRU-resident chunk through to the persistent store.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let resident: Vec<(Key, Vec<u8>)> = inner
            .mem
            .entries()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        for (key, data) in resident {
            inner.db.put(&key, &data)?;
        }
        Ok(())
    }

    pub async fn status(&self) -> LocalStoreStatus {
        let inner = self.inner.lock().await;
        LocalStoreStatus {
            mem_entries: inner.mem.len(),
            db_entries: inner.db.len(),
        }
    }
}

/// The capability shared by every chunk-store flavour (memory, disk, or
/// network-backed): retrieval and insertion by content address. The net
/// store implements it too, which lets the chunker run against local and
/// distributed storage interchangeably.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn get(&self, key: &Key) -> Result<Vec<u8>, RetrieveError>;
    async fn put(&self, key: Key, data: Vec<u8>) -> Result<(), StoreError>;
}

#[async_trait]
impl ChunkStore for LocalStore {
    async fn get(&self, key: &Key) -> Result<Vec<u8>, RetrieveError> {
        self.fetch(key)
            .await?
            .ok_or(RetrieveError::ChunkUnavailable(*key))
    }

    async fn put(&self, key: Key, data: Vec<u8>) -> Result<(), StoreError> {
        self.insert(key, data).await
    }
}

/// Durable per-peer queue of chunk keys awaiting push via store requests.
///
/// Entries live in their own KV namespace keyed
/// `peer address (32) || sequence (8, big-endian) || chunk key (32)`, so a
/// prefix scan over a peer's address yields that peer's queue in insertion
/// order. Values are empty; the chunk bytes stay in the local store.
#[derive(Clone)]
pub struct RequestQueue {
    kv: Arc<dyn KVStore>,
    seq: Arc<AtomicU64>,
}

impl RequestQueue {
    pub fn new(kv: Arc<dyn KVStore>) -> Self {
        // seed the sequence from the clock so ordering survives restarts
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self {
            kv,
            seq: Arc::new(AtomicU64::new(now)),
        }
    }

    pub fn enqueue(&self, peer: &Address, chunk: &Key) -> Result<(), StoreError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut key = Vec::with_capacity(2 * ADDRESS_LENGTH + 8);
        key.extend_from_slice(peer.as_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        key.extend_from_slice(chunk.as_bytes());
        self.kv.put(&key, &[])
    }

    /// Up to `max` queued entries for `peer`, oldest first, as
    /// `(queue key, chunk key)` pairs.
    pub fn drain_batch(
        &self,
        peer: &Address,
        max: usize,
    ) -> Result<Vec<(Vec<u8>, Key)>, StoreError> {
        let mut out = Vec::new();
        for entry in self.kv.iter_prefix(peer.as_bytes()).take(max) {
            let (key, _) = entry?;
            if key.len() != 2 * ADDRESS_LENGTH + 8 {
                self.kv.delete(&key)?;
                continue;
            }
            let mut chunk = [0u8; ADDRESS_LENGTH];
            chunk.copy_from_slice(&key[ADDRESS_LENGTH + 8..]);
            out.push((key, Address(chunk)));
        }
        Ok(out)
    }

    pub fn remove(&self, queue_key: &[u8]) -> Result<(), StoreError> {
        self.kv.delete(queue_key)
    }
}
