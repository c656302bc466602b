//! Proximity-binned routing table.
//!
//! Connected peers live in `max_prox + 1` buckets indexed by the proximity
//! of their address to ours; bucket `i` holds peers whose addresses share
//! exactly `i` leading bits with ours (capped at `max_prox`). Because a
//! uniform address space fills bins on a negative exponential scale, the
//! closest bins are merged into a single *near zone*: `prox_limit` is the
//! smallest bin index below which every bin is populated, and `prox_size`
//! counts the peers at or beyond it. The pair adjusts dynamically as peers
//! come and go so that the near zone stays at most `max_prox_bin_size`
//! strong whenever the populated bins allow it.
//!
//! Alongside the live buckets the table keeps a pool of offline node
//! records, binned the same way, used to re-seed connections and persisted
//! as a JSON snapshot across restarts.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::address::{self, Address};
use crate::config::Config;
use crate::error::HiveError;

/// A connected peer as seen by the routing table: an address, a dialable
/// endpoint url, and an activity timestamp used for staleness eviction.
pub trait Node: Clone + Send + Sync + 'static {
    fn addr(&self) -> Address;
    fn url(&self) -> String;
    fn last_active(&self) -> SystemTime;
    /// Ask the peer's session to disconnect; called when the peer loses its
    /// bucket slot.
    fn drop_peer(&self);
}

fn unix_nanos(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// A known peer, connected or not, as kept in the record pool and the
/// persisted snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeRecord {
    pub address: Address,
    pub url: String,
    /// Last observed activity, unix nanoseconds.
    pub active: u64,
    #[serde(skip)]
    pub connected: bool,
}

#[derive(Serialize, Deserialize)]
struct KadSnapshot {
    address: Address,
    nodes: Vec<Vec<NodeRecord>>,
}

pub struct Kademlia<N: Node> {
    addr: Address,
    bucket_size: usize,
    max_prox: usize,
    max_prox_bin_size: usize,

    buckets: Vec<Vec<N>>,
    count: usize,
    prox_limit: usize,
    prox_size: usize,

    node_db: Vec<Vec<NodeRecord>>,
    node_index: HashMap<Address, (usize, usize)>,

    need_peer: Option<mpsc::UnboundedSender<usize>>,
}

impl<N: Node> Kademlia<N> {
    pub fn new(addr: Address, cfg: &Config) -> Self {
        let bins = cfg.max_prox + 1;
        Self {
            addr,
            bucket_size: cfg.bucket_size,
            max_prox: cfg.max_prox,
            max_prox_bin_size: cfg.max_prox_bin_size,
            buckets: vec![Vec::new(); bins],
            count: 0,
            prox_limit: 0,
            prox_size: 0,
            node_db: vec![Vec::new(); bins],
            node_index: HashMap::new(),
            need_peer: None,
        }
    }

    pub fn addr(&self) -> Address {
        self.addr
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn prox_limit(&self) -> usize {
        self.prox_limit
    }

    pub fn prox_size(&self) -> usize {
        self.prox_size
    }

    /// Number of connected peers in `bin`.
    pub fn bucket_len(&self, bin: usize) -> usize {
        self.buckets.get(bin).map_or(0, |b| b.len())
    }

    /// Subscribe the hive to bucket-deficit events; each event carries the
    /// bin index that lost a peer.
    pub fn set_need_peer(&mut self, tx: mpsc::UnboundedSender<usize>) {
        self.need_peer = Some(tx);
    }

    /// The proximity bin of `other` relative to our own address.
    pub fn prox_bin(&self, other: &Address) -> usize {
        address::proximity(&self.addr, other).min(self.max_prox)
    }

    /// Register a connected peer. When its bucket is full the least recently
    /// active entry is evicted and returned so the caller can drop its
    /// session.
    pub fn add_node(&mut self, node: N) -> Option<N> {
        let addr = node.addr();
        if addr == self.addr {
            return None;
        }
        let bin = self.prox_bin(&addr);
        let bucket = &mut self.buckets[bin];
        let mut evicted = None;
        if let Some(pos) = bucket.iter().position(|n| n.addr() == addr) {
            bucket[pos] = node.clone();
        } else if bucket.len() >= self.bucket_size {
            let worst = bucket
                .iter()
                .enumerate()
                .min_by_key(|(_, n)| n.last_active())
                .map(|(i, _)| i)
                .unwrap_or(0);
            evicted = Some(std::mem::replace(&mut bucket[worst], node.clone()));
        } else {
            bucket.push(node.clone());
            self.count += 1;
            if bin >= self.prox_limit {
                self.adjust_prox_add(bin);
            }
        }
        self.touch_record(&node);
        if let Some(old) = &evicted {
            let old_addr = old.addr();
            if let Some(&(b, i)) = self.node_index.get(&old_addr) {
                self.node_db[b][i].connected = false;
            }
            debug!(peer = ?old_addr, bin, "evicted stale peer from full bucket");
        }
        debug!(peer = ?addr, bin, count = self.count, "added peer");
        evicted
    }

    /// Take a peer offline. Rolls the near-zone boundary back when its bin
    /// empties and notifies the hive that the bin needs refilling.
    pub fn remove_node(&mut self, addr: &Address) -> Option<N> {
        let bin = self.prox_bin(addr);
        let pos = self.buckets[bin].iter().position(|n| n.addr() == *addr)?;
        let node = self.buckets[bin].remove(pos);
        self.count -= 1;
        if bin >= self.prox_limit {
            self.prox_size -= 1;
        } else if self.buckets[bin].is_empty() {
            for i in (bin + 1)..self.prox_limit {
                self.prox_size += self.buckets[i].len();
            }
            self.prox_limit = bin;
        }
        if let Some(&(b, i)) = self.node_index.get(addr) {
            let record = &mut self.node_db[b][i];
            record.connected = false;
            record.active = unix_nanos(SystemTime::now());
        }
        if let Some(tx) = &self.need_peer {
            let _ = tx.send(bin);
        }
        debug!(peer = ?addr, bin, count = self.count, "removed peer");
        Some(node)
    }

    /// Maintain `prox_limit`/`prox_size` after a peer landed in `bin`
    /// (`bin >= prox_limit`). The boundary only ever advances past populated
    /// bins, so bins below it stay non-empty.
    fn adjust_prox_add(&mut self, bin: usize) {
        self.prox_size += 1;
        if bin == self.prox_limit {
            while self.prox_limit < self.max_prox && !self.buckets[self.prox_limit].is_empty() {
                self.prox_size -= self.buckets[self.prox_limit].len();
                self.prox_limit += 1;
            }
        } else {
            while self.prox_size > self.max_prox_bin_size
                && self.prox_limit < self.max_prox
                && !self.buckets[self.prox_limit].is_empty()
            {
                self.prox_size -= self.buckets[self.prox_limit].len();
                self.prox_limit += 1;
            }
        }
    }

    /// Up to `max` connected peers ordered by XOR distance to `target`.
    ///
    /// The walk starts at the target's bin — or sweeps the whole near zone
    /// downward from `max_prox` when the target falls at or beyond
    /// `prox_limit` — and widens outward until enough peers are collected or
    /// every bin has been visited.
    pub fn nearest(&self, target: &Address, max: usize) -> Vec<N> {
        if max == 0 {
            return Vec::new();
        }
        let bin = self.prox_bin(target);
        let mut visit: Vec<(usize, bool)> = Vec::new();
        if bin >= self.prox_limit {
            for b in (self.prox_limit..=self.max_prox).rev() {
                visit.push((b, b <= self.prox_limit));
            }
            for b in (0..self.prox_limit).rev() {
                visit.push((b, true));
            }
        } else {
            for b in bin..=self.max_prox {
                visit.push((b, false));
            }
            for b in (0..bin).rev() {
                visit.push((b, true));
            }
        }

        let mut ordered: Vec<N> = Vec::new();
        let mut pushed = 0usize;
        for (b, checkpoint) in visit {
            for node in &self.buckets[b] {
                insert_by_distance(&mut ordered, target, node.clone(), max);
                pushed += 1;
            }
            if checkpoint && pushed >= max {
                break;
            }
        }
        ordered
    }

    fn touch_record(&mut self, node: &N) {
        let addr = node.addr();
        let now = unix_nanos(SystemTime::now());
        match self.node_index.get(&addr) {
            Some(&(b, i)) => {
                let record = &mut self.node_db[b][i];
                record.connected = true;
                record.active = now;
                record.url = node.url();
            }
            None => {
                let bin = self.prox_bin(&addr);
                self.node_index.insert(addr, (bin, self.node_db[bin].len()));
                self.node_db[bin].push(NodeRecord {
                    address: addr,
                    url: node.url(),
                    active: now,
                    connected: true,
                });
            }
        }
    }

    /// Merge records learned from a peers message. Known addresses and our
    /// own are skipped.
    pub fn add_node_records(&mut self, records: Vec<NodeRecord>) {
        for record in records {
            if record.address == self.addr || self.node_index.contains_key(&record.address) {
                continue;
            }
            let bin = self.prox_bin(&record.address);
            self.node_index
                .insert(record.address, (bin, self.node_db[bin].len()));
            self.node_db[bin].push(record);
        }
    }

    /// Connection candidates in decreasing priority: a round-robin over the
    /// bins, where round `r` offers each bin's `r`-th record as long as the
    /// bin's live population plus `r` stays under the bucket size. Starting
    /// from an empty table this doubles as bootstrap ordering; on a mature
    /// node it fills short bins first.
    pub fn node_records(&self, max: usize) -> Vec<NodeRecord> {
        let mut out = Vec::new();
        let depth = self.node_db.iter().map(|b| b.len()).max().unwrap_or(0);
        'rounds: for round in 0..depth {
            for bin in 0..self.node_db.len() {
                if self.buckets[bin].len() + round >= self.bucket_size {
                    continue;
                }
                if let Some(record) = self.node_db[bin].get(round) {
                    if record.connected {
                        continue;
                    }
                    out.push(record.clone());
                    if out.len() >= max {
                        break 'rounds;
                    }
                }
            }
        }
        out
    }

    /// Persist the record pool.
    pub fn save(&self, path: &Path) -> Result<(), HiveError> {
        let snapshot = KadSnapshot {
            address: self.addr,
            nodes: self.node_db.clone(),
        };
        fs::write(path, serde_json::to_vec_pretty(&snapshot)?)?;
        info!(records = self.node_index.len(), path = %path.display(), "saved peer pool");
        Ok(())
    }

    /// Load a persisted record pool. The snapshot must belong to this node's
    /// address.
    pub fn load(&mut self, path: &Path) -> Result<(), HiveError> {
        let snapshot: KadSnapshot = serde_json::from_slice(&fs::read(path)?)?;
        if snapshot.address != self.addr {
            return Err(HiveError::AddressMismatch {
                expected: self.addr,
                found: snapshot.address,
            });
        }
        let bins = self.node_db.len();
        self.node_db = snapshot.nodes;
        self.node_db.resize_with(bins, Vec::new);
        self.node_db.truncate(bins);
        self.node_index.clear();
        for (bin, records) in self.node_db.iter().enumerate() {
            for (i, record) in records.iter().enumerate() {
                self.node_index.insert(record.address, (bin, i));
            }
        }
        info!(records = self.node_index.len(), path = %path.display(), "loaded peer pool");
        Ok(())
    }
}

/// Keep `list` ordered by distance to `target` and bounded at `max`
/// elements.
fn insert_by_distance<N: Node>(list: &mut Vec<N>, target: &Address, node: N, max: usize) {
    let ix = list
        .partition_point(|n| address::prox_cmp(target, &n.addr(), &node.addr()) == Ordering::Less);
    if ix < list.len() {
        list.insert(ix, node);
        if list.len() > max {
            list.pop();
        }
    } else if list.len() < max {
        list.push(node);
    }
}
