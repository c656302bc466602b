//! Node configuration.

use std::time::Duration;

/// Tunable parameters for a node. [`Config::default`] matches the wire-level
/// constants the network runs with; individual fields are overridden by tests
/// and embedders.
#[derive(Clone, Debug)]
pub struct Config {
    /// Chunker leaf payload size in bytes.
    pub chunk_size: usize,
    /// Chunker fan-out per internal tree node.
    pub branches: usize,
    /// Routing-table per-bin capacity.
    pub bucket_size: usize,
    /// Number of proximity bins minus one.
    pub max_prox: usize,
    /// Cap on the near-zone peer count before the proximity limit advances.
    pub max_prox_bin_size: usize,
    /// Chunks resident in the memory LRU.
    pub mem_cache_cap: usize,
    /// Chunks retained on disk before ring eviction.
    pub db_cache_cap: u64,
    /// Expiry for outstanding retrieve requests.
    pub retrieve_timeout: Duration,
    /// Peers contacted per retrieve or store forward.
    pub fanout: usize,
}

impl Default for Config {
    fn default() -> Self {
        let bucket_size = 20;
        Self {
            chunk_size: 4096,
            branches: 128,
            bucket_size,
            max_prox: 255,
            max_prox_bin_size: bucket_size,
            mem_cache_cap: 5000,
            db_cache_cap: 50_000,
            retrieve_timeout: Duration::from_secs(10),
            fanout: 3,
        }
    }
}
