use serde::{Deserialize, Serialize};

/// Top-level configuration for the storage core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeronConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub counter: CounterConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
}

/// Storage engine section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Sync writes to disk on every commit (can be overridden per
    /// transaction via the waitForSync hint).
    #[serde(default)]
    pub sync_writes: bool,
    /// Retain this many write batches in memory for WAL tailing (0 = keep
    /// everything until shutdown; tests use small values).
    #[serde(default = "default_wal_retention")]
    pub wal_retained_batches: usize,
}

fn default_wal_retention() -> usize {
    16 * 1024
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sync_writes: false,
            wal_retained_batches: default_wal_retention(),
        }
    }
}

/// Cache manager section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Global memory limit for all caches combined, in bytes.
    #[serde(default = "default_cache_limit")]
    pub global_limit: u64,
    /// Collect windowed (recent) hit-rate statistics in addition to
    /// lifetime statistics.
    #[serde(default = "default_true")]
    pub windowed_stats: bool,
    /// Minimum milliseconds between two rebalancing passes.
    #[serde(default = "default_rebalance_grace_ms")]
    pub rebalancing_grace_ms: u64,
}

fn default_cache_limit() -> u64 {
    256 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_rebalance_grace_ms() -> u64 {
    10_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            global_limit: default_cache_limit(),
            windowed_stats: true,
            rebalancing_grace_ms: default_rebalance_grace_ms(),
        }
    }
}

/// Counter manager section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterConfig {
    /// Seconds between background counter syncs.
    #[serde(default = "default_counter_interval")]
    pub sync_interval_secs: f64,
}

fn default_counter_interval() -> f64 {
    2.5
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: default_counter_interval(),
        }
    }
}

/// Replication section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Default time-to-live for replication batches, in seconds.
    #[serde(default = "default_batch_ttl")]
    pub batch_ttl_secs: f64,
    /// Default chunk size for dump/tailing responses, in bytes.
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: u64,
    /// Upper bound a client may request for the chunk size.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
}

fn default_batch_ttl() -> f64 {
    300.0
}

fn default_chunk_size() -> u64 {
    128 * 1024
}

fn default_max_chunk_size() -> u64 {
    128 * 1024 * 1024
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            batch_ttl_secs: default_batch_ttl(),
            default_chunk_size: default_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
        }
    }
}
