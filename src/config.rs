//! Engine configuration.
//!
//! Every tunable lives here and is passed explicitly at construction time.
//! There are no globals; tests routinely build tiny pools and tiny fan-outs
//! to force evictions and splits.

use std::time::Duration;

/// Tunables for the storage engine core.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Number of frames in the buffer pool.
    pub pool_size: usize,
    /// Maximum number of entries in a B+tree leaf page.
    pub leaf_max_size: u16,
    /// Maximum number of children in a B+tree internal page.
    pub internal_max_size: u16,
    /// Number of slots per hash block page.
    pub block_array_size: usize,
    /// Number of block pages a fresh hash table starts with.
    pub default_block_count: usize,
    /// Fixed width of hash index keys in bytes.
    pub hash_key_size: usize,
    /// How often the deadlock detector sweeps the lock table.
    pub cycle_detection_interval: Duration,
    /// Flush a dirty page as soon as its pin count drops to zero.
    pub eager_flush: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            pool_size: 64,
            leaf_max_size: 32,
            internal_max_size: 32,
            block_array_size: 256,
            default_block_count: 4,
            hash_key_size: 8,
            cycle_detection_interval: Duration::from_millis(50),
            eager_flush: false,
        }
    }
}
