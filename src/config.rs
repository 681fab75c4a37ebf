use std::collections::HashMap;
use std::sync::Mutex;

/// Configuration for the engine. Built once at startup; the knobs that can
/// change at runtime flow through [`crate::store::EmberStore::set_param`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of vbucket slots (default: 1024)
    pub max_vbuckets: usize,

    /// Initial hash table shard count per vbucket (default: 193)
    pub ht_shards: usize,

    /// Memory budget in bytes; 0 disables the budget (default: 256MB)
    pub max_size: usize,

    /// Low watermark in bytes; 0 derives 60% of max_size
    pub mem_low_wat: usize,

    /// High watermark in bytes; 0 derives 75% of max_size
    pub mem_high_wat: usize,

    /// Floor on seconds since a value was dirtied before it may flush
    pub min_data_age: u32,

    /// Queue age past which an item flushes regardless of min_data_age
    pub queue_age_cap: u32,

    /// Grace seconds past expiry during which a set persists as a delete
    pub expiry_window: u32,

    /// Maximum items per flush transaction (default: 250)
    pub max_txn_size: usize,

    /// Schedule lag in seconds applied to background fetches
    pub bg_fetch_delay: f64,

    /// Expiry pager period in seconds; 0 disables it (default: 3600)
    pub exp_pager_stime: u64,

    /// Checkpoint remover period in seconds (default: 5)
    pub chk_remover_stime: u64,

    /// Hash table resizer period in seconds (default: 60)
    pub ht_resizer_stime: u64,

    /// Access log path; empty disables the access scanner
    pub alog_path: String,

    /// Access log block size (default: 4096)
    pub alog_block_size: usize,

    /// Access scanner period in seconds (default: 86400)
    pub alog_sleep_time: u64,

    /// Delay in seconds before the first access scan; 0 waits one full
    /// period instead
    pub alog_task_time: u64,

    /// Mutation log path; empty disables the mutation log
    pub klog_path: String,

    /// Mutation log block size, a power of two (default: 4096)
    pub klog_block_size: usize,

    /// Mutation log sync mode: "off", "commit1", "commit2", "full"
    pub klog_sync: String,

    /// Checkpoint configuration
    pub checkpoint: CheckpointConfig,

    /// Mutation log compactor configuration
    pub klog_compactor: MutationLogCompactorConfig,

    /// Stop warmup value loading past this fraction of max_size
    pub warmup_min_memory_threshold: f64,

    /// Stop warmup value loading past this fraction of seen keys
    pub warmup_min_items_threshold: f64,

    /// Treat any warmup OOM as fatal to the engine
    pub failpartialwarmup: bool,

    /// Create vbucket 0 as active at startup
    pub start_vb0: bool,

    /// Allow separate read dispatchers when the store supports concurrency
    pub concurrent_db: bool,
}

/// Checkpoint manager configuration.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Close the open checkpoint after this many items (default: 500)
    pub max_items: usize,

    /// Close the open checkpoint after this many bytes (default: 1MB)
    pub max_bytes: usize,

    /// Accept TAP backfills into active vbuckets
    pub inconsistent_slave_checkpoint: bool,
}

/// Mutation log compactor configuration.
#[derive(Debug, Clone)]
pub struct MutationLogCompactorConfig {
    /// Rewrite the log once it exceeds this size in bytes
    pub max_log_size: u64,

    /// Rewrite the log once live records drop below this ratio
    pub max_entry_ratio: f64,

    /// Skip compaction while the flusher backlog exceeds this many items
    pub queue_cap: usize,

    /// Compactor period in seconds
    pub sleep_time: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_vbuckets: 1024,
            ht_shards: 193,
            max_size: 256 * 1024 * 1024,
            mem_low_wat: 0,
            mem_high_wat: 0,
            min_data_age: 0,
            queue_age_cap: 900,
            expiry_window: 3,
            max_txn_size: 250,
            bg_fetch_delay: 0.0,
            exp_pager_stime: 3600,
            chk_remover_stime: 5,
            ht_resizer_stime: 60,
            alog_path: String::new(),
            alog_block_size: 4096,
            alog_sleep_time: 86400,
            alog_task_time: 0,
            klog_path: String::new(),
            klog_block_size: 4096,
            klog_sync: "commit2".to_string(),
            checkpoint: CheckpointConfig::default(),
            klog_compactor: MutationLogCompactorConfig::default(),
            warmup_min_memory_threshold: 1.0,
            warmup_min_items_threshold: 1.0,
            failpartialwarmup: false,
            start_vb0: true,
            concurrent_db: true,
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_items: 500,
            max_bytes: 1024 * 1024,
            inconsistent_slave_checkpoint: false,
        }
    }
}

impl Default for MutationLogCompactorConfig {
    fn default() -> Self {
        Self {
            max_log_size: 2 * 1024 * 1024 * 1024,
            max_entry_ratio: 10.0,
            queue_cap: 500_000,
            sleep_time: 1800,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_vbuckets(mut self, n: usize) -> Self {
        self.max_vbuckets = n;
        self
    }

    pub fn ht_shards(mut self, n: usize) -> Self {
        self.ht_shards = n;
        self
    }

    pub fn max_size(mut self, bytes: usize) -> Self {
        self.max_size = bytes;
        self
    }

    pub fn min_data_age(mut self, secs: u32) -> Self {
        self.min_data_age = secs;
        self
    }

    pub fn queue_age_cap(mut self, secs: u32) -> Self {
        self.queue_age_cap = secs;
        self
    }

    pub fn expiry_window(mut self, secs: u32) -> Self {
        self.expiry_window = secs;
        self
    }

    pub fn max_txn_size(mut self, items: usize) -> Self {
        self.max_txn_size = items;
        self
    }

    pub fn klog_path(mut self, path: impl Into<String>) -> Self {
        self.klog_path = path.into();
        self
    }

    pub fn alog_path(mut self, path: impl Into<String>) -> Self {
        self.alog_path = path.into();
        self
    }

    pub fn checkpoint(mut self, config: CheckpointConfig) -> Self {
        self.checkpoint = config;
        self
    }

    pub fn klog_compactor(mut self, config: MutationLogCompactorConfig) -> Self {
        self.klog_compactor = config;
        self
    }

    pub fn failpartialwarmup(mut self, v: bool) -> Self {
        self.failpartialwarmup = v;
        self
    }

    pub fn start_vb0(mut self, v: bool) -> Self {
        self.start_vb0 = v;
        self
    }
}

impl CheckpointConfig {
    pub fn max_items(mut self, n: usize) -> Self {
        self.max_items = n;
        self
    }

    pub fn max_bytes(mut self, n: usize) -> Self {
        self.max_bytes = n;
        self
    }

    pub fn inconsistent_slave_checkpoint(mut self, v: bool) -> Self {
        self.inconsistent_slave_checkpoint = v;
        self
    }
}

impl MutationLogCompactorConfig {
    pub fn max_log_size(mut self, bytes: u64) -> Self {
        self.max_log_size = bytes;
        self
    }

    pub fn max_entry_ratio(mut self, ratio: f64) -> Self {
        self.max_entry_ratio = ratio;
        self
    }

    pub fn queue_cap(mut self, items: usize) -> Self {
        self.queue_cap = items;
        self
    }

    pub fn sleep_time(mut self, secs: u64) -> Self {
        self.sleep_time = secs;
        self
    }
}

type Listener = Box<dyn Fn(usize) + Send + Sync>;

/// Registration table for per-key parameter change listeners. The store
/// applies its own handling in `set_param` first, then notifies whatever the
/// embedder registered here.
#[derive(Default)]
pub struct ParamListeners {
    listeners: Mutex<HashMap<String, Vec<Listener>>>,
}

impl ParamListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: impl Into<String>, listener: Listener) {
        let mut map = self.listeners.lock().unwrap();
        map.entry(key.into()).or_default().push(listener);
    }

    pub fn notify(&self, key: &str, value: usize) {
        let map = self.listeners.lock().unwrap();
        if let Some(listeners) = map.get(key) {
            for l in listeners {
                l(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_vbuckets, 1024);
        assert_eq!(config.ht_shards, 193);
        assert_eq!(config.checkpoint.max_items, 500);
        assert!(config.klog_path.is_empty());
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .max_vbuckets(4)
            .min_data_age(5)
            .max_txn_size(10)
            .checkpoint(CheckpointConfig::default().max_items(2));

        assert_eq!(config.max_vbuckets, 4);
        assert_eq!(config.min_data_age, 5);
        assert_eq!(config.max_txn_size, 10);
        assert_eq!(config.checkpoint.max_items, 2);
    }

    #[test]
    fn test_param_listeners() {
        let listeners = ParamListeners::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        listeners.register(
            "min_data_age",
            Box::new(move |v| {
                seen2.store(v, Ordering::SeqCst);
            }),
        );

        listeners.notify("min_data_age", 42);
        assert_eq!(seen.load(Ordering::SeqCst), 42);

        // Unknown keys are a no-op.
        listeners.notify("unknown", 1);
    }
}
