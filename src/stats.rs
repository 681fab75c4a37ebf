use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared memory budget for all hash tables in the engine.
///
/// `max == 0` disables the budget check. The watermarks that drive the item
/// pager live in [`EngineStats`], not here; this only answers "is there room
/// for another stored value".
#[derive(Debug, Default)]
pub struct MemBudget {
    used: AtomicUsize,
    max: AtomicUsize,
}

impl MemBudget {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            used: AtomicUsize::new(0),
            max: AtomicUsize::new(max),
        })
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::Relaxed)
    }

    pub fn set_max(&self, max: usize) {
        self.max.store(max, Ordering::Relaxed);
    }

    /// Reserves `bytes` if the budget allows it.
    pub fn try_reserve(&self, bytes: usize) -> bool {
        let max = self.max.load(Ordering::Relaxed);
        let prev = self.used.fetch_add(bytes, Ordering::Relaxed);
        if max != 0 && prev + bytes > max {
            self.used.fetch_sub(bytes, Ordering::Relaxed);
            return false;
        }
        true
    }

    pub fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::Relaxed);
    }
}

const HISTO_BUCKETS: usize = 16;

/// A tiny lock-free histogram with power-of-two buckets. Values are
/// whatever unit the call site uses (the engine records microseconds).
#[derive(Debug, Default)]
pub struct Histogram {
    buckets: [AtomicU64; HISTO_BUCKETS],
    count: AtomicU64,
    sum: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, value: u64) {
        let idx = (64 - value.leading_zeros() as usize).min(HISTO_BUCKETS - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> u64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            0
        } else {
            self.sum.load(Ordering::Relaxed) / count
        }
    }
}

/// The global statistics counter block.
///
/// Everything here is monotonic or gauge-like and updated with relaxed
/// atomics; consistency across counters is not promised, only per-counter
/// accuracy.
#[derive(Debug)]
pub struct EngineStats {
    pub mem: Arc<MemBudget>,
    pub mem_low_wat: AtomicUsize,
    pub mem_high_wat: AtomicUsize,

    // Flusher knobs, runtime tunable.
    pub min_data_age: AtomicU32,
    pub queue_age_cap: AtomicU32,

    // Queueing and persistence.
    pub total_enqueued: AtomicU64,
    pub total_persisted: AtomicU64,
    pub queue_size: AtomicUsize,
    pub flusher_todo: AtomicUsize,
    pub flusher_commits: AtomicU64,
    pub flush_duration: AtomicU64,
    pub flush_duration_high_wat: AtomicU64,
    pub commit_time: AtomicU64,
    pub flush_failed: AtomicU64,
    pub flush_expired: AtomicU64,
    pub begin_failed: AtomicU64,
    pub commit_failed: AtomicU64,
    pub too_young: AtomicU64,
    pub too_old: AtomicU64,
    pub new_items: AtomicU64,
    pub del_items: AtomicU64,

    // Background fetches.
    pub bg_fetched: AtomicU64,
    pub bg_num_operations: AtomicU64,
    pub bg_wait_histo: Histogram,
    pub bg_load_histo: Histogram,

    // Operation counters.
    pub num_not_my_vbuckets: AtomicU64,
    pub num_ops_get_meta: AtomicU64,
    pub num_ops_set_meta: AtomicU64,
    pub num_ops_del_meta: AtomicU64,
    pub expired: AtomicU64,

    // Pagers and scanners.
    pub num_values_ejected: AtomicU64,
    pub pager_runs: AtomicU64,
    pub expiry_pager_runs: AtomicU64,
    pub alog_runs: AtomicU64,
    pub checkpoint_remover_runs: AtomicU64,
    pub items_removed_from_checkpoints: AtomicU64,

    // Mutation log health.
    pub klog_disabled_drops: AtomicU64,
    pub klog_compactor_runs: AtomicU64,

    // VBucket lifecycle.
    pub vbucket_deletions: AtomicU64,
    pub vbucket_deletion_fail: AtomicU64,
    pub snapshot_vbucket_histo: Histogram,

    // Warmup.
    pub warm_oom: AtomicU64,
    pub warmed_up_keys: AtomicU64,
    pub warmed_up_values: AtomicU64,
    pub warmup_dups: AtomicU64,

    pub disk_commit_histo: Histogram,
}

impl EngineStats {
    pub fn new(max_size: usize) -> Arc<Self> {
        let stats = Self {
            mem: MemBudget::new(max_size),
            mem_low_wat: AtomicUsize::new(0),
            mem_high_wat: AtomicUsize::new(0),
            min_data_age: AtomicU32::new(0),
            queue_age_cap: AtomicU32::new(900),
            total_enqueued: AtomicU64::new(0),
            total_persisted: AtomicU64::new(0),
            queue_size: AtomicUsize::new(0),
            flusher_todo: AtomicUsize::new(0),
            flusher_commits: AtomicU64::new(0),
            flush_duration: AtomicU64::new(0),
            flush_duration_high_wat: AtomicU64::new(0),
            commit_time: AtomicU64::new(0),
            flush_failed: AtomicU64::new(0),
            flush_expired: AtomicU64::new(0),
            begin_failed: AtomicU64::new(0),
            commit_failed: AtomicU64::new(0),
            too_young: AtomicU64::new(0),
            too_old: AtomicU64::new(0),
            new_items: AtomicU64::new(0),
            del_items: AtomicU64::new(0),
            bg_fetched: AtomicU64::new(0),
            bg_num_operations: AtomicU64::new(0),
            bg_wait_histo: Histogram::new(),
            bg_load_histo: Histogram::new(),
            num_not_my_vbuckets: AtomicU64::new(0),
            num_ops_get_meta: AtomicU64::new(0),
            num_ops_set_meta: AtomicU64::new(0),
            num_ops_del_meta: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            num_values_ejected: AtomicU64::new(0),
            pager_runs: AtomicU64::new(0),
            expiry_pager_runs: AtomicU64::new(0),
            alog_runs: AtomicU64::new(0),
            checkpoint_remover_runs: AtomicU64::new(0),
            items_removed_from_checkpoints: AtomicU64::new(0),
            klog_disabled_drops: AtomicU64::new(0),
            klog_compactor_runs: AtomicU64::new(0),
            vbucket_deletions: AtomicU64::new(0),
            vbucket_deletion_fail: AtomicU64::new(0),
            snapshot_vbucket_histo: Histogram::new(),
            warm_oom: AtomicU64::new(0),
            warmed_up_keys: AtomicU64::new(0),
            warmed_up_values: AtomicU64::new(0),
            warmup_dups: AtomicU64::new(0),
            disk_commit_histo: Histogram::new(),
        };
        stats.set_max_size(max_size);
        Arc::new(stats)
    }

    /// Sets the memory budget and derives the default watermarks (60% and
    /// 75%). Explicit watermark updates overwrite the derived values.
    pub fn set_max_size(&self, max_size: usize) {
        self.mem.set_max(max_size);
        self.mem_low_wat
            .store((max_size as f64 * 0.6) as usize, Ordering::Relaxed);
        self.mem_high_wat
            .store((max_size as f64 * 0.75) as usize, Ordering::Relaxed);
    }

    pub fn mem_used(&self) -> usize {
        self.mem.used()
    }

    /// Emits a one-line health summary through tracing.
    pub fn log_summary(&self) {
        tracing::info!(
            mem_used = self.mem.used(),
            queue_size = self.queue_size.load(Ordering::Relaxed),
            flusher_todo = self.flusher_todo.load(Ordering::Relaxed),
            total_enqueued = self.total_enqueued.load(Ordering::Relaxed),
            total_persisted = self.total_persisted.load(Ordering::Relaxed),
            commit_failed = self.commit_failed.load(Ordering::Relaxed),
            bg_fetched = self.bg_fetched.load(Ordering::Relaxed),
            ejected = self.num_values_ejected.load(Ordering::Relaxed),
            expired = self.expired.load(Ordering::Relaxed),
            "engine stats"
        );
    }

    /// Serializes the counters that survive restarts into a string map for
    /// `KVStore::snapshot_stats`.
    pub fn persisted_map(&self) -> std::collections::HashMap<String, String> {
        let mut map = std::collections::HashMap::new();
        map.insert(
            "total_persisted".to_string(),
            self.total_persisted.load(Ordering::Relaxed).to_string(),
        );
        map.insert(
            "total_enqueued".to_string(),
            self.total_enqueued.load(Ordering::Relaxed).to_string(),
        );
        map.insert(
            "vbucket_deletions".to_string(),
            self.vbucket_deletions.load(Ordering::Relaxed).to_string(),
        );
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_budget_reserve_release() {
        let budget = MemBudget::new(100);
        assert!(budget.try_reserve(60));
        assert!(!budget.try_reserve(50));
        budget.release(60);
        assert!(budget.try_reserve(50));
        assert_eq!(budget.used(), 50);
    }

    #[test]
    fn test_mem_budget_unlimited() {
        let budget = MemBudget::new(0);
        assert!(budget.try_reserve(usize::MAX / 2));
    }

    #[test]
    fn test_histogram_mean() {
        let h = Histogram::new();
        h.add(10);
        h.add(30);
        assert_eq!(h.count(), 2);
        assert_eq!(h.mean(), 20);
    }

    #[test]
    fn test_watermarks_derived_from_max_size() {
        let stats = EngineStats::new(1000);
        assert_eq!(stats.mem_low_wat.load(Ordering::Relaxed), 600);
        assert_eq!(stats.mem_high_wat.load(Ordering::Relaxed), 750);
    }
}
