//! VBuckets and the vbucket map.
//!
//! A vbucket is a self-contained partition of the key space: one hash
//! table, one checkpoint manager, a backfill queue, and a list of cookies
//! parked while the vbucket is pending. The [`VBucketMap`] owns every
//! vbucket by id and tracks the per-id persistence bookkeeping the flusher
//! and snapshot tasks need.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::bgfetch::BgFetchItem;
use crate::checkpoint::CheckpointManager;
use crate::config::{CheckpointConfig, EngineConfig};
use crate::hashtable::HashTable;
use crate::item::{Cookie, QueuedItem};
use crate::stats::MemBudget;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VBucketState {
    Active,
    Replica,
    Pending,
    Dead,
}

impl std::fmt::Display for VBucketState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            VBucketState::Active => write!(f, "active"),
            VBucketState::Replica => write!(f, "replica"),
            VBucketState::Pending => write!(f, "pending"),
            VBucketState::Dead => write!(f, "dead"),
        }
    }
}

impl VBucketState {
    /// Flush ordering rank; active vbuckets drain first.
    fn flush_rank(self) -> u8 {
        match self {
            VBucketState::Active => 0,
            VBucketState::Pending => 1,
            VBucketState::Replica => 2,
            VBucketState::Dead => 3,
        }
    }
}

/// Per-vbucket queue and operation statistics.
#[derive(Debug, Default)]
pub struct VBucketStats {
    pub ops_create: AtomicU64,
    pub ops_update: AtomicU64,
    pub ops_delete: AtomicU64,
    pub ops_reject: AtomicU64,
    pub num_expired: AtomicU64,
    pub dirty_queue_size: AtomicUsize,
    pub dirty_queue_mem: AtomicUsize,
    pub dirty_queue_fill: AtomicU64,
    pub dirty_queue_drain: AtomicU64,
    pub dirty_queue_age: AtomicU64,
    pub dirty_queue_pending_writes: AtomicUsize,
}

/// A logical shard of the key space.
pub struct VBucket {
    id: u16,
    state: RwLock<VBucketState>,
    pub ht: HashTable,
    pub checkpoints: Mutex<CheckpointManager>,
    backfill: Mutex<Vec<QueuedItem>>,
    pending_ops: Mutex<Vec<Cookie>>,
    pending_bg_fetches: Mutex<HashMap<Vec<u8>, Vec<BgFetchItem>>>,
    pub stats: VBucketStats,
}

impl VBucket {
    pub fn new(
        id: u16,
        state: VBucketState,
        config: &EngineConfig,
        mem: Arc<MemBudget>,
    ) -> Self {
        Self::with_checkpoint_config(id, state, config.ht_shards, config.checkpoint.clone(), mem)
    }

    pub fn with_checkpoint_config(
        id: u16,
        state: VBucketState,
        ht_shards: usize,
        checkpoint: CheckpointConfig,
        mem: Arc<MemBudget>,
    ) -> Self {
        // The first checkpoint of an active vbucket starts with id 2.
        let start_id = if state == VBucketState::Active { 2 } else { 0 };
        Self {
            id,
            state: RwLock::new(state),
            ht: HashTable::new(ht_shards, mem),
            checkpoints: Mutex::new(CheckpointManager::new(id, start_id, checkpoint)),
            backfill: Mutex::new(Vec::new()),
            pending_ops: Mutex::new(Vec::new()),
            pending_bg_fetches: Mutex::new(HashMap::new()),
            stats: VBucketStats::default(),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn state(&self) -> VBucketState {
        *self.state.read().unwrap()
    }

    pub fn set_state(&self, to: VBucketState) {
        let mut state = self.state.write().unwrap();
        tracing::info!(vbucket = self.id, from = %*state, to = %to, "vbucket state change");
        *state = to;
    }

    /// Parks a cookie until the vbucket leaves the pending state. Returns
    /// true when queued (the caller then reports would-block).
    pub fn add_pending_op(&self, cookie: Cookie) -> bool {
        self.pending_ops.lock().unwrap().push(cookie);
        true
    }

    /// Drains parked cookies, returning them for notification.
    pub fn take_pending_ops(&self) -> Vec<Cookie> {
        std::mem::take(&mut *self.pending_ops.lock().unwrap())
    }

    pub fn queue_backfill_item(&self, item: QueuedItem) -> bool {
        self.backfill.lock().unwrap().push(item);
        true
    }

    pub fn backfill_size(&self) -> usize {
        self.backfill.lock().unwrap().len()
    }

    pub fn take_backfill_items(&self, out: &mut Vec<QueuedItem>) {
        out.append(&mut self.backfill.lock().unwrap());
    }

    /// Adds a background fetch request. Returns true when this vbucket had
    /// no pending fetches before, which is the bg fetcher's wake signal.
    pub fn queue_bg_fetch(&self, key: Vec<u8>, item: BgFetchItem) -> bool {
        let mut map = self.pending_bg_fetches.lock().unwrap();
        let was_empty = map.is_empty();
        map.entry(key).or_default().push(item);
        was_empty
    }

    pub fn has_pending_bg_fetches(&self) -> bool {
        !self.pending_bg_fetches.lock().unwrap().is_empty()
    }

    pub fn num_pending_bg_fetch_items(&self) -> usize {
        self.pending_bg_fetches
            .lock()
            .unwrap()
            .values()
            .map(|v| v.len())
            .sum()
    }

    pub fn take_pending_bg_fetches(&self) -> HashMap<Vec<u8>, Vec<BgFetchItem>> {
        std::mem::take(&mut *self.pending_bg_fetches.lock().unwrap())
    }

    pub fn do_stats_for_queueing(&self, item: &QueuedItem) {
        self.stats.dirty_queue_size.fetch_add(1, Ordering::Relaxed);
        self.stats
            .dirty_queue_mem
            .fetch_add(item.size(), Ordering::Relaxed);
        self.stats.dirty_queue_fill.fetch_add(1, Ordering::Relaxed);
        self.stats
            .dirty_queue_pending_writes
            .fetch_add(item.size(), Ordering::Relaxed);
    }

    pub fn do_stats_for_flushing(&self, item: &QueuedItem, now: u32) {
        let stats = &self.stats;
        if stats.dirty_queue_size.load(Ordering::Relaxed) > 0 {
            stats.dirty_queue_size.fetch_sub(1, Ordering::Relaxed);
        }
        let mem = stats.dirty_queue_mem.load(Ordering::Relaxed);
        stats
            .dirty_queue_mem
            .store(mem.saturating_sub(item.size()), Ordering::Relaxed);
        stats.dirty_queue_drain.fetch_add(1, Ordering::Relaxed);
        stats
            .dirty_queue_age
            .fetch_add(now.saturating_sub(item.queued_at) as u64, Ordering::Relaxed);
        let pending = stats.dirty_queue_pending_writes.load(Ordering::Relaxed);
        stats
            .dirty_queue_pending_writes
            .store(pending.saturating_sub(item.size()), Ordering::Relaxed);
    }

    pub fn reset_queue_stats(&self) {
        self.stats.dirty_queue_size.store(0, Ordering::Relaxed);
        self.stats.dirty_queue_mem.store(0, Ordering::Relaxed);
        self.stats.dirty_queue_age.store(0, Ordering::Relaxed);
        self.stats
            .dirty_queue_pending_writes
            .store(0, Ordering::Relaxed);
    }
}

/// Visitor over vbuckets and, optionally, their stored values. Pagers, the
/// access scanner, and the state snapshot all speak this one interface.
pub trait VBucketVisitor {
    /// Called per vbucket; return true to also visit its stored values.
    fn visit_bucket(&mut self, vb: &Arc<VBucket>) -> bool;

    /// Called per stored value when `visit_bucket` returned true.
    fn visit(&mut self, sv: &mut crate::hashtable::StoredValue);

    /// Called once after the last vbucket.
    fn complete(&mut self) {}
}

/// Indexed collection of vbuckets plus per-id persistence bookkeeping.
pub struct VBucketMap {
    buckets: Vec<RwLock<Option<Arc<VBucket>>>>,
    bucket_deletion: Vec<AtomicBool>,
    persistence_checkpoint_ids: Vec<AtomicU64>,
    high_priority_snapshot: AtomicBool,
    low_priority_snapshot: AtomicBool,
}

impl VBucketMap {
    pub fn new(size: usize) -> Self {
        let mut buckets = Vec::with_capacity(size);
        let mut bucket_deletion = Vec::with_capacity(size);
        let mut persistence_checkpoint_ids = Vec::with_capacity(size);
        for _ in 0..size {
            buckets.push(RwLock::new(None));
            bucket_deletion.push(AtomicBool::new(false));
            persistence_checkpoint_ids.push(AtomicU64::new(0));
        }
        Self {
            buckets,
            bucket_deletion,
            persistence_checkpoint_ids,
            high_priority_snapshot: AtomicBool::new(false),
            low_priority_snapshot: AtomicBool::new(false),
        }
    }

    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    pub fn get(&self, id: u16) -> Option<Arc<VBucket>> {
        self.buckets
            .get(id as usize)
            .and_then(|slot| slot.read().unwrap().clone())
    }

    pub fn add(&self, vb: Arc<VBucket>) {
        let id = vb.id() as usize;
        if let Some(slot) = self.buckets.get(id) {
            *slot.write().unwrap() = Some(vb);
            self.persistence_checkpoint_ids[id].store(0, Ordering::Relaxed);
        }
    }

    pub fn remove(&self, id: u16) -> Option<Arc<VBucket>> {
        self.buckets
            .get(id as usize)
            .and_then(|slot| slot.write().unwrap().take())
    }

    /// Ids of live vbuckets.
    pub fn ids(&self) -> Vec<u16> {
        let mut out = Vec::new();
        for (i, slot) in self.buckets.iter().enumerate() {
            if slot.read().unwrap().is_some() {
                out.push(i as u16);
            }
        }
        out
    }

    /// Ids ordered so active vbuckets flush first.
    pub fn ids_sorted_by_state(&self) -> Vec<u16> {
        let mut with_state: Vec<(u8, u16)> = Vec::new();
        for (i, slot) in self.buckets.iter().enumerate() {
            if let Some(vb) = slot.read().unwrap().as_ref() {
                with_state.push((vb.state().flush_rank(), i as u16));
            }
        }
        with_state.sort();
        with_state.into_iter().map(|(_, id)| id).collect()
    }

    pub fn is_bucket_deletion(&self, id: u16) -> bool {
        self.bucket_deletion
            .get(id as usize)
            .map(|b| b.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Flags (or clears) deletion-in-progress. Returns true when the flag
    /// actually changed, which gates scheduling a second deletion task.
    pub fn set_bucket_deletion(&self, id: u16, value: bool) -> bool {
        self.bucket_deletion
            .get(id as usize)
            .map(|b| b.compare_exchange(!value, value, Ordering::AcqRel, Ordering::Acquire).is_ok())
            .unwrap_or(false)
    }

    pub fn persistence_checkpoint_id(&self, id: u16) -> u64 {
        self.persistence_checkpoint_ids
            .get(id as usize)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn set_persistence_checkpoint_id(&self, id: u16, checkpoint_id: u64) {
        if let Some(v) = self.persistence_checkpoint_ids.get(id as usize) {
            v.store(checkpoint_id, Ordering::Relaxed);
        }
    }

    /// One-shot scheduling flags for the vbucket state snapshot tasks.
    /// Setting returns true only on a transition, so one task runs at a
    /// time per priority.
    pub fn set_high_priority_vb_snapshot_flag(&self, value: bool) -> bool {
        self.high_priority_snapshot
            .compare_exchange(!value, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn set_low_priority_vb_snapshot_flag(&self, value: bool) -> bool {
        self.low_priority_snapshot
            .compare_exchange(!value, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_high_priority_vb_snapshot_scheduled(&self) -> bool {
        self.high_priority_snapshot.load(Ordering::Acquire)
    }
}
