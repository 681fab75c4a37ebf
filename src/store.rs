//! The store facade.
//!
//! [`EmberStore`] is the entry point for every client-facing operation and
//! the owner of the engine's moving parts: the vbucket map, the four
//! dispatchers, the flusher, the background fetcher, the mutation log, and
//! the periodic maintenance tasks. Operations run on the caller's thread;
//! anything that touches disk happens on a dispatcher.
//!
//! Lock order, outermost first: `vbset`, the vbucket map, a hash shard,
//! `restore`. Nothing acquires in the reverse direction.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use itertools::Itertools;

use crate::access_log::{AccessScanner, ItemAccessVisitor};
use crate::bgfetch::{BgFetchItem, BgFetcher, FetchKind, SingleBgFetchTask, VKeyStatBgFetchTask};
use crate::config::{EngineConfig, ParamListeners};
use crate::dispatcher::{Callback, Dispatcher, Priority, TaskHandle, TaskId};
use crate::error::{Error, Result};
use crate::flusher::Flusher;
use crate::hashtable::{AddType, MutationType, StoredValue};
use crate::item::{current_time, next_cas, Cookie, Item, ItemMeta, Operation, QueuedItem,
                  UNPERSISTED_ROW_ID};
use crate::kvstore::{GetValue, KVStore, StorageProperties, VBucketSnapshot};
use crate::mutation_log::{MutationLog, SyncMode};
use crate::pager::{ClosedUnrefCheckpointRemover, ExpiredItemPager, HashtableResizer, ItemPager,
                   MutationLogCompactor, StatSnap, ITEM_PAGER_PERIOD};
use crate::stats::EngineStats;
use crate::txn::TransactionContext;
use crate::vbucket::{VBucket, VBucketMap, VBucketState, VBucketVisitor};

/// Receives completion notifications for would-block operations.
pub trait EngineCallback: Send + Sync {
    fn notify_io_complete(&self, cookie: Cookie, result: Result<()>);
}

/// Callback sink for embedders that never hand out cookies.
pub struct NullEngineCallback;

impl EngineCallback for NullEngineCallback {
    fn notify_io_complete(&self, _cookie: Cookie, _result: Result<()>) {}
}

/// Per-key introspection snapshot.
#[derive(Clone, Debug)]
pub struct KeyStats {
    pub dirty: bool,
    pub deleted: bool,
    pub resident: bool,
    pub exptime: u32,
    pub flags: u32,
    pub cas: u64,
    pub data_age: u32,
    pub vbucket_state: VBucketState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SnapshotPriority {
    High,
    Low,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum VBucketDelResult {
    Success,
    Fail,
    Invalid,
}

/// Items spliced into the flush stream by online restore, plus the keys
/// whose deletion was persisted while running degraded.
#[derive(Default)]
struct RestoreContext {
    items: HashMap<u16, Vec<QueuedItem>>,
    items_deleted: HashSet<Vec<u8>>,
}

/// A periodic task slot guarded by its own mutex (expiry pager, access
/// scanner).
#[derive(Default)]
struct TaskSlot {
    sleep_time: u64,
    task: Option<TaskId>,
}

struct CompactorRuntime {
    max_log_size: AtomicU64,
    max_entry_ratio_bits: AtomicU64,
    queue_cap: AtomicUsize,
}

enum FlushAction {
    Skip,
    Reject(u32),
    Set {
        itm: Item,
        cas: u64,
        rowid: i64,
        dirtied: u32,
    },
    Del {
        itm: Item,
        rowid: i64,
        dirtied: u32,
    },
}

/// The eventually-persistent store.
pub struct EmberStore {
    config: EngineConfig,
    stats: Arc<EngineStats>,
    vbuckets: VBucketMap,
    rw_store: Arc<dyn KVStore>,
    ro_store: Arc<dyn KVStore>,
    storage_props: StorageProperties,
    mutation_log: Arc<MutationLog>,

    rw_dispatcher: Arc<Dispatcher>,
    ro_dispatcher: Arc<Dispatcher>,
    tap_dispatcher: Arc<Dispatcher>,
    nonio_dispatcher: Arc<Dispatcher>,

    flusher: Flusher,
    bg_fetcher: Option<BgFetcher>,
    engine_cb: Arc<dyn EngineCallback>,
    listeners: ParamListeners,

    vbset: Mutex<()>,
    restore: Mutex<RestoreContext>,
    expiry_pager: Mutex<TaskSlot>,
    access_scanner: Mutex<TaskSlot>,
    compactor: CompactorRuntime,

    do_persistence: bool,
    degraded: AtomicBool,
    disk_flush_all: AtomicBool,
    item_expiry_window: AtomicU32,
    bg_fetch_delay: AtomicU32,
    txn_size: AtomicUsize,
    started: AtomicBool,

    self_ref: OnceLock<Weak<EmberStore>>,
}

impl EmberStore {
    pub fn new(
        config: EngineConfig,
        kv: Arc<dyn KVStore>,
        engine_cb: Arc<dyn EngineCallback>,
    ) -> Result<Arc<Self>> {
        let stats = EngineStats::new(config.max_size);
        if config.mem_low_wat != 0 {
            stats.mem_low_wat.store(config.mem_low_wat, Ordering::Relaxed);
        }
        if config.mem_high_wat != 0 {
            stats
                .mem_high_wat
                .store(config.mem_high_wat, Ordering::Relaxed);
        }
        stats
            .min_data_age
            .store(config.min_data_age, Ordering::Relaxed);
        stats
            .queue_age_cap
            .store(config.queue_age_cap, Ordering::Relaxed);

        let storage_props = kv.properties();
        tracing::info!(
            concurrency = storage_props.max_concurrency,
            readers = storage_props.max_readers,
            writers = storage_props.max_writers,
            "storage properties"
        );

        let rw_dispatcher = Dispatcher::new("rw_dispatcher");
        let concurrent = storage_props.max_concurrency > 1
            && storage_props.max_readers > 1
            && config.concurrent_db;
        let ro_dispatcher = if concurrent {
            Dispatcher::new("ro_dispatcher")
        } else {
            rw_dispatcher.clone()
        };
        let tap_dispatcher = if storage_props.max_concurrency > 2
            && storage_props.max_readers > 2
            && config.concurrent_db
        {
            Dispatcher::new("tap_dispatcher")
        } else {
            ro_dispatcher.clone()
        };
        let nonio_dispatcher = Dispatcher::new("nonio_dispatcher");

        let mutation_log =
            match MutationLog::open(config.klog_path.clone(), config.klog_block_size) {
                Ok(log) => Arc::new(log),
                Err(e) => {
                    tracing::warn!(error = %e, "error opening mutation log, disabling");
                    Arc::new(MutationLog::open("", config.klog_block_size)?)
                }
            };
        mutation_log.set_sync_config(SyncMode::parse(&config.klog_sync)?);

        let flusher = Flusher::new(TransactionContext::new(
            kv.clone(),
            mutation_log.clone(),
            stats.clone(),
        ));

        let bg_fetcher = if concurrent {
            Some(BgFetcher::new())
        } else {
            None
        };

        let do_persistence = std::env::var_os("EP_NO_PERSISTENCE").is_none();
        if !do_persistence {
            tracing::warn!("EP_NO_PERSISTENCE set, running memory-only");
        }

        let compactor = CompactorRuntime {
            max_log_size: AtomicU64::new(config.klog_compactor.max_log_size),
            max_entry_ratio_bits: AtomicU64::new(config.klog_compactor.max_entry_ratio.to_bits()),
            queue_cap: AtomicUsize::new(config.klog_compactor.queue_cap),
        };

        let store = Arc::new(Self {
            vbuckets: VBucketMap::new(config.max_vbuckets),
            rw_store: kv.clone(),
            ro_store: kv,
            storage_props,
            mutation_log,
            rw_dispatcher,
            ro_dispatcher,
            tap_dispatcher,
            nonio_dispatcher,
            flusher,
            bg_fetcher,
            engine_cb,
            listeners: ParamListeners::new(),
            vbset: Mutex::new(()),
            restore: Mutex::new(RestoreContext::default()),
            expiry_pager: Mutex::new(TaskSlot::default()),
            access_scanner: Mutex::new(TaskSlot::default()),
            compactor,
            do_persistence,
            degraded: AtomicBool::new(true),
            disk_flush_all: AtomicBool::new(false),
            item_expiry_window: AtomicU32::new(config.expiry_window),
            bg_fetch_delay: AtomicU32::new(config.bg_fetch_delay as u32),
            txn_size: AtomicUsize::new(config.max_txn_size),
            started: AtomicBool::new(false),
            self_ref: OnceLock::new(),
            stats,
            config,
        });
        let _ = store.self_ref.set(Arc::downgrade(&store));

        if store.config.start_vb0 {
            let vb = Arc::new(VBucket::new(
                0,
                VBucketState::Active,
                &store.config,
                store.stats.mem.clone(),
            ));
            store.vbuckets.add(vb);
        }

        Ok(store)
    }

    /// Starts the background machinery: flusher, bg fetcher, pagers,
    /// resizer, checkpoint remover, log compactor, stat snapshots.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.flusher.start(&self.rw_dispatcher, self);
        if let Some(bg) = &self.bg_fetcher {
            bg.start(&self.ro_dispatcher, self);
        }

        let weak = Arc::downgrade(self);
        self.nonio_dispatcher.schedule(
            Box::new(ItemPager {
                store: weak.clone(),
            }),
            Priority::ITEM_PAGER,
            ITEM_PAGER_PERIOD,
        );
        self.nonio_dispatcher.schedule(
            Box::new(HashtableResizer {
                store: weak.clone(),
                sleep_time: self.config.ht_resizer_stime as f64,
            }),
            Priority::HT_RESIZER,
            self.config.ht_resizer_stime as f64,
        );
        self.nonio_dispatcher.schedule(
            Box::new(ClosedUnrefCheckpointRemover {
                store: weak.clone(),
                sleep_time: self.config.chk_remover_stime as f64,
            }),
            Priority::CHECKPOINT_REMOVER,
            self.config.chk_remover_stime as f64,
        );
        self.set_expiry_pager_sleeptime(self.config.exp_pager_stime);
        if !self.config.alog_path.is_empty() {
            self.set_access_scanner_sleeptime(self.config.alog_sleep_time);
        }
        if self.mutation_log.is_enabled() {
            self.rw_dispatcher.schedule(
                Box::new(MutationLogCompactor {
                    store: weak.clone(),
                    sleep_time: self.config.klog_compactor.sleep_time as f64,
                }),
                Priority::MUTATION_LOG_COMPACTOR,
                self.config.klog_compactor.sleep_time as f64,
            );
        }
        self.rw_dispatcher.schedule(
            Box::new(StatSnap {
                store: weak,
                sleep_time: 60.0,
            }),
            Priority::STAT_SNAP,
            60.0,
        );
    }

    /// Stops the flusher and every dispatcher. Pending background work is
    /// dropped, matching a shutdown.
    pub fn stop(&self) -> Result<()> {
        if let Some(bg) = &self.bg_fetcher {
            bg.stop(&self.ro_dispatcher);
        }
        self.flusher.request_stop(&self.rw_dispatcher);
        if !self.flusher.wait_stopped(Duration::from_secs(30)) {
            tracing::warn!("flusher did not stop in time");
        }
        self.rw_dispatcher.stop()?;
        if !Arc::ptr_eq(&self.ro_dispatcher, &self.rw_dispatcher) {
            self.ro_dispatcher.stop()?;
        }
        if !Arc::ptr_eq(&self.tap_dispatcher, &self.ro_dispatcher) {
            self.tap_dispatcher.stop()?;
        }
        self.nonio_dispatcher.stop()?;
        Ok(())
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage_properties(&self) -> StorageProperties {
        self.storage_props
    }

    pub(crate) fn flusher(&self) -> &Flusher {
        &self.flusher
    }

    pub fn flusher_state(&self) -> crate::flusher::FlusherState {
        self.flusher.state()
    }

    pub(crate) fn mutation_log(&self) -> &MutationLog {
        &self.mutation_log
    }

    pub fn register_param_listener(
        &self,
        key: impl Into<String>,
        listener: Box<dyn Fn(usize) + Send + Sync>,
    ) {
        self.listeners.register(key, listener);
    }

    fn self_arc(&self) -> Option<Arc<Self>> {
        self.self_ref.get().and_then(Weak::upgrade)
    }

    pub(crate) fn notify_io_complete(&self, cookie: Cookie, result: Result<()>) {
        self.engine_cb.notify_io_complete(cookie, result);
    }

    // ------------------------------------------------------------------
    // VBucket access and lifecycle
    // ------------------------------------------------------------------

    pub fn get_vbucket(&self, vbid: u16, wanted: VBucketState) -> Option<Arc<VBucket>> {
        let vb = self.vbuckets.get(vbid)?;
        if vb.state() == wanted {
            Some(vb)
        } else {
            None
        }
    }

    pub(crate) fn get_vbucket_any_state(&self, vbid: u16) -> Option<Arc<VBucket>> {
        self.vbuckets.get(vbid)
    }

    pub(crate) fn vbucket_ids(&self) -> Vec<u16> {
        self.vbuckets.ids()
    }

    pub(crate) fn num_live_items(&self) -> usize {
        self.vbuckets
            .ids()
            .into_iter()
            .filter_map(|id| self.vbuckets.get(id))
            .map(|vb| vb.ht.num_items())
            .sum()
    }

    pub fn set_vbucket_state(&self, vbid: u16, to: VBucketState) {
        let lh = self.vbset.lock().unwrap();
        if let Some(vb) = self.vbuckets.get(vbid) {
            let prior = vb.state();
            if prior == to {
                return;
            }
            vb.set_state(to);
            drop(lh);
            if prior == VBucketState::Pending && to == VBucketState::Active {
                for cookie in vb.take_pending_ops() {
                    self.notify_io_complete(cookie, Ok(()));
                }
            }
            self.schedule_vb_snapshot(SnapshotPriority::Low);
        } else {
            let vb = Arc::new(VBucket::new(vbid, to, &self.config, self.stats.mem.clone()));
            self.vbuckets.add(vb);
            self.vbuckets.set_persistence_checkpoint_id(vbid, 0);
            drop(lh);
            self.schedule_vb_snapshot(SnapshotPriority::High);
        }
    }

    /// Removes a dead vbucket, scheduling memory and disk teardown. With a
    /// cookie the caller is notified when the disk side completes and this
    /// returns `WouldBlock`.
    pub fn delete_vbucket(&self, vbid: u16, cookie: Option<Cookie>) -> Result<()> {
        let lh = self.vbset.lock().unwrap();
        let Some(vb) = self.vbuckets.get(vbid) else {
            return Err(Error::NotMyVbucket);
        };
        if vb.state() != VBucketState::Dead {
            return Err(Error::InvalidInput(
                "vbucket must be dead before deletion".to_string(),
            ));
        }
        self.vbuckets.remove(vbid);
        drop(lh);
        self.schedule_vb_snapshot(SnapshotPriority::High);
        self.schedule_vb_deletion(vb, cookie, 0.0);
        if cookie.is_some() {
            return Err(Error::WouldBlock);
        }
        Ok(())
    }

    fn schedule_vb_deletion(&self, vb: Arc<VBucket>, cookie: Option<Cookie>, delay: f64) {
        let Some(store) = self.self_arc() else {
            return;
        };
        self.nonio_dispatcher.schedule(
            Box::new(VBucketMemoryDeletionTask { vb: vb.clone() }),
            Priority::VB_MEMORY_DELETION,
            delay,
        );
        if self.vbuckets.set_bucket_deletion(vb.id(), true) {
            self.rw_dispatcher.schedule(
                Box::new(VBucketDeletionTask {
                    store: Arc::downgrade(&store),
                    vbucket: vb.id(),
                    cookie,
                }),
                Priority::VB_DELETION,
                delay,
            );
        }
    }

    fn complete_vbucket_deletion(&self, vbid: u16) -> VBucketDelResult {
        {
            let _lh = self.vbset.lock().unwrap();
            let proceed = match self.vbuckets.get(vbid) {
                None => true,
                Some(vb) => {
                    vb.state() == VBucketState::Dead || self.vbuckets.is_bucket_deletion(vbid)
                }
            };
            if !proceed {
                return VBucketDelResult::Invalid;
            }
        }
        if self.rw_store.del_vbucket(vbid) {
            self.vbuckets.set_bucket_deletion(vbid, false);
            self.mutation_log.delete_all(vbid);
            // An independent transaction, committed on the spot.
            self.mutation_log.commit1();
            self.mutation_log.commit2();
            self.stats.vbucket_deletions.fetch_add(1, Ordering::Relaxed);
            VBucketDelResult::Success
        } else {
            self.stats
                .vbucket_deletion_fail
                .fetch_add(1, Ordering::Relaxed);
            VBucketDelResult::Fail
        }
    }

    /// Removes and recreates a vbucket with the same state, preserving TAP
    /// cursor names. The old contents are torn down in the background.
    pub fn reset_vbucket(&self, vbid: u16) -> bool {
        let lh = self.vbset.lock().unwrap();
        let Some(vb) = self.vbuckets.get(vbid) else {
            return false;
        };
        if vb.ht.num_items() == 0 {
            return true;
        }
        self.vbuckets.remove(vbid);
        drop(lh);

        self.set_vbucket_state(vbid, vb.state());

        if let Some(newvb) = self.vbuckets.get(vbid) {
            let names = vb.checkpoints.lock().unwrap().tap_cursor_names();
            let mut cm = newvb.checkpoints.lock().unwrap();
            for name in names {
                cm.register_tap_cursor(name);
            }
        }
        self.schedule_vb_deletion(vb, None, 0.0);
        true
    }

    /// Clears every vbucket in memory and queues a disk flush-all marker.
    pub fn reset(&self) {
        for vbid in self.vbuckets.ids() {
            if let Some(vb) = self.vbuckets.get(vbid) {
                let names = vb.checkpoints.lock().unwrap().tap_cursor_names();
                vb.ht.clear();
                vb.checkpoints.lock().unwrap().clear(&names);
                vb.reset_queue_stats();
            }
        }
        if self
            .disk_flush_all
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.stats
                .queue_size
                .store(self.write_queue_size() + 1, Ordering::Relaxed);
            self.wake_flusher();
        }
    }

    pub(crate) fn schedule_vb_snapshot(&self, priority: SnapshotPriority) {
        let armed = match priority {
            SnapshotPriority::High => self.vbuckets.set_high_priority_vb_snapshot_flag(true),
            SnapshotPriority::Low => self.vbuckets.set_low_priority_vb_snapshot_flag(true),
        };
        if !armed {
            return;
        }
        let Some(store) = self.self_arc() else {
            return;
        };
        let dispatcher_priority = match priority {
            SnapshotPriority::High => Priority::VB_SNAPSHOT_HIGH,
            SnapshotPriority::Low => Priority::VB_SNAPSHOT_LOW,
        };
        self.rw_dispatcher.schedule(
            Box::new(SnapshotVBucketsTask {
                store: Arc::downgrade(&store),
                priority,
            }),
            dispatcher_priority,
            0.0,
        );
    }

    fn snapshot_vbuckets_now(&self, priority: SnapshotPriority) {
        match priority {
            SnapshotPriority::High => {
                self.vbuckets.set_high_priority_vb_snapshot_flag(false);
            }
            SnapshotPriority::Low => {
                self.vbuckets.set_low_priority_vb_snapshot_flag(false);
            }
        }
        let mut states = HashMap::new();
        for vbid in self.vbuckets.ids() {
            if let Some(vb) = self.vbuckets.get(vbid) {
                states.insert(
                    vbid,
                    VBucketSnapshot {
                        state: vb.state(),
                        checkpoint_id: self.vbuckets.persistence_checkpoint_id(vbid),
                    },
                );
            }
        }
        let start = Instant::now();
        if !self.rw_store.snapshot_vbuckets(&states) {
            tracing::warn!("vbucket snapshot failed, rescheduling");
            self.schedule_vb_snapshot(priority);
        } else {
            self.stats
                .snapshot_vbucket_histo
                .add(start.elapsed().as_micros() as u64);
        }
    }

    pub(crate) fn snapshot_stats(&self) {
        let map = self.stats.persisted_map();
        if !self.rw_store.snapshot_stats(&map) {
            tracing::warn!("engine stats snapshot failed");
        }
    }

    /// Visits every vbucket with the shared visitor interface.
    pub(crate) fn visit(&self, visitor: &mut dyn VBucketVisitor) {
        struct Adapter<'a> {
            visitor: &'a mut dyn VBucketVisitor,
        }
        impl crate::hashtable::HashTableVisitor for Adapter<'_> {
            fn visit(&mut self, sv: &mut StoredValue) {
                self.visitor.visit(sv);
            }
        }
        for vbid in self.vbuckets.ids() {
            if let Some(vb) = self.vbuckets.get(vbid) {
                if visitor.visit_bucket(&vb) {
                    vb.ht.visit(&mut Adapter { visitor });
                }
            }
        }
        visitor.complete();
    }

    // ------------------------------------------------------------------
    // Client operations
    // ------------------------------------------------------------------

    pub fn set(&self, item: &Item, cookie: Cookie) -> Result<()> {
        self.set_internal(item, cookie, false)
    }

    pub fn set_forced(&self, item: &Item, cookie: Cookie) -> Result<()> {
        self.set_internal(item, cookie, true)
    }

    fn set_internal(&self, item: &Item, cookie: Cookie, force: bool) -> Result<()> {
        let Some(vb) = self.vbuckets.get(item.vbucket) else {
            return self.not_my_vbucket();
        };
        match vb.state() {
            VBucketState::Dead => return self.not_my_vbucket(),
            VBucketState::Replica if !force => return self.not_my_vbucket(),
            VBucketState::Pending if !force => {
                if vb.add_pending_op(cookie) {
                    return Err(Error::WouldBlock);
                }
            }
            _ => {}
        }

        let cas_op = item.cas != 0;
        let (mtype, row_id) = vb
            .ht
            .with_bucket(&item.key, |b| b.set(item, item.cas, true, false, true));
        match mtype {
            MutationType::NoMem => Err(Error::NoMem),
            MutationType::InvalidCas | MutationType::IsLocked => Err(Error::KeyExists),
            MutationType::InvalidVbucket => self.not_my_vbucket(),
            MutationType::NotFound if cas_op => Err(Error::KeyNotFound),
            MutationType::NotFound | MutationType::WasDirty | MutationType::WasClean => {
                self.queue_dirty(&vb, &item.key, Operation::Set, item.seqno, row_id, false);
                Ok(())
            }
        }
    }

    pub fn add(&self, item: &Item, cookie: Cookie) -> Result<()> {
        let Some(vb) = self.vbuckets.get(item.vbucket) else {
            return self.not_my_vbucket();
        };
        match vb.state() {
            VBucketState::Dead | VBucketState::Replica => return self.not_my_vbucket(),
            VBucketState::Pending => {
                if vb.add_pending_op(cookie) {
                    return Err(Error::WouldBlock);
                }
            }
            _ => {}
        }
        if item.cas != 0 {
            // Adding with a cas value doesn't make sense.
            return Err(Error::NotStored);
        }
        match vb.ht.with_bucket(&item.key, |b| b.add(item)) {
            AddType::NoMem => Err(Error::NoMem),
            AddType::Exists => Err(Error::NotStored),
            AddType::Success | AddType::UnDel => {
                self.queue_dirty(
                    &vb,
                    &item.key,
                    Operation::Set,
                    item.seqno,
                    UNPERSISTED_ROW_ID,
                    false,
                );
                Ok(())
            }
        }
    }

    pub fn get(&self, key: &[u8], vbucket: u16, cookie: Cookie) -> Result<Item> {
        self.get_internal(key, vbucket, cookie, true, true, VBucketState::Active, true)
    }

    #[allow(clippy::too_many_arguments)]
    fn get_internal(
        &self,
        key: &[u8],
        vbucket: u16,
        cookie: Cookie,
        queue_bg: bool,
        honor_states: bool,
        allowed: VBucketState,
        track_ref: bool,
    ) -> Result<Item> {
        let Some(vb) = self.vbuckets.get(vbucket) else {
            return self.not_my_vbucket();
        };
        let disallowed = if allowed == VBucketState::Active {
            VBucketState::Replica
        } else {
            VBucketState::Active
        };
        let state = vb.state();
        if honor_states {
            if state == VBucketState::Dead || state == disallowed {
                return self.not_my_vbucket();
            }
            if state == VBucketState::Pending {
                if vb.add_pending_op(cookie) {
                    return Err(Error::WouldBlock);
                }
            }
        }

        enum Outcome {
            Miss,
            NonResident(i64),
            Hit(Item),
        }
        let outcome = self.with_valid_value(&vb, key, false, track_ref, |v| match v {
            None => Outcome::Miss,
            Some(v) if !v.is_resident() => Outcome::NonResident(v.row_id),
            Some(v) => Outcome::Hit(v.to_item(vbucket)),
        });
        match outcome {
            Outcome::Miss => Err(Error::KeyNotFound),
            Outcome::NonResident(row_id) => {
                if queue_bg {
                    self.bg_fetch(key, vbucket, row_id, cookie, FetchKind::Value);
                }
                Err(Error::WouldBlock)
            }
            Outcome::Hit(item) => Ok(item),
        }
    }

    /// Deletes a key; a non-zero `cas` must match the live value.
    pub fn delete(&self, key: &[u8], cas: u64, vbucket: u16, cookie: Cookie) -> Result<()> {
        self.delete_internal(key, cas, vbucket, cookie, false, None)
    }

    /// Delete stamping replicated metadata onto the tombstone.
    pub fn delete_with_meta(
        &self,
        key: &[u8],
        cas: u64,
        vbucket: u16,
        cookie: Cookie,
        meta: &ItemMeta,
    ) -> Result<()> {
        self.delete_internal(key, cas, vbucket, cookie, false, Some(meta))
    }

    pub(crate) fn delete_forced(&self, key: &[u8], vbucket: u16) -> Result<()> {
        self.delete_internal(key, 0, vbucket, 0, true, None)
    }

    fn delete_internal(
        &self,
        key: &[u8],
        cas: u64,
        vbucket: u16,
        cookie: Cookie,
        force: bool,
        meta: Option<&ItemMeta>,
    ) -> Result<()> {
        let Some(vb) = self.vbuckets.get(vbucket) else {
            return self.not_my_vbucket();
        };
        let state = vb.state();
        match state {
            VBucketState::Dead => return self.not_my_vbucket(),
            VBucketState::Replica if !force => return self.not_my_vbucket(),
            VBucketState::Pending if !force => {
                if vb.add_pending_op(cookie) {
                    return Err(Error::WouldBlock);
                }
            }
            _ => {}
        }

        let use_meta = meta.is_some();
        let result = vb.ht.with_bucket(key, |b| {
            if b.find(key, use_meta, false).is_none() {
                if state != VBucketState::Active && force {
                    let seqno = meta.map(|m| m.seqno).unwrap_or(0);
                    self.queue_dirty(&vb, key, Operation::Del, seqno, UNPERSISTED_ROW_ID, false);
                }
                return Err(Error::KeyNotFound);
            }
            let res = b.soft_delete(key, cas, meta);
            match res.mutation {
                MutationType::NotFound => Err(Error::KeyNotFound),
                MutationType::InvalidCas => Err(Error::KeyExists),
                MutationType::IsLocked => Err(Error::TempFail),
                _ => {
                    self.queue_dirty(&vb, key, Operation::Del, res.seqno, res.row_id, false);
                    Ok(())
                }
            }
        });
        if result.is_ok() && use_meta {
            self.stats.num_ops_del_meta.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Fetches metadata for a key, scheduling a disk fetch through a temp
    /// item when the key is not in memory. Returns the metadata and whether
    /// the item is deleted or expired.
    pub fn get_meta(&self, key: &[u8], vbucket: u16, cookie: Cookie) -> Result<(ItemMeta, bool)> {
        let Some(vb) = self.vbuckets.get(vbucket) else {
            return self.not_my_vbucket();
        };
        match vb.state() {
            VBucketState::Dead | VBucketState::Replica => return self.not_my_vbucket(),
            _ => {}
        }

        let now = current_time();
        enum Outcome {
            Meta(ItemMeta, bool),
            NonExistent,
            Fetch,
            NoMem,
        }
        let outcome = vb.ht.with_bucket(key, |b| match b.find(key, true, false) {
            Some(v) => {
                if v.temp && v.nonexistent {
                    Outcome::NonExistent
                } else {
                    // A temp item still waiting on its fetch answers with
                    // its placeholder state; no second fetch is scheduled.
                    let deleted = v.deleted || v.is_expired(now);
                    Outcome::Meta(
                        ItemMeta {
                            cas: v.cas,
                            seqno: v.seqno,
                            flags: v.flags,
                            exptime: v.exptime,
                        },
                        deleted,
                    )
                }
            }
            None => match b.add_temp_deleted_item(key) {
                AddType::NoMem => Outcome::NoMem,
                _ => Outcome::Fetch,
            },
        });

        match outcome {
            Outcome::Meta(meta, deleted) => {
                self.stats.num_ops_get_meta.fetch_add(1, Ordering::Relaxed);
                Ok((meta, deleted))
            }
            Outcome::NonExistent => {
                self.stats.num_ops_get_meta.fetch_add(1, Ordering::Relaxed);
                Err(Error::KeyNotFound)
            }
            Outcome::NoMem => Err(Error::NoMem),
            Outcome::Fetch => {
                self.bg_fetch(key, vbucket, UNPERSISTED_ROW_ID, cookie, FetchKind::Meta);
                Err(Error::WouldBlock)
            }
        }
    }

    /// Stores an item carrying replicated metadata. `cas` is the expected
    /// live cas; `allow_existing` false rejects overwrites.
    pub fn set_with_meta(
        &self,
        item: &Item,
        cas: u64,
        cookie: Cookie,
        force: bool,
        allow_existing: bool,
    ) -> Result<()> {
        let Some(vb) = self.vbuckets.get(item.vbucket) else {
            return self.not_my_vbucket();
        };
        match vb.state() {
            VBucketState::Dead => return self.not_my_vbucket(),
            VBucketState::Replica if !force => return self.not_my_vbucket(),
            VBucketState::Pending if !force => {
                if vb.add_pending_op(cookie) {
                    return Err(Error::WouldBlock);
                }
            }
            _ => {}
        }

        let cas_op = cas != 0;
        let (mtype, row_id) = vb
            .ht
            .with_bucket(&item.key, |b| b.set(item, cas, allow_existing, true, true));
        let ret = match mtype {
            MutationType::NoMem => Err(Error::NoMem),
            MutationType::InvalidCas | MutationType::IsLocked => Err(Error::KeyExists),
            MutationType::InvalidVbucket => self.not_my_vbucket(),
            MutationType::NotFound if cas_op => Err(Error::KeyNotFound),
            MutationType::NotFound | MutationType::WasDirty | MutationType::WasClean => {
                self.queue_dirty(&vb, &item.key, Operation::Set, item.seqno, row_id, false);
                Ok(())
            }
        };
        if ret.is_ok() {
            self.stats.num_ops_set_meta.fetch_add(1, Ordering::Relaxed);
        }
        ret
    }

    /// Fetches an item and updates its expiry in one pass. A changed expiry
    /// is re-queued for persistence; a non-resident value is fetched first
    /// so the change can be persisted with the payload.
    pub fn get_and_update_ttl(
        &self,
        key: &[u8],
        vbucket: u16,
        cookie: Cookie,
        exptime: u32,
    ) -> Result<Item> {
        let Some(vb) = self.vbuckets.get(vbucket) else {
            return self.not_my_vbucket();
        };
        match vb.state() {
            VBucketState::Dead | VBucketState::Replica => return self.not_my_vbucket(),
            VBucketState::Pending => {
                if vb.add_pending_op(cookie) {
                    return Err(Error::WouldBlock);
                }
            }
            _ => {}
        }

        enum Outcome {
            Miss,
            Fetch(i64),
            Hit(Item),
        }
        let outcome = self.with_valid_value(&vb, key, false, true, |v| match v {
            None => Outcome::Miss,
            Some(v) => {
                let mutated = v.exptime != exptime;
                if mutated {
                    v.exptime = exptime;
                    v.mark_dirty();
                }
                if v.is_resident() {
                    if mutated {
                        self.queue_dirty(&vb, key, Operation::Set, v.seqno, v.row_id, false);
                    }
                    Outcome::Hit(v.to_item(vbucket))
                } else {
                    Outcome::Fetch(v.row_id)
                }
            }
        });
        match outcome {
            Outcome::Miss => Err(Error::KeyNotFound),
            Outcome::Fetch(row_id) => {
                self.bg_fetch(key, vbucket, row_id, cookie, FetchKind::Value);
                Err(Error::WouldBlock)
            }
            Outcome::Hit(item) => Ok(item),
        }
    }

    /// Acquires a wallclock lock on a key and returns the item with a fresh
    /// cas. Writes without that cas fail until the lock expires.
    pub fn get_locked(
        &self,
        key: &[u8],
        vbucket: u16,
        lock_timeout: u32,
        cookie: Cookie,
    ) -> Result<Item> {
        let Some(vb) = self.get_vbucket(vbucket, VBucketState::Active) else {
            return self.not_my_vbucket();
        };
        let now = current_time();
        enum Outcome {
            Miss,
            Locked,
            Fetch(i64),
            Hit(Item),
        }
        let outcome = self.with_valid_value(&vb, key, false, true, |v| match v {
            None => Outcome::Miss,
            Some(v) => {
                if v.is_locked(now) {
                    Outcome::Locked
                } else if !v.is_resident() {
                    Outcome::Fetch(v.row_id)
                } else {
                    v.lock(now + lock_timeout);
                    let mut item = v.to_item(vbucket);
                    item.cas = next_cas();
                    v.cas = item.cas;
                    Outcome::Hit(item)
                }
            }
        });
        match outcome {
            Outcome::Miss => Err(Error::KeyNotFound),
            Outcome::Locked => Err(Error::TempFail),
            Outcome::Fetch(row_id) => {
                self.bg_fetch(key, vbucket, row_id, cookie, FetchKind::Value);
                Err(Error::WouldBlock)
            }
            Outcome::Hit(item) => Ok(item),
        }
    }

    /// Releases a key lock; requires the cas handed out by `get_locked`.
    pub fn unlock_key(&self, key: &[u8], vbucket: u16, cas: u64) -> Result<()> {
        let Some(vb) = self.get_vbucket(vbucket, VBucketState::Active) else {
            return self.not_my_vbucket();
        };
        let now = current_time();
        self.with_valid_value(&vb, key, false, false, |v| match v {
            None => Err(Error::KeyNotFound),
            Some(v) => {
                if v.is_locked(now) && v.cas == cas {
                    v.unlock();
                    Ok(())
                } else {
                    Err(Error::TempFail)
                }
            }
        })
    }

    pub fn get_key_stats(&self, key: &[u8], vbucket: u16, wants_deleted: bool) -> Result<KeyStats> {
        let Some(vb) = self.vbuckets.get(vbucket) else {
            return self.not_my_vbucket();
        };
        let state = vb.state();
        let now = current_time();
        self.with_valid_value(&vb, key, wants_deleted, false, |v| match v {
            None => Err(Error::KeyNotFound),
            Some(v) => Ok(KeyStats {
                dirty: v.dirty,
                deleted: v.deleted,
                resident: v.is_resident(),
                exptime: v.exptime,
                flags: v.flags,
                cas: v.cas,
                data_age: v.data_age(now),
                vbucket_state: state,
            }),
        })
    }

    /// Ejects one key's value payload. `force` first marks the value clean,
    /// which is only safe when the caller knows the disk copy matches.
    pub fn evict_key(&self, key: &[u8], vbucket: u16, force: bool) -> Result<&'static str> {
        let Some(vb) = self.vbuckets.get(vbucket) else {
            return self.not_my_vbucket();
        };
        if vb.state() != VBucketState::Active && !force {
            return self.not_my_vbucket();
        }
        let outcome = self.with_valid_value(&vb, key, force, false, |v| match v {
            None => Err(Error::KeyNotFound),
            Some(v) => {
                if force {
                    v.mark_clean();
                }
                if v.is_resident() {
                    if v.eject(&self.stats.mem) {
                        Ok("Ejected.")
                    } else {
                        Err(Error::KeyExists)
                    }
                } else {
                    Ok("Already ejected.")
                }
            }
        });
        if let Ok("Ejected.") = outcome {
            self.stats.num_values_ejected.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    /// Accepts a TAP backfill item into a replica or pending vbucket.
    pub fn add_tap_backfill_item(&self, item: &Item, meta: bool) -> Result<()> {
        let Some(vb) = self.vbuckets.get(item.vbucket) else {
            return self.not_my_vbucket();
        };
        let state = vb.state();
        if state == VBucketState::Dead
            || (state == VBucketState::Active
                && !self.config.checkpoint.inconsistent_slave_checkpoint)
        {
            return self.not_my_vbucket();
        }

        let (mtype, row_id) = vb
            .ht
            .with_bucket(&item.key, |b| b.set(item, 0, true, meta, false));
        match mtype {
            MutationType::NoMem => Err(Error::NoMem),
            MutationType::InvalidCas | MutationType::IsLocked => Err(Error::KeyExists),
            MutationType::InvalidVbucket => self.not_my_vbucket(),
            MutationType::WasDirty => {
                // Already dirty; don't queue the same key again.
                Ok(())
            }
            MutationType::NotFound | MutationType::WasClean => {
                self.queue_dirty(&vb, &item.key, Operation::Set, item.seqno, row_id, true);
                Ok(())
            }
        }
    }

    /// Splices an item restored from an external source into the flush
    /// stream, unless its deletion was already persisted this session.
    pub fn restore_item(&self, item: &Item, op: Operation) -> Result<()> {
        let Some(vb) = self.vbuckets.get(item.vbucket) else {
            return self.not_my_vbucket();
        };
        vb.ht.with_bucket(&item.key, |b| {
            let mut restore = self.restore.lock().unwrap();
            if restore.items_deleted.contains(&item.key) {
                return Err(Error::NotStored);
            }
            if !b.restore_item(item, op) {
                return Err(Error::NotStored);
            }
            let qi = QueuedItem::new(item.key.clone(), item.vbucket, op, item.row_id, item.seqno);
            restore.items.entry(item.vbucket).or_default().push(qi);
            Ok(())
        })
    }

    /// Soft-deletes and enqueues each expired key found by the expiry
    /// pager. Expired temp items are simply removed.
    pub fn delete_expired_items(&self, keys: Vec<(u16, Vec<u8>)>) {
        let start = current_time();
        for (vbid, key) in keys {
            let Some(vb) = self.vbuckets.get(vbid) else {
                continue;
            };
            self.stats.expired.fetch_add(1, Ordering::Relaxed);
            vb.stats.num_expired.fetch_add(1, Ordering::Relaxed);
            vb.ht.with_bucket(&key, |b| {
                let Some(v) = b.find(&key, true, false) else {
                    return;
                };
                if v.temp {
                    // A temp item whose metadata fetch has come and gone.
                    b.del(&key);
                } else if !v.deleted && v.is_expired(start) {
                    let res = b.soft_delete(&key, 0, None);
                    self.queue_dirty(&vb, &key, Operation::Del, res.seqno, res.row_id, false);
                }
            });
        }
    }

    fn not_my_vbucket<T>(&self) -> Result<T> {
        self.stats
            .num_not_my_vbuckets
            .fetch_add(1, Ordering::Relaxed);
        Err(Error::NotMyVbucket)
    }

    /// Runs `f` on the live stored value, folding expired entries into
    /// tombstones first (expiry is observed lazily, on access).
    fn with_valid_value<R>(
        &self,
        vb: &Arc<VBucket>,
        key: &[u8],
        want_deleted: bool,
        track_ref: bool,
        f: impl FnOnce(Option<&mut StoredValue>) -> R,
    ) -> R {
        let now = current_time();
        vb.ht.with_bucket(key, |b| {
            let expired = matches!(
                b.find(key, want_deleted, false),
                Some(v) if !v.deleted && !v.temp && v.is_expired(now)
            );
            if expired {
                self.stats.expired.fetch_add(1, Ordering::Relaxed);
                vb.stats.num_expired.fetch_add(1, Ordering::Relaxed);
                let res = b.soft_delete(key, 0, None);
                self.queue_dirty(vb, key, Operation::Del, res.seqno, res.row_id, false);
                f(None)
            } else {
                f(b.find(key, want_deleted, track_ref))
            }
        })
    }

    // ------------------------------------------------------------------
    // Queueing and flushing
    // ------------------------------------------------------------------

    pub(crate) fn queue_dirty(
        &self,
        vb: &Arc<VBucket>,
        key: &[u8],
        op: Operation,
        seqno: u64,
        row_id: i64,
        tap_backfill: bool,
    ) {
        if !self.do_persistence {
            return;
        }
        let qi = QueuedItem::new(key.to_vec(), vb.id(), op, row_id, seqno);
        let queued = if tap_backfill {
            vb.queue_backfill_item(qi.clone())
        } else {
            vb.checkpoints.lock().unwrap().queue_dirty(qi.clone())
        };
        if queued {
            let qsize = self.stats.queue_size.fetch_add(1, Ordering::Relaxed) + 1;
            self.stats.total_enqueued.fetch_add(1, Ordering::Relaxed);
            vb.do_stats_for_queueing(&qi);
            if qsize == 1 && self.stats.flusher_todo.load(Ordering::Relaxed) == 0 {
                self.wake_flusher();
            }
        }
    }

    pub fn wake_flusher(&self) {
        self.flusher.wake(&self.rw_dispatcher);
    }

    pub fn pause_flusher(&self) -> bool {
        self.flusher.request_pause()
    }

    pub fn resume_flusher(&self) -> bool {
        let ok = self.flusher.request_resume();
        if ok {
            self.wake_flusher();
        }
        ok
    }

    pub(crate) fn txn_size(&self) -> usize {
        self.txn_size.load(Ordering::Relaxed).max(1)
    }

    pub(crate) fn has_flush_items(&self) -> bool {
        if self.disk_flush_all.load(Ordering::Acquire) {
            return true;
        }
        for vbid in self.vbuckets.ids() {
            let Some(vb) = self.vbuckets.get(vbid) else {
                continue;
            };
            if vb.state() == VBucketState::Dead {
                continue;
            }
            if vb.checkpoints.lock().unwrap().has_items_for_persistence()
                || vb.backfill_size() > 0
            {
                return true;
            }
            let restore = self.restore.lock().unwrap();
            if restore.items.get(&vbid).map_or(false, |v| !v.is_empty()) {
                return true;
            }
        }
        false
    }

    pub(crate) fn write_queue_size(&self) -> usize {
        let mut size = 0;
        for vbid in self.vbuckets.ids() {
            if let Some(vb) = self.vbuckets.get(vbid) {
                if vb.state() != VBucketState::Dead {
                    size += vb.checkpoints.lock().unwrap().num_items_for_persistence()
                        + vb.backfill_size();
                }
            }
        }
        size
    }

    pub(crate) fn reset_vb_queue_stats(&self) {
        for vbid in self.vbuckets.ids() {
            if let Some(vb) = self.vbuckets.get(vbid) {
                vb.reset_queue_stats();
            }
        }
    }

    /// Gathers the next flush batch: restore items, then backfills, then
    /// checkpoint drains, active vbuckets first. Consecutive same-key
    /// entries collapse to the last occurrence.
    pub(crate) fn collect_flush_batch(&self, out: &mut VecDeque<QueuedItem>) {
        if self.disk_flush_all.load(Ordering::Acquire) {
            out.push_back(QueuedItem::new(Vec::new(), 0xffff, Operation::Flush, -1, 0));
        }
        let mut item_list: Vec<QueuedItem> = Vec::new();
        for vbid in self.vbuckets.ids_sorted_by_state() {
            let Some(vb) = self.vbuckets.get(vbid) else {
                continue;
            };
            {
                let mut restore = self.restore.lock().unwrap();
                if let Some(items) = restore.items.get_mut(&vbid) {
                    item_list.append(items);
                }
            }
            vb.take_backfill_items(&mut item_list);
            vb.checkpoints
                .lock()
                .unwrap()
                .get_all_items_for_persistence(&mut item_list);
            if !item_list.is_empty() {
                self.push_to_outgoing_queue(&mut item_list, out);
            }
        }
        self.stats
            .queue_size
            .store(self.write_queue_size(), Ordering::Relaxed);
        tracing::debug!(flushing = out.len(), "collected flush batch");
    }

    fn push_to_outgoing_queue(
        &self,
        items: &mut Vec<QueuedItem>,
        out: &mut VecDeque<QueuedItem>,
    ) {
        self.rw_store.optimize_writes(items);
        let mut dropped: Vec<QueuedItem> = Vec::new();
        out.extend(items.drain(..).coalesce(|prev, next| {
            if prev.key == next.key && prev.vbucket == next.vbucket {
                dropped.push(prev);
                Ok(next)
            } else {
                Err((prev, next))
            }
        }));
        let now = current_time();
        for dup in &dropped {
            if let Some(vb) = self.vbuckets.get(dup.vbucket) {
                vb.do_stats_for_flushing(dup, now);
            }
        }
    }

    /// Flush-all marker handling: reset the store and invalidate every
    /// vbucket's log records in an independent committed batch.
    pub(crate) fn flush_one_delete_all(&self) {
        self.rw_store.reset();
        for vbid in self.vbuckets.ids() {
            self.mutation_log.delete_all(vbid);
        }
        self.mutation_log.commit1();
        self.mutation_log.commit2();
        self.disk_flush_all.store(false, Ordering::Release);
    }

    /// Persists one queued set or delete, re-reading the live state under
    /// the hash bucket lock. Returns the seconds until a too-young item
    /// becomes eligible (0 otherwise).
    pub(crate) fn flush_one_del_or_set(
        &self,
        qi: &QueuedItem,
        reject: &mut VecDeque<QueuedItem>,
    ) -> u32 {
        let Some(vb) = self.vbuckets.get(qi.vbucket) else {
            return 0;
        };
        let now = current_time();
        let expiry_window = self.item_expiry_window.load(Ordering::Relaxed);
        let min_data_age = self.stats.min_data_age.load(Ordering::Relaxed);
        let queue_age_cap = self.stats.queue_age_cap.load(Ordering::Relaxed);

        let mut wait = 0u32;
        let action = vb.ht.with_bucket(&qi.key, |b| {
            vb.do_stats_for_flushing(qi, now);
            let Some(v) = b.find(&qi.key, true, false) else {
                // Hard-removed since queueing; delete whatever the queue
                // said was on disk.
                return FlushAction::Del {
                    itm: Item::meta_only(qi.key.clone(), qi.vbucket, qi.row_id),
                    rowid: qi.row_id,
                    dirtied: 0,
                };
            };

            let rowid = v.row_id;
            let mut deleted = v.deleted;
            let mut is_dirty = v.dirty;
            let mut dirtied = 0u32;

            if !deleted && is_dirty && v.is_expired(now + expiry_window) {
                // Expiring within the window: persist as a delete instead.
                self.stats.flush_expired.fetch_add(1, Ordering::Relaxed);
                v.mark_clean();
                v.row_id = UNPERSISTED_ROW_ID;
                is_dirty = false;
                deleted = true;
            }

            if is_dirty {
                dirtied = v.dirtied_at;
                let data_age = now.saturating_sub(dirtied);
                let dirty_age = now.saturating_sub(qi.queued_at);
                let mut eligible = true;
                if v.pending_id {
                    eligible = false;
                } else if dirty_age > queue_age_cap {
                    self.stats.too_old.fetch_add(1, Ordering::Relaxed);
                } else if data_age < min_data_age {
                    wait = min_data_age - data_age;
                    self.stats.too_young.fetch_add(1, Ordering::Relaxed);
                    eligible = false;
                }
                if !eligible {
                    v.re_dirty(dirtied);
                    return FlushAction::Reject(wait);
                }
            }

            let itm = v.to_item(qi.vbucket);
            if is_dirty && !deleted {
                if self.vbuckets.is_bucket_deletion(qi.vbucket) {
                    return FlushAction::Skip;
                }
                if self.vbuckets.is_high_priority_vb_snapshot_scheduled() {
                    // Let the state snapshot race ahead.
                    v.pending_id = false;
                    return FlushAction::Reject(0);
                }
                if rowid == UNPERSISTED_ROW_ID {
                    v.pending_id = true;
                }
                let cas = itm.cas;
                FlushAction::Set {
                    itm,
                    cas,
                    rowid,
                    dirtied,
                }
            } else if deleted {
                if self.vbuckets.is_bucket_deletion(qi.vbucket) {
                    return FlushAction::Skip;
                }
                FlushAction::Del {
                    itm,
                    rowid,
                    dirtied,
                }
            } else {
                FlushAction::Skip
            }
        });

        match action {
            FlushAction::Skip => 0,
            FlushAction::Reject(w) => {
                vb.stats.ops_reject.fetch_add(1, Ordering::Relaxed);
                reject.push_back(qi.clone());
                w
            }
            FlushAction::Set {
                mut itm,
                cas,
                rowid,
                dirtied,
            } => {
                itm.row_id = rowid;
                let (rv, new_rowid) = self.rw_store.set(&itm);
                if rowid == UNPERSISTED_ROW_ID {
                    vb.stats.ops_create.fetch_add(1, Ordering::Relaxed);
                } else {
                    vb.stats.ops_update.fetch_add(1, Ordering::Relaxed);
                }
                self.complete_persist_set(qi, cas, rv, new_rowid, dirtied, reject);
                0
            }
            FlushAction::Del {
                itm,
                rowid,
                dirtied,
            } => {
                let rv = self.rw_store.del(&itm, rowid);
                self.complete_persist_del(qi, rv, dirtied, reject);
                0
            }
        }
    }

    /// Completion of a persisted set: stamp the assigned row id, record the
    /// insert in the mutation log, and mark the value clean iff the cas
    /// has not moved since the write was issued. Replica and pending
    /// vbuckets over the low watermark shed the payload on the way out.
    fn complete_persist_set(
        &self,
        qi: &QueuedItem,
        cas: u64,
        rv: i32,
        new_rowid: i64,
        dirtied: u32,
        reject: &mut VecDeque<QueuedItem>,
    ) {
        if rv == 1 {
            self.stats.total_persisted.fetch_add(1, Ordering::Relaxed);
            let Some(vb) = self.vbuckets.get(qi.vbucket) else {
                return;
            };
            let state = vb.state();
            vb.ht.with_bucket(&qi.key, |b| {
                let Some(v) = b.find(&qi.key, true, false) else {
                    return;
                };
                if new_rowid > 0 {
                    self.mutation_log.new_item(qi.vbucket, &qi.key, new_rowid);
                    self.stats.new_items.fetch_add(1, Ordering::Relaxed);
                    v.row_id = new_rowid;
                    v.pending_id = false;
                }
                if v.cas == cas {
                    v.mark_clean();
                    if state != VBucketState::Active && state != VBucketState::Pending {
                        let used = self.stats.mem_used();
                        let low = self.stats.mem_low_wat.load(Ordering::Relaxed);
                        if used > low && !v.referenced && v.eject(&self.stats.mem) {
                            self.stats
                                .num_values_ejected
                                .fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            });
        } else if rv == 0 {
            let Some(vb) = self.vbuckets.get(qi.vbucket) else {
                return;
            };
            vb.ht.with_bucket(&qi.key, |b| match b.find(&qi.key, true, false) {
                Some(v) => {
                    tracing::warn!(
                        key = %String::from_utf8_lossy(&qi.key),
                        vbucket = qi.vbucket,
                        rowid = v.row_id,
                        "persisting item returned 0 updates"
                    );
                }
                None => {
                    tracing::warn!(
                        key = %String::from_utf8_lossy(&qi.key),
                        vbucket = qi.vbucket,
                        "error persisting now missing item"
                    );
                }
            });
        } else {
            tracing::warn!(
                key = %String::from_utf8_lossy(&qi.key),
                vbucket = qi.vbucket,
                "fatal error in persisting set, requeueing"
            );
            self.redirty(qi, dirtied, reject);
        }
    }

    /// Completion of a persisted delete: record it in the mutation log and
    /// hard-remove the entry iff it is still a tombstone.
    fn complete_persist_del(
        &self,
        qi: &QueuedItem,
        rv: i32,
        dirtied: u32,
        reject: &mut VecDeque<QueuedItem>,
    ) {
        if rv >= 0 {
            let vb = self.vbuckets.get(qi.vbucket);
            if rv > 0 {
                self.stats.total_persisted.fetch_add(1, Ordering::Relaxed);
                self.stats.del_items.fetch_add(1, Ordering::Relaxed);
                if let Some(vb) = &vb {
                    vb.stats.ops_delete.fetch_add(1, Ordering::Relaxed);
                }
            }
            self.mutation_log.del_item(qi.vbucket, &qi.key);
            if let Some(vb) = vb {
                vb.ht.with_bucket(&qi.key, |b| {
                    match b.find(&qi.key, true, false) {
                        Some(v) if v.deleted => {
                            if self.degraded.load(Ordering::Relaxed) {
                                let mut restore = self.restore.lock().unwrap();
                                restore.items_deleted.insert(qi.key.clone());
                            }
                            b.del(&qi.key);
                        }
                        Some(v) => {
                            v.row_id = UNPERSISTED_ROW_ID;
                        }
                        None => {}
                    }
                });
            }
        } else {
            tracing::warn!(
                key = %String::from_utf8_lossy(&qi.key),
                vbucket = qi.vbucket,
                "fatal error in persisting delete, requeueing"
            );
            self.redirty(qi, dirtied, reject);
        }
    }

    fn redirty(&self, qi: &QueuedItem, dirtied: u32, reject: &mut VecDeque<QueuedItem>) {
        self.stats.flush_failed.fetch_add(1, Ordering::Relaxed);
        if let Some(vb) = self.vbuckets.get(qi.vbucket) {
            vb.ht.with_bucket(&qi.key, |b| {
                if let Some(v) = b.find(&qi.key, true, false) {
                    v.re_dirty(dirtied);
                }
            });
        }
        reject.push_back(qi.clone());
    }

    /// Post-flush bookkeeping: persistence checkpoint ids, a state
    /// snapshot when any advanced, and flush timing stats.
    pub(crate) fn complete_flush(&self, flush_start: u32) {
        let mut schedule_snapshot = false;
        for vbid in self.vbuckets.ids() {
            let Some(vb) = self.vbuckets.get(vbid) else {
                continue;
            };
            if vb.state() == VBucketState::Dead {
                continue;
            }
            let pcid = vb
                .checkpoints
                .lock()
                .unwrap()
                .persistence_cursor_pre_chk_id();
            if pcid > 0 && pcid != self.vbuckets.persistence_checkpoint_id(vbid) {
                self.vbuckets.set_persistence_checkpoint_id(vbid, pcid);
                schedule_snapshot = true;
            }
        }
        if schedule_snapshot {
            self.schedule_vb_snapshot(SnapshotPriority::High);
        }

        self.stats.flusher_todo.store(0, Ordering::Relaxed);
        self.stats
            .queue_size
            .store(self.write_queue_size(), Ordering::Relaxed);
        let took = current_time().saturating_sub(flush_start) as u64;
        self.stats.flush_duration.store(took, Ordering::Relaxed);
        let high = self.stats.flush_duration_high_wat.load(Ordering::Relaxed);
        if took > high {
            self.stats
                .flush_duration_high_wat
                .store(took, Ordering::Relaxed);
        }
    }

    // ------------------------------------------------------------------
    // Background fetching
    // ------------------------------------------------------------------

    fn bg_fetch(&self, key: &[u8], vbucket: u16, row_id: i64, cookie: Cookie, kind: FetchKind) {
        // Metadata fetches are never coalesced with value fetches.
        if let (Some(bg), FetchKind::Value) = (&self.bg_fetcher, kind) {
            if let Some(vb) = self.vbuckets.get(vbucket) {
                let first = vb.queue_bg_fetch(
                    key.to_vec(),
                    BgFetchItem {
                        cookie,
                        row_id,
                        init: Instant::now(),
                    },
                );
                tracing::debug!(
                    pending = vb.num_pending_bg_fetch_items(),
                    "queued a background fetch"
                );
                if first {
                    bg.notify(&self.ro_dispatcher);
                }
                return;
            }
        }
        let Some(store) = self.self_arc() else {
            return;
        };
        let delay = self.bg_fetch_delay.load(Ordering::Relaxed) as f64;
        let priority = match kind {
            FetchKind::Meta => Priority::VKEY_STAT_FETCHER,
            FetchKind::Value => Priority::BG_FETCHER,
        };
        self.ro_dispatcher.schedule(
            Box::new(SingleBgFetchTask {
                store: Arc::downgrade(&store),
                key: key.to_vec(),
                vbucket,
                row_id,
                cookie,
                init: Instant::now(),
                kind,
            }),
            priority,
            delay,
        );
    }

    pub(crate) fn read_from_underlying(&self, key: &[u8], row_id: i64, vbucket: u16) -> GetValue {
        self.ro_store.get(key, row_id, vbucket)
    }

    /// Schedules a disk read feeding a per-key stats request.
    pub fn get_from_underlying(
        &self,
        key: &[u8],
        vbucket: u16,
        cookie: Cookie,
        lookup_cb: Box<dyn FnOnce(GetValue) + Send>,
    ) -> Result<()> {
        let Some(vb) = self.vbuckets.get(vbucket) else {
            return Err(Error::NotMyVbucket);
        };
        let row_id = self.with_valid_value(&vb, key, false, false, |v| v.map(|v| v.row_id));
        let Some(row_id) = row_id else {
            return Err(Error::KeyNotFound);
        };
        let Some(store) = self.self_arc() else {
            return Err(Error::KeyNotFound);
        };
        self.ro_dispatcher.schedule(
            Box::new(VKeyStatBgFetchTask {
                store: Arc::downgrade(&store),
                key: key.to_vec(),
                vbucket,
                row_id,
                cookie,
                lookup_cb: Some(lookup_cb),
            }),
            Priority::VKEY_STAT_FETCHER,
            self.bg_fetch_delay.load(Ordering::Relaxed) as f64,
        );
        Err(Error::WouldBlock)
    }

    /// Completes one background fetch: restore the value (or metadata)
    /// under the bucket lock, re-queue a set when the expiry moved while
    /// the fetch was in flight, and notify the waiting cookie.
    pub(crate) fn complete_bg_fetch(
        &self,
        key: &[u8],
        vbucket: u16,
        row_id: i64,
        cookie: Cookie,
        init: Instant,
        kind: FetchKind,
    ) {
        let start = Instant::now();
        self.stats.bg_fetched.fetch_add(1, Ordering::Relaxed);
        let gv = self.ro_store.get(key, row_id, vbucket);
        let status = self.apply_bg_fetch(key, vbucket, gv, kind);
        self.update_bg_stats(init, start, Instant::now());
        self.notify_io_complete(cookie, status);
    }

    /// Drains one vbucket's pending fetch batch in a single pass.
    pub(crate) fn run_bg_fetch_batch(&self, vbucket: u16, start: Instant) {
        let Some(vb) = self.vbuckets.get(vbucket) else {
            return;
        };
        let fetches = vb.take_pending_bg_fetches();
        if fetches.is_empty() {
            return;
        }
        let count: usize = fetches.values().map(|v| v.len()).sum();
        self.stats
            .bg_fetched
            .fetch_add(count as u64, Ordering::Relaxed);
        for (key, items) in fetches {
            for fetch in items {
                let gv = self.ro_store.get(&key, fetch.row_id, vbucket);
                let status = self.apply_bg_fetch(&key, vbucket, gv, FetchKind::Value);
                self.update_bg_stats(fetch.init, start, Instant::now());
                self.notify_io_complete(fetch.cookie, status);
            }
        }
        tracing::debug!(vbucket, count, "completed batched background fetch");
    }

    fn apply_bg_fetch(
        &self,
        key: &[u8],
        vbucket: u16,
        gv: GetValue,
        kind: FetchKind,
    ) -> Result<()> {
        let mut status = gv.status.clone();
        // Serialize against vbucket add/remove and state changes.
        let _lh = self.vbset.lock().unwrap();
        let Some(vb) = self.vbuckets.get(vbucket) else {
            return status;
        };
        if vb.state() != VBucketState::Active {
            return status;
        }
        self.with_valid_value(&vb, key, true, false, |v| match v {
            Some(v) if !v.is_resident() => match kind {
                FetchKind::Meta => {
                    if let Some(item) = &gv.item {
                        let meta = ItemMeta {
                            cas: item.cas,
                            seqno: item.seqno,
                            flags: item.flags,
                            exptime: item.exptime,
                        };
                        v.restore_meta(Some((&meta, item.row_id)));
                        status = Ok(());
                    } else {
                        v.restore_meta(None);
                    }
                }
                FetchKind::Value => {
                    if let Some(item) = &gv.item {
                        v.restore_value(item, &self.stats.mem);
                        if v.exptime != item.exptime {
                            // Expiry moved while non-resident; persist it.
                            self.queue_dirty(&vb, key, Operation::Set, v.seqno, v.row_id, false);
                        }
                    }
                }
            },
            Some(_) => {}
            None => {
                // Hard-removed while the fetch was in flight.
                if kind == FetchKind::Value {
                    status = Err(Error::KeyNotFound);
                }
            }
        });
        status
    }

    fn update_bg_stats(&self, init: Instant, start: Instant, stop: Instant) {
        if stop > start && start > init {
            self.stats.bg_num_operations.fetch_add(1, Ordering::Relaxed);
            self.stats
                .bg_wait_histo
                .add((start - init).as_micros() as u64);
            self.stats
                .bg_load_histo
                .add((stop - start).as_micros() as u64);
        }
    }

    // ------------------------------------------------------------------
    // Warmup
    // ------------------------------------------------------------------

    /// Reloads the persisted data set: vbucket states from the store, then
    /// keys (and values, budget permitting) from the mutation log.
    /// Uncommitted log records produce compensating deletes.
    pub fn warmup(&self) -> Result<usize> {
        let state_map = self.ro_store.list_persisted_vbuckets();
        {
            let _lh = self.vbset.lock().unwrap();
            for (vbid, snap) in &state_map {
                if self.vbuckets.get(*vbid).is_none() {
                    let vb = Arc::new(VBucket::new(
                        *vbid,
                        snap.state,
                        &self.config,
                        self.stats.mem.clone(),
                    ));
                    self.vbuckets.add(vb);
                }
                self.vbuckets
                    .set_persistence_checkpoint_id(*vbid, snap.checkpoint_id);
            }
        }

        if !self.mutation_log.is_enabled() || !self.mutation_log.exists() {
            self.warmup_completed();
            return Ok(0);
        }

        let mut harvester = crate::mutation_log::MutationLogHarvester::new();
        for vbid in self.vbuckets.ids() {
            harvester.set_vbucket(vbid);
        }
        if let Err(e) = harvester.load(&self.mutation_log) {
            tracing::warn!(error = %e, "failed to read mutation log");
            self.mutation_log.disable();
            self.warmup_completed();
            return Ok(0);
        }

        let max_size = self.stats.mem.max();
        let mem_cap = (max_size as f64 * self.config.warmup_min_memory_threshold) as usize;
        let mut loaded = 0usize;
        harvester.apply(|vbid, key, row_id| {
            let Some(vb) = self.vbuckets.get(vbid) else {
                return;
            };
            self.stats.warmed_up_keys.fetch_add(1, Ordering::Relaxed);
            let keys = self.stats.warmed_up_keys.load(Ordering::Relaxed);
            let values = self.stats.warmed_up_values.load(Ordering::Relaxed);
            let load_values = (max_size == 0 || self.stats.mem_used() < mem_cap)
                && (values as f64)
                    < (keys as f64 * self.config.warmup_min_items_threshold).max(1.0);

            let mtype = if load_values {
                let gv = self.ro_store.get(key, row_id, vbid);
                match gv.item {
                    Some(item) => {
                        self.stats.warmed_up_values.fetch_add(1, Ordering::Relaxed);
                        vb.ht.with_bucket(key, |b| b.insert(&item, false))
                    }
                    None => {
                        let item = Item::meta_only(key.to_vec(), vbid, row_id);
                        vb.ht.with_bucket(key, |b| b.insert(&item, true))
                    }
                }
            } else {
                let item = Item::meta_only(key.to_vec(), vbid, row_id);
                vb.ht.with_bucket(key, |b| b.insert(&item, true))
            };
            match mtype {
                MutationType::NoMem => {
                    self.stats.warm_oom.fetch_add(1, Ordering::Relaxed);
                }
                MutationType::NotFound => loaded += 1,
                _ => {
                    self.stats.warmup_dups.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        // Anything left unclosed in the log is uncommitted; schedule a
        // store-side delete for each so disk converges on the committed
        // state.
        let uncommitted = harvester.uncommitted();
        if !uncommitted.is_empty() {
            tracing::warn!(
                count = uncommitted.len(),
                "uncommitted mutation log records, deleting from the data store"
            );
        }
        for record in uncommitted {
            let Some(vb) = self.vbuckets.get(record.vbucket) else {
                continue;
            };
            let should_delete = if record.is_new {
                let item = Item::meta_only(record.key.clone(), record.vbucket, record.row_id);
                vb.ht.with_bucket(&record.key, |b| b.insert(&item, true))
                    == MutationType::NotFound
            } else {
                true
            };
            if should_delete {
                let _ = self.delete_forced(&record.key, record.vbucket);
            }
        }

        if self.config.failpartialwarmup && self.stats.warm_oom.load(Ordering::Relaxed) > 0 {
            return Err(Error::WarmupFailed(format!(
                "{} records failed to load due to OOM",
                self.stats.warm_oom.load(Ordering::Relaxed)
            )));
        }

        self.warmup_completed();
        Ok(loaded)
    }

    fn warmup_completed(&self) {
        self.degraded.store(false, Ordering::Relaxed);
        self.restore.lock().unwrap().items_deleted.clear();
        self.schedule_vb_snapshot(SnapshotPriority::High);
        tracing::info!(
            keys = self.stats.warmed_up_keys.load(Ordering::Relaxed),
            values = self.stats.warmed_up_values.load(Ordering::Relaxed),
            "warmup completed"
        );
    }

    // ------------------------------------------------------------------
    // Periodic task plumbing
    // ------------------------------------------------------------------

    pub fn set_expiry_pager_sleeptime(self: &Arc<Self>, secs: u64) {
        let mut slot = self.expiry_pager.lock().unwrap();
        if let Some(task) = slot.task.take() {
            self.nonio_dispatcher.cancel(task);
        }
        slot.sleep_time = secs;
        if secs != 0 {
            slot.task = Some(self.nonio_dispatcher.schedule(
                Box::new(ExpiredItemPager {
                    store: Arc::downgrade(self),
                    sleep_time: secs as f64,
                }),
                Priority::ITEM_PAGER,
                secs as f64,
            ));
        }
    }

    pub fn set_access_scanner_sleeptime(self: &Arc<Self>, secs: u64) {
        let first_run = if self.config.alog_task_time > 0 {
            self.config.alog_task_time
        } else {
            secs
        };
        self.schedule_access_scanner(secs, first_run);
    }

    fn schedule_access_scanner(self: &Arc<Self>, secs: u64, first_run: u64) {
        let mut slot = self.access_scanner.lock().unwrap();
        if let Some(task) = slot.task.take() {
            self.rw_dispatcher.cancel(task);
        }
        slot.sleep_time = secs;
        if secs != 0 {
            slot.task = Some(self.rw_dispatcher.schedule(
                Box::new(AccessScanner {
                    store: Arc::downgrade(self),
                    sleep_time: secs as f64,
                }),
                Priority::ACCESS_SCANNER,
                first_run as f64,
            ));
        }
    }

    /// One access scan pass: write, commit, and rotate the access log.
    pub(crate) fn run_access_scan(&self) {
        if self.config.alog_path.is_empty() {
            return;
        }
        let mut visitor =
            ItemAccessVisitor::new(&self.config.alog_path, self.config.alog_block_size);
        if !visitor.is_open() {
            return;
        }
        self.visit(&mut visitor);
        self.stats.alog_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn compactor_params(&self) -> (u64, f64, usize) {
        (
            self.compactor.max_log_size.load(Ordering::Relaxed),
            f64::from_bits(self.compactor.max_entry_ratio_bits.load(Ordering::Relaxed)),
            self.compactor.queue_cap.load(Ordering::Relaxed),
        )
    }

    /// Applies a runtime parameter change, then notifies registered
    /// listeners for the key.
    pub fn set_param(self: &Arc<Self>, key: &str, value: usize) -> Result<()> {
        match key {
            "min_data_age" => {
                self.stats.min_data_age.store(value as u32, Ordering::Relaxed);
            }
            "queue_age_cap" => {
                self.stats.queue_age_cap.store(value as u32, Ordering::Relaxed);
            }
            "max_size" => {
                self.stats.set_max_size(value);
            }
            "mem_low_wat" => {
                self.stats.mem_low_wat.store(value, Ordering::Relaxed);
            }
            "mem_high_wat" => {
                self.stats.mem_high_wat.store(value, Ordering::Relaxed);
            }
            "expiry_window" => {
                self.item_expiry_window.store(value as u32, Ordering::Relaxed);
            }
            "max_txn_size" => {
                self.txn_size.store(value, Ordering::Relaxed);
            }
            "bg_fetch_delay" => {
                self.bg_fetch_delay.store(value as u32, Ordering::Relaxed);
            }
            "exp_pager_stime" => {
                self.set_expiry_pager_sleeptime(value as u64);
            }
            "alog_sleep_time" => {
                self.set_access_scanner_sleeptime(value as u64);
            }
            "alog_task_time" => {
                // Re-arm the scanner so its next run lands at the new start
                // time.
                let sleep = self.access_scanner.lock().unwrap().sleep_time;
                if sleep != 0 {
                    self.schedule_access_scanner(sleep, value as u64);
                }
            }
            "klog_max_log_size" => {
                self.compactor.max_log_size.store(value as u64, Ordering::Relaxed);
            }
            "klog_max_entry_ratio" => {
                self.compactor
                    .max_entry_ratio_bits
                    .store((value as f64).to_bits(), Ordering::Relaxed);
            }
            "klog_compactor_queue_cap" => {
                self.compactor.queue_cap.store(value, Ordering::Relaxed);
            }
            other => {
                tracing::warn!(key = other, "failed to change value for unknown variable");
                return Err(Error::InvalidInput(format!("unknown parameter: {other}")));
            }
        }
        self.listeners.notify(key, value);
        Ok(())
    }
}

struct SnapshotVBucketsTask {
    store: Weak<EmberStore>,
    priority: SnapshotPriority,
}

impl Callback for SnapshotVBucketsTask {
    fn callback(&mut self, _d: &Dispatcher, _t: &TaskHandle) -> bool {
        if let Some(store) = self.store.upgrade() {
            store.snapshot_vbuckets_now(self.priority);
        }
        false
    }

    fn description(&self) -> String {
        "Snapshotting vbuckets".to_string()
    }
}

struct VBucketMemoryDeletionTask {
    vb: Arc<VBucket>,
}

impl Callback for VBucketMemoryDeletionTask {
    fn callback(&mut self, _d: &Dispatcher, _t: &TaskHandle) -> bool {
        self.vb.ht.clear();
        self.vb.ht.deactivate();
        false
    }

    fn description(&self) -> String {
        format!("Removing (dead) vbucket {} from memory", self.vb.id())
    }
}

struct VBucketDeletionTask {
    store: Weak<EmberStore>,
    vbucket: u16,
    cookie: Option<Cookie>,
}

impl Callback for VBucketDeletionTask {
    fn callback(&mut self, _d: &Dispatcher, t: &TaskHandle) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        match store.complete_vbucket_deletion(self.vbucket) {
            VBucketDelResult::Success | VBucketDelResult::Invalid => {
                if let Some(cookie) = self.cookie {
                    store.notify_io_complete(cookie, Ok(()));
                }
                false
            }
            VBucketDelResult::Fail => {
                t.snooze(1.0);
                true
            }
        }
    }

    fn description(&self) -> String {
        format!("Removing vbucket {} from disk", self.vbucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::MemoryKVStore;
    use crate::mutation_log::{LogRecord, MutationLogReader};
    use crate::tmpfs::TempDir;
    use std::sync::Condvar;

    struct RecordingCallback {
        notifications: Mutex<Vec<(Cookie, Result<()>)>>,
        cv: Condvar,
    }

    impl RecordingCallback {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                notifications: Mutex::new(Vec::new()),
                cv: Condvar::new(),
            })
        }

        fn wait_for(&self, cookie: Cookie, timeout: Duration) -> Option<Result<()>> {
            let deadline = Instant::now() + timeout;
            let mut notifications = self.notifications.lock().unwrap();
            loop {
                if let Some((_, r)) = notifications.iter().find(|(c, _)| *c == cookie) {
                    return Some(r.clone());
                }
                let now = Instant::now();
                if now >= deadline {
                    return None;
                }
                let (guard, _) = self.cv.wait_timeout(notifications, deadline - now).unwrap();
                notifications = guard;
            }
        }
    }

    impl EngineCallback for RecordingCallback {
        fn notify_io_complete(&self, cookie: Cookie, result: Result<()>) {
            self.notifications.lock().unwrap().push((cookie, result));
            self.cv.notify_all();
        }
    }

    struct TestEngine {
        store: Arc<EmberStore>,
        kv: Arc<MemoryKVStore>,
        callback: Arc<RecordingCallback>,
        _dir: TempDir,
    }

    impl Drop for TestEngine {
        fn drop(&mut self) {
            let _ = self.store.stop();
        }
    }

    fn engine_with(
        tweak: impl FnOnce(EngineConfig) -> EngineConfig,
        props: Option<StorageProperties>,
    ) -> TestEngine {
        let dir = TempDir::new().unwrap();
        let klog = dir.path().join("mutation.log");
        let config = tweak(
            EngineConfig::new()
                .max_vbuckets(4)
                .ht_shards(7)
                .klog_path(klog.to_str().unwrap()),
        );
        let kv = Arc::new(match props {
            Some(p) => MemoryKVStore::with_properties(p),
            None => MemoryKVStore::new(),
        });
        let callback = RecordingCallback::new();
        let store = EmberStore::new(config, kv.clone(), callback.clone()).unwrap();
        TestEngine {
            store,
            kv,
            callback,
            _dir: dir,
        }
    }

    fn engine() -> TestEngine {
        engine_with(|c| c, None)
    }

    fn single_reader_props() -> StorageProperties {
        StorageProperties {
            max_concurrency: 1,
            max_readers: 1,
            max_writers: 1,
            ..Default::default()
        }
    }

    fn flush(store: &Arc<EmberStore>) -> f64 {
        store.flusher().do_flush(store)
    }

    /// Flushes until the queue and reject backlog drain. A flush cycle can
    /// transiently requeue items while a state snapshot races ahead, so
    /// single-shot assertions use this instead of one cycle.
    fn flush_settle(store: &Arc<EmberStore>) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            store.flusher().do_flush(store);
            if store.write_queue_size() == 0 && store.flusher().backlog() == 0 {
                return;
            }
            assert!(Instant::now() < deadline, "flush did not settle");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_insert_flush_get() {
        let e = engine();
        e.store
            .set(&Item::new(b"a".to_vec(), b"v1".to_vec(), 0), 1)
            .unwrap();

        // Dirty and enqueued before the flush.
        assert_eq!(e.store.write_queue_size(), 1);
        assert!(e.store.get_key_stats(b"a", 0, false).unwrap().dirty);

        flush(&e.store);

        let got = e.store.get(b"a", 0, 2).unwrap();
        assert_eq!(got.value.as_deref(), Some(&b"v1"[..]));
        assert!(got.row_id > 0);

        let ks = e.store.get_key_stats(b"a", 0, false).unwrap();
        assert!(!ks.dirty);
        assert_eq!(e.kv.num_rows(), 1);
        assert_eq!(e.store.write_queue_size(), 0);
        assert_eq!(e.store.stats().total_persisted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_update_persists_over_same_row() {
        let e = engine();
        e.store
            .set(&Item::new(b"a".to_vec(), b"v1".to_vec(), 0), 1)
            .unwrap();
        flush(&e.store);
        let first = e.kv.committed_row(0, b"a").unwrap();

        e.store
            .set(&Item::new(b"a".to_vec(), b"v2".to_vec(), 0), 1)
            .unwrap();
        flush_settle(&e.store);
        let second = e.kv.committed_row(0, b"a").unwrap();

        assert_eq!(first.row_id, second.row_id);
        assert_eq!(second.value.as_deref(), Some(&b"v2"[..]));
        assert_eq!(e.kv.num_rows(), 1);
    }

    #[test]
    fn test_non_resident_get_completes_out_of_line() {
        let e = engine_with(|c| c, Some(single_reader_props()));
        e.store
            .set(&Item::new(b"a".to_vec(), b"v1".to_vec(), 0), 1)
            .unwrap();
        flush(&e.store);

        assert_eq!(e.store.evict_key(b"a", 0, false).unwrap(), "Ejected.");
        assert!(!e.store.get_key_stats(b"a", 0, false).unwrap().resident);

        let err = e.store.get(b"a", 0, 7).unwrap_err();
        assert_eq!(err, Error::WouldBlock);

        let result = e
            .callback
            .wait_for(7, Duration::from_secs(5))
            .expect("bg fetch notification");
        assert!(result.is_ok());

        let got = e.store.get(b"a", 0, 8).unwrap();
        assert_eq!(got.value.as_deref(), Some(&b"v1"[..]));
        assert!(e.store.stats().bg_fetched.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn test_batched_bg_fetch_path() {
        let e = engine();
        e.store.start();
        e.store
            .set(&Item::new(b"a".to_vec(), b"v1".to_vec(), 0), 1)
            .unwrap();
        let kv = e.kv.clone();
        wait_until(|| kv.committed_row(0, b"a").is_some());

        assert_eq!(e.store.evict_key(b"a", 0, false).unwrap(), "Ejected.");
        assert_eq!(e.store.get(b"a", 0, 7), Err(Error::WouldBlock));

        let result = e
            .callback
            .wait_for(7, Duration::from_secs(10))
            .expect("bg fetch notification");
        assert!(result.is_ok());
        assert_eq!(
            e.store.get(b"a", 0, 8).unwrap().value.as_deref(),
            Some(&b"v1"[..])
        );
    }

    #[test]
    fn test_pending_vbucket_parks_and_notifies() {
        let e = engine();
        e.store.set_vbucket_state(1, VBucketState::Pending);

        let item = Item::new(b"k".to_vec(), b"v".to_vec(), 1).cas(17);
        assert_eq!(e.store.set(&item, 41), Err(Error::WouldBlock));

        e.store.set_vbucket_state(1, VBucketState::Active);
        let result = e
            .callback
            .wait_for(41, Duration::from_secs(5))
            .expect("pending op notification");
        assert!(result.is_ok());

        // The retry is admitted now; a cas store on a missing key misses.
        assert_eq!(e.store.set(&item, 42), Err(Error::KeyNotFound));
        assert!(e
            .store
            .set(&Item::new(b"k".to_vec(), b"v".to_vec(), 1), 42)
            .is_ok());
    }

    #[test]
    fn test_too_young_items_are_rejected() {
        let e = engine_with(|c| c.min_data_age(5), None);
        e.store
            .set(&Item::new(b"b".to_vec(), b"v".to_vec(), 0), 1)
            .unwrap();

        let sleep = flush(&e.store);
        assert_eq!(e.kv.num_rows(), 0, "too-young item must not persist");
        assert!(e.store.stats().too_young.load(Ordering::Relaxed) >= 1);
        assert!(
            (1.0..=5.0).contains(&sleep),
            "flusher should retry when the item matures, got {sleep}"
        );

        e.store.set_param("min_data_age", 0).unwrap();
        flush_settle(&e.store);
        assert_eq!(e.kv.num_rows(), 1);
    }

    #[test]
    fn test_delete_races_fetch_completion() {
        let e = engine_with(|c| c, Some(single_reader_props()));
        e.store
            .set(&Item::new(b"c".to_vec(), b"v".to_vec(), 0), 1)
            .unwrap();
        flush(&e.store);
        let row_id = e.kv.committed_row(0, b"c").unwrap().row_id;
        assert_eq!(e.store.evict_key(b"c", 0, false).unwrap(), "Ejected.");

        // Hard-remove the entry as a racing delete's persistence would.
        let vb = e.store.vbuckets.get(0).unwrap();
        vb.ht.with_bucket(b"c", |b| {
            assert!(b.del(b"c"));
        });

        let init = Instant::now();
        std::thread::sleep(Duration::from_millis(2));
        e.store
            .complete_bg_fetch(b"c", 0, row_id, 99, init, FetchKind::Value);

        let result = e
            .callback
            .wait_for(99, Duration::from_secs(1))
            .expect("fetch notification");
        assert_eq!(result, Err(Error::KeyNotFound));
        // The value must not have been resurrected.
        vb.ht.with_bucket(b"c", |b| {
            assert!(b.find(b"c", true, false).is_none());
        });
    }

    #[test]
    fn test_warmup_recovers_committed_and_deletes_uncommitted() {
        let dir = TempDir::new().unwrap();
        let klog = dir.path().join("mutation.log");
        let klog_str = klog.to_str().unwrap().to_string();

        let kv = Arc::new(MemoryKVStore::new());
        kv.begin();
        let (_, row_a) = kv.set(&Item::new(b"a".to_vec(), b"va".to_vec(), 0));
        let (_, row_d) = kv.set(&Item::new(b"d".to_vec(), b"vd".to_vec(), 0));
        kv.commit();
        let mut states = HashMap::new();
        states.insert(
            0u16,
            VBucketSnapshot {
                state: VBucketState::Active,
                checkpoint_id: 0,
            },
        );
        kv.snapshot_vbuckets(&states);

        // Crash tail: "a" fully committed, "d" sealed but unconfirmed.
        {
            let log = MutationLog::open(klog_str.clone(), 4096).unwrap();
            log.new_item(0, b"a", row_a);
            log.commit1();
            log.commit2();
            log.new_item(0, b"d", row_d);
            log.commit1();
        }

        let callback = RecordingCallback::new();
        let store = EmberStore::new(
            EngineConfig::new()
                .max_vbuckets(4)
                .ht_shards(7)
                .klog_path(klog_str),
            kv.clone(),
            callback,
        )
        .unwrap();

        let loaded = store.warmup().unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(
            store.get(b"a", 0, 1).unwrap().value.as_deref(),
            Some(&b"va"[..])
        );

        // The compensating delete for "d" flushes through.
        flush_settle(&store);
        assert!(kv.committed_row(0, b"d").is_none());
        assert!(kv.committed_row(0, b"a").is_some());
        store.stop().unwrap();
    }

    #[test]
    fn test_lock_blocks_writes_until_released() {
        let e = engine();
        e.store
            .set(&Item::new(b"k".to_vec(), b"v".to_vec(), 0), 1)
            .unwrap();

        let locked = e.store.get_locked(b"k", 0, 30, 1).unwrap();
        assert!(locked.cas != 0);

        assert_eq!(
            e.store.set(&Item::new(b"k".to_vec(), b"v2".to_vec(), 0), 1),
            Err(Error::KeyExists)
        );
        assert_eq!(e.store.delete(b"k", 0, 0, 1), Err(Error::TempFail));
        assert_eq!(
            e.store.get_locked(b"k", 0, 30, 1),
            Err(Error::TempFail)
        );
        assert_eq!(
            e.store.unlock_key(b"k", 0, locked.cas + 1),
            Err(Error::TempFail)
        );

        e.store.unlock_key(b"k", 0, locked.cas).unwrap();
        assert!(e
            .store
            .set(&Item::new(b"k".to_vec(), b"v2".to_vec(), 0), 1)
            .is_ok());
    }

    #[test]
    fn test_store_with_lock_holder_cas_releases_lock() {
        let e = engine();
        e.store
            .set(&Item::new(b"k".to_vec(), b"v".to_vec(), 0), 1)
            .unwrap();
        let locked = e.store.get_locked(b"k", 0, 30, 1).unwrap();

        let update = Item::new(b"k".to_vec(), b"v2".to_vec(), 0).cas(locked.cas);
        e.store.set(&update, 1).unwrap();

        // The lock is gone; a plain store succeeds.
        assert!(e
            .store
            .set(&Item::new(b"k".to_vec(), b"v3".to_vec(), 0), 1)
            .is_ok());
    }

    #[test]
    fn test_expiring_set_persists_as_delete() {
        let e = engine();
        let item = Item::new(b"x".to_vec(), b"v".to_vec(), 0).exptime(current_time() + 1);
        e.store.set(&item, 1).unwrap();

        flush(&e.store);
        assert_eq!(e.store.stats().flush_expired.load(Ordering::Relaxed), 1);
        assert_eq!(e.kv.num_rows(), 0);
    }

    #[test]
    fn test_flush_all_resets_store() {
        let e = engine();
        e.store
            .set(&Item::new(b"a".to_vec(), b"v".to_vec(), 0), 1)
            .unwrap();
        flush(&e.store);
        assert_eq!(e.kv.num_rows(), 1);

        e.store.reset();
        assert_eq!(e.store.get(b"a", 0, 1), Err(Error::KeyNotFound));
        flush_settle(&e.store);
        assert_eq!(e.kv.num_rows(), 0);
    }

    #[test]
    fn test_state_admission_matrix() {
        let e = engine();
        e.store.set_vbucket_state(1, VBucketState::Replica);
        e.store.set_vbucket_state(2, VBucketState::Dead);

        let to_replica = Item::new(b"k".to_vec(), b"v".to_vec(), 1);
        assert_eq!(e.store.set(&to_replica, 1), Err(Error::NotMyVbucket));
        assert_eq!(e.store.get(b"k", 1, 1), Err(Error::NotMyVbucket));
        assert_eq!(e.store.delete(b"k", 0, 1, 1), Err(Error::NotMyVbucket));

        let to_dead = Item::new(b"k".to_vec(), b"v".to_vec(), 2);
        assert_eq!(e.store.set(&to_dead, 1), Err(Error::NotMyVbucket));

        let to_missing = Item::new(b"k".to_vec(), b"v".to_vec(), 3);
        assert_eq!(e.store.set(&to_missing, 1), Err(Error::NotMyVbucket));
        assert!(e.store.stats().num_not_my_vbuckets.load(Ordering::Relaxed) >= 5);

        // Replica vbuckets still take TAP backfills.
        assert!(e.store.add_tap_backfill_item(&to_replica, false).is_ok());
        // Active vbuckets reject them unless configured otherwise.
        let to_active = Item::new(b"k".to_vec(), b"v".to_vec(), 0);
        assert_eq!(
            e.store.add_tap_backfill_item(&to_active, false),
            Err(Error::NotMyVbucket)
        );
    }

    #[test]
    fn test_delete_vbucket_removes_map_and_disk() {
        let e = engine();
        e.store
            .set(&Item::new(b"a".to_vec(), b"v".to_vec(), 0), 1)
            .unwrap();
        flush(&e.store);
        assert_eq!(e.kv.num_rows(), 1);

        // Deletion requires the dead state.
        assert!(matches!(
            e.store.delete_vbucket(0, None),
            Err(Error::InvalidInput(_))
        ));

        e.store.set_vbucket_state(0, VBucketState::Dead);
        e.store.delete_vbucket(0, None).unwrap();
        assert!(e.store.vbuckets.get(0).is_none());

        let kv = e.kv.clone();
        wait_until(|| kv.num_rows() == 0);
        let stats = e.store.stats().clone();
        wait_until(move || stats.vbucket_deletions.load(Ordering::Relaxed) == 1);
    }

    #[test]
    fn test_get_meta_installs_temp_item_and_fetches() {
        let e = engine_with(|c| c, Some(single_reader_props()));

        assert_eq!(e.store.get_meta(b"nope", 0, 5), Err(Error::WouldBlock));
        let result = e
            .callback
            .wait_for(5, Duration::from_secs(5))
            .expect("meta fetch notification");
        assert_eq!(result, Err(Error::KeyNotFound));

        // The temp item now answers without another fetch.
        assert_eq!(e.store.get_meta(b"nope", 0, 6), Err(Error::KeyNotFound));

        // Meta of a deleted key reports the deleted flag.
        e.store
            .set(&Item::new(b"k".to_vec(), b"v".to_vec(), 0), 1)
            .unwrap();
        e.store.delete(b"k", 0, 0, 1).unwrap();
        let (meta, deleted) = e.store.get_meta(b"k", 0, 7).unwrap();
        assert!(deleted);
        assert!(meta.cas != 0);
    }

    #[test]
    fn test_get_and_update_ttl_requeues_changed_expiry() {
        let e = engine();
        e.store
            .set(&Item::new(b"k".to_vec(), b"v".to_vec(), 0), 1)
            .unwrap();
        flush(&e.store);
        assert!(!e.store.get_key_stats(b"k", 0, false).unwrap().dirty);

        let new_exp = current_time() + 3600;
        let got = e.store.get_and_update_ttl(b"k", 0, 1, new_exp).unwrap();
        assert_eq!(got.exptime, new_exp);
        assert!(e.store.get_key_stats(b"k", 0, false).unwrap().dirty);

        flush_settle(&e.store);
        assert_eq!(e.kv.committed_row(0, b"k").unwrap().exptime, new_exp);
    }

    #[test]
    fn test_persistence_checkpoint_id_snapshotted() {
        let e = engine();
        e.store
            .set(&Item::new(b"a".to_vec(), b"v".to_vec(), 0), 1)
            .unwrap();
        flush(&e.store);

        let kv = e.kv.clone();
        wait_until(move || {
            kv.list_persisted_vbuckets()
                .get(&0)
                .map(|s| s.state == VBucketState::Active && s.checkpoint_id >= 1)
                .unwrap_or(false)
        });
    }

    #[test]
    fn test_access_scan_writes_referenced_keys() {
        let dir = TempDir::new().unwrap();
        let alog = dir.path().join("access.log");
        let alog_str = alog.to_str().unwrap().to_string();
        let e = engine_with(move |c| c.alog_path(alog_str), None);

        e.store
            .set(&Item::new(b"hot".to_vec(), b"v".to_vec(), 0), 1)
            .unwrap();
        flush(&e.store);
        e.store.get(b"hot", 0, 1).unwrap();

        e.store.run_access_scan();
        assert!(alog.exists());
        let news: Vec<_> = MutationLogReader::open(&alog)
            .unwrap()
            .map(|r| r.unwrap())
            .filter(|r| matches!(r, LogRecord::New { key, .. } if key == b"hot"))
            .collect();
        assert_eq!(news.len(), 1);
        assert_eq!(e.store.stats().alog_runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_mutation_log_two_phase_ordering_across_batches() {
        let e = engine();
        for i in 0..3u32 {
            let key = format!("k{i}").into_bytes();
            e.store
                .set(&Item::new(key, b"v".to_vec(), 0), 1)
                .unwrap();
            flush_settle(&e.store);
        }

        let mut pending_commit1 = false;
        for record in e.store.mutation_log.reader().unwrap() {
            match record.unwrap() {
                LogRecord::Commit1 => pending_commit1 = true,
                LogRecord::Commit2 => {
                    assert!(pending_commit1, "commit2 must follow commit1");
                    pending_commit1 = false;
                }
                _ => assert!(!pending_commit1, "no records inside a sealed batch"),
            }
        }
    }

    #[test]
    fn test_commit_retry_counts_failures() {
        let e = engine();
        e.kv.fail_next_commits(1);
        e.store
            .set(&Item::new(b"a".to_vec(), b"v".to_vec(), 0), 1)
            .unwrap();
        flush(&e.store);

        assert_eq!(e.store.stats().commit_failed.load(Ordering::Relaxed), 1);
        assert_eq!(e.kv.num_rows(), 1);
    }

    #[test]
    fn test_write_failure_redirties_and_retries() {
        let e = engine();
        e.kv.fail_next_sets(1);
        e.store
            .set(&Item::new(b"a".to_vec(), b"v".to_vec(), 0), 1)
            .unwrap();

        flush(&e.store);
        assert_eq!(e.store.stats().flush_failed.load(Ordering::Relaxed), 1);
        assert!(e.store.get_key_stats(b"a", 0, false).unwrap().dirty);

        // The reject queue drains on the next cycle.
        flush_settle(&e.store);
        assert_eq!(e.kv.num_rows(), 1);
        assert!(!e.store.get_key_stats(b"a", 0, false).unwrap().dirty);
    }

    #[test]
    fn test_set_param_round_trip() {
        let e = engine();
        e.store.set_param("max_txn_size", 17).unwrap();
        assert_eq!(e.store.txn_size(), 17);
        e.store.set_param("min_data_age", 9).unwrap();
        assert_eq!(e.store.stats().min_data_age.load(Ordering::Relaxed), 9);
        assert!(e.store.set_param("bogus_knob", 1).is_err());

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        e.store.register_param_listener(
            "queue_age_cap",
            Box::new(move |v| {
                seen2.store(v, Ordering::SeqCst);
            }),
        );
        e.store.set_param("queue_age_cap", 123).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 123);
    }

    #[test]
    fn test_reset_vbucket_preserves_tap_cursors() {
        let e = engine();
        e.store
            .set(&Item::new(b"a".to_vec(), b"v".to_vec(), 0), 1)
            .unwrap();
        {
            let vb = e.store.vbuckets.get(0).unwrap();
            vb.checkpoints.lock().unwrap().register_tap_cursor("tap:x");
        }

        assert!(e.store.reset_vbucket(0));
        let vb = e.store.vbuckets.get(0).unwrap();
        assert_eq!(vb.state(), VBucketState::Active);
        assert_eq!(
            vb.checkpoints.lock().unwrap().tap_cursor_names(),
            vec!["tap:x".to_string()]
        );
        assert_eq!(vb.ht.num_items(), 0);
    }

    #[test]
    fn test_consecutive_duplicates_collapse_to_last() {
        // A queue drained in one batch persists only the latest value per
        // key (the batch is optimized then de-duped).
        let e = engine();
        e.store
            .set(&Item::new(b"a".to_vec(), b"v1".to_vec(), 0), 1)
            .unwrap();
        flush(&e.store);

        // Two updates to the same row id coalesce in the next batch.
        e.store
            .set(&Item::new(b"a".to_vec(), b"v2".to_vec(), 0), 1)
            .unwrap();
        let vb = e.store.vbuckets.get(0).unwrap();
        vb.queue_backfill_item(QueuedItem::new(
            b"a".to_vec(),
            0,
            Operation::Set,
            e.kv.committed_row(0, b"a").unwrap().row_id,
            2,
        ));
        flush_settle(&e.store);
        assert_eq!(
            e.kv.committed_row(0, b"a").unwrap().value.as_deref(),
            Some(&b"v2"[..])
        );
    }
}
