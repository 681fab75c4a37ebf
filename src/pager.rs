//! Periodic maintenance tasks: item pager, expiry pager, hash table
//! resizer, checkpoint remover, and the mutation log compactor.
//!
//! Each is a dispatcher task holding a weak store reference; it dies
//! quietly if the store is gone.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use crate::dispatcher::{Callback, Dispatcher, TaskHandle};
use crate::hashtable::StoredValue;
use crate::item::current_time;
use crate::mutation_log::MutationLog;
use crate::stats::MemBudget;
use crate::store::EmberStore;
use crate::vbucket::{VBucket, VBucketVisitor};

/// Item pager period in seconds.
pub(crate) const ITEM_PAGER_PERIOD: f64 = 10.0;

/// Entries per shard before the resizer grows a table.
const MAX_ITEMS_PER_SHARD: usize = 10;

/// Ejects unreferenced clean values until memory use drops back under the
/// low watermark. Referenced values get a second chance: the pass clears
/// their bit so they are candidates next time.
struct PagingVisitor {
    mem: Arc<MemBudget>,
    low_wat: usize,
    ejected: u64,
    done: bool,
}

impl VBucketVisitor for PagingVisitor {
    fn visit_bucket(&mut self, _vb: &Arc<VBucket>) -> bool {
        !self.done
    }

    fn visit(&mut self, sv: &mut StoredValue) {
        if self.done {
            return;
        }
        if self.mem.used() <= self.low_wat {
            self.done = true;
            return;
        }
        if sv.referenced {
            sv.referenced = false;
        } else if sv.eject(&self.mem) {
            self.ejected += 1;
        }
    }
}

pub(crate) struct ItemPager {
    pub store: Weak<EmberStore>,
}

impl Callback for ItemPager {
    fn callback(&mut self, _d: &Dispatcher, t: &TaskHandle) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        let stats = store.stats();
        let used = stats.mem_used();
        let high = stats.mem_high_wat.load(Ordering::Relaxed);
        if high > 0 && used > high {
            let mut visitor = PagingVisitor {
                mem: stats.mem.clone(),
                low_wat: stats.mem_low_wat.load(Ordering::Relaxed),
                ejected: 0,
                done: false,
            };
            store.visit(&mut visitor);
            stats
                .num_values_ejected
                .fetch_add(visitor.ejected, Ordering::Relaxed);
            stats.pager_runs.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                ejected = visitor.ejected,
                mem_used = stats.mem_used(),
                "item pager pass complete"
            );
        }
        t.snooze(ITEM_PAGER_PERIOD);
        true
    }

    fn description(&self) -> String {
        "Paging out items".to_string()
    }
}

/// Collects expired keys; the store soft-deletes and enqueues them after
/// the walk so no checkpoint lock is held during the scan.
struct ExpiredItemVisitor {
    now: u32,
    current_vbucket: u16,
    expired: Vec<(u16, Vec<u8>)>,
}

impl VBucketVisitor for ExpiredItemVisitor {
    fn visit_bucket(&mut self, vb: &Arc<VBucket>) -> bool {
        self.current_vbucket = vb.id();
        true
    }

    fn visit(&mut self, sv: &mut StoredValue) {
        // Temp placeholders are reaped on sight once their fetch is done;
        // live items only when actually expired.
        if sv.temp || (!sv.deleted && sv.is_expired(self.now)) {
            self.expired.push((self.current_vbucket, sv.key.clone()));
        }
    }
}

pub(crate) struct ExpiredItemPager {
    pub store: Weak<EmberStore>,
    pub sleep_time: f64,
}

impl Callback for ExpiredItemPager {
    fn callback(&mut self, _d: &Dispatcher, t: &TaskHandle) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        let mut visitor = ExpiredItemVisitor {
            now: current_time(),
            current_vbucket: 0,
            expired: Vec::new(),
        };
        store.visit(&mut visitor);
        if !visitor.expired.is_empty() {
            tracing::debug!(count = visitor.expired.len(), "expiry pager reaping items");
            store.delete_expired_items(visitor.expired);
        }
        store
            .stats()
            .expiry_pager_runs
            .fetch_add(1, Ordering::Relaxed);
        t.snooze(self.sleep_time);
        true
    }

    fn description(&self) -> String {
        "Paging expired items".to_string()
    }
}

pub(crate) struct HashtableResizer {
    pub store: Weak<EmberStore>,
    pub sleep_time: f64,
}

impl Callback for HashtableResizer {
    fn callback(&mut self, _d: &Dispatcher, t: &TaskHandle) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        for vbid in store.vbucket_ids() {
            if let Some(vb) = store.get_vbucket_any_state(vbid) {
                vb.ht.resize_if_needed(MAX_ITEMS_PER_SHARD);
            }
        }
        t.snooze(self.sleep_time);
        true
    }

    fn description(&self) -> String {
        "Adjusting hash table sizes".to_string()
    }
}

pub(crate) struct ClosedUnrefCheckpointRemover {
    pub store: Weak<EmberStore>,
    pub sleep_time: f64,
}

impl Callback for ClosedUnrefCheckpointRemover {
    fn callback(&mut self, _d: &Dispatcher, t: &TaskHandle) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        let mut removed = 0usize;
        for vbid in store.vbucket_ids() {
            if let Some(vb) = store.get_vbucket_any_state(vbid) {
                removed += vb.checkpoints.lock().unwrap().remove_closed_unref_checkpoints();
            }
        }
        let stats = store.stats();
        stats
            .items_removed_from_checkpoints
            .fetch_add(removed as u64, Ordering::Relaxed);
        stats
            .checkpoint_remover_runs
            .fetch_add(1, Ordering::Relaxed);
        t.snooze(self.sleep_time);
        true
    }

    fn description(&self) -> String {
        "Removing closed unreferenced checkpoints".to_string()
    }
}

/// Collects every persisted live row for a compaction rewrite.
struct PersistedItemVisitor {
    current_vbucket: u16,
    rows: Vec<(u16, Vec<u8>, i64)>,
}

impl VBucketVisitor for PersistedItemVisitor {
    fn visit_bucket(&mut self, vb: &Arc<VBucket>) -> bool {
        self.current_vbucket = vb.id();
        true
    }

    fn visit(&mut self, sv: &mut StoredValue) {
        if sv.row_id > 0 && !sv.deleted && !sv.temp {
            self.rows
                .push((self.current_vbucket, sv.key.clone(), sv.row_id));
        }
    }
}

pub(crate) struct MutationLogCompactor {
    pub store: Weak<EmberStore>,
    pub sleep_time: f64,
}

impl MutationLogCompactor {
    fn should_compact(store: &EmberStore, log: &MutationLog) -> bool {
        if !log.is_enabled() {
            return false;
        }
        let (max_log_size, max_entry_ratio, queue_cap) = store.compactor_params();
        if store.write_queue_size() > queue_cap {
            return false;
        }
        if log.log_size() > max_log_size {
            return true;
        }
        let total = log.records_appended();
        let live = store.num_live_items() as u64;
        live > 0 && (total as f64 / live as f64) > max_entry_ratio
    }

    fn compact(store: &EmberStore, log: &MutationLog) -> crate::Result<()> {
        let tmp_path = {
            let mut p = log.path().as_os_str().to_owned();
            p.push(".compact");
            std::path::PathBuf::from(p)
        };
        let _ = std::fs::remove_file(&tmp_path);

        let new_log = MutationLog::open(tmp_path.clone(), log.block_size())?;
        let mut visitor = PersistedItemVisitor {
            current_vbucket: 0,
            rows: Vec::new(),
        };
        store.visit(&mut visitor);
        for (vb, key, row_id) in &visitor.rows {
            new_log.new_item(*vb, key, *row_id);
        }
        new_log.commit1();
        new_log.commit2();
        drop(new_log);

        log.replace_with(&tmp_path, visitor.rows.len() as u64)
    }
}

impl Callback for MutationLogCompactor {
    fn callback(&mut self, _d: &Dispatcher, t: &TaskHandle) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        let log = store.mutation_log();
        if Self::should_compact(&store, log) {
            match Self::compact(&store, log) {
                Ok(()) => {
                    store
                        .stats()
                        .klog_compactor_runs
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "mutation log compaction failed");
                }
            }
        }
        t.snooze(self.sleep_time);
        true
    }

    fn description(&self) -> String {
        "Compacting the mutation log".to_string()
    }
}

/// Persists the engine stats map through the underlying store.
pub(crate) struct StatSnap {
    pub store: Weak<EmberStore>,
    pub sleep_time: f64,
}

impl Callback for StatSnap {
    fn callback(&mut self, _d: &Dispatcher, t: &TaskHandle) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        store.snapshot_stats();
        store.stats().log_summary();
        t.snooze(self.sleep_time);
        true
    }

    fn description(&self) -> String {
        "Snapshotting engine stats".to_string()
    }
}
