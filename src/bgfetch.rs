//! Background fetching of non-resident values.
//!
//! Two modes, selected by store capability. With a concurrent store, each
//! vbucket accumulates pending fetches and the [`BgFetcher`] task drains one
//! vbucket per run as a single batched read. Otherwise every non-resident
//! read schedules its own single-fetch task on the ro dispatcher.

use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use crate::dispatcher::{Callback, Dispatcher, Priority, TaskHandle, TaskId};
use crate::item::Cookie;
use crate::store::EmberStore;

/// Poll period while the fetcher is idle; an enqueue wakes it early.
const BG_FETCHER_SLEEP: f64 = 1.0;

/// What a fetch should restore.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchKind {
    Value,
    /// Metadata-only fetch completing a temp item; never batched.
    Meta,
}

/// One pending background read, keyed by its cookie.
#[derive(Clone, Debug)]
pub struct BgFetchItem {
    pub cookie: Cookie,
    pub row_id: i64,
    pub init: Instant,
}

/// Batching fetcher for stores that allow concurrent reads.
pub struct BgFetcher {
    task_id: Mutex<Option<TaskId>>,
}

impl BgFetcher {
    pub fn new() -> Self {
        Self {
            task_id: Mutex::new(None),
        }
    }

    pub(crate) fn start(&self, dispatcher: &Dispatcher, store: &Arc<EmberStore>) {
        let task = BgFetcherTask {
            store: Arc::downgrade(store),
        };
        let id = dispatcher.schedule(Box::new(task), Priority::BG_FETCHER, BG_FETCHER_SLEEP);
        *self.task_id.lock().unwrap() = Some(id);
    }

    /// Wakes the fetcher; called when a vbucket queues its first fetch.
    pub(crate) fn notify(&self, dispatcher: &Dispatcher) {
        if let Some(id) = *self.task_id.lock().unwrap() {
            dispatcher.wake(id);
        }
    }

    pub(crate) fn stop(&self, dispatcher: &Dispatcher) {
        if let Some(id) = self.task_id.lock().unwrap().take() {
            dispatcher.cancel(id);
        }
    }
}

impl Default for BgFetcher {
    fn default() -> Self {
        Self::new()
    }
}

struct BgFetcherTask {
    store: Weak<EmberStore>,
}

impl Callback for BgFetcherTask {
    fn callback(&mut self, _d: &Dispatcher, t: &TaskHandle) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };

        // Drain one vbucket with pending fetches per run.
        let mut more_pending = false;
        let mut picked = None;
        for vbid in store.vbucket_ids() {
            let Some(vb) = store.get_vbucket_any_state(vbid) else {
                continue;
            };
            if vb.has_pending_bg_fetches() {
                if picked.is_none() {
                    picked = Some(vbid);
                } else {
                    more_pending = true;
                    break;
                }
            }
        }

        if let Some(vbid) = picked {
            store.run_bg_fetch_batch(vbid, Instant::now());
        }

        t.snooze(if more_pending { 0.0 } else { BG_FETCHER_SLEEP });
        true
    }

    fn description(&self) -> String {
        "Batching background fetch".to_string()
    }
}

/// A one-off fetch for a single key, used for metadata fetches and for
/// stores without read concurrency.
pub(crate) struct SingleBgFetchTask {
    pub store: Weak<EmberStore>,
    pub key: Vec<u8>,
    pub vbucket: u16,
    pub row_id: i64,
    pub cookie: Cookie,
    pub init: Instant,
    pub kind: FetchKind,
}

impl Callback for SingleBgFetchTask {
    fn callback(&mut self, _d: &Dispatcher, _t: &TaskHandle) -> bool {
        if let Some(store) = self.store.upgrade() {
            store.complete_bg_fetch(
                &self.key,
                self.vbucket,
                self.row_id,
                self.cookie,
                self.init,
                self.kind,
            );
        }
        false
    }

    fn description(&self) -> String {
        format!(
            "Fetching item from disk: {}",
            String::from_utf8_lossy(&self.key)
        )
    }
}

/// Disk fetch feeding a per-key stats request; the lookup callback gets the
/// raw [`crate::kvstore::GetValue`].
pub(crate) struct VKeyStatBgFetchTask {
    pub store: Weak<EmberStore>,
    pub key: Vec<u8>,
    pub vbucket: u16,
    pub row_id: i64,
    pub cookie: Cookie,
    pub lookup_cb: Option<Box<dyn FnOnce(crate::kvstore::GetValue) + Send>>,
}

impl Callback for VKeyStatBgFetchTask {
    fn callback(&mut self, _d: &Dispatcher, _t: &TaskHandle) -> bool {
        if let Some(store) = self.store.upgrade() {
            let gv = store.read_from_underlying(&self.key, self.row_id, self.vbucket);
            if let Some(cb) = self.lookup_cb.take() {
                cb(gv);
            }
            store.notify_io_complete(self.cookie, Ok(()));
        }
        false
    }

    fn description(&self) -> String {
        format!(
            "Fetching item from disk for vkey stat: {}",
            String::from_utf8_lossy(&self.key)
        )
    }
}
