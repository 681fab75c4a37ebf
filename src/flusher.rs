//! The flusher: drains dirty items from vbuckets into batched transactions
//! against the persistent store.
//!
//! A state machine driven by a task on the rw dispatcher:
//! `Initializing → Running ⇄ (Pausing → Paused) → Stopping → Stopped`.
//! Each running step performs one full flush cycle (begin, flush in
//! txn-sized batches, complete) and then snoozes; too-young rejects shorten
//! the snooze so the retry lands when the youngest item becomes eligible.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::dispatcher::{Callback, Dispatcher, Priority, TaskHandle, TaskId};
use crate::item::{current_time, Operation, QueuedItem};
use crate::store::EmberStore;
use crate::txn::TransactionContext;

/// Idle sleep between flush cycles; a queueing client wakes the task early.
const MAX_FLUSH_SLEEP: f64 = 10.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlusherState {
    Initializing,
    Running,
    Pausing,
    Paused,
    Stopping,
    Stopped,
}

impl std::fmt::Display for FlusherState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            FlusherState::Initializing => "initializing",
            FlusherState::Running => "running",
            FlusherState::Pausing => "pausing",
            FlusherState::Paused => "paused",
            FlusherState::Stopping => "stopping",
            FlusherState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

struct FlushWork {
    queue: VecDeque<QueuedItem>,
    reject: VecDeque<QueuedItem>,
    txn: TransactionContext,
}

pub struct Flusher {
    state: Mutex<FlusherState>,
    cv: Condvar,
    task_id: Mutex<Option<TaskId>>,
    work: Mutex<FlushWork>,
}

impl Flusher {
    pub fn new(txn: TransactionContext) -> Self {
        Self {
            state: Mutex::new(FlusherState::Initializing),
            cv: Condvar::new(),
            task_id: Mutex::new(None),
            work: Mutex::new(FlushWork {
                queue: VecDeque::new(),
                reject: VecDeque::new(),
                txn,
            }),
        }
    }

    pub fn state(&self) -> FlusherState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, to: FlusherState) {
        let mut state = self.state.lock().unwrap();
        tracing::debug!(from = %*state, to = %to, "flusher transition");
        *state = to;
        self.cv.notify_all();
    }

    /// Schedules the flusher task. Called once from the store's start path.
    pub(crate) fn start(&self, dispatcher: &Dispatcher, store: &Arc<EmberStore>) {
        let task = FlusherTask {
            store: Arc::downgrade(store),
        };
        let id = dispatcher.schedule(Box::new(task), Priority::FLUSHER, 0.0);
        *self.task_id.lock().unwrap() = Some(id);
    }

    /// Kicks the task so a newly queued mutation flushes promptly.
    pub(crate) fn wake(&self, dispatcher: &Dispatcher) {
        if let Some(id) = *self.task_id.lock().unwrap() {
            dispatcher.wake(id);
        }
    }

    pub fn request_pause(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            FlusherState::Running | FlusherState::Initializing => {
                *state = FlusherState::Pausing;
                true
            }
            FlusherState::Pausing | FlusherState::Paused => true,
            _ => false,
        }
    }

    pub fn request_resume(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            FlusherState::Pausing | FlusherState::Paused => {
                *state = FlusherState::Running;
                true
            }
            FlusherState::Running => true,
            _ => false,
        }
    }

    pub(crate) fn request_stop(&self, dispatcher: &Dispatcher) {
        if self.state() == FlusherState::Stopped {
            return;
        }
        let scheduled = self.task_id.lock().unwrap().is_some();
        if !scheduled {
            self.set_state(FlusherState::Stopped);
            return;
        }
        self.set_state(FlusherState::Stopping);
        self.wake(dispatcher);
    }

    /// Blocks until the flusher reaches `Stopped`, bounded by `timeout`.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while *state != FlusherState::Stopped {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cv.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
        true
    }

    /// Items held in the in-flight queue plus the reject backlog.
    pub(crate) fn backlog(&self) -> usize {
        let work = self.work.lock().unwrap();
        work.queue.len() + work.reject.len()
    }

    /// One full flush cycle. Returns the next snooze in seconds.
    pub(crate) fn do_flush(&self, store: &EmberStore) -> f64 {
        let mut work = self.work.lock().unwrap();

        if work.queue.is_empty() && !work.reject.is_empty() {
            let rejects = std::mem::take(&mut work.reject);
            work.queue.extend(rejects);
        }

        if work.queue.is_empty() {
            if store.has_flush_items() {
                let mut batch = VecDeque::new();
                store.collect_flush_batch(&mut batch);
                work.queue = batch;
                store
                    .stats()
                    .flusher_todo
                    .store(work.queue.len(), std::sync::atomic::Ordering::Relaxed);
            } else {
                // Nothing anywhere; reset the per-vbucket queue stats.
                store.reset_vb_queue_stats();
                return MAX_FLUSH_SLEEP;
            }
        }

        if work.queue.is_empty() {
            return MAX_FLUSH_SLEEP;
        }

        tracing::debug!(items = work.queue.len(), "flushing");
        let flush_start = current_time();
        let mut min_wait: u32 = 0;
        while !work.queue.is_empty() {
            let wait = Self::flush_some(store, &mut work);
            if wait > 0 && (min_wait == 0 || wait < min_wait) {
                min_wait = wait;
            }
        }
        store.complete_flush(flush_start);

        if !work.reject.is_empty() {
            // Retry rejected items once the youngest becomes eligible.
            let wait = if min_wait > 0 { min_wait as f64 } else { 1.0 };
            return wait.min(MAX_FLUSH_SLEEP);
        }
        MAX_FLUSH_SLEEP
    }

    /// Flushes up to one transaction's worth of items, then commits.
    /// Returns the smallest too-young wait seen, or 0.
    fn flush_some(store: &EmberStore, work: &mut FlushWork) -> u32 {
        let FlushWork { queue, reject, txn } = work;

        if !txn.enter() {
            store
                .stats()
                .begin_failed
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            tracing::warn!("failed to start a flush transaction");
            while let Some(qi) = queue.pop_front() {
                reject.push_back(qi);
            }
            return 1;
        }

        let txn_size = store.txn_size();
        let mut oldest: u32 = 0;
        let mut completed = 0;
        while completed < txn_size {
            let Some(qi) = queue.pop_front() else {
                break;
            };
            completed += 1;
            match qi.op {
                Operation::Flush => store.flush_one_delete_all(),
                Operation::Set | Operation::Del => {
                    let rejects_before = reject.len();
                    let wait = store.flush_one_del_or_set(&qi, reject);
                    if qi.op == Operation::Set && reject.len() == rejects_before {
                        txn.add_uncommitted_item(qi);
                    }
                    if wait > 0 && (oldest == 0 || wait < oldest) {
                        oldest = wait;
                    }
                }
                Operation::Commit | Operation::Empty => {}
            }
        }
        txn.commit();
        oldest
    }
}

pub(crate) struct FlusherTask {
    store: std::sync::Weak<EmberStore>,
}

impl Callback for FlusherTask {
    fn callback(&mut self, _d: &Dispatcher, t: &TaskHandle) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        let flusher = store.flusher();
        match flusher.state() {
            FlusherState::Initializing => {
                tracing::info!("flusher initializing");
                flusher.set_state(FlusherState::Running);
                t.snooze(0.0);
                true
            }
            FlusherState::Running => {
                let sleep = flusher.do_flush(&store);
                t.snooze(sleep);
                true
            }
            FlusherState::Pausing => {
                flusher.set_state(FlusherState::Paused);
                t.snooze(1.0);
                true
            }
            FlusherState::Paused => {
                t.snooze(1.0);
                true
            }
            FlusherState::Stopping => {
                // Drain what we can before going quiet.
                flusher.do_flush(&store);
                tracing::info!("flusher stopped");
                flusher.set_state(FlusherState::Stopped);
                false
            }
            FlusherState::Stopped => false,
        }
    }

    fn description(&self) -> String {
        "Running a flusher loop".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::MemoryKVStore;
    use crate::mutation_log::MutationLog;
    use crate::stats::EngineStats;

    fn flusher() -> Flusher {
        let kv = Arc::new(MemoryKVStore::new());
        let log = Arc::new(MutationLog::open("", 512).unwrap());
        Flusher::new(TransactionContext::new(kv, log, EngineStats::new(0)))
    }

    #[test]
    fn test_state_transitions() {
        let f = flusher();
        assert_eq!(f.state(), FlusherState::Initializing);
        f.set_state(FlusherState::Running);

        assert!(f.request_pause());
        assert_eq!(f.state(), FlusherState::Pausing);
        f.set_state(FlusherState::Paused);
        assert!(f.request_resume());
        assert_eq!(f.state(), FlusherState::Running);
    }

    #[test]
    fn test_stop_without_task_is_immediate() {
        let f = flusher();
        let d = Dispatcher::new("test-rw");
        f.request_stop(&d);
        assert!(f.wait_stopped(Duration::from_secs(1)));
        d.stop().unwrap();
    }

    #[test]
    fn test_pause_rejected_after_stop() {
        let f = flusher();
        f.set_state(FlusherState::Stopped);
        assert!(!f.request_pause());
        assert!(!f.request_resume());
    }
}
