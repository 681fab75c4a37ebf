//! Priority-queue task dispatchers.
//!
//! A [`Dispatcher`] owns one worker thread and a queue of scheduled tasks
//! ordered by (waketime, priority). Tasks implement [`Callback`]; returning
//! `true` from `callback` reschedules the task after the snooze recorded on
//! its [`TaskHandle`]. The engine runs four dispatchers (rw, ro, tap,
//! non-io); client-facing operations never run here, only background work.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::Result;

pub type TaskId = u64;

/// Task priority; lower values run first among tasks that are due.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(pub i32);

impl Priority {
    pub const BG_FETCHER: Priority = Priority(0);
    pub const VB_DELETION: Priority = Priority(1);
    pub const VB_SNAPSHOT_HIGH: Priority = Priority(2);
    pub const VKEY_STAT_FETCHER: Priority = Priority(3);
    pub const FLUSHER: Priority = Priority(5);
    pub const VB_MEMORY_DELETION: Priority = Priority(6);
    pub const ITEM_PAGER: Priority = Priority(7);
    pub const MUTATION_LOG_COMPACTOR: Priority = Priority(7);
    pub const VB_SNAPSHOT_LOW: Priority = Priority(8);
    pub const CHECKPOINT_REMOVER: Priority = Priority(9);
    pub const ACCESS_SCANNER: Priority = Priority(10);
    pub const HT_RESIZER: Priority = Priority(10);
    pub const STAT_SNAP: Priority = Priority(11);
}

/// Handed to a running task so it can re-arm itself.
pub struct TaskHandle {
    id: TaskId,
    snooze: Cell<f64>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Sets the delay before the next run, used when `callback` returns true.
    pub fn snooze(&self, secs: f64) {
        self.snooze.set(secs);
    }
}

/// A schedulable unit of background work.
pub trait Callback: Send {
    /// Runs the task. Returns true to reschedule after the snooze set on
    /// `task` (zero if never set).
    fn callback(&mut self, dispatcher: &Dispatcher, task: &TaskHandle) -> bool;

    /// Human-readable description for logs.
    fn description(&self) -> String;
}

struct ScheduledTask {
    id: TaskId,
    priority: Priority,
    waketime: Instant,
    callback: Box<dyn Callback>,
}

struct State {
    tasks: Vec<ScheduledTask>,
    running: bool,
    running_task: Option<TaskId>,
    cancelled_running: bool,
    wake_running: bool,
}

/// A single-threaded scheduler of prioritized callbacks.
pub struct Dispatcher {
    name: String,
    state: Mutex<State>,
    condvar: Condvar,
    next_id: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Creates the dispatcher and starts its worker thread.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            name: name.into(),
            state: Mutex::new(State {
                tasks: Vec::new(),
                running: true,
                running_task: None,
                cancelled_running: false,
                wake_running: false,
            }),
            condvar: Condvar::new(),
            next_id: AtomicU64::new(1),
            handle: Mutex::new(None),
        });

        let worker = dispatcher.clone();
        let thread_name = worker.name.clone();
        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker.run())
            .expect("failed to spawn dispatcher thread");
        *dispatcher.handle.lock().unwrap() = Some(handle);
        dispatcher
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schedules a task to run after `delay_secs`. Returns its id.
    pub fn schedule(
        &self,
        callback: Box<dyn Callback>,
        priority: Priority,
        delay_secs: f64,
    ) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let task = ScheduledTask {
            id,
            priority,
            waketime: Instant::now() + Duration::from_secs_f64(delay_secs.max(0.0)),
            callback,
        };
        let mut state = self.state.lock().unwrap();
        state.tasks.push(task);
        self.condvar.notify_all();
        id
    }

    /// Cancels a pending task. Idempotent; a task that is mid-callback is
    /// dropped before its next run instead.
    pub fn cancel(&self, id: TaskId) {
        let mut state = self.state.lock().unwrap();
        state.tasks.retain(|t| t.id != id);
        if state.running_task == Some(id) {
            state.cancelled_running = true;
        }
    }

    /// Moves a pending task's waketime to now. A task that is currently
    /// running is re-armed to run again immediately after it returns.
    pub fn wake(&self, id: TaskId) {
        let mut state = self.state.lock().unwrap();
        let mut found = false;
        for t in state.tasks.iter_mut() {
            if t.id == id {
                t.waketime = Instant::now();
                found = true;
            }
        }
        if !found && state.running_task == Some(id) {
            state.wake_running = true;
        }
        self.condvar.notify_all();
    }

    /// Stops the worker. Pending tasks are dropped without running.
    pub fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.running = false;
            self.condvar.notify_all();
        }
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| crate::Error::Io(format!("dispatcher {} panicked", self.name)))?;
        }
        Ok(())
    }

    fn run(&self) {
        tracing::debug!(dispatcher = %self.name, "dispatcher started");
        loop {
            let mut task = {
                let mut state = self.state.lock().unwrap();
                loop {
                    if !state.running {
                        tracing::debug!(dispatcher = %self.name, "dispatcher stopped");
                        return;
                    }
                    let next = Self::next_due(&state.tasks);
                    match next {
                        None => {
                            state = self.condvar.wait(state).unwrap();
                        }
                        Some(idx) => {
                            let now = Instant::now();
                            let waketime = state.tasks[idx].waketime;
                            if waketime <= now {
                                let task = state.tasks.swap_remove(idx);
                                state.running_task = Some(task.id);
                                state.cancelled_running = false;
                                state.wake_running = false;
                                break task;
                            }
                            let (guard, _) = self
                                .condvar
                                .wait_timeout(state, waketime - now)
                                .unwrap();
                            state = guard;
                        }
                    }
                }
            };

            let handle = TaskHandle {
                id: task.id,
                snooze: Cell::new(0.0),
            };
            let reschedule = task.callback.callback(self, &handle);

            let mut state = self.state.lock().unwrap();
            let cancelled = state.cancelled_running;
            let woken = state.wake_running;
            state.running_task = None;
            if reschedule && !cancelled && state.running {
                let delay = if woken { 0.0 } else { handle.snooze.get() };
                task.waketime = Instant::now() + Duration::from_secs_f64(delay.max(0.0));
                state.tasks.push(task);
            } else if !reschedule {
                tracing::debug!(
                    dispatcher = %self.name,
                    task = %task.callback.description(),
                    "task completed"
                );
            }
        }
    }

    /// Index of the next task by (waketime, priority, id).
    fn next_due(tasks: &[ScheduledTask]) -> Option<usize> {
        tasks
            .iter()
            .enumerate()
            .min_by_key(|(_, t)| (t.waketime, t.priority, t.id))
            .map(|(idx, _)| idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingTask {
        counter: Arc<AtomicUsize>,
        period: f64,
        limit: usize,
    }

    impl Callback for CountingTask {
        fn callback(&mut self, _d: &Dispatcher, t: &TaskHandle) -> bool {
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            t.snooze(self.period);
            n < self.limit
        }

        fn description(&self) -> String {
            "counting task".to_string()
        }
    }

    fn wait_for(counter: &AtomicUsize, at_least: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < at_least {
            assert!(Instant::now() < deadline, "timed out waiting for task runs");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_schedule_and_reschedule() {
        let d = Dispatcher::new("test");
        let counter = Arc::new(AtomicUsize::new(0));
        d.schedule(
            Box::new(CountingTask {
                counter: counter.clone(),
                period: 0.001,
                limit: 3,
            }),
            Priority::FLUSHER,
            0.0,
        );

        wait_for(&counter, 3);
        // The task returned false on its third run and must not run again.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        d.stop().unwrap();
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let d = Dispatcher::new("test");
        let counter = Arc::new(AtomicUsize::new(0));
        let id = d.schedule(
            Box::new(CountingTask {
                counter: counter.clone(),
                period: 0.0,
                limit: usize::MAX,
            }),
            Priority::FLUSHER,
            60.0,
        );

        d.cancel(id);
        d.cancel(id);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        d.stop().unwrap();
    }

    #[test]
    fn test_wake_runs_early() {
        let d = Dispatcher::new("test");
        let counter = Arc::new(AtomicUsize::new(0));
        let id = d.schedule(
            Box::new(CountingTask {
                counter: counter.clone(),
                period: 3600.0,
                limit: usize::MAX,
            }),
            Priority::FLUSHER,
            3600.0,
        );

        d.wake(id);
        wait_for(&counter, 1);
        d.stop().unwrap();
    }

    #[test]
    fn test_stop_drops_pending_tasks() {
        let d = Dispatcher::new("test");
        let counter = Arc::new(AtomicUsize::new(0));
        d.schedule(
            Box::new(CountingTask {
                counter: counter.clone(),
                period: 0.0,
                limit: usize::MAX,
            }),
            Priority::FLUSHER,
            60.0,
        );

        d.stop().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_next_due_prefers_priority_on_tie() {
        struct Noop;
        impl Callback for Noop {
            fn callback(&mut self, _d: &Dispatcher, _t: &TaskHandle) -> bool {
                false
            }
            fn description(&self) -> String {
                "noop".to_string()
            }
        }

        let waketime = Instant::now();
        let tasks = vec![
            ScheduledTask {
                id: 1,
                priority: Priority::STAT_SNAP,
                waketime,
                callback: Box::new(Noop),
            },
            ScheduledTask {
                id: 2,
                priority: Priority::BG_FETCHER,
                waketime,
                callback: Box::new(Noop),
            },
        ];
        assert_eq!(Dispatcher::next_due(&tasks), Some(1));
    }
}
