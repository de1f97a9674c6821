//! Background task scheduler.
//!
//! A single thread sleeps until the earliest task is due, takes it off the
//! queue under the lock and runs it outside the lock. Tasks are keyed by
//! purpose: scheduling a key that is already pending replaces the old task.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use minitx_common::GlobalTransactionId;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error};

/// What a scheduled task is for. At most one task per key is pending.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKey {
    /// Marks the transaction rollback-only once its deadline passes.
    TransactionTimeout(GlobalTransactionId),
    /// Periodic background recovery.
    Recovery,
    /// Anything else, for callers outside the coordinator.
    Named(String),
}

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Queue position: execution time, then insertion order.
type Slot = (Instant, u64);

struct Entry {
    key: TaskKey,
    task: Task,
}

#[derive(Default)]
struct State {
    queue: BTreeMap<Slot, Entry>,
    index: HashMap<TaskKey, Slot>,
    next_seq: u64,
    shutdown: bool,
}

impl State {
    fn remove(&mut self, key: &TaskKey) -> Option<Entry> {
        let slot = self.index.remove(key)?;
        self.queue.remove(&slot)
    }
}

struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
}

pub struct TaskScheduler {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn start() -> io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            wakeup: Condvar::new(),
        });
        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name("minitx-scheduler".into())
            .spawn(move || run(worker))?;
        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Schedules `task` to run at `at`, replacing any pending task with the
    /// same key. Returns false if the scheduler is shut down.
    pub fn schedule<F>(&self, key: TaskKey, at: Instant, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return false;
        }
        let replaced = state.remove(&key).is_some();
        let slot = (at, state.next_seq);
        state.next_seq += 1;
        state.index.insert(key.clone(), slot);
        state.queue.insert(slot, Entry {
            key,
            task: Box::new(task),
        });
        drop(state);

        if replaced {
            debug!("replaced pending task");
        }
        self.shared.wakeup.notify_one();
        true
    }

    /// Cancels the pending task with `key`. Returns true if a task was pending;
    /// that task is then guaranteed never to run.
    pub fn cancel(&self, key: &TaskKey) -> bool {
        self.shared.state.lock().remove(key).is_some()
    }

    pub fn is_scheduled(&self, key: &TaskKey) -> bool {
        self.shared.state.lock().index.contains_key(key)
    }

    pub fn count_pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Drops every pending task without running it and joins the thread. A
    /// task that is running finishes first.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.shutdown {
                state.shutdown = true;
                let dropped = state.queue.len();
                state.queue.clear();
                state.index.clear();
                debug!(dropped, "scheduler shutting down");
            }
        }
        self.shared.wakeup.notify_all();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            // A task may drop the last owner of the scheduler.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("scheduler thread panicked");
            }
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Deadlines further out are clamped to this distance from now.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// The instant `after` from now. Durations too large for an [`Instant`] are
/// clamped to a far-future deadline.
pub fn deadline_after(after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(after.min(FAR_FUTURE)).unwrap_or(now)
}

fn run(shared: Arc<Shared>) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            return;
        }
        let next = state.queue.first_key_value().map(|(slot, _)| *slot);
        match next {
            Some(slot) if slot.0 <= Instant::now() => {
                if let Some(entry) = state.queue.remove(&slot) {
                    state.index.remove(&entry.key);
                    MutexGuard::unlocked(&mut state, || execute(entry));
                }
            }
            Some((at, _)) => {
                shared.wakeup.wait_until(&mut state, at);
            }
            None => shared.wakeup.wait(&mut state),
        }
    }
}

fn execute(entry: Entry) {
    let Entry { key, task } = entry;
    debug!(?key, "running scheduled task");
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!(?key, "scheduled task panicked");
    }
}
