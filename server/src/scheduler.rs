//! Deferred task scheduler.
//!
//! Tasks are kept in a min-heap keyed by their due time. A single worker
//! task sleeps until the earliest entry is due, or until a new insertion or
//! a cancellation wakes it up, then re-checks the head before running
//! anything. A panicking task is logged and does not stop the worker.

use log::{debug, error, info};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("task is scheduled in the past")]
    InPast,
    #[error("scheduler has been cancelled")]
    Cancelled,
}

struct Entry {
    at: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
    cancelled: bool,
}

struct Inner {
    queue: Mutex<Queue>,
    wake: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a running scheduler. Cheap to clone; every clone feeds the same
/// worker.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Spawns the worker and returns a handle to it along with the worker's
    /// join handle.
    pub fn start() -> (Self, JoinHandle<()>) {
        let inner = Arc::new(Inner {
            queue: Mutex::new(Queue::default()),
            wake: Notify::new(),
        });
        let worker = tokio::spawn(run_worker(Arc::clone(&inner)));
        (Self { inner }, worker)
    }

    /// Schedules `task` to run at `at`.
    pub fn schedule<F>(&self, at: Instant, task: F) -> Result<(), ScheduleError>
    where
        F: FnOnce() + Send + 'static,
    {
        if at < Instant::now() {
            return Err(ScheduleError::InPast);
        }

        {
            let mut queue = self.inner.lock();
            if queue.cancelled {
                return Err(ScheduleError::Cancelled);
            }
            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.heap.push(Reverse(Entry {
                at,
                seq,
                task: Box::new(task),
            }));
        }

        self.inner.wake.notify_one();
        Ok(())
    }

    pub fn schedule_in<F>(&self, delay: Duration, task: F) -> Result<(), ScheduleError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Instant::now() + delay, task)
    }

    /// Drops every pending task and stops the worker. Later calls to
    /// [`schedule`](Self::schedule) fail.
    pub fn cancel(&self) {
        {
            let mut queue = self.inner.lock();
            if queue.cancelled {
                return;
            }
            queue.cancelled = true;
            let dropped = queue.heap.len();
            queue.heap.clear();
            info!("Scheduler cancelled, {} pending tasks dropped", dropped);
        }
        self.inner.wake.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().heap.len()
    }
}

async fn run_worker(inner: Arc<Inner>) {
    loop {
        let next_due = {
            let queue = inner.lock();
            if queue.cancelled {
                break;
            }
            queue.heap.peek().map(|Reverse(entry)| entry.at)
        };

        match next_due {
            None => inner.wake.notified().await,
            Some(at) if at > Instant::now() => {
                tokio::select! {
                    _ = time::sleep_until(at) => {}
                    _ = inner.wake.notified() => {}
                }
            }
            Some(_) => {
                let due = {
                    let mut queue = inner.lock();
                    match queue.heap.peek() {
                        Some(Reverse(entry)) if entry.at <= Instant::now() => queue.heap.pop(),
                        _ => None,
                    }
                };
                if let Some(Reverse(entry)) = due {
                    run_task(entry);
                }
            }
        }
    }
    debug!("Scheduler worker exited");
}

fn run_task(entry: Entry) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry.task)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!("Scheduled task {} panicked: {}", entry.seq, message);
    }
}
