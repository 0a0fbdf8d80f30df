//! In-memory FIFO task queue with a coalescing "work available" signal.
//!
//! Producers call [`TaskQueue::enqueue`]; the single consumer (the
//! [`Executor`][crate::executor::Executor]) takes the queue's [`WorkSignal`]
//! once and waits on it.  The signal is a capacity-1 channel: any number of
//! enqueues between two waits collapse into one pending wake-up, and a
//! wake-up sent while nobody is waiting is kept rather than lost.
//!
//! The queue also owns the drain claim.  Whoever drains it must hold a
//! [`DrainClaim`] first, so two executors sharing one queue never process
//! tasks at the same time.
//!
//! No priorities, no deduplication: tasks leave in exactly the order they
//! arrived, and id uniqueness is the producer's job.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use foreman_middleware::{EventBus, Topic};
use foreman_types::{EventPayload, Task};
use tokio::sync::mpsc;
use tracing::{debug, trace};

const SOURCE: &str = "foreman-runtime::queue";

/// Receiving half of the queue's wake-up channel.
pub struct WorkSignal {
    receiver: mpsc::Receiver<()>,
}

impl WorkSignal {
    /// Wait until work may be available.  Returns `false` once the queue has
    /// been dropped.
    pub async fn notified(&mut self) -> bool {
        self.receiver.recv().await.is_some()
    }
}

/// Exclusive right to drain a [`TaskQueue`].  Released on drop.
pub struct DrainClaim<'a> {
    draining: &'a AtomicBool,
}

impl Drop for DrainClaim<'_> {
    fn drop(&mut self) {
        self.draining.store(false, Ordering::Release);
    }
}

/// Ordered holding area for pending tasks.
///
/// # Example
///
/// ```
/// use foreman_runtime::TaskQueue;
/// use foreman_types::Task;
///
/// let queue = TaskQueue::new();
/// queue.enqueue(Task::new("t1", "login form"));
/// queue.enqueue(Task::new("t2", "password reset"));
///
/// assert_eq!(queue.size(), 2);
/// assert_eq!(queue.dequeue().unwrap().id, "t1");
/// assert_eq!(queue.dequeue().unwrap().id, "t2");
/// assert!(queue.dequeue().is_none());
/// ```
pub struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
    draining: AtomicBool,
    signal_tx: mpsc::Sender<()>,
    signal_rx: Mutex<Option<mpsc::Receiver<()>>>,
    bus: Option<EventBus>,
}

impl TaskQueue {
    pub fn new() -> Self {
        let (signal_tx, signal_rx) = mpsc::channel(1);
        Self {
            tasks: Mutex::default(),
            draining: AtomicBool::new(false),
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
            bus: None,
        }
    }

    /// Like [`new`][Self::new], announcing every enqueue on `bus`.
    pub fn with_bus(bus: EventBus) -> Self {
        Self {
            bus: Some(bus),
            ..Self::new()
        }
    }

    /// Append `task` to the tail and raise the work-available signal.
    pub fn enqueue(&self, task: Task) {
        let task_id = task.id.clone();
        let feature_name = task.feature_name.clone();
        let depth = {
            let mut tasks = self.lock();
            tasks.push_back(task);
            tasks.len()
        };
        debug!(task_id = %task_id, depth, "task enqueued");

        if let Some(bus) = &self.bus {
            bus.emit(
                Topic::Tasks,
                SOURCE,
                EventPayload::TaskEnqueued {
                    task_id,
                    feature_name,
                },
            );
        }

        // Full means a wake-up is already pending.
        if let Err(mpsc::error::TrySendError::Closed(())) = self.signal_tx.try_send(()) {
            trace!("work signal consumer dropped");
        }
    }

    /// Remove and return the head of the queue.
    pub fn dequeue(&self) -> Option<Task> {
        self.lock().pop_front()
    }

    /// Number of tasks waiting.
    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Copy of the waiting tasks, head first.
    pub fn snapshot(&self) -> Vec<Task> {
        self.lock().iter().cloned().collect()
    }

    /// Hand out the work signal.  There is exactly one; later calls get
    /// `None`.
    pub fn take_signal(&self) -> Option<WorkSignal> {
        self.signal_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(|receiver| WorkSignal { receiver })
    }

    /// Claim the queue for draining.  `None` while someone else holds the
    /// claim.
    pub fn try_claim_drain(&self) -> Option<DrainClaim<'_>> {
        self.draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DrainClaim {
                draining: &self.draining,
            })
    }

    /// Whether a [`DrainClaim`] is currently held.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Task>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
