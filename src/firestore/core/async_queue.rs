//! Single-consumer FIFO task queue that serialises all cache and sync work.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use futures::channel::oneshot;

use crate::firestore::error::{cancelled, FirestoreResult};
use crate::platform::runtime::{sleep, spawn_detached};

type Task = Pin<Box<dyn Future<Output = ()> + Send>>;
type DelayedTask = Box<dyn FnOnce() -> Task + Send>;

/// Identifies the kind of a delayed operation so tests can fast-forward it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Sentinel that runs every scheduled operation.
    All,
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    HealthCheckTimeout,
}

struct DelayedEntry {
    id: u64,
    timer_id: TimerId,
    target_time: Instant,
    task: Mutex<Option<DelayedTask>>,
    cancelled: AtomicBool,
}

impl DelayedEntry {
    fn take_task(&self) -> Option<DelayedTask> {
        if self.cancelled.load(Ordering::SeqCst) {
            return None;
        }
        self.task.lock().ok().and_then(|mut task| task.take())
    }
}

struct Inner {
    sender: async_channel::Sender<Task>,
    delayed: Mutex<Vec<Arc<DelayedEntry>>>,
    next_delayed_id: AtomicU64,
    shut_down: AtomicBool,
}

impl Inner {
    fn push(&self, task: Task) -> bool {
        if self.shut_down.load(Ordering::SeqCst) {
            return false;
        }
        self.sender.try_send(task).is_ok()
    }

    fn forget_delayed(&self, id: u64) {
        if let Ok(mut delayed) = self.delayed.lock() {
            delayed.retain(|entry| entry.id != id);
        }
    }
}

/// Cloneable handle to the queue; the worker stops once every handle is dropped.
#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<Inner>,
}

impl AsyncQueue {
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded::<Task>();
        spawn_detached(async move {
            while let Ok(task) = receiver.recv().await {
                task.await;
            }
        });
        Self {
            inner: Arc::new(Inner {
                sender,
                delayed: Mutex::new(Vec::new()),
                next_delayed_id: AtomicU64::new(0),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Runs `operation` after every previously enqueued task and returns its output.
    pub async fn enqueue<F, T>(&self, operation: F) -> FirestoreResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let task: Task = Box::pin(async move {
            let _ = sender.send(operation.await);
        });
        if !self.inner.push(task) {
            return Err(cancelled("The async queue has been shut down"));
        }
        receiver
            .await
            .map_err(|_| cancelled("The async queue dropped the operation"))
    }

    pub fn enqueue_and_forget<F>(&self, operation: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.inner.push(Box::pin(operation)) {
            log::debug!(target: "firestore::async_queue", "dropping operation enqueued after shutdown");
        }
    }

    /// Schedules `operation` to be enqueued after `delay` unless cancelled first.
    pub fn enqueue_after_delay<F, Fut>(
        &self,
        timer_id: TimerId,
        delay: Duration,
        operation: F,
    ) -> DelayedOperation
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let entry = Arc::new(DelayedEntry {
            id: self.inner.next_delayed_id.fetch_add(1, Ordering::SeqCst),
            timer_id,
            target_time: Instant::now() + delay,
            task: Mutex::new(Some(Box::new(move || Box::pin(operation()) as Task))),
            cancelled: AtomicBool::new(false),
        });
        if let Ok(mut delayed) = self.inner.delayed.lock() {
            delayed.push(Arc::clone(&entry));
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let timer_entry = Arc::clone(&entry);
        spawn_detached(async move {
            sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.forget_delayed(timer_entry.id);
            if let Some(task) = timer_entry.take_task() {
                inner.push(task());
            }
        });

        DelayedOperation {
            timer_id,
            entry,
            queue: Arc::downgrade(&self.inner),
        }
    }

    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        self.inner.delayed.lock().map_or(false, |delayed| {
            delayed.iter().any(|entry| {
                entry.timer_id == timer_id && !entry.cancelled.load(Ordering::SeqCst)
            })
        })
    }

    /// Test hook: runs pending delayed operations in due order up to and
    /// including the first one with `last_timer_id` (all of them for
    /// [`TimerId::All`]), then waits for them to finish.
    pub async fn run_delays_until(&self, last_timer_id: TimerId) -> FirestoreResult<()> {
        let mut pending: Vec<Arc<DelayedEntry>> = match self.inner.delayed.lock() {
            Ok(delayed) => delayed.clone(),
            Err(_) => Vec::new(),
        };
        pending.sort_by_key(|entry| (entry.target_time, entry.id));
        for entry in pending {
            self.inner.forget_delayed(entry.id);
            if let Some(task) = entry.take_task() {
                self.inner.push(task());
            }
            if last_timer_id != TimerId::All && entry.timer_id == last_timer_id {
                break;
            }
        }
        self.enqueue(async {}).await
    }

    /// Rejects further work; already queued tasks still run.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        if let Ok(mut delayed) = self.inner.delayed.lock() {
            for entry in delayed.drain(..) {
                entry.cancelled.store(true, Ordering::SeqCst);
            }
        }
        self.inner.sender.close();
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`].
pub struct DelayedOperation {
    timer_id: TimerId,
    entry: Arc<DelayedEntry>,
    queue: Weak<Inner>,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Prevents the operation from running if it has not started yet.
    pub fn cancel(&self) {
        self.entry.cancelled.store(true, Ordering::SeqCst);
        if let Some(inner) = self.queue.upgrade() {
            inner.forget_delayed(self.entry.id);
        }
    }
}
