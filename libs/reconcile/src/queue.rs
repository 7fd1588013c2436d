//! Deduplicating, rate-limited work queue.
//!
//! Semantics follow the classic controller work queue:
//! - an item is identified by its [`QueueItem::queue_key`], not its payload;
//!   adding a key that is already pending replaces the payload (latest wins)
//! - a key handed out by [`WorkQueue::get`] stays in flight until
//!   [`WorkQueue::done`]; re-adds in the meantime are parked and re-queued on
//!   `done`, so no two workers ever hold the same key
//! - [`WorkQueue::add_rate_limited`] re-adds after a per-key exponential delay
//! - after [`WorkQueue::shut_down`], `get` drains what is queued and then
//!   returns `None` to every caller

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::backoff::{BackoffPolicy, RateLimiter};
use crate::object::ObjectKey;

/// Something that can sit in a [`WorkQueue`].
pub trait QueueItem: Send + 'static {
    /// Identity used for deduplication and in-flight tracking.
    type Key: Eq + Hash + Clone + Debug + Send + Sync + 'static;

    fn queue_key(&self) -> Self::Key;
}

impl QueueItem for ObjectKey {
    type Key = ObjectKey;

    fn queue_key(&self) -> ObjectKey {
        self.clone()
    }
}

impl QueueItem for String {
    type Key = String;

    fn queue_key(&self) -> String {
        self.clone()
    }
}

struct State<T: QueueItem> {
    /// Keys ready to be handed out, in arrival order.
    queue: VecDeque<T::Key>,
    /// Latest payload for every key that needs processing.
    dirty: HashMap<T::Key, T>,
    /// Keys currently held by a worker.
    processing: HashSet<T::Key>,
    limiter: RateLimiter<T::Key>,
    shutting_down: bool,
}

struct Inner<T: QueueItem> {
    name: String,
    state: Mutex<State<T>>,
    notify: Notify,
}

impl<T: QueueItem> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // Critical sections never panic midway, so a poisoned lock still
        // holds consistent state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared handle to a work queue. Clones refer to the same queue.
pub struct WorkQueue<T: QueueItem> {
    inner: Arc<Inner<T>>,
}

impl<T: QueueItem> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: QueueItem> Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("WorkQueue")
            .field("name", &self.inner.name)
            .field("queued", &state.queue.len())
            .field("in_flight", &state.processing.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}

impl<T: QueueItem> WorkQueue<T> {
    /// Create a queue with the given retry backoff.
    pub fn new(name: impl Into<String>, backoff: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashMap::new(),
                    processing: HashSet::new(),
                    limiter: RateLimiter::new(backoff),
                    shutting_down: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Enqueue `item` unless its key is already pending or in flight.
    ///
    /// A pending key keeps its queue position but takes the new payload.
    pub fn add(&self, item: T) {
        self.insert(item, true);
    }

    fn insert(&self, item: T, replace_pending: bool) {
        let key = item.queue_key();
        {
            let mut state = self.inner.lock();
            if state.shutting_down {
                trace!(queue = %self.inner.name, ?key, "Dropping add after shutdown");
                return;
            }
            if let Some(pending) = state.dirty.get_mut(&key) {
                if replace_pending {
                    *pending = item;
                }
                return;
            }
            state.dirty.insert(key.clone(), item);
            if state.processing.contains(&key) {
                // Re-queued by done()
                return;
            }
            state.queue.push_back(key);
        }
        self.inner.notify.notify_one();
    }

    /// Wait for the next item and mark its key in flight.
    ///
    /// Returns `None` once the queue is shut down and empty.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.lock();
                while let Some(key) = state.queue.pop_front() {
                    if let Some(item) = state.dirty.remove(&key) {
                        state.processing.insert(key);
                        return Some(item);
                    }
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Release the in-flight mark for `key`, re-queueing it if it was added
    /// again while being processed.
    pub fn done(&self, key: &T::Key) {
        let requeued = {
            let mut state = self.inner.lock();
            state.processing.remove(key);
            if state.dirty.contains_key(key) {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.notify.notify_one();
        }
    }

    /// Clear retry history for `key`.
    pub fn forget(&self, key: &T::Key) {
        self.inner.lock().limiter.forget(key);
    }

    /// Number of rate-limited re-adds recorded for `key` since the last
    /// [`forget`](Self::forget).
    pub fn num_requeues(&self, key: &T::Key) -> u32 {
        self.inner.lock().limiter.num_requeues(key)
    }

    /// Re-add `item` after a delay that grows with its requeue count.
    ///
    /// A payload added for the same key in the meantime is newer than the
    /// retry and is kept.
    pub fn add_rate_limited(&self, item: T) {
        let key = item.queue_key();
        let delay = {
            let mut state = self.inner.lock();
            if state.shutting_down {
                return;
            }
            state.limiter.when(&key)
        };
        debug!(queue = %self.inner.name, ?key, delay_ms = delay.as_millis() as u64, "Requeue with backoff");
        if delay.is_zero() {
            self.insert(item, false);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.insert(item, false);
        });
    }

    /// Add `item` once `delay` has elapsed. Must be called within a tokio
    /// runtime when `delay` is non-zero.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Stop accepting work and wake every waiting worker.
    pub fn shut_down(&self) {
        {
            let mut state = self.inner.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
        }
        debug!(queue = %self.inner.name, "Work queue shutting down");
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }

    /// Keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently held by workers.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().processing.len()
    }
}
