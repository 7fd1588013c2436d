//! In-process [`ResourceStore`] for tests and local development.
//!
//! Watchers get an unbounded channel per subscription. The store can also
//! drop every subscription or fail the next lists and writes, which is how
//! tests exercise the cache's reconnect path and callers' error paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::error::StoreError;
use crate::object::{ObjectKey, Resource, Selector};
use crate::registry::TypeRegistry;
use crate::store::{ResourceStore, WatchEvent, WatchStream};

struct Watcher<K> {
    selector: Selector,
    tx: mpsc::UnboundedSender<WatchEvent<K>>,
}

/// Object map plus live watchers for one kind.
pub struct MemoryStore<K: Resource> {
    objects: RwLock<BTreeMap<ObjectKey, K>>,
    watchers: RwLock<Vec<Watcher<K>>>,
    failing_lists: AtomicU32,
    passing_writes: AtomicU32,
    failing_writes: AtomicU32,
}

impl<K: Resource> MemoryStore<K> {
    /// Create a store for `K`. Fails unless `K` is in `registry`.
    pub fn new(registry: &TypeRegistry) -> Result<Self, StoreError> {
        let info = registry.require(K::KIND)?;
        debug!(kind = info.kind, plural = info.plural, "Memory store created");
        Ok(Self {
            objects: RwLock::new(BTreeMap::new()),
            watchers: RwLock::new(Vec::new()),
            failing_lists: AtomicU32::new(0),
            passing_writes: AtomicU32::new(0),
            failing_writes: AtomicU32::new(0),
        })
    }

    /// Make the next `count` list calls fail with `Unavailable`.
    pub fn fail_next_lists(&self, count: u32) {
        self.failing_lists.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` create, update or delete calls fail with
    /// `Unavailable`. Nothing is written and nothing is broadcast.
    pub fn fail_next_writes(&self, count: u32) {
        self.fail_writes_after(0, count);
    }

    /// Let `successes` writes through, then fail the `count` after them.
    pub fn fail_writes_after(&self, successes: u32, count: u32) {
        self.passing_writes.store(successes, Ordering::SeqCst);
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Close every open watch stream, as a transport disconnect would.
    pub async fn disconnect_watchers(&self) {
        self.watchers.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    fn refuse(counter: &AtomicU32, op: &str) -> Result<(), StoreError> {
        let refused = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(StoreError::Unavailable(format!("{op} {} refused", K::KIND)));
        }
        Ok(())
    }

    fn refuse_write(&self, op: &str) -> Result<(), StoreError> {
        let passed = self
            .passing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if passed {
            return Ok(());
        }
        Self::refuse(&self.failing_writes, op)
    }

    async fn broadcast(&self, event: WatchEvent<K>) {
        let mut watchers = self.watchers.write().await;
        watchers.retain(|w| {
            if !w.selector.matches(event.object().metadata()) {
                return !w.tx.is_closed();
            }
            w.tx.send(event.clone()).is_ok()
        });
    }
}

#[async_trait]
impl<K: Resource> ResourceStore<K> for MemoryStore<K> {
    async fn list(&self, selector: &Selector) -> Result<Vec<K>, StoreError> {
        Self::refuse(&self.failing_lists, "list")?;
        let objects = self.objects.read().await;
        Ok(objects
            .values()
            .filter(|obj| selector.matches(obj.metadata()))
            .cloned()
            .collect())
    }

    async fn watch(&self, selector: &Selector) -> Result<WatchStream<K>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.write().await.push(Watcher {
            selector: selector.clone(),
            tx,
        });
        Ok(Box::pin(
            UnboundedReceiverStream::new(rx).map(Ok::<_, StoreError>),
        ))
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, StoreError> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn create(&self, object: K) -> Result<K, StoreError> {
        self.refuse_write("create")?;
        let key = object.key();
        // Broadcast under the object lock so watchers see writes in order
        let mut objects = self.objects.write().await;
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        objects.insert(key, object.clone());
        self.broadcast(WatchEvent::Added(object.clone())).await;
        Ok(object)
    }

    async fn update(&self, object: K) -> Result<K, StoreError> {
        self.refuse_write("update")?;
        let key = object.key();
        let mut objects = self.objects.write().await;
        let Some(slot) = objects.get_mut(&key) else {
            return Err(StoreError::NotFound(key.to_string()));
        };
        *slot = object.clone();
        self.broadcast(WatchEvent::Modified(object.clone())).await;
        Ok(object)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<K, StoreError> {
        self.refuse_write("delete")?;
        let mut objects = self.objects.write().await;
        let removed = objects
            .remove(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        self.broadcast(WatchEvent::Deleted(removed.clone())).await;
        Ok(removed)
    }
}
