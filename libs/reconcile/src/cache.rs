//! In-memory mirror of one kind, kept current by list + watch.
//!
//! The cache is the only consumer of the store's watch stream. For every
//! change that matters it invokes a cheap callback (usually "enqueue this
//! key") and nothing else; business logic runs on the worker loops.
//!
//! Emission rules:
//! - Added/Modified emit only when the object differs from the cached copy
//! - Deleted always emits, and the last known object is kept as a tombstone
//!   until the handler has seen it
//! - a relist that no longer contains a cached object emits a Delete for it

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::object::{ObjectKey, Resource, Selector};
use crate::store::{ResourceStore, WatchEvent};
use crate::DEFAULT_RESYNC_PERIOD;

/// What happened to an object, as seen by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Add,
    Update,
    Delete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// Invoked for every queue-worthy change.
pub type EventCallback = Arc<dyn Fn(ObjectKey, EventKind) + Send + Sync>;

/// Watch loop tuning.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Full relist interval. `None` disables periodic resync.
    pub resync_period: Option<Duration>,

    /// Delay between failed list/watch attempts.
    pub relist_backoff: BackoffPolicy,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            resync_period: Some(DEFAULT_RESYNC_PERIOD),
            relist_backoff: BackoffPolicy {
                base: Duration::from_millis(200),
                max: Duration::from_secs(30),
                jitter: 0.2,
            },
        }
    }
}

/// Indexed mirror of a store kind.
pub struct EventCache<K: Resource> {
    items: RwLock<HashMap<ObjectKey, Arc<K>>>,
    tombstones: RwLock<HashMap<ObjectKey, Arc<K>>>,
    synced: watch::Sender<bool>,
}

impl<K: Resource> Default for EventCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Resource> fmt::Debug for EventCache<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventCache")
            .field("kind", &K::KIND)
            .field("synced", &self.has_synced())
            .finish_non_exhaustive()
    }
}

impl<K: Resource> EventCache<K> {
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            items: RwLock::new(HashMap::new()),
            tombstones: RwLock::new(HashMap::new()),
            synced,
        }
    }

    pub fn kind(&self) -> &'static str {
        K::KIND
    }

    /// Point lookup. `None` means the object is not (or no longer) present.
    pub async fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.items.read().await.get(key).cloned()
    }

    /// Last known state of a deleted object that no handler has consumed yet.
    pub async fn tombstone(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.tombstones.read().await.get(key).cloned()
    }

    pub async fn clear_tombstone(&self, key: &ObjectKey) {
        self.tombstones.write().await.remove(key);
    }

    /// Snapshot of every cached object.
    pub async fn list(&self) -> Vec<Arc<K>> {
        self.items.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    /// True once a full list has been applied and no later list has failed.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Receiver that flips to `true` when the cache syncs.
    pub fn subscribe_synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    fn set_synced(&self, value: bool) {
        self.synced.send_if_modified(|current| {
            let changed = *current != value;
            *current = value;
            changed
        });
    }

    /// Fold one watch event into the mirror. Returns the event to emit, if any.
    pub async fn apply(&self, event: WatchEvent<K>) -> Option<EventKind> {
        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => self.upsert(obj).await,
            WatchEvent::Deleted(obj) => {
                self.remove(&obj.key(), Arc::new(obj)).await;
                Some(EventKind::Delete)
            }
        }
    }

    async fn upsert(&self, obj: K) -> Option<EventKind> {
        let key = obj.key();
        self.tombstones.write().await.remove(&key);

        let mut items = self.items.write().await;
        match items.get(&key) {
            Some(cached) if **cached == obj => None,
            Some(_) => {
                items.insert(key, Arc::new(obj));
                Some(EventKind::Update)
            }
            None => {
                items.insert(key, Arc::new(obj));
                Some(EventKind::Add)
            }
        }
    }

    async fn remove(&self, key: &ObjectKey, observed: Arc<K>) {
        let cached = self.items.write().await.remove(key);
        // Prefer what the handler last saw over the store's final copy
        let last_known = cached.unwrap_or(observed);
        self.tombstones.write().await.insert(key.clone(), last_known);
    }

    /// Replace the mirror with a full listing, returning the diff to emit.
    pub async fn replace(&self, objects: Vec<K>) -> Vec<(ObjectKey, EventKind)> {
        let mut emitted = Vec::new();
        let listed: HashSet<ObjectKey> = objects.iter().map(Resource::key).collect();

        let vanished: Vec<(ObjectKey, Arc<K>)> = self
            .items
            .read()
            .await
            .iter()
            .filter(|(key, _)| !listed.contains(*key))
            .map(|(key, obj)| (key.clone(), Arc::clone(obj)))
            .collect();
        for (key, obj) in vanished {
            self.remove(&key, obj).await;
            emitted.push((key, EventKind::Delete));
        }

        for obj in objects {
            let key = obj.key();
            if let Some(kind) = self.upsert(obj).await {
                emitted.push((key, kind));
            }
        }
        emitted
    }

    /// Keep the mirror in sync with `store` until `shutdown` fires.
    ///
    /// Each round subscribes, lists, then consumes the watch stream until it
    /// ends, errors or a resync is due. List failures close the sync gate and
    /// are retried with backoff.
    pub async fn run(
        self: Arc<Self>,
        store: Arc<dyn ResourceStore<K>>,
        selector: Selector,
        options: CacheOptions,
        on_event: EventCallback,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(kind = K::KIND, "Starting cache watch loop");
        let mut failures = 0u32;

        'relist: loop {
            if *shutdown.borrow() {
                break;
            }

            // Subscribe before listing so nothing between the two is lost;
            // replays of listed objects are filtered by the equality check.
            let listing = match store.watch(&selector).await {
                Ok(stream) => store.list(&selector).await.map(|objects| (stream, objects)),
                Err(e) => Err(e),
            };
            let mut stream = match listing {
                Ok((stream, objects)) => {
                    let emitted = self.replace(objects).await;
                    debug!(kind = K::KIND, changes = emitted.len(), "Cache relisted");
                    for (key, kind) in emitted {
                        on_event(key, kind);
                    }
                    if !self.has_synced() {
                        let objects = self.len().await;
                        info!(kind = K::KIND, objects, "Cache synced");
                    }
                    self.set_synced(true);
                    failures = 0;
                    stream
                }
                Err(e) => {
                    self.set_synced(false);
                    let delay = options.relist_backoff.delay(failures);
                    failures = failures.saturating_add(1);
                    warn!(
                        kind = K::KIND,
                        error = %e,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "Cache relist failed"
                    );
                    let stop = tokio::select! {
                        _ = tokio::time::sleep(delay) => false,
                        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
                    };
                    if stop {
                        break 'relist;
                    }
                    continue 'relist;
                }
            };

            let next_resync = options.resync_period.map(|period| Instant::now() + period);
            loop {
                let resync_due = async {
                    match next_resync {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break 'relist;
                        }
                    }
                    _ = resync_due => {
                        debug!(kind = K::KIND, "Periodic resync");
                        continue 'relist;
                    }
                    next = stream.next() => match next {
                        Some(Ok(event)) => {
                            let key = event.object().key();
                            if let Some(kind) = self.apply(event).await {
                                on_event(key, kind);
                            }
                        }
                        Some(Err(e)) => {
                            warn!(kind = K::KIND, error = %e, "Watch stream error, relisting");
                            continue 'relist;
                        }
                        None => {
                            warn!(kind = K::KIND, "Watch stream closed, relisting");
                            continue 'relist;
                        }
                    }
                }
            }
        }

        info!(kind = K::KIND, "Cache watch loop stopped");
    }
}
