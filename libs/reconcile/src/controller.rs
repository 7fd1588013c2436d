//! Reconciliation engine.
//!
//! A [`Controller`] owns one shared [`WorkQueue`] and any number of kind
//! bindings. Each binding is an [`EventCache`] fed by a store watch plus the
//! [`ResourceHandler`] for that kind. Cache callbacks only enqueue; worker
//! loops resolve each task against the cache and call the handler.
//!
//! ## Retry policy
//!
//! A failed task is re-added with per-key exponential backoff while its
//! requeue count is below `max_retries`. Past that it is forgotten and
//! handed to the [`ErrorSink`]. A success always resets the count.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::BackoffPolicy;
use crate::cache::{CacheOptions, EventCache, EventCallback, EventKind};
use crate::error::ReconcileError;
use crate::object::{ObjectKey, Resource, Selector};
use crate::queue::{QueueItem, WorkQueue};
use crate::store::ResourceStore;
use crate::{DEFAULT_MAX_RETRIES, DEFAULT_SYNC_TIMEOUT};

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Name used for the queue and in logs.
    pub name: String,

    /// Number of worker loops.
    pub workers: usize,

    /// Requeues allowed before a task is dropped.
    pub max_retries: u32,

    /// Full relist interval for every cache. `None` disables resync.
    pub resync_period: Option<Duration>,

    /// Upper bound on the startup wait for cache sync.
    pub sync_timeout: Duration,

    /// Backoff for failed tasks.
    pub backoff: BackoffPolicy,

    /// Backoff between failed cache relists.
    pub relist_backoff: BackoffPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let cache = CacheOptions::default();
        Self {
            name: "controller".to_string(),
            workers: 2,
            max_retries: DEFAULT_MAX_RETRIES,
            resync_period: cache.resync_period,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            backoff: BackoffPolicy::default(),
            relist_backoff: cache.relist_backoff,
        }
    }
}

/// Domain logic for one kind.
#[async_trait]
pub trait ResourceHandler<K: Resource>: Send + Sync {
    /// Drive the world toward the observed state of `key`.
    ///
    /// `object` is the cached object, or `None` when it no longer exists; in
    /// that case `tombstone` carries its last known state if the cache saw
    /// the deletion. Must be idempotent: the same key may be reconciled
    /// again with nothing changed.
    async fn reconcile(
        &self,
        key: &ObjectKey,
        object: Option<Arc<K>>,
        tombstone: Option<Arc<K>>,
        event: EventKind,
    ) -> anyhow::Result<()>;
}

/// Receives tasks the engine gave up on.
pub trait ErrorSink: Send + Sync {
    fn report(&self, task: &TaskKey, error: &anyhow::Error);
}

/// Default sink: log at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn report(&self, task: &TaskKey, error: &anyhow::Error) {
        error!(task = %task, error = %error, "Dropping task out of the queue");
    }
}

/// Queue identity of a [`Task`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub kind: &'static str,
    pub key: ObjectKey,
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.key)
    }
}

/// A unit of work: which object, what happened, and who handles it.
#[derive(Clone)]
pub struct Task {
    pub key: ObjectKey,
    pub event: EventKind,
    binding: Arc<dyn Binding>,
}

impl Task {
    pub fn kind(&self) -> &'static str {
        self.binding.kind()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("kind", &self.kind())
            .field("key", &self.key)
            .field("event", &self.event)
            .finish()
    }
}

impl QueueItem for Task {
    type Key = TaskKey;

    fn queue_key(&self) -> TaskKey {
        TaskKey {
            kind: self.kind(),
            key: self.key.clone(),
        }
    }
}

/// Type-erased cache + handler pair for one kind.
#[async_trait]
trait Binding: Send + Sync {
    fn kind(&self) -> &'static str;

    fn has_synced(&self) -> bool;

    fn subscribe_synced(&self) -> watch::Receiver<bool>;

    fn start(
        self: Arc<Self>,
        queue: WorkQueue<Task>,
        options: CacheOptions,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()>;

    async fn process(&self, task: &Task) -> anyhow::Result<()>;

    /// Release per-key state once a task is finished for good.
    async fn finish(&self, key: &ObjectKey);
}

struct KindBinding<K: Resource, H> {
    cache: Arc<EventCache<K>>,
    store: Arc<dyn ResourceStore<K>>,
    selector: Selector,
    handler: Arc<H>,
}

#[async_trait]
impl<K, H> Binding for KindBinding<K, H>
where
    K: Resource,
    H: ResourceHandler<K> + 'static,
{
    fn kind(&self) -> &'static str {
        K::KIND
    }

    fn has_synced(&self) -> bool {
        self.cache.has_synced()
    }

    fn subscribe_synced(&self) -> watch::Receiver<bool> {
        self.cache.subscribe_synced()
    }

    fn start(
        self: Arc<Self>,
        queue: WorkQueue<Task>,
        options: CacheOptions,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let binding: Arc<dyn Binding> = self.clone();
        let on_event: EventCallback = Arc::new(move |key: ObjectKey, event: EventKind| {
            debug!(kind = K::KIND, key = %key, event = %event, "Enqueue");
            queue.add(Task {
                key,
                event,
                binding: Arc::clone(&binding),
            });
        });
        tokio::spawn(Arc::clone(&self.cache).run(
            Arc::clone(&self.store),
            self.selector.clone(),
            options,
            on_event,
            shutdown,
        ))
    }

    async fn process(&self, task: &Task) -> anyhow::Result<()> {
        let object = self.cache.get_by_key(&task.key).await;
        let tombstone = match object {
            Some(_) => None,
            None => self.cache.tombstone(&task.key).await,
        };
        self.handler
            .reconcile(&task.key, object, tombstone, task.event)
            .await
    }

    async fn finish(&self, key: &ObjectKey) {
        if self.cache.get_by_key(key).await.is_none() {
            self.cache.clear_tombstone(key).await;
        }
    }
}

/// Watch-driven reconciliation engine.
pub struct Controller {
    config: ControllerConfig,
    queue: WorkQueue<Task>,
    bindings: Vec<Arc<dyn Binding>>,
    sink: Arc<dyn ErrorSink>,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .field("kinds", &self.kinds())
            .field("queue", &self.queue)
            .finish()
    }
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Self {
        let queue = WorkQueue::new(config.name.clone(), config.backoff.clone());
        Self {
            config,
            queue,
            bindings: Vec::new(),
            sink: Arc::new(LogErrorSink),
        }
    }

    /// Replace the sink that receives dropped tasks.
    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Register a kind. Returns the cache so callers can read the mirror.
    pub fn watch<K, H>(
        &mut self,
        store: Arc<dyn ResourceStore<K>>,
        selector: Selector,
        handler: Arc<H>,
    ) -> Result<Arc<EventCache<K>>, ReconcileError>
    where
        K: Resource,
        H: ResourceHandler<K> + 'static,
    {
        if self.bindings.iter().any(|b| b.kind() == K::KIND) {
            return Err(ReconcileError::DuplicateKind(K::KIND));
        }
        let cache = Arc::new(EventCache::new());
        self.bindings.push(Arc::new(KindBinding {
            cache: Arc::clone(&cache),
            store,
            selector,
            handler,
        }));
        debug!(controller = %self.config.name, kind = K::KIND, "Kind registered");
        Ok(cache)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn queue(&self) -> &WorkQueue<Task> {
        &self.queue
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.bindings.iter().map(|b| b.kind()).collect()
    }

    /// Queue a task for a registered kind without going through its cache.
    /// Returns false when the kind is unknown.
    pub fn enqueue(&self, kind: &str, key: ObjectKey, event: EventKind) -> bool {
        let Some(binding) = self.bindings.iter().find(|b| b.kind() == kind) else {
            return false;
        };
        self.queue.add(Task {
            key,
            event,
            binding: Arc::clone(binding),
        });
        true
    }

    /// Run caches and workers until `shutdown` flips to true.
    ///
    /// Fails with [`ReconcileError::CacheSyncTimeout`] when the caches do not
    /// sync within `sync_timeout`.
    #[instrument(skip(self, shutdown), fields(controller = %self.config.name))]
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), ReconcileError> {
        info!(kinds = ?self.kinds(), workers = self.config.workers, "Starting controller");

        let options = CacheOptions {
            resync_period: self.config.resync_period,
            relist_backoff: self.config.relist_backoff.clone(),
        };
        let (cache_stop_tx, cache_stop_rx) = watch::channel(false);
        let caches: Vec<JoinHandle<()>> = self
            .bindings
            .iter()
            .map(|b| Arc::clone(b).start(self.queue.clone(), options.clone(), cache_stop_rx.clone()))
            .collect();

        if let Err(e) = self.wait_for_sync(&mut shutdown).await {
            let _ = cache_stop_tx.send(true);
            self.queue.shut_down();
            join_all("cache", caches).await;
            return Err(e);
        }
        info!("Caches synced, starting workers");

        let workers: Vec<JoinHandle<()>> = (0..self.config.workers.max(1))
            .map(|worker_id| {
                let controller = Arc::clone(&self);
                tokio::spawn(async move { controller.run_worker(worker_id).await })
            })
            .collect();

        wait_for_shutdown(&mut shutdown).await;
        info!("Controller shutting down");

        let _ = cache_stop_tx.send(true);
        self.queue.shut_down();
        join_all("worker", workers).await;
        join_all("cache", caches).await;

        info!("Controller stopped");
        Ok(())
    }

    async fn wait_for_sync(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), ReconcileError> {
        let started = Instant::now();
        let mut receivers: Vec<watch::Receiver<bool>> =
            self.bindings.iter().map(|b| b.subscribe_synced()).collect();

        let all_synced = async {
            for rx in receivers.iter_mut() {
                // The sender lives in the cache, which outlives this wait
                if rx.wait_for(|synced| *synced).await.is_err() {
                    return;
                }
            }
        };

        tokio::select! {
            _ = all_synced => Ok(()),
            _ = tokio::time::sleep(self.config.sync_timeout) => {
                let pending: Vec<&'static str> = self
                    .bindings
                    .iter()
                    .filter(|b| !b.has_synced())
                    .map(|b| b.kind())
                    .collect();
                error!(?pending, "Timed out waiting for caches to sync");
                Err(ReconcileError::CacheSyncTimeout {
                    elapsed: started.elapsed(),
                    pending,
                })
            }
            _ = wait_for_shutdown(shutdown) => Err(ReconcileError::ShutdownBeforeSync),
        }
    }

    async fn run_worker(&self, worker_id: usize) {
        debug!(worker_id, "Worker started");
        while self.process_next_item().await {}
        debug!(worker_id, "Worker stopped");
    }

    /// Take one task, reconcile it and settle its retry state.
    /// Returns false once the queue has shut down and drained.
    pub async fn process_next_item(&self) -> bool {
        let Some(task) = self.queue.get().await else {
            return false;
        };
        let task_key = task.queue_key();

        let result = task.binding.process(&task).await;
        self.handle_result(&task, &task_key, result).await;
        self.queue.done(&task_key);
        true
    }

    async fn handle_result(&self, task: &Task, task_key: &TaskKey, result: anyhow::Result<()>) {
        let err = match result {
            Ok(()) => {
                self.queue.forget(task_key);
                task.binding.finish(&task.key).await;
                debug!(task = %task_key, event = %task.event, "Reconciled");
                return;
            }
            Err(err) => err,
        };

        let requeues = self.queue.num_requeues(task_key);
        if requeues < self.config.max_retries {
            warn!(
                task = %task_key,
                attempt = requeues + 1,
                max_retries = self.config.max_retries,
                error = %err,
                "Reconcile failed, requeueing"
            );
            self.queue.add_rate_limited(task.clone());
            return;
        }

        self.queue.forget(task_key);
        task.binding.finish(&task.key).await;
        self.sink.report(task_key, &err);
    }
}

/// Resolves once the signal is true or its sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn join_all(what: &str, handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            error!(task = what, error = %e, "Task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use anyhow::anyhow;

    use super::*;
    use crate::memory::MemoryStore;
    use crate::object::ObjectMeta;
    use crate::registry::TypeRegistry;

    #[derive(Debug, Clone, PartialEq)]
    struct Widget {
        meta: ObjectMeta,
        size: u32,
    }

    impl Resource for Widget {
        const KIND: &'static str = "Widget";

        fn metadata(&self) -> &ObjectMeta {
            &self.meta
        }
    }

    fn widget(name: &str, size: u32) -> Widget {
        Widget {
            meta: ObjectMeta::new("ns", name),
            size,
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        calls: Mutex<Vec<(ObjectKey, bool, bool, EventKind)>>,
        fail: bool,
    }

    impl RecordingHandler {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<(ObjectKey, bool, bool, EventKind)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ResourceHandler<Widget> for RecordingHandler {
        async fn reconcile(
            &self,
            key: &ObjectKey,
            object: Option<Arc<Widget>>,
            tombstone: Option<Arc<Widget>>,
            event: EventKind,
        ) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((key.clone(), object.is_some(), tombstone.is_some(), event));
            if self.fail {
                return Err(anyhow!("backend unavailable"));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingSink {
        reports: AtomicU32,
    }

    impl ErrorSink for CountingSink {
        fn report(&self, _task: &TaskKey, _error: &anyhow::Error) {
            self.reports.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_config() -> ControllerConfig {
        ControllerConfig {
            name: "test".to_string(),
            workers: 2,
            resync_period: None,
            sync_timeout: Duration::from_secs(2),
            backoff: BackoffPolicy {
                base: Duration::from_millis(1),
                max: Duration::from_millis(20),
                jitter: 0.0,
            },
            relist_backoff: BackoffPolicy {
                base: Duration::from_millis(1),
                max: Duration::from_millis(10),
                jitter: 0.0,
            },
            ..Default::default()
        }
    }

    fn memory_store() -> Arc<MemoryStore<Widget>> {
        let registry = TypeRegistry::new().register::<Widget>("widgets", true);
        Arc::new(MemoryStore::new(&registry).unwrap())
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_duplicate_kind_rejected() {
        let store = memory_store();
        let mut controller = Controller::new(fast_config());
        controller
            .watch::<Widget, _>(store.clone(), Selector::all(), Arc::new(RecordingHandler::default()))
            .unwrap();
        let second =
            controller.watch::<Widget, _>(store, Selector::all(), Arc::new(RecordingHandler::default()));
        assert!(matches!(second, Err(ReconcileError::DuplicateKind("Widget"))));
    }

    #[tokio::test]
    async fn test_synthetic_task_resolves_against_cache() {
        let store = memory_store();
        let handler = Arc::new(RecordingHandler::default());
        let mut controller = Controller::new(fast_config());
        let cache = controller
            .watch::<Widget, _>(store, Selector::all(), handler.clone())
            .unwrap();
        cache
            .apply(crate::store::WatchEvent::Added(widget("w1", 1)))
            .await;

        let key = ObjectKey::new("ns", "w1");
        assert!(controller.enqueue("Widget", key.clone(), EventKind::Add));
        assert!(!controller.enqueue("Gadget", key.clone(), EventKind::Add));

        assert!(controller.process_next_item().await);
        assert_eq!(handler.calls(), vec![(key, true, false, EventKind::Add)]);
        assert_eq!(controller.queue().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_deleted_object_arrives_with_tombstone_once() {
        let store = memory_store();
        let handler = Arc::new(RecordingHandler::default());
        let mut controller = Controller::new(fast_config());
        let cache = controller
            .watch::<Widget, _>(store, Selector::all(), handler.clone())
            .unwrap();
        let key = ObjectKey::new("ns", "w1");
        cache
            .apply(crate::store::WatchEvent::Added(widget("w1", 1)))
            .await;
        cache
            .apply(crate::store::WatchEvent::Deleted(widget("w1", 1)))
            .await;

        controller.enqueue("Widget", key.clone(), EventKind::Delete);
        controller.process_next_item().await;
        assert_eq!(handler.calls()[0], (key.clone(), false, true, EventKind::Delete));
        // Consumed on success
        assert!(cache.tombstone(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_always_failing_handler_runs_six_times() {
        let store = memory_store();
        let handler = Arc::new(RecordingHandler::failing());
        let sink = Arc::new(CountingSink::default());
        let mut controller = Controller::new(fast_config()).with_error_sink(sink.clone());
        controller
            .watch::<Widget, _>(store, Selector::all(), handler.clone())
            .unwrap();

        let key = ObjectKey::new("ns", "w1");
        controller.enqueue("Widget", key.clone(), EventKind::Add);
        for _ in 0..6 {
            assert!(controller.process_next_item().await);
        }

        assert_eq!(handler.calls().len(), 6);
        assert_eq!(sink.reports.load(Ordering::SeqCst), 1);
        let task_key = TaskKey { kind: "Widget", key };
        assert_eq!(controller.queue().num_requeues(&task_key), 0);

        // Nothing is scheduled after the drop
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(controller.queue().is_empty());
        assert_eq!(handler.calls().len(), 6);
    }

    #[tokio::test]
    async fn test_run_drives_add_and_delete_once_each() {
        let store = memory_store();
        let handler = Arc::new(RecordingHandler::default());
        let mut controller = Controller::new(fast_config());
        controller
            .watch::<Widget, _>(store.clone(), Selector::all(), handler.clone())
            .unwrap();
        let controller = Arc::new(controller);

        let (stop_tx, stop_rx) = watch::channel(false);
        let running = tokio::spawn(Arc::clone(&controller).run(stop_rx));

        store.create(widget("r1", 1)).await.unwrap();
        eventually(|| handler.calls().len() == 1).await;
        store.delete(&ObjectKey::new("ns", "r1")).await.unwrap();
        eventually(|| handler.calls().len() == 2).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let calls = handler.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].3, EventKind::Add);
        assert!(calls[0].1);
        assert_eq!(calls[1].3, EventKind::Delete);
        assert!(!calls[1].1 && calls[1].2);

        stop_tx.send(true).unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_times_out_when_cache_never_syncs() {
        let store = memory_store();
        store.fail_next_lists(u32::MAX);
        let mut controller = Controller::new(ControllerConfig {
            sync_timeout: Duration::from_millis(50),
            ..fast_config()
        });
        controller
            .watch::<Widget, _>(store, Selector::all(), Arc::new(RecordingHandler::default()))
            .unwrap();

        let (_stop_tx, stop_rx) = watch::channel(false);
        let result = Arc::new(controller).run(stop_rx).await;
        match result {
            Err(ReconcileError::CacheSyncTimeout { pending, .. }) => {
                assert_eq!(pending, vec!["Widget"]);
            }
            other => panic!("expected sync timeout, got {other:?}"),
        }
    }
}
