//! End-to-end tests: requests in a store, a running controller, and the
//! pool handler in between.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clusterpool_manager::{
    policy, registry, AllocationPolicy, ClusterConfig, ClusterInstance, ClusterManager,
    ClusterRequest, ClusterRequestHandler, ClusterState, InstanceReconciler, MockProvider,
    PoolConfig, PoolHandler, PoolMode, RequestReconciler,
};
use clusterpool_reconcile::{
    BackoffPolicy, Controller, ControllerConfig, MemoryStore, ObjectKey, Resource, ResourceStore,
    Selector,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const NAMESPACE: &str = "default";

fn request_config() -> ClusterConfig {
    ClusterConfig {
        ttl: Duration::from_secs(600),
        num_cores_per_node: 2,
        num_nodes: 1,
        version: "1.29".to_string(),
        rbac: true,
    }
}

fn controller_config() -> ControllerConfig {
    ControllerConfig {
        name: "test".to_string(),
        workers: 2,
        resync_period: None,
        sync_timeout: Duration::from_secs(2),
        backoff: BackoffPolicy {
            base: Duration::from_millis(2),
            max: Duration::from_millis(50),
            jitter: 0.0,
        },
        ..Default::default()
    }
}

async fn eventually<F, Fut>(check: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Counts calls and forwards to the real handler.
struct CountingHandler {
    inner: PoolHandler,
    provisions: AtomicU32,
    recycles: AtomicU32,
}

#[async_trait]
impl ClusterRequestHandler for CountingHandler {
    async fn provision_cluster(&self, request: &ClusterRequest) -> anyhow::Result<()> {
        self.provisions.fetch_add(1, Ordering::SeqCst);
        self.inner.provision_cluster(request).await
    }

    async fn recycle_cluster(&self, request: &ClusterRequest) -> anyhow::Result<()> {
        self.recycles.fetch_add(1, Ordering::SeqCst);
        self.inner.recycle_cluster(request).await
    }
}

struct Running {
    provider: Arc<MockProvider>,
    requests: Arc<MemoryStore<ClusterRequest>>,
    instances: Arc<MemoryStore<ClusterInstance>>,
    policy: Arc<dyn AllocationPolicy>,
    handler: Arc<CountingHandler>,
    stop: watch::Sender<bool>,
    controller: JoinHandle<Result<(), clusterpool_reconcile::ReconcileError>>,
}

impl Running {
    fn manager(&self) -> &Arc<ClusterManager> {
        self.policy.manager()
    }

    async fn stop(self) {
        self.stop.send(true).unwrap();
        self.controller.await.unwrap().unwrap();
    }
}

fn request_store() -> Arc<MemoryStore<ClusterRequest>> {
    Arc::new(MemoryStore::new(&registry()).unwrap())
}

fn instance_store() -> Arc<MemoryStore<ClusterInstance>> {
    Arc::new(MemoryStore::new(&registry()).unwrap())
}

async fn start(provider: MockProvider, mode: PoolMode) -> Running {
    start_on(Arc::new(provider), request_store(), instance_store(), mode).await
}

/// Start the way the binary does: restore, release vanished requests, then
/// run the controller.
async fn start_on(
    provider: Arc<MockProvider>,
    requests: Arc<MemoryStore<ClusterRequest>>,
    instances: Arc<MemoryStore<ClusterInstance>>,
    mode: PoolMode,
) -> Running {

    let pool_config = PoolConfig {
        mode,
        pool_size: 2,
        poll_interval: Duration::from_millis(1),
        ..Default::default()
    };
    let manager = Arc::new(ClusterManager::new(
        NAMESPACE,
        provider.clone(),
        instances.clone(),
        pool_config.clone(),
    ));
    let policy = policy::from_config(manager, &pool_config);
    policy.restore().await.unwrap();

    let handler = Arc::new(CountingHandler {
        inner: PoolHandler::new(policy.clone(), requests.clone()),
        provisions: AtomicU32::new(0),
        recycles: AtomicU32::new(0),
    });
    handler.inner.release_orphans().await.unwrap();

    let mut controller = Controller::new(controller_config());
    controller
        .watch::<ClusterRequest, _>(
            requests.clone(),
            Selector::namespaced(NAMESPACE),
            Arc::new(RequestReconciler::new(handler.clone())),
        )
        .unwrap();
    controller
        .watch::<ClusterInstance, _>(
            instances.clone(),
            Selector::namespaced(NAMESPACE),
            Arc::new(InstanceReconciler::new(policy.clone())),
        )
        .unwrap();

    let (stop, stop_rx) = watch::channel(false);
    let controller = tokio::spawn(Arc::new(controller).run(stop_rx));

    Running {
        provider,
        requests,
        instances,
        policy,
        handler,
        stop,
        controller,
    }
}

#[tokio::test]
async fn test_request_lifecycle_calls_handler_once_each() {
    let env = start(MockProvider::new(), PoolMode::Fixed).await;
    let key = ObjectKey::new(NAMESPACE, "r1");

    env.requests
        .create(ClusterRequest::new(NAMESPACE, "r1", request_config()))
        .await
        .unwrap();

    let requests = env.requests.clone();
    let watched = key.clone();
    eventually(|| {
        let requests = requests.clone();
        let watched = watched.clone();
        async move {
            requests
                .get(&watched)
                .await
                .unwrap()
                .and_then(|r| r.status)
                .is_some()
        }
    })
    .await;

    let request = env.requests.get(&key).await.unwrap().unwrap();
    let status = request.status.unwrap();
    assert_eq!(status.state, ClusterState::InUse);
    let instance_id = status.instance.unwrap();
    assert!(status.kube_config.contains(&instance_id.to_string()));

    let instance = env.manager().get(&instance_id).await.unwrap();
    assert_eq!(instance.request(), Some(&key));

    // The status write comes back as an update and is a no-op
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(env.provider.creates(), 1);
    let calls_after_provision = env.provider.calls();

    env.requests.delete(&key).await.unwrap();
    let handler = env.handler.clone();
    eventually(|| {
        let handler = handler.clone();
        async move { handler.recycles.load(Ordering::SeqCst) == 1 }
    })
    .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(env.handler.recycles.load(Ordering::SeqCst), 1);
    assert!(env.handler.provisions.load(Ordering::SeqCst) >= 1);

    // Young instance went back to the pool without backend calls
    assert_eq!(env.provider.calls(), calls_after_provision);
    let pooled = env.manager().get(&instance_id).await.unwrap();
    assert_eq!(pooled.state(), ClusterState::Ready);
    assert!(pooled.request().is_none());

    env.stop().await;
}

#[tokio::test]
async fn test_reconciling_twice_makes_no_backend_calls() {
    let env = start(MockProvider::new(), PoolMode::OnDemand).await;
    let request = env
        .requests
        .create(ClusterRequest::new(NAMESPACE, "r1", request_config()))
        .await
        .unwrap();

    let manager = env.manager().clone();
    let key = request.key();
    eventually(|| {
        let manager = manager.clone();
        let key = key.clone();
        async move { manager.assignment(&key).await.is_some() }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let calls = env.provider.calls();
    let current = env.requests.get(&key).await.unwrap().unwrap();
    env.handler.provision_cluster(&current).await.unwrap();
    env.handler.provision_cluster(&current).await.unwrap();
    assert_eq!(env.provider.calls(), calls);

    env.stop().await;
}

#[tokio::test]
async fn test_failing_backend_retries_then_recovers() {
    let env = start(MockProvider::failing(), PoolMode::Fixed).await;
    let key = ObjectKey::new(NAMESPACE, "r1");
    env.requests
        .create(ClusterRequest::new(NAMESPACE, "r1", request_config()))
        .await
        .unwrap();

    let provider = env.provider.clone();
    eventually(|| {
        let provider = provider.clone();
        async move { provider.creates() >= 2 }
    })
    .await;
    env.provider.set_fail_creates(false);

    let manager = env.manager().clone();
    let watched = key.clone();
    eventually(|| {
        let manager = manager.clone();
        let watched = watched.clone();
        async move { manager.assignment(&watched).await.is_some() }
    })
    .await;

    env.stop().await;
}

#[tokio::test]
async fn test_request_dropped_after_retries_stays_unfulfilled() {
    let env = start(MockProvider::failing(), PoolMode::OnDemand).await;
    let key = ObjectKey::new(NAMESPACE, "r1");
    env.requests
        .create(ClusterRequest::new(NAMESPACE, "r1", request_config()))
        .await
        .unwrap();

    let provider = env.provider.clone();
    eventually(|| {
        let provider = provider.clone();
        async move { provider.creates() == 6 }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(env.provider.creates(), 6);
    assert_eq!(env.handler.provisions.load(Ordering::SeqCst), 6);
    assert!(env.requests.get(&key).await.unwrap().unwrap().status.is_none());

    env.stop().await;
}

#[tokio::test]
async fn test_external_instance_delete_is_forgotten() {
    let env = start(MockProvider::new(), PoolMode::Fixed).await;
    let key = ObjectKey::new(NAMESPACE, "r1");
    env.requests
        .create(ClusterRequest::new(NAMESPACE, "r1", request_config()))
        .await
        .unwrap();

    let manager = env.manager().clone();
    let watched = key.clone();
    eventually(|| {
        let manager = manager.clone();
        let watched = watched.clone();
        async move { manager.assignment(&watched).await.is_some() }
    })
    .await;
    let instance = env.manager().assignment(&key).await.unwrap();

    env.instances.delete(&instance.key()).await.unwrap();
    let manager = env.manager().clone();
    let id = instance.id();
    eventually(|| {
        let manager = manager.clone();
        async move { manager.get(&id).await.is_none() }
    })
    .await;

    // Nothing left to recycle, and no backend teardown for a forgotten instance
    env.requests.delete(&key).await.unwrap();
    let handler = env.handler.clone();
    eventually(|| {
        let handler = handler.clone();
        async move { handler.recycles.load(Ordering::SeqCst) == 1 }
    })
    .await;
    assert_eq!(env.provider.deletes(), 0);

    env.stop().await;
}

#[tokio::test]
async fn test_request_deleted_while_down_releases_its_cluster() {
    let env = start(MockProvider::new(), PoolMode::Fixed).await;
    let key = ObjectKey::new(NAMESPACE, "r1");
    env.requests
        .create(ClusterRequest::new(NAMESPACE, "r1", request_config()))
        .await
        .unwrap();

    let manager = env.manager().clone();
    let watched = key.clone();
    eventually(|| {
        let manager = manager.clone();
        let watched = watched.clone();
        async move { manager.assignment(&watched).await.is_some() }
    })
    .await;
    let bound = env.manager().assignment(&key).await.unwrap();
    let provider = env.provider.clone();
    let instances = env.instances.clone();
    env.stop().await;

    // Restart against the same instances; the request is gone
    let env = start_on(provider, request_store(), instances, PoolMode::Fixed).await;

    let released = env.manager().get(&bound.id()).await.unwrap();
    assert_eq!(released.state(), ClusterState::Ready);
    assert!(released.request().is_none());
    assert!(env.manager().assignments().await.is_empty());
    assert_eq!(
        env.instances.get(&released.key()).await.unwrap().unwrap().state(),
        ClusterState::Ready
    );
    assert_eq!(env.provider.deletes(), 0);

    // The released cluster serves the next request from the pool
    env.requests
        .create(ClusterRequest::new(NAMESPACE, "r2", request_config()))
        .await
        .unwrap();
    let manager = env.manager().clone();
    eventually(|| {
        let manager = manager.clone();
        async move {
            manager
                .assignment(&ObjectKey::new(NAMESPACE, "r2"))
                .await
                .is_some()
        }
    })
    .await;
    let reused = env
        .manager()
        .assignment(&ObjectKey::new(NAMESPACE, "r2"))
        .await
        .unwrap();
    assert_eq!(reused.id(), bound.id());
    assert_eq!(env.provider.creates(), 1);

    env.stop().await;
}

#[tokio::test]
async fn test_request_still_present_after_restart_keeps_its_cluster() {
    let env = start(MockProvider::new(), PoolMode::OnDemand).await;
    let key = ObjectKey::new(NAMESPACE, "r1");
    env.requests
        .create(ClusterRequest::new(NAMESPACE, "r1", request_config()))
        .await
        .unwrap();

    let manager = env.manager().clone();
    let watched = key.clone();
    eventually(|| {
        let manager = manager.clone();
        let watched = watched.clone();
        async move { manager.assignment(&watched).await.is_some() }
    })
    .await;
    let bound = env.manager().assignment(&key).await.unwrap();
    let (provider, requests, instances) =
        (env.provider.clone(), env.requests.clone(), env.instances.clone());
    env.stop().await;

    let env = start_on(provider, requests, instances, PoolMode::OnDemand).await;
    assert_eq!(env.manager().assignment(&key).await.unwrap().id(), bound.id());
    assert_eq!(env.provider.deletes(), 0);

    env.stop().await;
}

#[tokio::test]
async fn test_refused_claim_is_retried_without_a_second_cluster() {
    let env = start(MockProvider::new(), PoolMode::Fixed).await;
    // Creation and READY are recorded; the first claim write is refused
    env.instances.fail_writes_after(2, 1);
    env.requests
        .create(ClusterRequest::new(NAMESPACE, "r1", request_config()))
        .await
        .unwrap();

    let requests = env.requests.clone();
    eventually(|| {
        let requests = requests.clone();
        async move {
            requests
                .get(&ObjectKey::new(NAMESPACE, "r1"))
                .await
                .unwrap()
                .and_then(|r| r.status)
                .is_some()
        }
    })
    .await;

    assert!(env.handler.provisions.load(Ordering::SeqCst) >= 2);
    assert_eq!(env.provider.creates(), 1);
    assert_eq!(env.manager().len().await, 1);
    let instance = env.manager().list().await.remove(0);
    assert_eq!(instance.state(), ClusterState::InUse);
    assert_eq!(instance.request(), Some(&ObjectKey::new(NAMESPACE, "r1")));

    env.stop().await;
}
