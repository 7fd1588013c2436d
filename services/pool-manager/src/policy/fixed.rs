use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use clusterpool_reconcile::{Fingerprint, ObjectKey};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use super::AllocationPolicy;
use crate::error::PoolError;
use crate::manager::ClusterManager;
use crate::pool::PoolQueue;
use crate::types::{ClusterConfig, ClusterInstance, ClusterState, InstanceId};

/// Warm pools keyed by config fingerprint.
///
/// Each queue sits behind its own lock; the map lock is only held to find
/// or create a queue. Backend calls never happen under a queue lock.
pub struct FixedSizePools {
    manager: Arc<ClusterManager>,
    pool_size: usize,
    life_span: Duration,
    queues: RwLock<HashMap<Fingerprint, Arc<Mutex<PoolQueue>>>>,
}

impl FixedSizePools {
    pub fn new(manager: Arc<ClusterManager>, pool_size: usize, life_span: Duration) -> Self {
        Self {
            manager,
            pool_size,
            life_span,
            queues: RwLock::new(HashMap::new()),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn life_span(&self) -> Duration {
        self.life_span
    }

    async fn queue_for(&self, config: &ClusterConfig) -> Arc<Mutex<PoolQueue>> {
        let fingerprint = config.fingerprint();
        if let Some(queue) = self.queues.read().await.get(&fingerprint) {
            return Arc::clone(queue);
        }
        let mut queues = self.queues.write().await;
        Arc::clone(queues.entry(fingerprint).or_insert_with(|| {
            debug!(fingerprint = %config.fingerprint(), size = self.pool_size, "New pool queue");
            Arc::new(Mutex::new(PoolQueue::new(config.clone(), self.pool_size)))
        }))
    }

    async fn all_queues(&self) -> Vec<Arc<Mutex<PoolQueue>>> {
        self.queues.read().await.values().cloned().collect()
    }

    /// Members currently pooled for `config`'s fingerprint.
    pub async fn pooled(&self, config: &ClusterConfig) -> Vec<ClusterInstance> {
        let queue = self.queue_for(config).await;
        let queue = queue.lock().await;
        queue.members().cloned().collect()
    }

    /// Push into a queue and destroy whatever it evicts.
    async fn enqueue(&self, queue: &Mutex<PoolQueue>, instance: ClusterInstance) {
        let evicted = queue.lock().await.push(instance);
        if let Some(evicted) = evicted {
            info!(instance_id = %evicted.id(), "Pool full, evicting oldest member");
            self.manager.destroy(&evicted.id()).await;
        }
    }

    /// Provision up to the queue's deficit. Failures are logged; the next
    /// refill or maintenance pass tries again.
    async fn refill(&self, queue: &Mutex<PoolQueue>) {
        let (template, deficit) = {
            let mut q = queue.lock().await;
            let deficit = q.deficit();
            q.begin_provisioning(deficit);
            (q.template().clone(), deficit)
        };
        if deficit == 0 {
            return;
        }
        info!(fingerprint = %template.fingerprint(), deficit, "Refilling pool");

        for _ in 0..deficit {
            let result = self.manager.provision(&template).await;
            queue.lock().await.finish_provisioning();
            match result {
                Ok(instance) => self.enqueue(queue, instance).await,
                Err(e) => warn!(fingerprint = %template.fingerprint(), error = %e, "Refill provisioning failed"),
            }
        }
    }
}

#[async_trait]
impl AllocationPolicy for FixedSizePools {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn manager(&self) -> &Arc<ClusterManager> {
        &self.manager
    }

    #[instrument(
        skip(self, request, config),
        fields(policy = "fixed", request = %request, fingerprint = %config.fingerprint())
    )]
    async fn get(
        &self,
        request: &ObjectKey,
        config: &ClusterConfig,
    ) -> Result<ClusterInstance, PoolError> {
        let queue = self.queue_for(config).await;
        let popped = queue.lock().await.pop_ready();

        let ready = match popped {
            Some(instance) => {
                debug!(instance_id = %instance.id(), "Pool hit");
                instance
            }
            None => {
                info!("Pool empty, provisioning synchronously");
                self.manager.provision(config).await?
            }
        };
        match self.manager.claim(&ready.id(), request).await {
            Ok(claimed) => Ok(claimed),
            Err(e) => {
                // Still READY and unbound: keep it warm for the retry
                warn!(instance_id = %ready.id(), error = %e, "Claim failed, returning instance to pool");
                if let Some(current) = self.manager.get(&ready.id()).await {
                    if current.state() == ClusterState::Ready {
                        self.enqueue(&queue, current).await;
                    }
                }
                Err(e)
            }
        }
    }

    #[instrument(skip(self), fields(policy = "fixed"))]
    async fn recycle(&self, id: &InstanceId) -> Result<(), PoolError> {
        let Some(instance) = self.manager.get(id).await else {
            panic!("recycle of unknown instance {id}");
        };
        let queue = self.queue_for(instance.config()).await;

        if instance.is_expired(self.life_span, Utc::now()) {
            info!(instance_id = %id, "Instance past its life span, destroying");
            self.manager.destroy(id).await;
            self.refill(&queue).await;
            return Ok(());
        }

        let ready = self.manager.transition(id, ClusterState::Ready).await?;
        debug!(instance_id = %id, "Returning instance to pool");
        self.enqueue(&queue, ready).await;
        Ok(())
    }

    /// Re-derive pool membership from the restored roster.
    async fn restore(&self) -> Result<(), PoolError> {
        let roster = self.manager.restore().await?;
        let mut pooled = 0usize;
        for instance in roster {
            if !instance.state().is_poolable() {
                continue;
            }
            let queue = self.queue_for(instance.config()).await;
            self.enqueue(&queue, instance).await;
            pooled += 1;
        }
        let queues = self.queues.read().await.len();
        info!(pooled, queues, "Fixed pools restored");
        Ok(())
    }

    /// Promote members that finished creating and top every queue up.
    async fn maintain(&self) -> Result<(), PoolError> {
        for queue in self.all_queues().await {
            let creating = queue.lock().await.creating();
            for id in creating {
                match self.manager.refresh(&id).await {
                    Ok(instance) => {
                        queue.lock().await.update(instance);
                    }
                    Err(e) => {
                        warn!(instance_id = %id, error = %e, "Dropping pooled instance");
                        queue.lock().await.remove(&id);
                    }
                }
            }
            self.refill(&queue).await;
        }
        Ok(())
    }

    async fn forget(&self, id: &InstanceId) {
        for queue in self.all_queues().await {
            if queue.lock().await.remove(id).is_some() {
                debug!(instance_id = %id, "Removed forgotten instance from pool");
            }
        }
        self.manager.forget(id).await;
    }
}
