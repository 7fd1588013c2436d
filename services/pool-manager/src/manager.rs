//! Cluster manager: the roster of every instance this process owns.
//!
//! The manager:
//! - Provisions instances through the provider and waits for READY
//! - Applies state transitions and persists every change as a
//!   `ClusterInstance` object
//! - Tracks which request each IN_USE instance is bound to; an instance
//!   only becomes IN_USE together with its binding
//! - Rebuilds all of that from the store on restart
//!
//! Policies decide *when* to provision or destroy; this type only knows *how*.

use std::collections::HashMap;
use std::sync::Arc;

use clusterpool_reconcile::{ObjectKey, Resource, ResourceStore, Selector, StoreError};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::provider::ClusterProvider;
use crate::types::{ClusterConfig, ClusterInstance, ClusterState, InstanceId};

/// Instance roster plus request assignments.
pub struct ClusterManager {
    namespace: String,
    provider: Arc<dyn ClusterProvider>,
    store: Arc<dyn ResourceStore<ClusterInstance>>,
    config: PoolConfig,

    /// Every live instance by ID.
    roster: RwLock<HashMap<InstanceId, ClusterInstance>>,

    /// Request key to the instance bound to it.
    assignments: RwLock<HashMap<ObjectKey, InstanceId>>,
}

impl ClusterManager {
    pub fn new(
        namespace: impl Into<String>,
        provider: Arc<dyn ClusterProvider>,
        store: Arc<dyn ResourceStore<ClusterInstance>>,
        config: PoolConfig,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            provider,
            store,
            config,
            roster: RwLock::new(HashMap::new()),
            assignments: RwLock::new(HashMap::new()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub async fn get(&self, id: &InstanceId) -> Option<ClusterInstance> {
        self.roster.read().await.get(id).cloned()
    }

    /// Every live instance, oldest first.
    pub async fn list(&self) -> Vec<ClusterInstance> {
        let mut instances: Vec<_> = self.roster.read().await.values().cloned().collect();
        instances.sort_by_key(|i| (i.status.created_at, i.id()));
        instances
    }

    pub async fn len(&self) -> usize {
        self.roster.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.roster.read().await.is_empty()
    }

    /// Instance currently bound to `request`.
    pub async fn assignment(&self, request: &ObjectKey) -> Option<ClusterInstance> {
        let id = *self.assignments.read().await.get(request)?;
        self.get(&id).await
    }

    /// Snapshot of request-to-instance bindings.
    pub async fn assignments(&self) -> HashMap<ObjectKey, InstanceId> {
        self.assignments.read().await.clone()
    }

    /// Create an instance and wait until the provider reports READY.
    ///
    /// The instance joins the roster (and the store) as soon as the
    /// provider returns it. Every failure after that point tears the
    /// half-built instance down before the error is returned.
    #[instrument(skip(self, config), fields(version = %config.version, num_nodes = config.num_nodes))]
    pub async fn provision(&self, config: &ClusterConfig) -> Result<ClusterInstance, PoolError> {
        let started = Instant::now();
        let mut instance = self
            .provider
            .create(config)
            .await
            .map_err(PoolError::Provision)?
            .in_namespace(self.namespace.clone());
        instance.status.request = None;
        let id = instance.id();
        info!(instance_id = %id, fingerprint = %instance.fingerprint(), "Instance created");

        self.roster.write().await.insert(id, instance.clone());
        if let Err(e) = self.persist(&instance).await {
            warn!(instance_id = %id, error = %e, "Failed to record new instance, tearing down");
            self.destroy(&id).await;
            return Err(e);
        }

        while instance.state() == ClusterState::Creating {
            if started.elapsed() >= self.config.provision_timeout {
                warn!(instance_id = %id, "Instance not ready in time, tearing down");
                self.destroy(&id).await;
                return Err(PoolError::ProvisionTimeout {
                    id,
                    elapsed: started.elapsed(),
                });
            }

            let state = match self.provider.check_status(&id).await {
                Ok(state) => state,
                Err(e) => {
                    self.destroy(&id).await;
                    return Err(PoolError::Provision(e));
                }
            };
            match state {
                ClusterState::Creating => {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                ClusterState::Ready => match self.transition(&id, ClusterState::Ready).await {
                    Ok(ready) => instance = ready,
                    Err(e) => {
                        warn!(instance_id = %id, error = %e, "Failed to record READY, tearing down");
                        self.destroy(&id).await;
                        return Err(e);
                    }
                },
                other => {
                    warn!(instance_id = %id, state = %other, "Instance failed while provisioning");
                    self.destroy(&id).await;
                    return Err(PoolError::ProvisionAborted { id, state: other });
                }
            }
        }

        info!(
            instance_id = %id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Instance ready"
        );
        Ok(instance)
    }

    /// Poll the provider once for a CREATING instance and record READY.
    pub async fn refresh(&self, id: &InstanceId) -> Result<ClusterInstance, PoolError> {
        let Some(current) = self.get(id).await else {
            return Err(PoolError::UnknownInstance(*id));
        };
        if current.state() != ClusterState::Creating {
            return Ok(current);
        }
        match self.provider.check_status(id).await.map_err(PoolError::Provision)? {
            ClusterState::Ready => self.transition(id, ClusterState::Ready).await,
            ClusterState::Creating => Ok(current),
            other => {
                warn!(instance_id = %id, state = %other, "Instance lost while creating");
                self.destroy(id).await;
                Err(PoolError::ProvisionAborted { id: *id, state: other })
            }
        }
    }

    /// Move an instance to `next` and persist it.
    ///
    /// Leaving IN_USE clears the request binding. The roster only changes
    /// once the store write succeeds, so on error the instance is exactly as
    /// it was.
    ///
    /// # Panics
    ///
    /// If the instance is unknown or the transition is illegal.
    pub async fn transition(
        &self,
        id: &InstanceId,
        next: ClusterState,
    ) -> Result<ClusterInstance, PoolError> {
        let Some(mut updated) = self.get(id).await else {
            panic!("transition of unknown instance {id} to {next}");
        };
        let current = updated.state();
        assert!(
            current.can_transition_to(next),
            "illegal transition for instance {id}: {current} -> {next}"
        );
        updated.status.state = next;
        if next != ClusterState::InUse {
            updated.status.request = None;
        }

        self.persist(&updated).await?;
        if !self.commit(&updated).await {
            return Err(PoolError::UnknownInstance(*id));
        }
        if next != ClusterState::InUse {
            self.assignments.write().await.retain(|_, bound| bound != id);
        }
        debug!(instance_id = %id, from = %current, to = %next, "Instance transition");
        Ok(updated)
    }

    /// Move a READY instance to IN_USE bound to `request`, in one write.
    ///
    /// On error nothing changed: the instance is still READY and unbound.
    ///
    /// # Panics
    ///
    /// If the instance is unknown or not READY.
    pub async fn claim(
        &self,
        id: &InstanceId,
        request: &ObjectKey,
    ) -> Result<ClusterInstance, PoolError> {
        let Some(mut updated) = self.get(id).await else {
            panic!("claim of unknown instance {id}");
        };
        assert_eq!(
            updated.state(),
            ClusterState::Ready,
            "only READY instances can be claimed"
        );
        updated.status.state = ClusterState::InUse;
        updated.status.request = Some(request.clone());

        self.persist(&updated).await?;
        if !self.commit(&updated).await {
            return Err(PoolError::UnknownInstance(*id));
        }
        self.assignments.write().await.insert(request.clone(), *id);
        info!(instance_id = %id, request = %request, "Instance claimed");
        Ok(updated)
    }

    /// Store a persisted instance in the roster. An instance destroyed while
    /// its write was in flight stays gone, and its object is removed again.
    async fn commit(&self, instance: &ClusterInstance) -> bool {
        let id = instance.id();
        {
            let mut roster = self.roster.write().await;
            if let Some(slot) = roster.get_mut(&id) {
                *slot = instance.clone();
                return true;
            }
        }
        debug!(instance_id = %id, "Instance forgotten during write");
        if let Err(e) = self.store.delete(&instance.key()).await {
            if !matches!(e, StoreError::NotFound(_)) {
                warn!(instance_id = %id, error = %e, "Failed to remove stale instance object");
            }
        }
        false
    }

    /// Tear an instance down. Backend failures are logged; the instance is
    /// marked DELETED and dropped from the roster and store regardless.
    #[instrument(skip(self))]
    pub async fn destroy(&self, id: &InstanceId) {
        let Some(instance) = self.get(id).await else {
            debug!(instance_id = %id, "Destroy of instance already gone");
            return;
        };

        if let Err(e) = self.provider.delete(&instance).await {
            warn!(instance_id = %id, error = %e, "Backend teardown failed, marking deleted anyway");
        }

        let mut deleted = instance;
        deleted.status.state = ClusterState::Deleted;
        deleted.status.request = None;
        self.forget(id).await;
        if let Err(e) = self.persist(&deleted).await {
            warn!(instance_id = %id, error = %e, "Failed to remove instance object");
        }
        info!(instance_id = %id, "Instance destroyed");
    }

    /// Drop an instance from local state without touching the backend.
    pub async fn forget(&self, id: &InstanceId) -> Option<ClusterInstance> {
        let removed = self.roster.write().await.remove(id);
        self.assignments.write().await.retain(|_, bound| bound != id);
        removed
    }

    /// Write an instance's current state to the store. DELETED instances are
    /// removed instead.
    pub async fn persist(&self, instance: &ClusterInstance) -> Result<(), PoolError> {
        if instance.state() == ClusterState::Deleted {
            return match self.store.delete(&instance.key()).await {
                Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
                Err(e) => Err(e.into()),
            };
        }
        self.store.apply(instance.clone()).await?;
        Ok(())
    }

    /// Rebuild the roster and assignments from the store.
    ///
    /// CREATING instances are re-polled, DELETED ones purged. Returns the
    /// live roster, oldest first.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn restore(&self) -> Result<Vec<ClusterInstance>, PoolError> {
        let stored = self.store.list(&Selector::namespaced(self.namespace.clone())).await?;
        let mut purged = 0usize;

        for mut instance in stored {
            let id = instance.id();
            match instance.state() {
                ClusterState::Deleted => {
                    self.persist(&instance).await?;
                    purged += 1;
                    continue;
                }
                ClusterState::Creating => match self.provider.check_status(&id).await {
                    Ok(ClusterState::Ready) => {
                        instance.status.state = ClusterState::Ready;
                        self.persist(&instance).await?;
                    }
                    Ok(ClusterState::Creating) => {}
                    Ok(other) => {
                        warn!(instance_id = %id, state = %other, "Stored instance lost while creating");
                        instance.status.state = ClusterState::Deleted;
                        self.persist(&instance).await?;
                        purged += 1;
                        continue;
                    }
                    Err(e) => {
                        warn!(instance_id = %id, error = %e, "Status check failed during restore");
                    }
                },
                ClusterState::Ready | ClusterState::InUse => {}
            }

            if instance.state() == ClusterState::InUse {
                if let Some(request) = instance.request() {
                    self.assignments.write().await.insert(request.clone(), id);
                }
            }
            self.roster.write().await.insert(id, instance);
        }

        let roster = self.list().await;
        info!(instances = roster.len(), purged, "Roster restored");
        Ok(roster)
    }
}
