//! Request and instance handlers wired into the reconciliation engine.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clusterpool_reconcile::{
    EventKind, ObjectKey, Resource, ResourceHandler, ResourceStore, Selector, StoreError,
};
use tracing::{debug, info, instrument, warn};

use crate::policy::AllocationPolicy;
use crate::types::{ClusterInstance, ClusterRequest, ClusterState, ClusterStatus, InstanceId};

/// Domain contract for request lifecycle.
#[async_trait]
pub trait ClusterRequestHandler: Send + Sync {
    /// The request exists: make sure it is bound to a ready cluster.
    async fn provision_cluster(&self, request: &ClusterRequest) -> anyhow::Result<()>;

    /// The request is gone: give its cluster back.
    async fn recycle_cluster(&self, request: &ClusterRequest) -> anyhow::Result<()>;
}

/// Satisfies requests from an [`AllocationPolicy`] and writes status back.
pub struct PoolHandler {
    policy: Arc<dyn AllocationPolicy>,
    requests: Arc<dyn ResourceStore<ClusterRequest>>,
}

impl PoolHandler {
    pub fn new(
        policy: Arc<dyn AllocationPolicy>,
        requests: Arc<dyn ResourceStore<ClusterRequest>>,
    ) -> Self {
        Self { policy, requests }
    }

    pub fn policy(&self) -> &Arc<dyn AllocationPolicy> {
        &self.policy
    }

    /// Recycle instances bound to requests that no longer exist.
    ///
    /// A request deleted while the process was down never produces a delete
    /// event, so its binding survives restore. Run this after restore and
    /// before the controller starts. Returns how many bindings were released.
    pub async fn release_orphans(&self) -> anyhow::Result<usize> {
        let manager = self.policy.manager();
        // Snapshot bindings before listing: a binding can only appear after
        // its request exists, so nothing live is mistaken for an orphan
        let bound = manager.assignments().await;
        if bound.is_empty() {
            return Ok(0);
        }

        let live: HashSet<ObjectKey> = self
            .requests
            .list(&Selector::namespaced(manager.namespace()))
            .await
            .context("listing requests")?
            .iter()
            .map(Resource::key)
            .collect();

        let mut released = 0usize;
        for (key, id) in bound {
            if live.contains(&key) {
                continue;
            }
            info!(request = %key, instance_id = %id, "Request gone, releasing its cluster");
            match self.recycle_cluster(&ClusterRequest::placeholder(&key)).await {
                Ok(()) => released += 1,
                Err(e) => warn!(request = %key, error = %e, "Failed to release orphaned cluster"),
            }
        }
        Ok(released)
    }

    /// Write `IN_USE` status for `instance` unless the request already has it.
    async fn write_status(
        &self,
        request: &ClusterRequest,
        instance: &ClusterInstance,
    ) -> anyhow::Result<()> {
        let desired = ClusterStatus {
            state: ClusterState::InUse,
            instance: Some(instance.id()),
            kube_config: instance.status.kube_config.clone(),
        };
        if request.status.as_ref() == Some(&desired) {
            return Ok(());
        }

        let mut updated = request.clone();
        updated.status = Some(desired);
        match self.requests.update(updated).await {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound(_)) => {
                // Deleted meanwhile; its delete event recycles the instance
                debug!(request = %request.key(), "Request gone before status write");
                Ok(())
            }
            Err(e) => Err(e).context("writing request status"),
        }
    }
}

#[async_trait]
impl ClusterRequestHandler for PoolHandler {
    #[instrument(skip(self, request), fields(request = %request.key(), policy = self.policy.name()))]
    async fn provision_cluster(&self, request: &ClusterRequest) -> anyhow::Result<()> {
        let key = request.key();
        let manager = self.policy.manager();

        if let Some(bound) = manager.assignment(&key).await {
            if bound.state() == ClusterState::InUse {
                debug!(instance_id = %bound.id(), "Request already satisfied");
                return self.write_status(request, &bound).await;
            }
        }

        let instance = self.policy.get(&key, request.config()).await?;
        info!(instance_id = %instance.id(), "Request provisioned");
        self.write_status(request, &instance).await
    }

    #[instrument(skip(self, request), fields(request = %request.key(), policy = self.policy.name()))]
    async fn recycle_cluster(&self, request: &ClusterRequest) -> anyhow::Result<()> {
        let key = request.key();
        let Some(bound) = self.policy.manager().assignment(&key).await else {
            info!("No cluster assigned, nothing to recycle");
            return Ok(());
        };

        self.policy.recycle(&bound.id()).await?;
        info!(instance_id = %bound.id(), "Request recycled");
        Ok(())
    }
}

/// Routes `ClusterRequest` reconciles to a [`ClusterRequestHandler`].
pub struct RequestReconciler {
    handler: Arc<dyn ClusterRequestHandler>,
}

impl RequestReconciler {
    pub fn new(handler: Arc<dyn ClusterRequestHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl ResourceHandler<ClusterRequest> for RequestReconciler {
    async fn reconcile(
        &self,
        key: &ObjectKey,
        object: Option<Arc<ClusterRequest>>,
        tombstone: Option<Arc<ClusterRequest>>,
        event: EventKind,
    ) -> anyhow::Result<()> {
        debug!(request = %key, event = %event, present = object.is_some(), "Reconciling request");
        match (object, tombstone) {
            (Some(request), _) => self.handler.provision_cluster(&request).await,
            (None, Some(last_known)) => self.handler.recycle_cluster(&last_known).await,
            (None, None) => {
                self.handler
                    .recycle_cluster(&ClusterRequest::placeholder(key))
                    .await
            }
        }
    }
}

/// Keeps the roster in line with instance objects removed behind our back.
pub struct InstanceReconciler {
    policy: Arc<dyn AllocationPolicy>,
}

impl InstanceReconciler {
    pub fn new(policy: Arc<dyn AllocationPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl ResourceHandler<ClusterInstance> for InstanceReconciler {
    async fn reconcile(
        &self,
        key: &ObjectKey,
        object: Option<Arc<ClusterInstance>>,
        _tombstone: Option<Arc<ClusterInstance>>,
        _event: EventKind,
    ) -> anyhow::Result<()> {
        let id = match &object {
            Some(instance) if instance.state() != ClusterState::Deleted => return Ok(()),
            Some(instance) => instance.id(),
            None => match InstanceId::parse(&key.name) {
                Ok(id) => id,
                Err(e) => {
                    debug!(key = %key, error = %e, "Ignoring object that is not an instance");
                    return Ok(());
                }
            },
        };

        if self.policy.manager().get(&id).await.is_some() {
            info!(instance_id = %id, "Instance removed externally, forgetting");
            self.policy.forget(&id).await;
        }
        Ok(())
    }
}
