use std::sync::Arc;

use async_trait::async_trait;
use clusterpool_reconcile::ObjectKey;
use tracing::{info, instrument, warn};

use super::AllocationPolicy;
use crate::error::PoolError;
use crate::manager::ClusterManager;
use crate::types::{ClusterConfig, ClusterInstance, ClusterState, InstanceId};

/// One fresh instance per request, destroyed on recycle.
pub struct OnDemand {
    manager: Arc<ClusterManager>,
}

impl OnDemand {
    pub fn new(manager: Arc<ClusterManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl AllocationPolicy for OnDemand {
    fn name(&self) -> &'static str {
        "on-demand"
    }

    fn manager(&self) -> &Arc<ClusterManager> {
        &self.manager
    }

    #[instrument(skip(self, request, config), fields(policy = "on-demand", request = %request))]
    async fn get(
        &self,
        request: &ObjectKey,
        config: &ClusterConfig,
    ) -> Result<ClusterInstance, PoolError> {
        let ready = self.manager.provision(config).await?;
        match self.manager.claim(&ready.id(), request).await {
            Ok(claimed) => Ok(claimed),
            Err(e) => {
                warn!(instance_id = %ready.id(), error = %e, "Claim failed, tearing down");
                self.manager.destroy(&ready.id()).await;
                Err(e)
            }
        }
    }

    #[instrument(skip(self), fields(policy = "on-demand"))]
    async fn recycle(&self, id: &InstanceId) -> Result<(), PoolError> {
        if self.manager.get(id).await.is_none() {
            panic!("recycle of unknown instance {id}");
        }
        self.manager.destroy(id).await;
        Ok(())
    }

    /// Anything not bound to a request is an orphan here.
    async fn restore(&self) -> Result<(), PoolError> {
        let roster = self.manager.restore().await?;
        let mut orphans = 0usize;
        for instance in roster {
            if instance.state() != ClusterState::InUse || instance.request().is_none() {
                self.manager.destroy(&instance.id()).await;
                orphans += 1;
            }
        }
        info!(orphans, "On-demand policy restored");
        Ok(())
    }
}
