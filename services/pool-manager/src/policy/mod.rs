//! Allocation policies.
//!
//! A policy decides where an instance for a request comes from and what
//! happens to it afterwards:
//! - [`OnDemand`]: always create, always destroy
//! - [`FixedSizePools`]: hand out warm instances per fingerprint and take
//!   them back until they age out

mod fixed;
mod on_demand;

use std::sync::Arc;

use async_trait::async_trait;
use clusterpool_reconcile::ObjectKey;

pub use fixed::FixedSizePools;
pub use on_demand::OnDemand;

use crate::config::{PoolConfig, PoolMode};
use crate::error::PoolError;
use crate::manager::ClusterManager;
use crate::types::{ClusterConfig, ClusterInstance, InstanceId};

/// How instances are obtained and returned.
#[async_trait]
pub trait AllocationPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Roster the policy allocates from.
    fn manager(&self) -> &Arc<ClusterManager>;

    /// Return an instance matching `config`'s fingerprint, IN_USE and bound
    /// to `request`. On error no instance is left IN_USE.
    async fn get(
        &self,
        request: &ObjectKey,
        config: &ClusterConfig,
    ) -> Result<ClusterInstance, PoolError>;

    /// Take back an IN_USE instance.
    ///
    /// # Panics
    ///
    /// If the manager does not know the instance.
    async fn recycle(&self, id: &InstanceId) -> Result<(), PoolError>;

    /// Rebuild policy state from the store.
    async fn restore(&self) -> Result<(), PoolError>;

    /// Periodic upkeep.
    async fn maintain(&self) -> Result<(), PoolError> {
        Ok(())
    }

    /// Drop an instance that disappeared outside our control.
    async fn forget(&self, id: &InstanceId) {
        self.manager().forget(id).await;
    }
}

/// Build the policy selected by `config.mode`.
pub fn from_config(manager: Arc<ClusterManager>, config: &PoolConfig) -> Arc<dyn AllocationPolicy> {
    match config.mode {
        PoolMode::OnDemand => Arc::new(OnDemand::new(manager)),
        PoolMode::Fixed => Arc::new(FixedSizePools::new(manager, config.pool_size, config.life_span)),
    }
}
