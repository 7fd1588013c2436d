//! Cluster pool manager.
//!
//! Watches `ClusterRequest` objects and binds each one to a ready cluster,
//! either freshly provisioned or taken from a warm pool. Deleting the
//! request hands the cluster back.
//!
//! ## Architecture
//!
//! - **Controller**: generic watch/queue/retry engine from `clusterpool-reconcile`
//! - **Handlers**: `RequestReconciler` over a `PoolHandler`, plus
//!   `InstanceReconciler` for instances removed behind our back
//! - **Policy**: `OnDemand` or `FixedSizePools`
//! - **Cluster Manager**: roster, assignments, persistence
//! - **Provider**: abstracts cluster lifecycle (mock in dev)

pub mod config;
pub mod error;
pub mod handler;
pub mod manager;
pub mod policy;
pub mod pool;
pub mod provider;
pub mod types;

use clusterpool_reconcile::TypeRegistry;

pub use config::{Config, PoolConfig, PoolMode};
pub use error::PoolError;
pub use handler::{ClusterRequestHandler, InstanceReconciler, PoolHandler, RequestReconciler};
pub use manager::ClusterManager;
pub use policy::{AllocationPolicy, FixedSizePools, OnDemand};
pub use pool::PoolQueue;
pub use provider::{ClusterProvider, MockProvider};
pub use types::{
    ClusterConfig, ClusterInstance, ClusterRequest, ClusterState, ClusterStatus, InstanceId,
};

/// Registry holding both kinds this service stores.
pub fn registry() -> TypeRegistry {
    TypeRegistry::new()
        .register::<ClusterRequest>(types::CLUSTER_REQUEST_PLURAL, true)
        .register::<ClusterInstance>(types::CLUSTER_INSTANCE_PLURAL, true)
}
