//! Provisioning backend interface and mock implementation.
//!
//! The provider abstracts cluster lifecycle operations:
//! - Creating a cluster for a config
//! - Tearing a cluster down
//! - Polling a cluster's state while it comes up
//!
//! A mock implementation is provided for testing and development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::types::{ClusterConfig, ClusterInstance, ClusterState, InstanceId};

/// Cluster provisioning backend. Must tolerate concurrent calls.
#[async_trait]
pub trait ClusterProvider: Send + Sync {
    /// Start creating a cluster. The returned instance is usually CREATING.
    async fn create(&self, config: &ClusterConfig) -> Result<ClusterInstance>;

    /// Tear a cluster down.
    async fn delete(&self, instance: &ClusterInstance) -> Result<()>;

    /// Current state of a cluster.
    async fn check_status(&self, id: &InstanceId) -> Result<ClusterState>;
}

/// Mock provider for testing and development.
pub struct MockProvider {
    creates: AtomicU64,
    deletes: AtomicU64,
    status_checks: AtomicU64,

    /// Whether creates should fail.
    fail_creates: AtomicBool,

    /// Whether deletes should fail.
    fail_deletes: AtomicBool,

    /// CREATING answers per instance before it reports READY.
    creating_polls: u32,

    /// Subtracted from every creation timestamp.
    backdate: Mutex<chrono::Duration>,

    /// Remaining CREATING answers, or `None` once deleted.
    clusters: Mutex<HashMap<InstanceId, Option<u32>>>,
}

impl MockProvider {
    /// Create a new mock provider whose clusters are READY on first poll.
    pub fn new() -> Self {
        Self {
            creates: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            status_checks: AtomicU64::new(0),
            fail_creates: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            creating_polls: 0,
            backdate: Mutex::new(chrono::Duration::zero()),
            clusters: Mutex::new(HashMap::new()),
        }
    }

    /// Create a mock provider that fails all creates.
    pub fn failing() -> Self {
        let provider = Self::new();
        provider.set_fail_creates(true);
        provider
    }

    /// Report CREATING `polls` times before READY.
    pub fn with_creating_polls(mut self, polls: u32) -> Self {
        self.creating_polls = polls;
        self
    }

    /// Stamp new clusters as created `age` ago.
    pub fn with_backdate(self, age: chrono::Duration) -> Self {
        self.set_backdate(age);
        self
    }

    pub fn set_backdate(&self, age: chrono::Duration) {
        *self.backdate.lock().unwrap_or_else(|e| e.into_inner()) = age;
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn creates(&self) -> u64 {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn status_checks(&self) -> u64 {
        self.status_checks.load(Ordering::SeqCst)
    }

    /// Calls of any kind.
    pub fn calls(&self) -> u64 {
        self.creates() + self.deletes() + self.status_checks()
    }

    /// Clusters created and not yet deleted.
    pub fn live_clusters(&self) -> usize {
        self.clusters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|c| c.is_some())
            .count()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterProvider for MockProvider {
    async fn create(&self, config: &ClusterConfig) -> Result<ClusterInstance> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_creates.load(Ordering::SeqCst) {
            anyhow::bail!("Mock provider configured to fail");
        }

        let id = InstanceId::new();
        let backdate = *self.backdate.lock().unwrap_or_else(|e| e.into_inner());
        info!(
            instance_id = %id,
            num_nodes = config.num_nodes,
            cores_per_node = config.num_cores_per_node,
            version = %config.version,
            "[MOCK] Creating cluster"
        );

        self.clusters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Some(self.creating_polls));

        Ok(ClusterInstance::new(
            id,
            config.clone(),
            format!("apiVersion: v1\nkind: Config\ncurrent-context: {id}\n"),
            Utc::now() - backdate,
        ))
    }

    async fn delete(&self, instance: &ClusterInstance) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        info!(instance_id = %instance.id(), "[MOCK] Deleting cluster");
        if self.fail_deletes.load(Ordering::SeqCst) {
            anyhow::bail!("Mock provider configured to fail deletes");
        }

        self.clusters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(instance.id(), None);
        Ok(())
    }

    async fn check_status(&self, id: &InstanceId) -> Result<ClusterState> {
        self.status_checks.fetch_add(1, Ordering::SeqCst);
        let mut clusters = self.clusters.lock().unwrap_or_else(|e| e.into_inner());
        let state = match clusters.get_mut(id) {
            None => anyhow::bail!("unknown cluster {id}"),
            Some(None) => ClusterState::Deleted,
            Some(Some(0)) => ClusterState::Ready,
            Some(Some(remaining)) => {
                *remaining -= 1;
                ClusterState::Creating
            }
        };
        debug!(instance_id = %id, state = %state, "[MOCK] Checking cluster status");
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_provider_create() {
        let provider = MockProvider::new();
        let instance = provider.create(&ClusterConfig::default()).await.unwrap();

        assert_eq!(instance.state(), ClusterState::Creating);
        assert!(instance.status.kube_config.contains(&instance.id().to_string()));
        assert_eq!(provider.creates(), 1);
        assert_eq!(provider.live_clusters(), 1);
    }

    #[tokio::test]
    async fn test_mock_provider_polls_until_ready() {
        let provider = MockProvider::new().with_creating_polls(2);
        let instance = provider.create(&ClusterConfig::default()).await.unwrap();
        let id = instance.id();

        assert_eq!(provider.check_status(&id).await.unwrap(), ClusterState::Creating);
        assert_eq!(provider.check_status(&id).await.unwrap(), ClusterState::Creating);
        assert_eq!(provider.check_status(&id).await.unwrap(), ClusterState::Ready);
        assert_eq!(provider.status_checks(), 3);
    }

    #[tokio::test]
    async fn test_mock_provider_delete() {
        let provider = MockProvider::new();
        let instance = provider.create(&ClusterConfig::default()).await.unwrap();

        provider.delete(&instance).await.unwrap();
        assert_eq!(
            provider.check_status(&instance.id()).await.unwrap(),
            ClusterState::Deleted
        );
        assert_eq!(provider.live_clusters(), 0);
    }

    #[tokio::test]
    async fn test_mock_provider_unknown_cluster() {
        let provider = MockProvider::new();
        assert!(provider.check_status(&InstanceId::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_provider_failing() {
        let provider = MockProvider::failing();
        assert!(provider.create(&ClusterConfig::default()).await.is_err());
        assert_eq!(provider.creates(), 1);

        provider.set_fail_creates(false);
        assert!(provider.create(&ClusterConfig::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_provider_backdate() {
        let provider = MockProvider::new().with_backdate(chrono::Duration::hours(2));
        let instance = provider.create(&ClusterConfig::default()).await.unwrap();
        assert!(instance.is_expired(std::time::Duration::from_secs(3600), Utc::now()));
    }
}
