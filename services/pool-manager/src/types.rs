//! Cluster request and instance objects.
//!
//! Both kinds are stored as namespaced objects with camelCase JSON:
//!
//! - `ClusterRequest`: written by a consumer, status written by the manager
//! - `ClusterInstance`: one provisioned cluster, keyed `namespace/<instance id>`

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clusterpool_reconcile::{Fingerprint, ObjectKey, ObjectMeta, Resource, DEFAULT_NAMESPACE};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::PoolError;

/// Kind name for requests.
pub const CLUSTER_REQUEST_KIND: &str = "ClusterRequest";
/// Collection name for requests.
pub const CLUSTER_REQUEST_PLURAL: &str = "clusterrequests";
/// Kind name for instances.
pub const CLUSTER_INSTANCE_KIND: &str = "ClusterInstance";
/// Collection name for instances.
pub const CLUSTER_INSTANCE_PLURAL: &str = "clusterinstances";

/// Typed ULID for a cluster instance, formatted `ci_<ulid>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(Ulid);

impl InstanceId {
    pub const PREFIX: &'static str = "ci";

    /// Creates a new ID with a fresh ULID.
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    #[must_use]
    pub const fn ulid(&self) -> Ulid {
        self.0
    }

    /// Parses `ci_<ulid>`.
    pub fn parse(s: &str) -> Result<Self, PoolError> {
        let Some((prefix, ulid_str)) = s.split_once('_') else {
            return Err(PoolError::InvalidId(s.to_string()));
        };
        if prefix != Self::PREFIX {
            return Err(PoolError::InvalidId(s.to_string()));
        }
        let ulid = ulid_str
            .parse::<Ulid>()
            .map_err(|e| PoolError::InvalidId(format!("{s}: {e}")))?;
        Ok(Self(ulid))
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", Self::PREFIX, self.0)
    }
}

impl FromStr for InstanceId {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for InstanceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for InstanceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Shape of a cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// How long the consumer expects to hold the cluster. Not part of the
    /// fingerprint.
    #[serde(default, with = "duration_secs")]
    pub ttl: Duration,

    #[serde(default)]
    pub num_cores_per_node: u32,

    #[serde(default)]
    pub num_nodes: u32,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub rbac: bool,
}

impl ClusterConfig {
    /// Pool identity: every field except `ttl`.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_json(&serde_json::json!({
            "numCoresPerNode": self.num_cores_per_node,
            "numNodes": self.num_nodes,
            "version": self.version,
            "rbac": self.rbac,
        }))
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// Lifecycle of a cluster instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterState {
    Creating,
    Ready,
    InUse,
    Deleted,
}

impl ClusterState {
    /// Whether moving from `self` to `next` is allowed.
    ///
    /// Forward along CREATING, READY, IN_USE; IN_USE back to READY for
    /// pooling; anything to DELETED. Staying put is always allowed.
    pub fn can_transition_to(self, next: ClusterState) -> bool {
        use ClusterState::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Deleted, _) => false,
            (_, Deleted) => true,
            (Creating, Ready) | (Ready, InUse) | (InUse, Ready) => true,
            _ => false,
        }
    }

    /// Members of a pool queue must be in one of these states.
    pub fn is_poolable(self) -> bool {
        matches!(self, ClusterState::Creating | ClusterState::Ready)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClusterState::Creating => "CREATING",
            ClusterState::Ready => "READY",
            ClusterState::InUse => "IN_USE",
            ClusterState::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status the manager writes onto a satisfied request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    pub state: ClusterState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<InstanceId>,

    #[serde(default)]
    pub kube_config: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRequestSpec {
    pub config: ClusterConfig,
}

/// A consumer's ask for one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRequest {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: ClusterRequestSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ClusterStatus>,
}

impl ClusterRequest {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, config: ClusterConfig) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec: ClusterRequestSpec { config },
            status: None,
        }
    }

    /// Stand-in for a request whose last state is unknown. Carries only
    /// the key.
    pub fn placeholder(key: &ObjectKey) -> Self {
        Self::new(key.namespace.clone(), key.name.clone(), ClusterConfig::default())
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.spec.config
    }
}

impl Resource for ClusterRequest {
    const KIND: &'static str = CLUSTER_REQUEST_KIND;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInstanceSpec {
    pub id: InstanceId,
    pub config: ClusterConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub state: ClusterState,

    #[serde(default)]
    pub kube_config: String,

    pub created_at: DateTime<Utc>,

    /// Request this instance is bound to while IN_USE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<ObjectKey>,
}

/// One provisioned cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInstance {
    pub metadata: ObjectMeta,
    pub spec: ClusterInstanceSpec,
    pub status: InstanceStatus,
}

impl ClusterInstance {
    /// A fresh CREATING instance in the default namespace.
    pub fn new(
        id: InstanceId,
        config: ClusterConfig,
        kube_config: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            metadata: ObjectMeta::new(DEFAULT_NAMESPACE, id.to_string()),
            spec: ClusterInstanceSpec { id, config },
            status: InstanceStatus {
                state: ClusterState::Creating,
                kube_config: kube_config.into(),
                created_at,
                request: None,
            },
        }
    }

    /// Move the object to `namespace`. The name stays the instance ID.
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.metadata.namespace = namespace.into();
        self
    }

    pub fn id(&self) -> InstanceId {
        self.spec.id
    }

    pub fn state(&self) -> ClusterState {
        self.status.state
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.spec.config
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.spec.config.fingerprint()
    }

    pub fn request(&self) -> Option<&ObjectKey> {
        self.status.request.as_ref()
    }

    /// True once the instance is at least `life_span` old at `now`.
    pub fn is_expired(&self, life_span: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.status.created_at)
            .to_std()
            .is_ok_and(|age| age >= life_span)
    }
}

impl Resource for ClusterInstance {
    const KIND: &'static str = CLUSTER_INSTANCE_KIND;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}
