//! Object identity shared by stores, caches and queues.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Namespace used when an object does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Namespace-qualified object name.
///
/// This is the reconciliation key: the queue deduplicates on it and the
/// caches index by it. Displayed as `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = StoreError;

    /// Parses `namespace/name`, or a bare `name` in the default namespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, name) = match s.split_once('/') {
            Some((ns, name)) => (ns, name),
            None => (DEFAULT_NAMESPACE, s),
        };
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return Err(StoreError::InvalidKey(s.to_string()));
        }
        Ok(Self::new(namespace, name))
    }
}

/// Metadata carried by every stored object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }
}

/// A declarative object kind the engine can watch.
///
/// `PartialEq` is what the event cache uses to drop no-op updates.
pub trait Resource: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Kind name, e.g. `ClusterRequest`. Must be registered in the
    /// [`TypeRegistry`](crate::TypeRegistry) handed to the store.
    const KIND: &'static str;

    fn metadata(&self) -> &ObjectMeta;

    fn key(&self) -> ObjectKey {
        self.metadata().key()
    }
}

/// Restricts list/watch to a namespace and/or a label set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl Selector {
    /// Every object of the kind, in every namespace.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn namespaced(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        if let Some(ns) = &self.namespace {
            if ns != &meta.namespace {
                return false;
            }
        }
        self.labels
            .iter()
            .all(|(k, v)| meta.labels.get(k).is_some_and(|actual| actual == v))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_key_display_and_parse() {
        let key = ObjectKey::new("pools", "r1");
        assert_eq!(key.to_string(), "pools/r1");
        assert_eq!("pools/r1".parse::<ObjectKey>().unwrap(), key);
        assert_eq!(
            "r1".parse::<ObjectKey>().unwrap(),
            ObjectKey::new(DEFAULT_NAMESPACE, "r1")
        );
    }

    #[rstest]
    #[case("")]
    #[case("ns/")]
    #[case("/name")]
    #[case("a/b/c")]
    fn test_key_parse_rejects_garbage(#[case] input: &str) {
        assert!(matches!(
            input.parse::<ObjectKey>(),
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_selector_matches() {
        let mut meta = ObjectMeta::new("ci", "r1");
        meta.labels.insert("team".to_string(), "infra".to_string());

        assert!(Selector::all().matches(&meta));
        assert!(Selector::namespaced("ci").matches(&meta));
        assert!(!Selector::namespaced("prod").matches(&meta));
        assert!(Selector::namespaced("ci")
            .with_label("team", "infra")
            .matches(&meta));
        assert!(!Selector::all().with_label("team", "web").matches(&meta));
    }
}
