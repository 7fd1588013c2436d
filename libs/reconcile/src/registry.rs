//! Explicit registry of object kinds known to a store adapter.
//!
//! Store adapters are constructed with a registry value and refuse to serve
//! kinds that were never registered. There is no process-wide table.

use std::collections::BTreeMap;

use crate::error::StoreError;
use crate::object::Resource;

/// Static description of one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindInfo {
    pub kind: &'static str,
    /// Collection name used by REST-style stores (`clusterrequests`).
    pub plural: &'static str,
    pub namespaced: bool,
}

/// Kind name to [`KindInfo`] mapping, injected into stores.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    kinds: BTreeMap<&'static str, KindInfo>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `K` under its [`Resource::KIND`]. Re-registering replaces
    /// the previous entry.
    pub fn register<K: Resource>(mut self, plural: &'static str, namespaced: bool) -> Self {
        self.kinds.insert(
            K::KIND,
            KindInfo {
                kind: K::KIND,
                plural,
                namespaced,
            },
        );
        self
    }

    pub fn lookup(&self, kind: &str) -> Option<&KindInfo> {
        self.kinds.get(kind)
    }

    /// Like [`lookup`](Self::lookup) but as a store error.
    pub fn require(&self, kind: &str) -> Result<&KindInfo, StoreError> {
        self.lookup(kind)
            .ok_or_else(|| StoreError::UnknownKind(kind.to_string()))
    }

    pub fn kinds(&self) -> impl Iterator<Item = &KindInfo> {
        self.kinds.values()
    }
}
