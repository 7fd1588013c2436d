//! Resource store adapter interface.
//!
//! The engine never talks to a concrete object store. It consumes this
//! narrow list/watch/CRUD contract and leaves transport, schema and auth to
//! the adapter.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::error::StoreError;
use crate::object::{ObjectKey, Resource, Selector};

/// A change observed on the store, carrying the full object.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

impl<K> WatchEvent<K> {
    pub fn object(&self) -> &K {
        match self {
            Self::Added(obj) | Self::Modified(obj) | Self::Deleted(obj) => obj,
        }
    }
}

/// Stream of watch events. Ending, or yielding an error, means the
/// subscription was lost and the caller should relist.
pub type WatchStream<K> = Pin<Box<dyn Stream<Item = Result<WatchEvent<K>, StoreError>> + Send>>;

/// List/watch and CRUD over one kind.
#[async_trait]
pub trait ResourceStore<K: Resource>: Send + Sync {
    /// Every object matching `selector`.
    async fn list(&self, selector: &Selector) -> Result<Vec<K>, StoreError>;

    /// Subscribe to changes after the current state.
    async fn watch(&self, selector: &Selector) -> Result<WatchStream<K>, StoreError>;

    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, StoreError>;

    async fn create(&self, object: K) -> Result<K, StoreError>;

    async fn update(&self, object: K) -> Result<K, StoreError>;

    /// Remove the object, returning its last state.
    async fn delete(&self, key: &ObjectKey) -> Result<K, StoreError>;

    /// Create or replace.
    async fn apply(&self, object: K) -> Result<K, StoreError> {
        let key = object.key();
        match self.get(&key).await? {
            Some(_) => self.update(object).await,
            None => self.create(object).await,
        }
    }
}
