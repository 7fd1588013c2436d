//! Watch-driven reconciliation primitives.
//!
//! This library turns an eventually-consistent stream of object changes into
//! ordered, deduplicated, retried work. Key pieces:
//!
//! - **Store**: where objects live ([`ResourceStore`], [`MemoryStore`]).
//! - **Cache**: an in-memory mirror of one kind kept current by watch
//!   ([`EventCache`]).
//! - **Queue**: pending keys with dedup and per-key backoff ([`WorkQueue`]).
//! - **Controller**: workers that resolve keys against the cache and call
//!   the domain handler ([`Controller`]).
//!
//! # Invariants
//!
//! - At most one worker holds a given key at a time
//! - Handlers see the current cached state, not the event that woke them
//! - A failing key is retried a bounded number of times, then dropped

mod backoff;
mod cache;
mod controller;
mod error;
mod fingerprint;
mod memory;
mod object;
mod queue;
mod registry;
mod store;

use std::time::Duration;

pub use backoff::BackoffPolicy;
pub use cache::{CacheOptions, EventCache, EventCallback, EventKind};
pub use controller::{
    Controller, ControllerConfig, ErrorSink, LogErrorSink, ResourceHandler, Task, TaskKey,
};
pub use error::{ReconcileError, StoreError};
pub use fingerprint::Fingerprint;
pub use memory::MemoryStore;
pub use object::{ObjectKey, ObjectMeta, Resource, Selector, DEFAULT_NAMESPACE};
pub use queue::{QueueItem, WorkQueue};
pub use registry::{KindInfo, TypeRegistry};
pub use store::{ResourceStore, WatchEvent, WatchStream};

/// Requeues allowed before a failing task is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default full relist interval for caches.
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(60);

/// Default bound on the startup wait for cache sync.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);
