//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Coordination store client abstraction
//!
//! The registry talks to a lease-capable, watchable key-value store through
//! [`CoordinationClient`]. [`EtcdStore`] is the production backend and
//! [`MemoryStore`] an in-process one for tests and local development.

pub mod etcd;
pub mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use crate::error::DiscoveryResult;
use crate::types::Revision;
use async_trait::async_trait;

/// Lease identifier issued by the store
pub type LeaseId = i64;

/// A stored key and its value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: Revision,
    /// Attached lease, if any
    pub lease: Option<LeaseId>,
}

/// Result of a prefix read
#[derive(Debug, Clone, Default)]
pub struct Range {
    pub kvs: Vec<KeyValue>,
    /// Store revision the read was served at
    pub revision: Revision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventKind {
    Put,
    Delete,
}

/// A raw change delivered by a watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub kind: StoreEventKind,
    pub key: String,
    /// New value; empty for deletes
    pub value: Vec<u8>,
    /// Value before the change, when the watch asked for it
    pub prev_value: Option<Vec<u8>>,
    pub revision: Revision,
}

/// Watch subscription parameters
#[derive(Debug, Clone)]
pub struct WatchRequest {
    pub prefix: String,
    /// First revision to deliver; `None` starts at the current revision
    pub start_revision: Option<Revision>,
    /// Include before-images on every event
    pub prev_kv: bool,
}

impl WatchRequest {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            start_revision: None,
            prev_kv: false,
        }
    }

    pub fn with_prev_kv(mut self) -> Self {
        self.prev_kv = true;
        self
    }

    pub fn with_start_revision(mut self, revision: Option<Revision>) -> Self {
        self.start_revision = revision;
        self
    }
}

/// An open watch; owned by exactly one consumer
#[async_trait]
pub trait WatchStream: Send {
    /// Next batch of events. `Ok(None)` means the stream ended.
    async fn message(&mut self) -> DiscoveryResult<Option<Vec<StoreEvent>>>;

    /// Cancel the subscription on the store side
    async fn cancel(&mut self) -> DiscoveryResult<()>;
}

/// Lease-capable, watchable key-value store
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Write `value` under `key`, attached to `lease` when given
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> DiscoveryResult<()>;

    /// Read every key starting with `prefix`
    async fn get_prefix(&self, prefix: &str) -> DiscoveryResult<Range>;

    /// Delete `key`, or every key starting with it when `with_prefix` is set.
    /// Returns the number of deleted keys.
    async fn delete(&self, key: &str, with_prefix: bool) -> DiscoveryResult<u64>;

    /// Grant a lease with the given TTL
    async fn grant(&self, ttl_secs: i64) -> DiscoveryResult<LeaseId>;

    /// Renew a lease once; returns the remaining TTL in seconds
    async fn keep_alive_once(&self, lease: LeaseId) -> DiscoveryResult<i64>;

    /// Revoke a lease, deleting every key attached to it
    async fn revoke(&self, lease: LeaseId) -> DiscoveryResult<()>;

    /// Open a prefix watch
    async fn watch(&self, request: WatchRequest) -> DiscoveryResult<Box<dyn WatchStream>>;

    /// Backend name for logs
    fn backend(&self) -> &'static str;
}
