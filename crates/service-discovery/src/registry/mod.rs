//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Service registry backed by a coordination store

pub mod codec;
pub mod keys;
pub mod store;

pub use keys::KeyLayout;
pub use store::StoreRegistry;

use crate::config::{DiscoveryConfig, StoreBackend};
use crate::error::DiscoveryResult;
use crate::store::{CoordinationClient, EtcdStore, MemoryStore};
use crate::types::{Revision, ServiceDescriptor};
use crate::watcher::Watcher;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Per-call registration options
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    /// Lease TTL; the registry default applies when unset
    pub ttl: Option<Duration>,
}

impl RegisterOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }
}

/// Point-in-time membership of one service
#[derive(Debug, Clone, Default)]
pub struct ServiceSnapshot {
    /// One descriptor per registered node
    pub services: Vec<ServiceDescriptor>,

    /// Store revision the snapshot was read at
    pub revision: Revision,
}

/// Registry operations shared by every backend
#[async_trait]
pub trait Registry: Send + Sync {
    /// Register every node of `service` under a fresh lease
    async fn register(
        &self,
        service: &ServiceDescriptor,
        options: RegisterOptions,
    ) -> DiscoveryResult<()>;

    /// Remove the nodes of `service` and revoke their lease
    async fn deregister(&self, service: &ServiceDescriptor) -> DiscoveryResult<()>;

    /// Current membership of a service together with the read revision
    async fn snapshot(&self, name: &str) -> DiscoveryResult<ServiceSnapshot>;

    /// Current membership of a service
    async fn get_service(&self, name: &str) -> DiscoveryResult<Vec<ServiceDescriptor>> {
        Ok(self.snapshot(name).await?.services)
    }

    /// Every registered entry across all services
    async fn list_services(&self) -> DiscoveryResult<Vec<ServiceDescriptor>>;

    /// Watch a service starting at `start_revision` (or now)
    async fn watch_from(
        &self,
        name: &str,
        start_revision: Option<Revision>,
    ) -> DiscoveryResult<Watcher>;

    /// Watch a service from now on
    async fn watch(&self, name: &str) -> DiscoveryResult<Watcher> {
        self.watch_from(name, None).await
    }

    /// Backend name for logs
    fn backend(&self) -> &'static str;
}

/// Build the registry selected by configuration
pub async fn connect(config: &DiscoveryConfig) -> DiscoveryResult<Arc<dyn Registry>> {
    config.validate()?;

    let client: Arc<dyn CoordinationClient> = match config.backend {
        StoreBackend::Etcd => {
            Arc::new(EtcdStore::connect(&config.endpoints, config.connect_timeout).await?)
        }
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    };

    info!("Using {} coordination store", client.backend());
    Ok(Arc::new(StoreRegistry::new(client, config)))
}
