//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Calling-side facade: logical service name in, live connection out

use crate::cache::{ConnectionCache, ServiceChannel};
use crate::config::DiscoveryConfig;
use crate::error::DiscoveryResult;
use crate::registry::{self, Registry};
use crate::resolver::{Resolver, ResolverTask, TargetSink};
use crate::selector::Selector;
use crate::transport::{Dialer, GrpcDialer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

/// Resolves services on first use and hands out cached connections
pub struct DiscoveryClient<D: Dialer> {
    registry: Arc<dyn Registry>,
    cache: ConnectionCache<D>,
    resolvers: Mutex<HashMap<String, Arc<ResolverTask>>>,
    service_suffix: String,
    reconnect_delay: Duration,
    ready_timeout: Duration,
}

impl DiscoveryClient<GrpcDialer> {
    /// Connect to the configured store and dial gRPC channels
    pub async fn connect(config: &DiscoveryConfig) -> DiscoveryResult<Self> {
        let registry = registry::connect(config).await?;
        Ok(Self::new(registry, GrpcDialer::from_config(config), config))
    }
}

impl<D: Dialer> DiscoveryClient<D> {
    pub fn new(registry: Arc<dyn Registry>, dialer: D, config: &DiscoveryConfig) -> Self {
        Self::with_selector(registry, dialer, config.selection.build(), config)
    }

    pub fn with_selector(
        registry: Arc<dyn Registry>,
        dialer: D,
        selector: Arc<dyn Selector>,
        config: &DiscoveryConfig,
    ) -> Self {
        info!(
            "Discovery client using {} selection over the {} registry",
            selector.name(),
            registry.backend()
        );
        Self {
            registry,
            cache: ConnectionCache::new(dialer, selector),
            resolvers: Mutex::new(HashMap::new()),
            service_suffix: config.service_suffix.clone(),
            reconnect_delay: config.reconnect_delay,
            ready_timeout: config.request_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn cache(&self) -> &ConnectionCache<D> {
        &self.cache
    }

    /// Registered name for a logical service
    pub fn service_name(&self, service: &str) -> String {
        if self.service_suffix.is_empty() || service.ends_with(&self.service_suffix) {
            service.to_string()
        } else {
            format!("{}{}", service, self.service_suffix)
        }
    }

    /// Start following a service, if not yet, and wait for its first snapshot
    pub async fn resolve(&self, service: &str) -> DiscoveryResult<String> {
        let name = self.service_name(service);

        let task = {
            let mut resolvers = self.resolvers.lock().await;
            resolvers
                .entry(name.clone())
                .or_insert_with(|| {
                    let resolver =
                        Resolver::new(self.registry.clone(), name.clone(), self.reconnect_delay);
                    let sink: Arc<dyn TargetSink> = Arc::new(self.cache.clone());
                    Arc::new(ResolverTask::spawn(resolver, sink))
                })
                .clone()
        };

        task.wait_ready(self.ready_timeout).await?;
        Ok(name)
    }

    /// Connection to one instance of `service`
    pub async fn get_connection(&self, service: &str) -> DiscoveryResult<ServiceChannel<D>> {
        let name = self.resolve(service).await?;
        self.cache.get_connection(&name).await
    }

    /// Current targets of `service`
    pub async fn targets(&self, service: &str) -> DiscoveryResult<Vec<String>> {
        let name = self.resolve(service).await?;
        Ok(self.cache.targets(&name).await)
    }

    /// Stop every resolver and close every connection
    pub async fn shutdown(&self) {
        let tasks: Vec<Arc<ResolverTask>> = {
            let mut resolvers = self.resolvers.lock().await;
            resolvers.drain().map(|(_, task)| task).collect()
        };

        for task in &tasks {
            task.shutdown().await;
        }
        self.cache.shutdown().await;
        info!("Discovery client stopped {} resolvers", tasks.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiscoveryError;
    use crate::registry::{KeyLayout, RegisterOptions, StoreRegistry};
    use crate::store::MemoryStore;
    use crate::transport::Connection;
    use crate::types::{Node, ServiceDescriptor};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct StubConnection(String);

    impl Connection for StubConnection {}

    #[derive(Default)]
    struct StubDialer {
        dials: AtomicUsize,
    }

    #[async_trait]
    impl Dialer for StubDialer {
        type Connection = StubConnection;

        async fn dial(&self, address: &str) -> DiscoveryResult<StubConnection> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            Ok(StubConnection(address.to_string()))
        }
    }

    fn setup(suffix: &str) -> (MemoryStore, DiscoveryClient<StubDialer>) {
        let store = MemoryStore::new();
        let registry: Arc<dyn Registry> = Arc::new(StoreRegistry::with_options(
            Arc::new(store.clone()),
            KeyLayout::default(),
            Duration::from_secs(30),
            Duration::from_secs(5),
        ));
        let config = DiscoveryConfig {
            service_suffix: suffix.to_string(),
            reconnect_delay: Duration::from_millis(10),
            request_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let client = DiscoveryClient::new(registry, StubDialer::default(), &config);
        (store, client)
    }

    async fn register(client: &DiscoveryClient<StubDialer>, name: &str, id: &str, address: &str) {
        client
            .registry()
            .register(
                &ServiceDescriptor::new(name).with_node(Node::with_id(id, address, 9001)),
                RegisterOptions::default(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_service_suffix() {
        let (_store, client) = setup("-rpc");
        assert_eq!(client.service_name("orders"), "orders-rpc");
        assert_eq!(client.service_name("orders-rpc"), "orders-rpc");

        let (_store, plain) = setup("");
        assert_eq!(plain.service_name("orders"), "orders");
    }

    #[tokio::test]
    async fn test_get_connection_resolves_on_first_use() {
        let (_store, client) = setup("-rpc");
        register(&client, "orders-rpc", "a", "10.0.0.1").await;

        let channel = client.get_connection("orders").await.unwrap();
        assert_eq!(channel.service(), "orders-rpc");
        assert_eq!(channel.connection().0, "10.0.0.1:9001");

        // A second call reuses both the resolver and the connection.
        client.get_connection("orders").await.unwrap();
        assert_eq!(client.cache().dialer_dials(), 1);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_unregistered_service_is_unavailable() {
        let (_store, client) = setup("");
        let result = client.get_connection("orders").await;
        assert!(matches!(result, Err(DiscoveryError::Unavailable(_))));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_releases_watches() {
        let (store, client) = setup("");
        register(&client, "orders", "a", "10.0.0.1").await;
        client.get_connection("orders").await.unwrap();

        client.shutdown().await;
        assert_eq!(store.watch_count(), 0);
        assert_eq!(client.cache().connection_count("orders").await, 0);
    }

    impl ConnectionCache<StubDialer> {
        fn dialer_dials(&self) -> usize {
            self.dialer().dials.load(Ordering::SeqCst)
        }
    }
}
