//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Registry implementation over any [`CoordinationClient`]

use super::codec::{decode, encode};
use super::keys::KeyLayout;
use super::{RegisterOptions, Registry, ServiceSnapshot};
use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::store::{CoordinationClient, KeyValue, LeaseId, WatchRequest};
use crate::types::{Node, Revision, ServiceDescriptor};
use crate::watcher::Watcher;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Registry storing one key per node, each attached to the registering
/// process's lease
pub struct StoreRegistry {
    client: Arc<dyn CoordinationClient>,
    keys: KeyLayout,
    default_ttl: Duration,
    request_timeout: Duration,
    /// Node key -> lease currently keeping it alive
    leases: Mutex<HashMap<String, LeaseId>>,
}

impl StoreRegistry {
    /// Create a registry from configuration
    pub fn new(client: Arc<dyn CoordinationClient>, config: &DiscoveryConfig) -> Self {
        Self::with_options(
            client,
            KeyLayout::new(&config.root_prefix),
            config.lease_ttl,
            config.request_timeout,
        )
    }

    pub fn with_options(
        client: Arc<dyn CoordinationClient>,
        keys: KeyLayout,
        default_ttl: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client,
            keys,
            default_ttl,
            request_timeout,
            leases: Mutex::new(HashMap::new()),
        }
    }

    pub fn keys(&self) -> &KeyLayout {
        &self.keys
    }

    /// Run one store round-trip under the request deadline
    async fn deadline<T>(
        &self,
        operation: &str,
        call: impl Future<Output = DiscoveryResult<T>>,
    ) -> DiscoveryResult<T> {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(DiscoveryError::Timeout(format!(
                "{} timed out after {:?}",
                operation, self.request_timeout
            ))),
        }
    }

    /// Confirm the lease is alive, then write every node under it.
    ///
    /// `attempted` counts the nodes whose put was issued, including a failed one.
    async fn attach(
        &self,
        service: &ServiceDescriptor,
        lease: LeaseId,
        attempted: &mut usize,
    ) -> DiscoveryResult<()> {
        let keep_alive = self.client.keep_alive_once(lease);
        self.deadline("lease keep-alive", keep_alive).await?;

        for node in &service.nodes {
            let key = self.keys.node_key(&service.name, &node.id);
            let value = encode(&service.for_node(node))?;
            *attempted += 1;
            let put = self.client.put(&key, value, Some(lease));
            self.deadline("put", put).await?;
        }
        Ok(())
    }

    /// Undo a partial attach: nodes that were already alive go back to their
    /// previous lease before the new one is revoked.
    async fn rollback(&self, service: &ServiceDescriptor, lease: LeaseId, attempted: usize) {
        let previous: Vec<(&Node, String, LeaseId)> = {
            let leases = self.leases.lock().await;
            service
                .nodes
                .iter()
                .take(attempted)
                .filter_map(|node| {
                    let key = self.keys.node_key(&service.name, &node.id);
                    leases.get(&key).map(|old| (node, key, *old))
                })
                .collect()
        };

        for (node, key, old) in previous {
            if let Err(e) = self.restore(service, node, &key, old).await {
                warn!("Failed to restore {} under lease {}: {}", key, old, e);
            }
        }

        self.revoke_quietly(lease).await;
    }

    async fn restore(
        &self,
        service: &ServiceDescriptor,
        node: &Node,
        key: &str,
        lease: LeaseId,
    ) -> DiscoveryResult<()> {
        let value = encode(&service.for_node(node))?;
        let put = self.client.put(key, value, Some(lease));
        self.deadline("put", put).await
    }

    async fn revoke_quietly(&self, lease: LeaseId) {
        if let Err(e) = self.deadline("lease revoke", self.client.revoke(lease)).await {
            warn!(
                "Failed to revoke lease {}, it will expire via TTL: {}",
                lease, e
            );
        }
    }

    fn decode_all(kvs: &[KeyValue]) -> Vec<ServiceDescriptor> {
        kvs.iter()
            .filter_map(|kv| decode(&kv.key, &kv.value))
            .collect()
    }
}

#[async_trait]
impl Registry for StoreRegistry {
    async fn register(
        &self,
        service: &ServiceDescriptor,
        options: RegisterOptions,
    ) -> DiscoveryResult<()> {
        service.validate_for_registration()?;

        let ttl = options.ttl.unwrap_or(self.default_ttl);
        let ttl_secs = ttl.as_secs().max(1) as i64;

        let lease = self
            .deadline("lease grant", self.client.grant(ttl_secs))
            .await?;

        let mut attempted = 0;
        if let Err(e) = self.attach(service, lease, &mut attempted).await {
            self.rollback(service, lease, attempted).await;
            return Err(e);
        }

        // The nodes now live on the new lease; leases nothing points at any more are revoked.
        let stale: BTreeSet<LeaseId> = {
            let mut leases = self.leases.lock().await;
            let mut replaced = BTreeSet::new();
            for node in &service.nodes {
                let key = self.keys.node_key(&service.name, &node.id);
                if let Some(old) = leases.insert(key, lease) {
                    if old != lease {
                        replaced.insert(old);
                    }
                }
            }
            replaced.retain(|old| !leases.values().any(|current| current == old));
            replaced
        };

        for old in stale {
            self.revoke_quietly(old).await;
        }

        info!(
            "Registered service {} ({} nodes, lease {}, ttl {}s)",
            service.name,
            service.nodes.len(),
            lease,
            ttl_secs
        );
        Ok(())
    }

    async fn deregister(&self, service: &ServiceDescriptor) -> DiscoveryResult<()> {
        if service.nodes.is_empty() {
            return Err(DiscoveryError::EmptyNodes(service.name.clone()));
        }

        for node in &service.nodes {
            let key = self.keys.node_key(&service.name, &node.id);
            let deleted = self
                .deadline("delete", self.client.delete(&key, false))
                .await?;
            debug!("Deleted {} entries at {}", deleted, key);
        }

        let released: BTreeSet<LeaseId> = {
            let mut leases = self.leases.lock().await;
            let mut removed = BTreeSet::new();
            for node in &service.nodes {
                if let Some(lease) = leases.remove(&self.keys.node_key(&service.name, &node.id)) {
                    removed.insert(lease);
                }
            }
            removed.retain(|lease| !leases.values().any(|current| current == lease));
            removed
        };

        for lease in released {
            self.deadline("lease revoke", self.client.revoke(lease))
                .await?;
            debug!("Revoked lease {}", lease);
        }

        info!(
            "Deregistered service {} ({} nodes)",
            service.name,
            service.nodes.len()
        );
        Ok(())
    }

    async fn snapshot(&self, name: &str) -> DiscoveryResult<ServiceSnapshot> {
        let prefix = self.keys.service_prefix(name);
        let range = self
            .deadline("get", self.client.get_prefix(&prefix))
            .await?;

        // `orders-rpc` nests under `orders/`, so entries are matched on their own name too.
        let services: Vec<ServiceDescriptor> = Self::decode_all(&range.kvs)
            .into_iter()
            .filter(|descriptor| descriptor.name == name)
            .collect();
        debug!(
            "Read {} entries for service {} at revision {}",
            services.len(),
            name,
            range.revision
        );

        Ok(ServiceSnapshot {
            services,
            revision: range.revision,
        })
    }

    async fn list_services(&self) -> DiscoveryResult<Vec<ServiceDescriptor>> {
        let range = self
            .deadline("get", self.client.get_prefix(self.keys.root()))
            .await?;
        Ok(Self::decode_all(&range.kvs))
    }

    async fn watch_from(
        &self,
        name: &str,
        start_revision: Option<Revision>,
    ) -> DiscoveryResult<Watcher> {
        let prefix = self.keys.service_prefix(name);
        let request = WatchRequest::prefix(prefix.clone())
            .with_prev_kv()
            .with_start_revision(start_revision);

        let stream = self.deadline("watch", self.client.watch(request)).await?;
        debug!("Watching {} from revision {:?}", prefix, start_revision);
        Ok(Watcher::new(name, stream))
    }

    fn backend(&self) -> &'static str {
        self.client.backend()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry(store: &MemoryStore) -> StoreRegistry {
        StoreRegistry::with_options(
            Arc::new(store.clone()),
            KeyLayout::default(),
            Duration::from_secs(30),
            Duration::from_secs(5),
        )
    }

    fn orders(id: &str, address: &str) -> ServiceDescriptor {
        ServiceDescriptor::new("orders").with_node(Node::with_id(id, address, 9001))
    }

    #[tokio::test]
    async fn test_register_requires_nodes() {
        let store = MemoryStore::new();
        let registry = registry(&store);
        let result = registry
            .register(&ServiceDescriptor::new("orders"), RegisterOptions::default())
            .await;
        assert!(matches!(result, Err(DiscoveryError::EmptyNodes(_))));
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_register_and_get_service() {
        let store = MemoryStore::new();
        let registry = registry(&store);
        registry
            .register(&orders("a", "10.0.0.1"), RegisterOptions::default())
            .await
            .unwrap();
        registry
            .register(&orders("b", "10.0.0.2"), RegisterOptions::default())
            .await
            .unwrap();

        let services = registry.get_service("orders").await.unwrap();
        let ids: Vec<&str> = services.iter().map(|s| s.nodes[0].id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let range = store.get_prefix("/services/orders/a").await.unwrap();
        assert!(range.kvs[0].lease.is_some());
    }

    #[tokio::test]
    async fn test_reregister_replaces_lease() {
        let store = MemoryStore::new();
        let registry = registry(&store);
        let service = orders("a", "10.0.0.1");

        registry.register(&service, RegisterOptions::default()).await.unwrap();
        registry.register(&service, RegisterOptions::default()).await.unwrap();

        assert_eq!(store.lease_count(), 1);
        assert_eq!(registry.get_service("orders").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_reregister_keeps_live_nodes() {
        let store = MemoryStore::new();
        let registry = registry(&store);
        let service = ServiceDescriptor::new("orders")
            .with_node(Node::with_id("a", "10.0.0.1", 9001))
            .with_node(Node::with_id("b", "10.0.0.2", 9001));
        registry.register(&service, RegisterOptions::default()).await.unwrap();
        let lease = store.get_prefix("/services/orders/a").await.unwrap().kvs[0].lease;

        store.reject_puts(Some("/services/orders/b"));
        assert!(registry
            .register(&service, RegisterOptions::default())
            .await
            .is_err());

        let range = store.get_prefix("/services/orders/").await.unwrap();
        assert_eq!(range.kvs.len(), 2);
        assert!(range.kvs.iter().all(|kv| kv.lease == lease));
        assert_eq!(store.lease_count(), 1);

        store.reject_puts(None);
        registry.register(&service, RegisterOptions::default()).await.unwrap();
        assert_eq!(registry.get_service("orders").await.unwrap().len(), 2);
        assert_eq!(store.lease_count(), 1);
    }

    #[tokio::test]
    async fn test_deregister_removes_key_and_lease() {
        let store = MemoryStore::new();
        let registry = registry(&store);
        let service = orders("a", "10.0.0.1");
        registry.register(&service, RegisterOptions::default()).await.unwrap();
        registry
            .register(&orders("ab", "10.0.0.3"), RegisterOptions::default())
            .await
            .unwrap();

        registry.deregister(&service).await.unwrap();

        let remaining = registry.get_service("orders").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].nodes[0].id, "ab");
        assert_eq!(store.lease_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_entries_are_skipped() {
        let store = MemoryStore::new();
        let registry = registry(&store);
        registry
            .register(&orders("a", "10.0.0.1"), RegisterOptions::default())
            .await
            .unwrap();
        store
            .put("/services/orders/broken", b"{oops".to_vec(), None)
            .await
            .unwrap();

        assert_eq!(registry.get_service("orders").await.unwrap().len(), 1);
        assert_eq!(registry.list_services().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_services_do_not_bleed_into_each_other() {
        let store = MemoryStore::new();
        let registry = registry(&store);
        registry
            .register(&orders("a", "10.0.0.1"), RegisterOptions::default())
            .await
            .unwrap();
        registry
            .register(
                &ServiceDescriptor::new("orders-rpc")
                    .with_node(Node::with_id("r", "10.0.0.9", 9100)),
                RegisterOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(registry.get_service("orders").await.unwrap().len(), 1);
        assert_eq!(registry.get_service("orders-rpc").await.unwrap().len(), 1);
        assert_eq!(registry.list_services().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_store_errors_surface() {
        let store = MemoryStore::new();
        let registry = registry(&store);
        store.set_unavailable(true);

        let result = registry
            .register(&orders("a", "10.0.0.1"), RegisterOptions::default())
            .await;
        assert!(matches!(result, Err(DiscoveryError::Store(_))));
        assert!(registry.get_service("orders").await.is_err());
    }
}
