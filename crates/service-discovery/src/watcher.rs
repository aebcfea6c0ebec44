//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Typed membership events over a raw store watch
//!
//! A store-level put becomes [`MembershipAction::Created`] carrying the new
//! value; a delete becomes [`MembershipAction::Deleted`] carrying the
//! before-image. Every event of a store response is delivered, in order.
//! Malformed payloads are skipped. Once `next` returns an error the watcher
//! is spent and must be recreated.

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::registry::codec::decode;
use crate::signal::{stop_pair, StopHandle, StopSignal};
use crate::store::{StoreEvent, StoreEventKind, WatchStream};
use crate::types::{MembershipAction, MembershipEvent, Revision};
use std::collections::VecDeque;
use tracing::{debug, warn};

pub struct Watcher {
    service: String,
    stream: Option<Box<dyn WatchStream>>,
    pending: VecDeque<MembershipEvent>,
    stop: StopHandle,
    signal: StopSignal,
    last_revision: Option<Revision>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("service", &self.service)
            .field("open", &self.stream.is_some())
            .field("pending", &self.pending.len())
            .field("last_revision", &self.last_revision)
            .finish()
    }
}

impl Watcher {
    pub fn new(service: impl Into<String>, stream: Box<dyn WatchStream>) -> Self {
        let (stop, signal) = stop_pair();
        Self {
            service: service.into(),
            stream: Some(stream),
            pending: VecDeque::new(),
            stop,
            signal,
            last_revision: None,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Revision of the last store event consumed, decodable or not
    pub fn last_revision(&self) -> Option<Revision> {
        self.last_revision
    }

    /// Handle that stops this watcher from another task, waking a pending `next`
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Wait for the next membership change
    pub async fn next(&mut self) -> DiscoveryResult<MembershipEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }

            if self.signal.is_stopped() {
                self.release().await;
                return Err(DiscoveryError::Stopped);
            }

            let Some(stream) = self.stream.as_mut() else {
                return Err(DiscoveryError::WatchClosed(format!(
                    "watcher for {} is closed",
                    self.service
                )));
            };

            let signal = &mut self.signal;
            let message = tokio::select! {
                _ = signal.stopped() => None,
                message = stream.message() => Some(message),
            };

            let Some(message) = message else {
                self.release().await;
                return Err(DiscoveryError::Stopped);
            };

            match message {
                Ok(Some(events)) => {
                    for event in events {
                        self.last_revision = Some(event.revision);
                        if let Some(membership) = self.translate(event) {
                            self.pending.push_back(membership);
                        }
                    }
                }
                Ok(None) => {
                    self.stream = None;
                    return Err(DiscoveryError::WatchClosed(format!(
                        "watch on {} ended",
                        self.service
                    )));
                }
                Err(e) => {
                    self.stream = None;
                    return Err(e);
                }
            }
        }
    }

    /// Stop the watcher and release the underlying stream
    pub async fn stop(&mut self) {
        self.stop.stop();
        self.release().await;
    }

    async fn release(&mut self) {
        self.pending.clear();
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.cancel().await {
                debug!("Failed to cancel watch on {}: {}", self.service, e);
            }
        }
    }

    fn translate(&self, event: StoreEvent) -> Option<MembershipEvent> {
        let (action, payload) = match event.kind {
            StoreEventKind::Put => (MembershipAction::Created, Some(event.value)),
            StoreEventKind::Delete => (MembershipAction::Deleted, event.prev_value),
        };

        let Some(payload) = payload else {
            warn!(
                "Delete of {} arrived without a previous value, skipping",
                event.key
            );
            return None;
        };

        let descriptor = decode(&event.key, &payload)?;
        if descriptor.name != self.service {
            debug!(
                "Ignoring {} entry for {} under the {} prefix",
                action, descriptor.name, self.service
            );
            return None;
        }

        Some(MembershipEvent {
            action,
            descriptor,
            revision: event.revision,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::codec::encode;
    use crate::store::{CoordinationClient, MemoryStore, WatchRequest};
    use crate::types::{Node, ServiceDescriptor};
    use std::time::Duration;

    fn entry(id: &str, address: &str) -> Vec<u8> {
        encode(&ServiceDescriptor::new("orders").with_node(Node::with_id(id, address, 9001)))
            .unwrap()
    }

    async fn watcher(store: &MemoryStore) -> Watcher {
        let stream = store
            .watch(WatchRequest::prefix("/services/orders/").with_prev_kv())
            .await
            .unwrap();
        Watcher::new("orders", stream)
    }

    #[tokio::test]
    async fn test_put_and_delete_are_typed() {
        let store = MemoryStore::new();
        let mut watcher = watcher(&store).await;

        store
            .put("/services/orders/a", entry("a", "10.0.0.1"), None)
            .await
            .unwrap();
        store.delete("/services/orders/a", false).await.unwrap();

        let created = watcher.next().await.unwrap();
        assert_eq!(created.action, MembershipAction::Created);
        assert_eq!(created.descriptor.nodes[0].endpoint(), "10.0.0.1:9001");

        let deleted = watcher.next().await.unwrap();
        assert_eq!(deleted.action, MembershipAction::Deleted);
        assert_eq!(deleted.descriptor.nodes[0].id, "a");
        assert_eq!(watcher.last_revision(), Some(deleted.revision));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_skipped() {
        let store = MemoryStore::new();
        let mut watcher = watcher(&store).await;

        store
            .put("/services/orders/x", b"garbage".to_vec(), None)
            .await
            .unwrap();
        store
            .put("/services/orders/b", entry("b", "10.0.0.2"), None)
            .await
            .unwrap();

        let event = watcher.next().await.unwrap();
        assert_eq!(event.descriptor.nodes[0].id, "b");
    }

    #[tokio::test]
    async fn test_every_event_of_a_batch_is_delivered() {
        let store = MemoryStore::new();
        let lease = store.grant(30).await.unwrap();
        store
            .put("/services/orders/a", entry("a", "10.0.0.1"), Some(lease))
            .await
            .unwrap();
        store
            .put("/services/orders/b", entry("b", "10.0.0.2"), Some(lease))
            .await
            .unwrap();

        let mut watcher = watcher(&store).await;
        // Revoking drops both keys in one store revision.
        store.revoke(lease).await.unwrap();

        let first = watcher.next().await.unwrap();
        let second = watcher.next().await.unwrap();
        let mut ids = vec![
            first.descriptor.nodes[0].id.clone(),
            second.descriptor.nodes[0].id.clone(),
        ];
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(second.action, MembershipAction::Deleted);
    }

    #[tokio::test]
    async fn test_stop_unblocks_next() {
        let store = MemoryStore::new();
        let mut watcher = watcher(&store).await;
        let handle = watcher.stop_handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.stop();
        });

        let result = tokio::time::timeout(Duration::from_secs(2), watcher.next())
            .await
            .unwrap();
        assert!(matches!(result, Err(DiscoveryError::Stopped)));
        assert!(matches!(watcher.next().await, Err(DiscoveryError::Stopped)));
    }

    #[tokio::test]
    async fn test_stream_error_spends_watcher() {
        let store = MemoryStore::new();
        let mut watcher = watcher(&store).await;

        store.reset_watches();
        assert!(watcher.next().await.is_err());
        assert!(matches!(
            watcher.next().await,
            Err(DiscoveryError::WatchClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_nested_service_entries_are_ignored() {
        let store = MemoryStore::new();
        let mut watcher = watcher(&store).await;

        let nested = encode(
            &ServiceDescriptor::new("orders-rpc").with_node(Node::with_id("r", "10.0.0.9", 9100)),
        )
        .unwrap();
        store
            .put("/services/orders/rpc/r", nested, None)
            .await
            .unwrap();
        store
            .put("/services/orders/a", entry("a", "10.0.0.1"), None)
            .await
            .unwrap();

        assert_eq!(watcher.next().await.unwrap().descriptor.name, "orders");
    }
}
