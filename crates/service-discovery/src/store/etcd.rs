//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! etcd v3 coordination store backend

use super::{
    CoordinationClient, KeyValue, LeaseId, Range, StoreEvent, StoreEventKind, WatchRequest,
    WatchStream,
};
use crate::error::{DiscoveryError, DiscoveryResult};
use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, DeleteOptions, EventType, GetOptions, PutOptions, WatchOptions,
};
use std::time::Duration;
use tracing::{debug, info};

/// etcd-backed coordination client
///
/// `etcd_client::Client` is a cheap handle over shared gRPC channels, so each
/// call works on its own clone.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to the given etcd endpoints
    pub async fn connect(endpoints: &[String], connect_timeout: Duration) -> DiscoveryResult<Self> {
        let connect_options = ConnectOptions::new()
            .with_connect_timeout(connect_timeout)
            .with_keep_alive(Duration::from_secs(30), Duration::from_secs(10));

        let client = Client::connect(endpoints, Some(connect_options))
            .await
            .map_err(|e| DiscoveryError::Store(format!("Failed to connect to etcd: {}", e)))?;

        info!("Connected to etcd at {:?}", endpoints);
        Ok(Self { client })
    }

    /// Wrap an already connected client
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    fn convert_kv(kv: &etcd_client::KeyValue) -> DiscoveryResult<KeyValue> {
        let key = kv
            .key_str()
            .map_err(|e| DiscoveryError::Serialization(format!("non UTF-8 key: {}", e)))?;
        Ok(KeyValue {
            key: key.to_string(),
            value: kv.value().to_vec(),
            mod_revision: kv.mod_revision(),
            lease: (kv.lease() != 0).then_some(kv.lease()),
        })
    }
}

#[async_trait]
impl CoordinationClient for EtcdStore {
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> DiscoveryResult<()> {
        let mut options = PutOptions::new();
        if let Some(lease) = lease {
            options = options.with_lease(lease);
        }

        self.client.clone().put(key, value, Some(options)).await?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> DiscoveryResult<Range> {
        let response = self
            .client
            .clone()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        let revision = response.header().map(|h| h.revision()).unwrap_or_default();
        let mut kvs = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            match Self::convert_kv(kv) {
                Ok(kv) => kvs.push(kv),
                Err(e) => debug!("Skipping unreadable key under {}: {}", prefix, e),
            }
        }

        Ok(Range { kvs, revision })
    }

    async fn delete(&self, key: &str, with_prefix: bool) -> DiscoveryResult<u64> {
        let mut options = DeleteOptions::new();
        if with_prefix {
            options = options.with_prefix();
        }

        let response = self.client.clone().delete(key, Some(options)).await?;
        Ok(response.deleted().max(0) as u64)
    }

    async fn grant(&self, ttl_secs: i64) -> DiscoveryResult<LeaseId> {
        let response = self.client.clone().lease_grant(ttl_secs, None).await?;
        Ok(response.id())
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> DiscoveryResult<i64> {
        let (mut keeper, mut stream) = self.client.clone().lease_keep_alive(lease).await?;
        keeper.keep_alive().await?;

        match stream.message().await? {
            Some(response) if response.ttl() > 0 => Ok(response.ttl()),
            Some(_) => Err(DiscoveryError::Store(format!("lease {} has expired", lease))),
            None => Err(DiscoveryError::Store(format!(
                "keep-alive stream for lease {} closed",
                lease
            ))),
        }
    }

    async fn revoke(&self, lease: LeaseId) -> DiscoveryResult<()> {
        self.client.clone().lease_revoke(lease).await?;
        Ok(())
    }

    async fn watch(&self, request: WatchRequest) -> DiscoveryResult<Box<dyn WatchStream>> {
        let mut options = WatchOptions::new().with_prefix();
        if request.prev_kv {
            options = options.with_prev_key();
        }
        if let Some(revision) = request.start_revision {
            options = options.with_start_revision(revision);
        }

        let (watcher, stream) = self
            .client
            .clone()
            .watch(request.prefix.as_str(), Some(options))
            .await?;

        debug!(
            "Opened etcd watch {} on {} (start revision {:?})",
            watcher.watch_id(),
            request.prefix,
            request.start_revision
        );

        Ok(Box::new(EtcdWatchStream { watcher, stream }))
    }

    fn backend(&self) -> &'static str {
        "etcd"
    }
}

struct EtcdWatchStream {
    watcher: etcd_client::Watcher,
    stream: etcd_client::WatchStream,
}

#[async_trait]
impl WatchStream for EtcdWatchStream {
    async fn message(&mut self) -> DiscoveryResult<Option<Vec<StoreEvent>>> {
        let response = match self.stream.message().await? {
            Some(response) => response,
            None => return Ok(None),
        };

        if response.canceled() {
            if response.compact_revision() > 0 {
                return Err(DiscoveryError::Compacted(response.compact_revision()));
            }
            return Err(DiscoveryError::WatchClosed(format!(
                "watch canceled by server: {}",
                response.cancel_reason()
            )));
        }

        let mut events = Vec::with_capacity(response.events().len());
        for event in response.events() {
            let kv = match event.kv() {
                Some(kv) => kv,
                None => continue,
            };
            let key = match kv.key_str() {
                Ok(key) => key.to_string(),
                Err(_) => continue,
            };

            let kind = match event.event_type() {
                EventType::Put => StoreEventKind::Put,
                EventType::Delete => StoreEventKind::Delete,
            };

            events.push(StoreEvent {
                kind,
                key,
                value: kv.value().to_vec(),
                prev_value: event.prev_kv().map(|prev| prev.value().to_vec()),
                revision: kv.mod_revision(),
            });
        }

        Ok(Some(events))
    }

    async fn cancel(&mut self) -> DiscoveryResult<()> {
        self.watcher.cancel().await?;
        Ok(())
    }
}
