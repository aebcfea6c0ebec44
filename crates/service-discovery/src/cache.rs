//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Connection cache keyed by logical service name
//!
//! Each service has a live target set, fed by the resolver, and at most one
//! connection per target address. Targets are dialed lazily. The service map
//! lock covers mutations and snapshot reads only; dials run outside it under
//! a per-service guard, so concurrent callers never dial the same service
//! twice and a slow dial never stalls other services. Connections are closed
//! by the cache only, when their target is removed or the cache shuts down.

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::resolver::TargetSink;
use crate::selector::Selector;
use crate::transport::{Connection, Dialer};
use crate::types::TargetUpdate;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One dialed target of a service
#[derive(Debug)]
pub struct ConnectionTarget<C> {
    pub address: String,
    pub connection: Arc<C>,
    pub created_at: Instant,
}

impl<C> Clone for ConnectionTarget<C> {
    fn clone(&self) -> Self {
        Self {
            address: self.address.clone(),
            connection: self.connection.clone(),
            created_at: self.created_at,
        }
    }
}

struct ServiceEntry<C> {
    addresses: BTreeSet<String>,
    connections: BTreeMap<String, ConnectionTarget<C>>,
    dial_guard: Arc<Mutex<()>>,
}

impl<C> Default for ServiceEntry<C> {
    fn default() -> Self {
        Self {
            addresses: BTreeSet::new(),
            connections: BTreeMap::new(),
            dial_guard: Arc::new(Mutex::new(())),
        }
    }
}

/// Outcome of a lookup under the map lock
enum Lookup<C> {
    Cached(ConnectionTarget<C>),
    Dial(Arc<Mutex<()>>),
}

pub struct ConnectionCache<D: Dialer> {
    dialer: Arc<D>,
    selector: Arc<dyn Selector>,
    services: Arc<Mutex<HashMap<String, ServiceEntry<D::Connection>>>>,
}

impl<D: Dialer> Clone for ConnectionCache<D> {
    fn clone(&self) -> Self {
        Self {
            dialer: self.dialer.clone(),
            selector: self.selector.clone(),
            services: self.services.clone(),
        }
    }
}

impl<D: Dialer> ConnectionCache<D> {
    pub fn new(dialer: D, selector: Arc<dyn Selector>) -> Self {
        Self {
            dialer: Arc::new(dialer),
            selector,
            services: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn selector(&self) -> &Arc<dyn Selector> {
        &self.selector
    }

    pub fn dialer(&self) -> &D {
        &self.dialer
    }

    /// Add a target to a service's live set. Adding a known target is a no-op.
    pub async fn add(&self, service: &str, address: &str) {
        let mut services = self.services.lock().await;
        let entry = services.entry(service.to_string()).or_default();
        if entry.addresses.insert(address.to_string()) {
            info!("Added target {} to service {}", address, service);
        } else {
            debug!("Target {} already present for service {}", address, service);
        }
    }

    /// Remove a target and close its connection. Unknown targets are ignored.
    pub async fn remove(&self, service: &str, address: &str) {
        let closed = {
            let mut services = self.services.lock().await;
            let Some(entry) = services.get_mut(service) else {
                debug!("Ignoring removal of {} from unknown service {}", address, service);
                return;
            };

            if !entry.addresses.remove(address) {
                debug!("Target {} not present for service {}", address, service);
            } else {
                info!(
                    "Removed target {} from service {} ({} remaining)",
                    address,
                    service,
                    entry.addresses.len()
                );
            }
            entry.connections.remove(address)
        };

        if let Some(target) = closed {
            target.connection.close().await;
            debug!("Closed connection to {}", target.address);
        }
    }

    /// Live target set of a service
    pub async fn targets(&self, service: &str) -> Vec<String> {
        let services = self.services.lock().await;
        services
            .get(service)
            .map(|entry| entry.addresses.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of open connections for a service
    pub async fn connection_count(&self, service: &str) -> usize {
        let services = self.services.lock().await;
        services
            .get(service)
            .map(|entry| entry.connections.len())
            .unwrap_or(0)
    }

    /// Return the service's connection, dialing one if none is open.
    ///
    /// Fails fast with [`DiscoveryError::Unavailable`] when the service has
    /// no targets. Dial candidates are tried in selector order until one
    /// succeeds; the last dial error is returned if none does. Only callers
    /// of a service without a connection wait, and only on that service.
    pub async fn get_connection(&self, service: &str) -> DiscoveryResult<ServiceChannel<D>> {
        let guard = match self.lookup_any(service).await? {
            Lookup::Cached(target) => return Ok(self.channel(service, target)),
            Lookup::Dial(guard) => guard,
        };
        let _dialing = guard.lock().await;

        // Another caller may have connected while this one waited.
        let mut candidates = match self.lookup_any(service).await? {
            Lookup::Cached(target) => return Ok(self.channel(service, target)),
            Lookup::Dial(_) => self.targets(service).await,
        };

        let mut last_error = None;
        while !candidates.is_empty() {
            let index = self.selector.pick(&candidates)?;
            let address = candidates.swap_remove(index);

            match self.dialer.dial(&address).await {
                Ok(connection) => {
                    if let Some(target) = self.store_dialed(service, &address, connection).await {
                        info!("Connected service {} to {}", service, address);
                        return Ok(self.channel(service, target));
                    }
                }
                Err(e) => {
                    warn!("Failed to dial {} for service {}: {}", address, service, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Err(DiscoveryError::Unavailable(format!(
                "service {} has no available targets",
                service
            ))),
        }
    }

    /// Any open connection of a live service, or its dial guard
    async fn lookup_any(&self, service: &str) -> DiscoveryResult<Lookup<D::Connection>> {
        let services = self.services.lock().await;
        let entry = services
            .get(service)
            .filter(|entry| !entry.addresses.is_empty())
            .ok_or_else(|| {
                DiscoveryError::Unavailable(format!("service {} has no available targets", service))
            })?;

        Ok(match entry.connections.values().next() {
            Some(target) => Lookup::Cached(target.clone()),
            None => Lookup::Dial(entry.dial_guard.clone()),
        })
    }

    /// Cache a freshly dialed connection if its target is still live.
    ///
    /// A target removed during the dial gets its connection closed and
    /// `None` is returned. If a connection to the address already exists it
    /// wins and the new one is closed.
    async fn store_dialed(
        &self,
        service: &str,
        address: &str,
        connection: D::Connection,
    ) -> Option<ConnectionTarget<D::Connection>> {
        let connection = Arc::new(connection);
        let stored = {
            let mut services = self.services.lock().await;
            match services.get_mut(service) {
                Some(entry) if entry.addresses.contains(address) => Some(
                    entry
                        .connections
                        .entry(address.to_string())
                        .or_insert_with(|| ConnectionTarget {
                            address: address.to_string(),
                            connection: connection.clone(),
                            created_at: Instant::now(),
                        })
                        .clone(),
                ),
                _ => None,
            }
        };

        match stored {
            Some(target) if Arc::ptr_eq(&target.connection, &connection) => Some(target),
            Some(target) => {
                connection.close().await;
                Some(target)
            }
            None => {
                debug!(
                    "Target {} left service {} while dialing, discarding connection",
                    address, service
                );
                connection.close().await;
                None
            }
        }
    }

    /// Close every connection and forget every service
    pub async fn shutdown(&self) {
        let drained: Vec<ConnectionTarget<D::Connection>> = {
            let mut services = self.services.lock().await;
            services
                .drain()
                .flat_map(|(_, entry)| entry.connections.into_values())
                .collect()
        };

        let count = drained.len();
        futures::future::join_all(drained.iter().map(|target| target.connection.close())).await;
        info!("Connection cache shut down, closed {} connections", count);
    }

    fn channel(
        &self,
        service: &str,
        primary: ConnectionTarget<D::Connection>,
    ) -> ServiceChannel<D> {
        ServiceChannel {
            service: service.to_string(),
            primary,
            cache: self.clone(),
        }
    }

    /// Pick a target for one call, dialing it if needed.
    ///
    /// When the picked target cannot be dialed, another open connection of
    /// the service is used instead, if there is one.
    async fn pick(&self, service: &str) -> DiscoveryResult<ConnectionTarget<D::Connection>> {
        let (address, guard) = {
            let services = self.services.lock().await;
            let entry = services
                .get(service)
                .ok_or(DiscoveryError::NoAvailableTarget)?;

            let targets: Vec<String> = entry.addresses.iter().cloned().collect();
            let address = self.selector.select(&targets)?.to_string();
            if let Some(target) = entry.connections.get(&address) {
                return Ok(target.clone());
            }
            (address, entry.dial_guard.clone())
        };

        let _dialing = guard.lock().await;
        if let Some(target) = self.cached(service, &address).await {
            return Ok(target);
        }

        match self.dialer.dial(&address).await {
            Ok(connection) => {
                let target = self
                    .store_dialed(service, &address, connection)
                    .await
                    .ok_or(DiscoveryError::NoAvailableTarget)?;
                debug!("Connected service {} to {}", service, address);
                Ok(target)
            }
            Err(e) => {
                warn!("Failed to dial {} for service {}: {}", address, service, e);
                match self.lookup_any(service).await {
                    Ok(Lookup::Cached(target)) => Ok(target),
                    _ => Err(e),
                }
            }
        }
    }

    async fn cached(
        &self,
        service: &str,
        address: &str,
    ) -> Option<ConnectionTarget<D::Connection>> {
        let services = self.services.lock().await;
        services
            .get(service)
            .and_then(|entry| entry.connections.get(address))
            .cloned()
    }
}

#[async_trait]
impl<D: Dialer> TargetSink for ConnectionCache<D> {
    async fn apply(&self, service: &str, update: TargetUpdate) {
        match update {
            TargetUpdate::Add(address) => self.add(service, &address).await,
            TargetUpdate::Remove(address) => self.remove(service, &address).await,
        }
    }
}

/// Handle to a logical service returned by [`ConnectionCache::get_connection`]
pub struct ServiceChannel<D: Dialer> {
    service: String,
    primary: ConnectionTarget<D::Connection>,
    cache: ConnectionCache<D>,
}

impl<D: Dialer> Clone for ServiceChannel<D> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            primary: self.primary.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<D: Dialer> std::fmt::Debug for ServiceChannel<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceChannel")
            .field("service", &self.service)
            .field("primary", &self.primary.address)
            .finish()
    }
}

impl<D: Dialer> ServiceChannel<D> {
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Connection established when this handle was obtained
    pub fn connection(&self) -> &Arc<D::Connection> {
        &self.primary.connection
    }

    /// Address of [`Self::connection`]
    pub fn address(&self) -> &str {
        &self.primary.address
    }

    /// Select a target for one call among the current live set
    pub async fn pick(&self) -> DiscoveryResult<Arc<D::Connection>> {
        Ok(self.cache.pick(&self.service).await?.connection)
    }

    /// Like [`Self::pick`], also returning the chosen address
    pub async fn pick_target(&self) -> DiscoveryResult<(String, Arc<D::Connection>)> {
        let target = self.cache.pick(&self.service).await?;
        Ok((target.address, target.connection))
    }

    pub async fn targets(&self) -> Vec<String> {
        self.cache.targets(&self.service).await
    }
}
