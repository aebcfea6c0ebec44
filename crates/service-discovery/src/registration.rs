//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Serving-side registration loop
//!
//! `Starting -> Registered -> (re-register every interval) -> Deregistering -> Stopped`.
//! A failed attempt is logged and retried on the next tick. Stopping the
//! loop deregisters exactly once.

use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::registry::{RegisterOptions, Registry};
use crate::signal::{stop_pair, StopHandle};
use crate::types::ServiceDescriptor;
use crate::DEFAULT_REGISTRATION_INTERVAL_SECS;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Starting,
    Registered,
    Deregistering,
    Stopped,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationState::Starting => write!(f, "starting"),
            RegistrationState::Registered => write!(f, "registered"),
            RegistrationState::Deregistering => write!(f, "deregistering"),
            RegistrationState::Stopped => write!(f, "stopped"),
        }
    }
}

pub struct RegistrationLoop {
    registry: Arc<dyn Registry>,
    service: ServiceDescriptor,
    interval: Duration,
    jitter: Duration,
    ttl: Option<Duration>,
}

impl RegistrationLoop {
    pub fn new(registry: Arc<dyn Registry>, service: ServiceDescriptor) -> Self {
        Self {
            registry,
            service,
            interval: Duration::from_secs(DEFAULT_REGISTRATION_INTERVAL_SECS),
            jitter: Duration::ZERO,
            ttl: None,
        }
    }

    pub fn from_config(
        registry: Arc<dyn Registry>,
        service: ServiceDescriptor,
        config: &DiscoveryConfig,
    ) -> Self {
        Self::new(registry, service)
            .with_interval(config.registration_interval)
            .with_jitter(config.registration_jitter)
            .with_ttl(config.lease_ttl)
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Add a random delay of up to `jitter` to every tick
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    fn next_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.interval;
        }
        self.interval + rand::thread_rng().gen_range(Duration::ZERO..=self.jitter)
    }

    /// Start the loop in the background.
    ///
    /// The descriptor is validated up front, so an empty node list fails
    /// here instead of on every tick.
    pub fn spawn(self) -> DiscoveryResult<RegistrationHandle> {
        self.service.validate_for_registration()?;

        let (stop, mut signal) = stop_pair();
        let (state_tx, state) = watch::channel(RegistrationState::Starting);
        let name = self.service.name.clone();

        let task = tokio::spawn(async move {
            let options = RegisterOptions { ttl: self.ttl };
            info!(
                "Registration loop for {} started (interval {:?}, jitter {:?})",
                self.service.name, self.interval, self.jitter
            );

            while !signal.is_stopped() {
                match self.registry.register(&self.service, options.clone()).await {
                    Ok(()) => {
                        if *state_tx.borrow() != RegistrationState::Registered {
                            info!("Service {} registered", self.service.name);
                            state_tx.send_replace(RegistrationState::Registered);
                        } else {
                            debug!("Service {} re-registered", self.service.name);
                        }
                    }
                    Err(e) => {
                        warn!(
                            "Registration of {} failed, retrying in {:?}: {}",
                            self.service.name, self.interval, e
                        );
                    }
                }

                let delay = self.next_delay();
                tokio::select! {
                    _ = signal.stopped() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            state_tx.send_replace(RegistrationState::Deregistering);
            let result = self.registry.deregister(&self.service).await;
            match &result {
                Ok(()) => info!("Service {} deregistered", self.service.name),
                Err(e) => error!("Failed to deregister {}: {}", self.service.name, e),
            }
            state_tx.send_replace(RegistrationState::Stopped);
            result
        });

        Ok(RegistrationHandle {
            service: name,
            state,
            stop,
            task: Mutex::new(Some(task)),
        })
    }
}

/// Control handle of a running registration loop.
///
/// Dropping the handle stops the loop, which still deregisters.
pub struct RegistrationHandle {
    service: String,
    state: watch::Receiver<RegistrationState>,
    stop: StopHandle,
    task: Mutex<Option<JoinHandle<DiscoveryResult<()>>>>,
}

impl RegistrationHandle {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> RegistrationState {
        *self.state.borrow()
    }

    /// Wait until the loop reaches `target`
    pub async fn wait_for(
        &self,
        target: RegistrationState,
        timeout: Duration,
    ) -> DiscoveryResult<()> {
        let mut state = self.state.clone();
        let wait = async move { state.wait_for(|state| *state == target).await.map(|_| ()) };
        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DiscoveryError::Stopped),
            Err(_) => Err(DiscoveryError::Timeout(format!(
                "{} did not reach {} within {:?}",
                self.service, target, timeout
            ))),
        }
    }

    /// Stop the loop, deregister, and wait for completion.
    ///
    /// Only the first call observes the deregistration result.
    pub async fn shutdown(&self) -> DiscoveryResult<()> {
        self.stop.stop();
        let task = self.task.lock().await.take();
        match task {
            Some(task) => task.await.map_err(|e| {
                DiscoveryError::Shutdown(format!(
                    "registration loop for {} panicked: {}",
                    self.service, e
                ))
            })?,
            None => Ok(()),
        }
    }
}

impl Drop for RegistrationHandle {
    fn drop(&mut self) {
        self.stop.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{KeyLayout, StoreRegistry};
    use crate::store::MemoryStore;
    use crate::types::Node;

    fn setup() -> (MemoryStore, Arc<dyn Registry>) {
        let store = MemoryStore::new();
        let registry: Arc<dyn Registry> = Arc::new(StoreRegistry::with_options(
            Arc::new(store.clone()),
            KeyLayout::default(),
            Duration::from_secs(30),
            Duration::from_secs(5),
        ));
        (store, registry)
    }

    fn orders() -> ServiceDescriptor {
        ServiceDescriptor::new("orders").with_node(Node::with_id("a", "10.0.0.1", 9001))
    }

    #[tokio::test(start_paused = true)]
    async fn test_registers_and_deregisters() {
        let (store, registry) = setup();
        let handle = RegistrationLoop::new(registry.clone(), orders())
            .spawn()
            .unwrap();

        handle
            .wait_for(RegistrationState::Registered, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(registry.get_service("orders").await.unwrap().len(), 1);

        handle.shutdown().await.unwrap();
        assert_eq!(handle.state(), RegistrationState::Stopped);
        assert!(registry.get_service("orders").await.unwrap().is_empty());
        assert_eq!(store.lease_count(), 0);

        // A second shutdown does not deregister again.
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregisters_every_interval() {
        let (store, registry) = setup();
        let handle = RegistrationLoop::new(registry.clone(), orders())
            .spawn()
            .unwrap();
        handle
            .wait_for(RegistrationState::Registered, Duration::from_secs(1))
            .await
            .unwrap();
        let first = store.revision();

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(store.revision() > first);

        // Well past the TTL the entry is still alive, kept by re-registration.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(registry.get_service("orders").await.unwrap().len(), 1);
        assert_eq!(store.lease_count(), 1);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempts_retry_on_next_tick() {
        let (store, registry) = setup();
        store.set_unavailable(true);

        let handle = RegistrationLoop::new(registry.clone(), orders())
            .spawn()
            .unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(handle.state(), RegistrationState::Starting);

        store.set_unavailable(false);
        handle
            .wait_for(RegistrationState::Registered, Duration::from_secs(20))
            .await
            .unwrap();
        assert_eq!(registry.get_service("orders").await.unwrap().len(), 1);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_stays_within_bounds() {
        let (_store, registry) = setup();
        let registration = RegistrationLoop::new(registry, orders())
            .with_interval(Duration::from_secs(15))
            .with_jitter(Duration::from_secs(5));

        for _ in 0..100 {
            let delay = registration.next_delay();
            assert!(delay >= Duration::from_secs(15));
            assert!(delay <= Duration::from_secs(20));
        }
    }

    #[tokio::test]
    async fn test_empty_descriptor_is_rejected() {
        let (_store, registry) = setup();
        let result = RegistrationLoop::new(registry, ServiceDescriptor::new("orders")).spawn();
        assert!(matches!(result, Err(DiscoveryError::EmptyNodes(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_deregisters() {
        let (store, registry) = setup();
        let handle = RegistrationLoop::new(registry.clone(), orders())
            .spawn()
            .unwrap();
        handle
            .wait_for(RegistrationState::Registered, Duration::from_secs(1))
            .await
            .unwrap();

        drop(handle);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.get_service("orders").await.unwrap().is_empty());
        assert_eq!(store.lease_count(), 0);
    }
}
