//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Naming bridge from registry membership to connection targets
//!
//! A [`Resolver`] reads one revision-stamped snapshot of a service, then
//! follows a watch opened right after that revision. Incremental events are
//! never applied before the snapshot. When the watch fails it is reopened
//! from the last revision seen; if that revision has been compacted away the
//! resolver diffs a fresh snapshot against what it already reported.

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::registry::{Registry, ServiceSnapshot};
use crate::signal::{stop_pair, StopHandle, StopSignal};
use crate::types::{MembershipAction, MembershipEvent, Revision, TargetUpdate};
use crate::watcher::Watcher;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Consumer of target updates, e.g. the connection cache
#[async_trait]
pub trait TargetSink: Send + Sync {
    async fn apply(&self, service: &str, update: TargetUpdate);
}

pub struct Resolver {
    registry: Arc<dyn Registry>,
    service: String,
    reconnect_delay: Duration,
    watcher: Option<Watcher>,
    /// Node id -> advertised `address:port`
    members: HashMap<String, String>,
    last_revision: Option<Revision>,
    initialized: bool,
    stop: StopHandle,
    signal: StopSignal,
}

impl Resolver {
    pub fn new(
        registry: Arc<dyn Registry>,
        service: impl Into<String>,
        reconnect_delay: Duration,
    ) -> Self {
        let (stop, signal) = stop_pair();
        Self {
            registry,
            service: service.into(),
            reconnect_delay,
            watcher: None,
            members: HashMap::new(),
            last_revision: None,
            initialized: false,
            stop,
            signal,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Whether the initial snapshot has been applied
    pub fn initialized(&self) -> bool {
        self.initialized
    }

    /// Current target set
    pub fn targets(&self) -> BTreeSet<String> {
        self.members.values().cloned().collect()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Wait for the next batch of target updates.
    ///
    /// The first call returns the snapshot, possibly empty. Later calls block
    /// until membership changes in a way that alters the target set. Watch
    /// failures are absorbed by reconnecting; only snapshot failures and a
    /// stop request are returned.
    pub async fn next(&mut self) -> DiscoveryResult<Vec<TargetUpdate>> {
        loop {
            if self.signal.is_stopped() {
                self.close().await;
                return Err(DiscoveryError::Stopped);
            }

            if !self.initialized {
                let snapshot = self.registry.snapshot(&self.service).await?;
                let updates = self.reconcile(snapshot);
                self.initialized = true;
                info!(
                    "Resolved {} with {} targets at revision {:?}",
                    self.service,
                    self.members.len(),
                    self.last_revision
                );
                return Ok(updates);
            }

            if self.watcher.is_none() {
                let start = self.last_revision.map(|revision| revision + 1);
                match self.registry.watch_from(&self.service, start).await {
                    Ok(watcher) => self.watcher = Some(watcher),
                    Err(e) => {
                        warn!(
                            "Failed to watch {}, retrying in {:?}: {}",
                            self.service, self.reconnect_delay, e
                        );
                        self.pause().await?;
                        continue;
                    }
                }
            }

            let Some(watcher) = self.watcher.as_mut() else {
                continue;
            };

            let signal = &mut self.signal;
            let result = tokio::select! {
                _ = signal.stopped() => None,
                result = watcher.next() => Some(result),
            };

            if let Some(revision) = watcher.last_revision() {
                self.last_revision = Some(revision);
            }

            let Some(result) = result else {
                continue;
            };

            match result {
                Ok(event) => {
                    let updates = self.apply(event);
                    if !updates.is_empty() {
                        return Ok(updates);
                    }
                }
                Err(DiscoveryError::Compacted(revision)) => {
                    warn!(
                        "Watch on {} resumed past compaction at revision {}, resynchronising",
                        self.service, revision
                    );
                    self.watcher = None;
                    match self.registry.snapshot(&self.service).await {
                        Ok(snapshot) => {
                            let updates = self.reconcile(snapshot);
                            if !updates.is_empty() {
                                return Ok(updates);
                            }
                        }
                        Err(e) => {
                            warn!("Failed to resynchronise {}: {}", self.service, e);
                            self.pause().await?;
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "Watch on {} failed, reopening in {:?}: {}",
                        self.service, self.reconnect_delay, e
                    );
                    self.watcher = None;
                    self.pause().await?;
                }
            }
        }
    }

    /// Release the current watch, if any
    pub async fn close(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop().await;
        }
    }

    async fn pause(&mut self) -> DiscoveryResult<()> {
        let delay = self.reconnect_delay;
        tokio::select! {
            _ = self.signal.stopped() => Err(DiscoveryError::Stopped),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn holds(&self, address: &str) -> bool {
        self.members.values().any(|held| held == address)
    }

    fn apply(&mut self, event: MembershipEvent) -> Vec<TargetUpdate> {
        let mut updates = Vec::new();

        for node in &event.descriptor.nodes {
            let address = node.endpoint();
            match event.action {
                MembershipAction::Created => {
                    let already_held = self.holds(&address);
                    let previous = self.members.insert(node.id.clone(), address.clone());

                    if let Some(previous) = previous.filter(|previous| *previous != address) {
                        if !self.holds(&previous) {
                            updates.push(TargetUpdate::Remove(previous));
                        }
                    }
                    if !already_held {
                        updates.push(TargetUpdate::Add(address));
                    }
                }
                MembershipAction::Deleted => {
                    // Only drop the node if it is still registered at this address.
                    if self.members.get(&node.id) == Some(&address) {
                        self.members.remove(&node.id);
                        if !self.holds(&address) {
                            updates.push(TargetUpdate::Remove(address));
                        }
                    }
                }
            }
        }

        debug!(
            "{} {} at revision {} -> {} updates",
            event.descriptor.name,
            event.action,
            event.revision,
            updates.len()
        );
        updates
    }

    /// Replace the membership with `snapshot`, reporting additions before removals
    fn reconcile(&mut self, snapshot: ServiceSnapshot) -> Vec<TargetUpdate> {
        let before = self.targets();

        self.members = snapshot
            .services
            .iter()
            .flat_map(|descriptor| descriptor.nodes.iter())
            .map(|node| (node.id.clone(), node.endpoint()))
            .collect();
        self.last_revision = Some(snapshot.revision);

        let after = self.targets();
        let added = after
            .difference(&before)
            .cloned()
            .map(TargetUpdate::Add);
        let removed = before
            .difference(&after)
            .cloned()
            .map(TargetUpdate::Remove);
        added.chain(removed).collect()
    }
}

/// A resolver running in the background, feeding a [`TargetSink`]
pub struct ResolverTask {
    service: String,
    stop: StopHandle,
    ready: watch::Receiver<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ResolverTask {
    pub fn spawn(mut resolver: Resolver, sink: Arc<dyn TargetSink>) -> Self {
        let service = resolver.service().to_string();
        let stop = resolver.stop_handle();
        let (ready_tx, ready) = watch::channel(false);

        let task_service = service.clone();
        let handle = tokio::spawn(async move {
            info!("Resolver for {} started", task_service);
            loop {
                match resolver.next().await {
                    Ok(updates) => {
                        for update in updates {
                            sink.apply(&task_service, update).await;
                        }
                        if resolver.initialized() {
                            ready_tx.send_replace(true);
                        }
                    }
                    Err(DiscoveryError::Stopped) => break,
                    Err(e) => {
                        warn!(
                            "Resolver for {} failed, retrying in {:?}: {}",
                            task_service, resolver.reconnect_delay, e
                        );
                        if resolver.pause().await.is_err() {
                            break;
                        }
                    }
                }
            }
            resolver.close().await;
            info!("Resolver for {} stopped", task_service);
        });

        Self {
            service,
            stop,
            ready,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Whether the initial snapshot has reached the sink
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the initial snapshot has reached the sink
    pub async fn wait_ready(&self, timeout: Duration) -> DiscoveryResult<()> {
        let mut ready = self.ready.clone();
        let wait = async move { ready.wait_for(|ready| *ready).await.map(|_| ()) };
        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DiscoveryError::Stopped),
            Err(_) => Err(DiscoveryError::Timeout(format!(
                "resolver for {} not ready after {:?}",
                self.service, timeout
            ))),
        }
    }

    /// Request a stop without waiting for the task
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Stop the task and wait for it to release its watch
    pub async fn shutdown(&self) {
        self.stop.stop();
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Resolver task for {} ended abnormally: {}", self.service, e);
            }
        }
    }
}
