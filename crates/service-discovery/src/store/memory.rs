//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! In-process coordination store
//!
//! Keeps etcd's observable semantics that discovery relies on: a single
//! monotonically increasing revision, TTL leases whose keys disappear on
//! expiry or revoke, and prefix watches that can replay from a start
//! revision and carry before-images. History older than the retained window
//! is compacted automatically, as an etcd auto-compaction policy would.

use super::{
    CoordinationClient, KeyValue, LeaseId, Range, StoreEvent, StoreEventKind, WatchRequest,
    WatchStream,
};
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::types::Revision;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How often the background reaper looks for expired leases
const REAPER_PERIOD: Duration = Duration::from_millis(100);

/// Revisions of watch history kept for replay
pub const DEFAULT_HISTORY_REVISIONS: Revision = 1000;

type WatchMessage = DiscoveryResult<Vec<StoreEvent>>;

struct StoredValue {
    value: Vec<u8>,
    mod_revision: Revision,
    lease: Option<LeaseId>,
}

struct MemoryLease {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

struct MemoryWatch {
    prefix: String,
    prev_kv: bool,
    tx: mpsc::UnboundedSender<WatchMessage>,
}

struct MemoryState {
    revision: Revision,
    kvs: BTreeMap<String, StoredValue>,
    leases: HashMap<LeaseId, MemoryLease>,
    next_lease: LeaseId,
    history: VecDeque<StoreEvent>,
    history_revisions: Revision,
    compacted: Revision,
    watches: Vec<MemoryWatch>,
    unavailable: bool,
    rejected_prefix: Option<String>,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            revision: 0,
            kvs: BTreeMap::new(),
            leases: HashMap::new(),
            next_lease: 0,
            history: VecDeque::new(),
            history_revisions: DEFAULT_HISTORY_REVISIONS,
            compacted: 0,
            watches: Vec::new(),
            unavailable: false,
            rejected_prefix: None,
        }
    }
}

impl MemoryState {
    fn check_available(&self) -> DiscoveryResult<()> {
        if self.unavailable {
            return Err(DiscoveryError::Store(
                "coordination store unavailable".to_string(),
            ));
        }
        Ok(())
    }

    /// Commit a batch of changes at a new revision and fan it out to watches.
    fn commit(&mut self, mut events: Vec<StoreEvent>) {
        if events.is_empty() {
            return;
        }

        self.revision += 1;
        for event in &mut events {
            event.revision = self.revision;
        }

        self.watches.retain(|watch| {
            let matching: Vec<StoreEvent> = events
                .iter()
                .filter(|event| event.key.starts_with(&watch.prefix))
                .map(|event| strip_prev(event, watch.prev_kv))
                .collect();
            matching.is_empty() || watch.tx.send(Ok(matching)).is_ok()
        });

        self.history.extend(events);
        let floor = self.revision - self.history_revisions;
        if floor > self.compacted {
            self.compact_to(floor);
        }
    }

    fn compact_to(&mut self, revision: Revision) {
        let revision = revision.min(self.revision);
        while self
            .history
            .front()
            .is_some_and(|event| event.revision <= revision)
        {
            self.history.pop_front();
        }
        self.compacted = self.compacted.max(revision);
    }

    fn remove_key(&mut self, key: &str) -> Option<StoreEvent> {
        let stored = self.kvs.remove(key)?;
        if let Some(lease) = stored.lease.and_then(|id| self.leases.get_mut(&id)) {
            lease.keys.remove(key);
        }
        Some(StoreEvent {
            kind: StoreEventKind::Delete,
            key: key.to_string(),
            value: Vec::new(),
            prev_value: Some(stored.value),
            revision: 0,
        })
    }

    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let lease = match self.leases.remove(&id) {
            Some(lease) => lease,
            None => return false,
        };

        let mut keys: Vec<String> = lease.keys.into_iter().collect();
        keys.sort();
        let events = keys
            .iter()
            .filter_map(|key| self.remove_key(key))
            .collect();
        self.commit(events);
        true
    }

    fn expire_leases(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            debug!("Lease {} expired", id);
            self.drop_lease(id);
        }
    }
}

fn strip_prev(event: &StoreEvent, prev_kv: bool) -> StoreEvent {
    let mut event = event.clone();
    if !prev_kv {
        event.prev_value = None;
    }
    event
}

/// In-memory coordination store
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    /// Create an empty store.
    ///
    /// When called inside a tokio runtime a background task expires leases
    /// without needing further traffic; it exits once the store is dropped.
    pub fn new() -> Self {
        let store = Self::default();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(Self::reap(Arc::downgrade(&store.state)));
        }
        store
    }

    async fn reap(state: Weak<Mutex<MemoryState>>) {
        let mut interval = tokio::time::interval(REAPER_PERIOD);
        loop {
            interval.tick().await;
            let state = match state.upgrade() {
                Some(state) => state,
                None => return,
            };
            let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
            guard.expire_leases(Instant::now());
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.expire_leases(Instant::now());
        state
    }

    /// Make every client call fail as if the store were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Make puts to keys under `prefix` fail; `None` accepts every put again
    pub fn reject_puts(&self, prefix: Option<&str>) {
        self.lock().rejected_prefix = prefix.map(str::to_string);
    }

    /// Terminate every open watch with an error
    pub fn reset_watches(&self) {
        let mut state = self.lock();
        for watch in state.watches.drain(..) {
            let _ = watch.tx.send(Err(DiscoveryError::WatchClosed(
                "watch stream reset".to_string(),
            )));
        }
    }

    /// Keep only the last `revisions` revisions of history for watch replay
    pub fn with_history_revisions(self, revisions: Revision) -> Self {
        self.lock().history_revisions = revisions.max(1);
        self
    }

    /// Discard history up to and including `revision`
    pub fn compact(&self, revision: Revision) {
        self.lock().compact_to(revision);
    }

    /// Current store revision
    pub fn revision(&self) -> Revision {
        self.lock().revision
    }

    /// Number of live leases
    pub fn lease_count(&self) -> usize {
        self.lock().leases.len()
    }

    /// Number of open watches
    pub fn watch_count(&self) -> usize {
        let mut state = self.lock();
        state.watches.retain(|watch| !watch.tx.is_closed());
        state.watches.len()
    }
}

#[async_trait]
impl CoordinationClient for MemoryStore {
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> DiscoveryResult<()> {
        let mut state = self.lock();
        state.check_available()?;
        if let Some(prefix) = &state.rejected_prefix {
            if key.starts_with(prefix.as_str()) {
                return Err(DiscoveryError::Store(format!("put to {} rejected", key)));
            }
        }

        if let Some(id) = lease {
            match state.leases.get_mut(&id) {
                Some(lease) => {
                    lease.keys.insert(key.to_string());
                }
                None => {
                    return Err(DiscoveryError::Store(format!("lease {} not found", id)));
                }
            }
        }

        let revision = state.revision + 1;
        let previous = state.kvs.insert(
            key.to_string(),
            StoredValue {
                value: value.clone(),
                mod_revision: revision,
                lease,
            },
        );

        let prev_value = previous.map(|previous| {
            if previous.lease != lease {
                if let Some(old) = previous.lease.and_then(|id| state.leases.get_mut(&id)) {
                    old.keys.remove(key);
                }
            }
            previous.value
        });

        state.commit(vec![StoreEvent {
            kind: StoreEventKind::Put,
            key: key.to_string(),
            value,
            prev_value,
            revision,
        }]);
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> DiscoveryResult<Range> {
        let state = self.lock();
        state.check_available()?;

        let kvs = state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, stored)| KeyValue {
                key: key.clone(),
                value: stored.value.clone(),
                mod_revision: stored.mod_revision,
                lease: stored.lease,
            })
            .collect();

        Ok(Range {
            kvs,
            revision: state.revision,
        })
    }

    async fn delete(&self, key: &str, with_prefix: bool) -> DiscoveryResult<u64> {
        let mut state = self.lock();
        state.check_available()?;

        let keys: Vec<String> = if with_prefix {
            state
                .kvs
                .range(key.to_string()..)
                .take_while(|(k, _)| k.starts_with(key))
                .map(|(k, _)| k.clone())
                .collect()
        } else if state.kvs.contains_key(key) {
            vec![key.to_string()]
        } else {
            Vec::new()
        };

        let events: Vec<StoreEvent> = keys.iter().filter_map(|k| state.remove_key(k)).collect();
        let deleted = events.len() as u64;
        state.commit(events);
        Ok(deleted)
    }

    async fn grant(&self, ttl_secs: i64) -> DiscoveryResult<LeaseId> {
        if ttl_secs <= 0 {
            return Err(DiscoveryError::Store(format!("invalid lease TTL {}", ttl_secs)));
        }

        let mut state = self.lock();
        state.check_available()?;

        state.next_lease += 1;
        let id = state.next_lease;
        let ttl = Duration::from_secs(ttl_secs as u64);
        state.leases.insert(
            id,
            MemoryLease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> DiscoveryResult<i64> {
        let mut state = self.lock();
        state.check_available()?;

        match state.leases.get_mut(&lease) {
            Some(record) => {
                record.deadline = Instant::now() + record.ttl;
                Ok(record.ttl.as_secs() as i64)
            }
            None => Err(DiscoveryError::Store(format!("lease {} has expired", lease))),
        }
    }

    async fn revoke(&self, lease: LeaseId) -> DiscoveryResult<()> {
        let mut state = self.lock();
        state.check_available()?;

        if !state.drop_lease(lease) {
            warn!("Revoking unknown lease {}", lease);
        }
        Ok(())
    }

    async fn watch(&self, request: WatchRequest) -> DiscoveryResult<Box<dyn WatchStream>> {
        let mut state = self.lock();
        state.check_available()?;

        let (tx, rx) = mpsc::unbounded_channel();

        // Replay and registration happen under one lock, so nothing falls in between.
        if let Some(start) = request.start_revision {
            if start <= state.compacted {
                let _ = tx.send(Err(DiscoveryError::Compacted(state.compacted)));
                return Ok(Box::new(MemoryWatchStream { rx }));
            }

            let replay: Vec<StoreEvent> = state
                .history
                .iter()
                .filter(|event| event.revision >= start && event.key.starts_with(&request.prefix))
                .map(|event| strip_prev(event, request.prev_kv))
                .collect();
            if !replay.is_empty() {
                let _ = tx.send(Ok(replay));
            }
        }

        state.watches.push(MemoryWatch {
            prefix: request.prefix,
            prev_kv: request.prev_kv,
            tx,
        });

        Ok(Box::new(MemoryWatchStream { rx }))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

struct MemoryWatchStream {
    rx: mpsc::UnboundedReceiver<WatchMessage>,
}

#[async_trait]
impl WatchStream for MemoryWatchStream {
    async fn message(&mut self) -> DiscoveryResult<Option<Vec<StoreEvent>>> {
        match self.rx.recv().await {
            Some(Ok(events)) => Ok(Some(events)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn cancel(&mut self) -> DiscoveryResult<()> {
        self.rx.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete_prefix() {
        let store = MemoryStore::new();
        store.put("/services/orders/a", b"a".to_vec(), None).await.unwrap();
        store.put("/services/orders/b", b"b".to_vec(), None).await.unwrap();
        store.put("/services/users/c", b"c".to_vec(), None).await.unwrap();

        let range = store.get_prefix("/services/orders/").await.unwrap();
        assert_eq!(range.kvs.len(), 2);
        assert_eq!(range.revision, 3);

        assert_eq!(store.delete("/services/orders/", true).await.unwrap(), 2);
        assert!(store.get_prefix("/services/orders/").await.unwrap().kvs.is_empty());
        assert_eq!(store.get_prefix("/services/").await.unwrap().kvs.len(), 1);
    }

    #[tokio::test]
    async fn test_exact_delete_leaves_siblings() {
        let store = MemoryStore::new();
        store.put("/services/orders/a", b"a".to_vec(), None).await.unwrap();
        store.put("/services/orders/ab", b"ab".to_vec(), None).await.unwrap();

        assert_eq!(store.delete("/services/orders/a", false).await.unwrap(), 1);
        let range = store.get_prefix("/services/orders/").await.unwrap();
        assert_eq!(range.kvs.len(), 1);
        assert_eq!(range.kvs[0].key, "/services/orders/ab");
    }

    #[tokio::test]
    async fn test_revoke_deletes_attached_keys() {
        let store = MemoryStore::new();
        let lease = store.grant(30).await.unwrap();
        store.put("/k/leased", b"1".to_vec(), Some(lease)).await.unwrap();
        store.put("/k/plain", b"2".to_vec(), None).await.unwrap();

        store.revoke(lease).await.unwrap();
        let range = store.get_prefix("/k/").await.unwrap();
        assert_eq!(range.kvs.len(), 1);
        assert_eq!(range.kvs[0].key, "/k/plain");
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_put_under_unknown_lease_fails() {
        let store = MemoryStore::new();
        assert!(store.put("/k", b"1".to_vec(), Some(42)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_and_keep_alive() {
        let store = MemoryStore::new();
        let lease = store.grant(2).await.unwrap();
        store.put("/k", b"1".to_vec(), Some(lease)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(store.keep_alive_once(lease).await.unwrap(), 2);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(store.get_prefix("/k").await.unwrap().kvs.len(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(store.get_prefix("/k").await.unwrap().kvs.is_empty());
        assert!(store.keep_alive_once(lease).await.is_err());
    }

    #[tokio::test]
    async fn test_watch_delivers_prev_value_on_delete() {
        let store = MemoryStore::new();
        store.put("/w/a", b"first".to_vec(), None).await.unwrap();

        let mut stream = store
            .watch(WatchRequest::prefix("/w/").with_prev_kv())
            .await
            .unwrap();
        store.delete("/w/a", false).await.unwrap();

        let events = stream.message().await.unwrap().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, StoreEventKind::Delete);
        assert_eq!(events[0].prev_value.as_deref(), Some(&b"first"[..]));
    }

    #[tokio::test]
    async fn test_watch_replays_from_start_revision() {
        let store = MemoryStore::new();
        store.put("/w/a", b"1".to_vec(), None).await.unwrap();
        let snapshot = store.get_prefix("/w/").await.unwrap();
        store.put("/w/b", b"2".to_vec(), None).await.unwrap();
        store.put("/other", b"3".to_vec(), None).await.unwrap();

        let mut stream = store
            .watch(WatchRequest::prefix("/w/").with_start_revision(Some(snapshot.revision + 1)))
            .await
            .unwrap();

        let events = stream.message().await.unwrap().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, "/w/b");
        assert_eq!(events[0].prev_value, None);
    }

    #[tokio::test]
    async fn test_unavailable_and_reset() {
        let store = MemoryStore::new();
        let mut stream = store.watch(WatchRequest::prefix("/w/")).await.unwrap();
        assert_eq!(store.watch_count(), 1);

        store.reset_watches();
        assert!(stream.message().await.is_err());
        assert!(stream.message().await.unwrap().is_none());

        store.set_unavailable(true);
        assert!(matches!(
            store.grant(5).await,
            Err(DiscoveryError::Store(_))
        ));
        store.set_unavailable(false);
        assert!(store.grant(5).await.is_ok());
    }

    #[tokio::test]
    async fn test_watch_from_compacted_revision_fails() {
        let store = MemoryStore::new();
        store.put("/w/a", b"1".to_vec(), None).await.unwrap();
        store.put("/w/a", b"2".to_vec(), None).await.unwrap();
        store.compact(2);

        let mut stale = store
            .watch(WatchRequest::prefix("/w/").with_start_revision(Some(1)))
            .await
            .unwrap();
        assert!(matches!(
            stale.message().await,
            Err(DiscoveryError::Compacted(2))
        ));

        let mut fresh = store
            .watch(WatchRequest::prefix("/w/").with_start_revision(Some(3)))
            .await
            .unwrap();
        store.put("/w/b", b"3".to_vec(), None).await.unwrap();
        let events = fresh.message().await.unwrap().unwrap();
        assert_eq!(events[0].key, "/w/b");
    }

    #[tokio::test]
    async fn test_history_is_compacted_automatically() {
        let store = MemoryStore::new().with_history_revisions(3);
        for i in 0..10 {
            store.put("/w/a", vec![i], None).await.unwrap();
        }

        let mut stale = store
            .watch(WatchRequest::prefix("/w/").with_start_revision(Some(2)))
            .await
            .unwrap();
        assert!(matches!(
            stale.message().await,
            Err(DiscoveryError::Compacted(7))
        ));

        let mut recent = store
            .watch(WatchRequest::prefix("/w/").with_start_revision(Some(8)))
            .await
            .unwrap();
        let events = recent.message().await.unwrap().unwrap();
        let revisions: Vec<Revision> = events.iter().map(|event| event.revision).collect();
        assert_eq!(revisions, vec![8, 9, 10]);
    }
}
