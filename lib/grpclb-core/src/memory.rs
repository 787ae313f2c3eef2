//! In-process coordination store
//!
//! MemoryStore gives the same guarantees discovery relies on from etcd:
//! a single revision counter, prefix scans, prefix watches that can resume
//! from a revision, and leases that delete their keys on revoke or expiry.
//! Lease expiry runs on `tokio::time`, so paused-clock tests can drive it.
//!
//! Only the last [`HISTORY_LIMIT`] events are kept for replay. Watching from
//! an older revision fails the way a compacted etcd revision does.

use crate::store::{
    keep_alive_period, CoordinationStore, KeepAliveStream, KeyValue, LeaseId, LeaseKeepAlive, Snapshot, WatchEvent,
    WatchStream,
};
use crate::{CoreError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::debug;

/// Number of past events retained for watches that resume from a revision
pub const HISTORY_LIMIT: usize = 1024;

/// Store operations that can be made to fail once, for exercising error paths
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Get,
    Watch,
    Grant,
    Put,
    KeepAlive,
    Revoke,
}

struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

struct Lease {
    ttl: i64,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct Watcher {
    conn: u64,
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct State {
    revision: i64,
    next_lease: LeaseId,
    next_conn: u64,
    kvs: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    history: VecDeque<WatchEvent>,
    compacted: i64,
    watchers: Vec<Watcher>,
    fail_points: HashSet<FailPoint>,
}

impl State {
    fn take_failure(&mut self, point: FailPoint) -> bool {
        self.fail_points.remove(&point)
    }

    fn emit(&mut self, event: WatchEvent) {
        if self.history.len() == HISTORY_LIMIT {
            if let Some(oldest) = self.history.pop_front() {
                self.compacted = oldest.revision();
            }
        }
        self.history.push_back(event.clone());
        self.watchers.retain(|w| {
            if event.key().starts_with(&w.prefix) {
                w.tx.send(event.clone()).is_ok()
            } else {
                !w.tx.is_closed()
            }
        });
    }

    fn delete_key(&mut self, key: &str) {
        if self.kvs.remove(key).is_some() {
            self.revision += 1;
            let revision = self.revision;
            self.emit(WatchEvent::Delete {
                key: key.to_string(),
                revision,
            });
        }
    }

    fn drop_lease(&mut self, lease: LeaseId) -> bool {
        match self.leases.remove(&lease) {
            Some(state) => {
                for key in state.keys {
                    self.delete_key(&key);
                }
                true
            }
            None => false,
        }
    }
}

struct Connection {
    id: u64,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// A connection handle to a shared in-memory store
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Mutex<State>>,
    conn: Arc<Connection>,
}

impl MemoryStore {
    /// Create an empty store and return the first connection to it
    pub fn new() -> Self {
        let shared = Arc::new(Mutex::new(State {
            next_lease: 1,
            ..Default::default()
        }));
        Self::attach(shared)
    }

    /// Open another independent connection to the same store
    pub fn connect(&self) -> Self {
        Self::attach(self.shared.clone())
    }

    fn attach(shared: Arc<Mutex<State>>) -> Self {
        let id = {
            let mut state = lock(&shared);
            state.next_conn += 1;
            state.next_conn
        };
        let (shutdown, _) = watch::channel(false);
        Self {
            shared,
            conn: Arc::new(Connection {
                id,
                closed: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    /// Make the next call of `point` on any connection fail
    pub fn fail_next(&self, point: FailPoint) {
        lock(&self.shared).fail_points.insert(point);
    }

    /// Number of live leases
    pub fn lease_count(&self) -> usize {
        lock(&self.shared).leases.len()
    }

    /// Current store revision
    pub fn revision(&self) -> i64 {
        lock(&self.shared).revision
    }

    /// Delete a key directly, as an operator would with `etcdctl del`
    pub fn delete(&self, key: &str) {
        lock(&self.shared).delete_key(key);
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        if self.conn.closed.load(Ordering::SeqCst) {
            return Err(CoreError::Closed);
        }
        Ok(lock(&self.shared))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(shared: &Mutex<State>) -> MutexGuard<'_, State> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn expire_when_due(shared: Weak<Mutex<State>>, lease: LeaseId) {
    loop {
        let deadline = {
            let Some(shared) = shared.upgrade() else { return };
            let state = lock(&shared);
            match state.leases.get(&lease) {
                Some(l) => l.deadline,
                None => return,
            }
        };

        tokio::time::sleep_until(deadline).await;

        let Some(shared) = shared.upgrade() else { return };
        let mut state = lock(&shared);
        match state.leases.get(&lease) {
            Some(l) if l.deadline <= Instant::now() => {
                debug!("Lease {} expired", lease);
                state.drop_lease(lease);
                return;
            }
            Some(_) => continue,
            None => return,
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot> {
        let mut state = self.state()?;
        if state.take_failure(FailPoint::Get) {
            return Err(CoreError::Get(format!("injected failure for {}", prefix)));
        }

        let kvs = state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| KeyValue {
                key: k.clone(),
                value: e.value.clone(),
            })
            .collect();

        Ok(Snapshot {
            revision: state.revision,
            kvs,
        })
    }

    async fn watch_prefix(&self, prefix: &str, start_revision: i64) -> Result<WatchStream> {
        let mut state = self.state()?;
        if state.take_failure(FailPoint::Watch) {
            return Err(CoreError::Watch(format!("injected failure for {}", prefix)));
        }

        if start_revision > 0 && start_revision <= state.compacted {
            return Err(CoreError::Watch(format!(
                "revision {} has been compacted, oldest available is {}",
                start_revision,
                state.compacted + 1
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if start_revision > 0 {
            for event in state
                .history
                .iter()
                .filter(|e| e.revision() >= start_revision && e.key().starts_with(prefix))
            {
                let _ = tx.send(event.clone());
            }
        }

        state.watchers.push(Watcher {
            conn: self.conn.id,
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn grant(&self, ttl: i64) -> Result<LeaseId> {
        if ttl <= 0 {
            return Err(CoreError::LeaseGrant(format!("ttl must be positive, got {}", ttl)));
        }

        let lease = {
            let mut state = self.state()?;
            if state.take_failure(FailPoint::Grant) {
                return Err(CoreError::LeaseGrant("injected failure".to_string()));
            }
            let lease = state.next_lease;
            state.next_lease += 1;
            state.leases.insert(
                lease,
                Lease {
                    ttl,
                    deadline: Instant::now() + Duration::from_secs(ttl as u64),
                    keys: BTreeSet::new(),
                },
            );
            lease
        };

        tokio::spawn(expire_when_due(Arc::downgrade(&self.shared), lease));
        Ok(lease)
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        let mut state = self.state()?;
        if state.take_failure(FailPoint::Put) {
            return Err(CoreError::Put(format!("injected failure for {}", key)));
        }

        if let Some(id) = lease {
            match state.leases.get_mut(&id) {
                Some(l) => {
                    l.keys.insert(key.to_string());
                }
                None => return Err(CoreError::Put(format!("lease {} not found", id))),
            }
        }

        let previous = state.kvs.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease,
            },
        );
        if let Some(old) = previous.and_then(|e| e.lease).filter(|old| Some(*old) != lease) {
            if let Some(l) = state.leases.get_mut(&old) {
                l.keys.remove(key);
            }
        }

        state.revision += 1;
        let revision = state.revision;
        state.emit(WatchEvent::Put {
            key: key.to_string(),
            value: value.to_string(),
            revision,
        });
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        let ttl = {
            let mut state = self.state()?;
            if state.take_failure(FailPoint::KeepAlive) {
                return Err(CoreError::KeepAlive(format!("injected failure for lease {}", lease)));
            }
            state
                .leases
                .get(&lease)
                .map(|l| l.ttl)
                .ok_or_else(|| CoreError::KeepAlive(format!("lease {} not found", lease)))?
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::downgrade(&self.shared);
        let mut shutdown = self.conn.shutdown.subscribe();
        let period = keep_alive_period(ttl);

        tokio::spawn(async move {
            loop {
                let renewed = {
                    let Some(shared) = shared.upgrade() else { break };
                    let mut state = lock(&shared);
                    match state.leases.get_mut(&lease) {
                        Some(l) => {
                            l.deadline = Instant::now() + Duration::from_secs(l.ttl as u64);
                            Some(l.ttl)
                        }
                        None => None,
                    }
                };

                let Some(ttl) = renewed else { break };
                if tx.send(LeaseKeepAlive { lease_id: lease, ttl }).is_err() {
                    break;
                }

                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = shutdown.changed() => break,
                    _ = tx.closed() => break,
                }
            }
            debug!("Keepalive loop for lease {} stopped", lease);
        });

        Ok(rx)
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.state()?;
        if state.take_failure(FailPoint::Revoke) {
            return Err(CoreError::Revoke(format!("injected failure for lease {}", lease)));
        }
        if state.drop_lease(lease) {
            Ok(())
        } else {
            Err(CoreError::Revoke(format!("lease {} not found", lease)))
        }
    }

    async fn close(&self) -> Result<()> {
        if self.conn.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.conn.shutdown.send(true);
        let id = self.conn.id;
        lock(&self.shared).watchers.retain(|w| w.conn != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prefix_scan_only_returns_matching_keys() {
        let store = MemoryStore::new();
        store.put("/svc/a/1", "1", None).await.unwrap();
        store.put("/svc/ab/2", "2", None).await.unwrap();
        store.put("/svc/a/3", "3", None).await.unwrap();

        let snapshot = store.get_prefix("/svc/a/").await.unwrap();
        let keys: Vec<_> = snapshot.kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/svc/a/1", "/svc/a/3"]);
        assert_eq!(snapshot.revision, 3);
    }

    #[tokio::test]
    async fn test_watch_replays_from_revision() {
        let store = MemoryStore::new();
        store.put("/svc/a/1", "1", None).await.unwrap();
        store.put("/svc/a/2", "2", None).await.unwrap();

        let mut events = store.watch_prefix("/svc/a/", 2).await.unwrap();
        store.delete("/svc/a/1");

        assert_eq!(
            events.recv().await,
            Some(WatchEvent::Put {
                key: "/svc/a/2".to_string(),
                value: "2".to_string(),
                revision: 2,
            })
        );
        assert_eq!(
            events.recv().await,
            Some(WatchEvent::Delete {
                key: "/svc/a/1".to_string(),
                revision: 3,
            })
        );
    }

    #[tokio::test]
    async fn test_watch_from_compacted_revision_fails() {
        let store = MemoryStore::new();
        for i in 0..HISTORY_LIMIT + 2 {
            store.put("/svc/a/1", &i.to_string(), None).await.unwrap();
        }
        let revision = store.revision();

        assert!(matches!(
            store.watch_prefix("/svc/a/", 1).await,
            Err(CoreError::Watch(_))
        ));
        assert!(matches!(
            store.watch_prefix("/svc/a/", 2).await,
            Err(CoreError::Watch(_))
        ));

        let mut events = store.watch_prefix("/svc/a/", 3).await.unwrap();
        assert_eq!(events.recv().await.map(|e| e.revision()), Some(3));

        let mut events = store.watch_prefix("/svc/a/", revision).await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(WatchEvent::Put {
                key: "/svc/a/1".to_string(),
                value: (HISTORY_LIMIT + 1).to_string(),
                revision,
            })
        );
    }

    #[tokio::test]
    async fn test_revoke_deletes_bound_keys() {
        let store = MemoryStore::new();
        let lease = store.grant(5).await.unwrap();
        store.put("/svc/a/1", "1", Some(lease)).await.unwrap();
        store.put("/svc/a/2", "2", None).await.unwrap();

        store.revoke(lease).await.unwrap();

        let snapshot = store.get_prefix("/svc/a/").await.unwrap();
        assert_eq!(snapshot.kvs.len(), 1);
        assert_eq!(snapshot.kvs[0].key, "/svc/a/2");
        assert!(store.revoke(lease).await.is_err());
    }

    #[tokio::test]
    async fn test_grant_rejects_non_positive_ttl() {
        let store = MemoryStore::new();
        assert!(matches!(store.grant(0).await, Err(CoreError::LeaseGrant(_))));
    }

    #[tokio::test]
    async fn test_put_with_unknown_lease_fails() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.put("/svc/a/1", "1", Some(42)).await,
            Err(CoreError::Put(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_without_keepalive() {
        let store = MemoryStore::new();
        let lease = store.grant(5).await.unwrap();
        store.put("/svc/a/1", "1", Some(lease)).await.unwrap();
        let mut events = store.watch_prefix("/svc/a/", 0).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;

        assert!(matches!(events.recv().await, Some(WatchEvent::Delete { .. })));
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_holds_lease_until_stream_dropped() {
        let store = MemoryStore::new();
        let lease = store.grant(3).await.unwrap();
        store.put("/svc/a/1", "1", Some(lease)).await.unwrap();
        let mut acks = store.keep_alive(lease).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.lease_count(), 1);
        assert_eq!(acks.recv().await.map(|a| a.lease_id), Some(lease));

        drop(acks);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_close_ends_watches_of_that_connection_only() {
        let store = MemoryStore::new();
        let other = store.connect();
        let mut mine = store.watch_prefix("/svc/", 0).await.unwrap();
        let mut theirs = other.watch_prefix("/svc/", 0).await.unwrap();

        store.close().await.unwrap();
        other.put("/svc/a/1", "1", None).await.unwrap();

        assert_eq!(mine.recv().await, None);
        assert!(theirs.recv().await.is_some());
        assert!(matches!(store.get_prefix("/svc/").await, Err(CoreError::Closed)));
    }

    #[tokio::test]
    async fn test_fail_point_fires_once() {
        let store = MemoryStore::new();
        store.fail_next(FailPoint::Get);

        assert!(matches!(store.get_prefix("/").await, Err(CoreError::Get(_))));
        assert!(store.get_prefix("/").await.is_ok());
    }
}
