//! Coordination store abstraction
//!
//! The store is a strongly-consistent key-value service with prefix scans,
//! prefix watches and leases. Discovery and registration only talk to it
//! through [`CoordinationStore`].

use crate::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Lease identifier issued by the store
pub type LeaseId = i64;

/// Change feed returned by [`CoordinationStore::watch_prefix`]
pub type WatchStream = mpsc::UnboundedReceiver<WatchEvent>;

/// Renewal acks returned by [`CoordinationStore::keep_alive`]
pub type KeepAliveStream = mpsc::UnboundedReceiver<LeaseKeepAlive>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Result of a prefix scan, with the store revision it reflects
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub revision: i64,
    pub kvs: Vec<KeyValue>,
}

/// One change delivered on a watch stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    /// Key created or updated
    Put {
        key: String,
        value: String,
        revision: i64,
    },
    /// Key deleted, revoked or expired
    Delete { key: String, revision: i64 },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key, .. } => key,
        }
    }

    pub fn revision(&self) -> i64 {
        match self {
            WatchEvent::Put { revision, .. } | WatchEvent::Delete { revision, .. } => *revision,
        }
    }
}

/// Lease renewal acknowledgement
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseKeepAlive {
    pub lease_id: LeaseId,
    /// Remaining TTL in seconds after the renewal
    pub ttl: i64,
}

/// Renewal period for keepalive loops: a third of the TTL, at least 1s
pub fn keep_alive_period(ttl: i64) -> Duration {
    Duration::from_secs((ttl / 3).max(1) as u64)
}

/// Client handle to a coordination store.
///
/// A handle is one connection: `close` ends every watch and keepalive
/// stream it opened and makes later calls fail with `CoreError::Closed`.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// All key/value pairs under `prefix`
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot>;

    /// Changes under `prefix` from `start_revision` on (0 means "from now")
    async fn watch_prefix(&self, prefix: &str, start_revision: i64) -> Result<WatchStream>;

    /// Grant a lease with a TTL in seconds
    async fn grant(&self, ttl: i64) -> Result<LeaseId>;

    /// Write a key, optionally bound to a lease
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()>;

    /// Keep a lease alive until it is revoked or the handle is closed
    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream>;

    /// Revoke a lease, deleting every key bound to it
    async fn revoke(&self, lease: LeaseId) -> Result<()>;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}
