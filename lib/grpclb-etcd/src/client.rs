//! etcd v3 client for the coordination store contract

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, Event, EventType, GetOptions, PutOptions, WatchOptions};
use grpclb_core::store::{keep_alive_period, KeepAliveStream, WatchStream};
use grpclb_core::{
    CoordinationStore, CoreError, KeyValue, LeaseId, LeaseKeepAlive, Result, Snapshot,
    StoreConfig, WatchEvent,
};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// EtcdStore wraps the etcd client for discovery and registration.
///
/// Cloning shares the connection. `close` releases the shared client and
/// stops the watches and keepalives opened through any clone; the gRPC
/// channel shuts down once those tasks have dropped their handles.
#[derive(Clone)]
pub struct EtcdStore {
    client: Arc<Mutex<Option<Client>>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl EtcdStore {
    /// Connect to etcd, failing if no endpoint answers within the dial timeout
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        config.validate()?;

        let options = ConnectOptions::new().with_connect_timeout(config.dial_timeout);
        let dial = async {
            let mut client = Client::connect(config.endpoints.clone(), Some(options)).await?;
            // The channel dials lazily, so probe once to surface unreachable endpoints here.
            client
                .get("/", Some(GetOptions::new().with_count_only()))
                .await?;
            Ok::<_, etcd_client::Error>(client)
        };

        let client = tokio::time::timeout(config.dial_timeout, dial)
            .await
            .map_err(|_| {
                CoreError::Connect(format!(
                    "no response from {:?} within {:?}",
                    config.endpoints, config.dial_timeout
                ))
            })?
            .map_err(|e| CoreError::Connect(e.to_string()))?;

        info!("Connected to etcd at {:?}", config.endpoints);

        Ok(Self::from_client(client))
    }

    fn from_client(client: Client) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            client: Arc::new(Mutex::new(Some(client))),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Get a clone of the etcd client for calls, unless closed
    fn client(&self) -> Result<Client> {
        self.slot()?.as_ref().cloned().ok_or(CoreError::Closed)
    }

    fn slot(&self) -> Result<MutexGuard<'_, Option<Client>>> {
        self.client
            .lock()
            .map_err(|_| CoreError::Connect("etcd client lock poisoned".to_string()))
    }
}

fn convert_event(event: &Event) -> Option<WatchEvent> {
    let kv = event.kv()?;
    decode_event(event.event_type(), kv.key(), kv.value(), kv.mod_revision())
}

/// Decode raw key and value bytes; events that are not UTF-8 are logged and skipped
fn decode_event(event_type: EventType, key: &[u8], value: &[u8], revision: i64) -> Option<WatchEvent> {
    let Ok(key) = std::str::from_utf8(key) else {
        warn!(
            "Skipping {:?} event at revision {}: key is not valid UTF-8 ({:?})",
            event_type,
            revision,
            String::from_utf8_lossy(key)
        );
        return None;
    };

    match event_type {
        EventType::Put => match std::str::from_utf8(value) {
            Ok(value) => Some(WatchEvent::Put {
                key: key.to_string(),
                value: value.to_string(),
                revision,
            }),
            Err(_) => {
                warn!(
                    "Skipping put of {} at revision {}: value is not valid UTF-8",
                    key, revision
                );
                None
            }
        },
        EventType::Delete => Some(WatchEvent::Delete {
            key: key.to_string(),
            revision,
        }),
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot> {
        let mut client = self.client()?;
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| CoreError::Get(e.to_string()))?;

        let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
        let mut kvs = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let key = kv.key_str().map_err(|e| CoreError::Get(e.to_string()))?;
            let value = kv.value_str().map_err(|e| CoreError::Get(e.to_string()))?;
            kvs.push(KeyValue {
                key: key.to_string(),
                value: value.to_string(),
            });
        }

        debug!("Scanned {} keys under {} at revision {}", kvs.len(), prefix, revision);
        Ok(Snapshot { revision, kvs })
    }

    async fn watch_prefix(&self, prefix: &str, start_revision: i64) -> Result<WatchStream> {
        let mut client = self.client()?;
        let mut options = WatchOptions::new().with_prefix();
        if start_revision > 0 {
            options = options.with_start_revision(start_revision);
        }

        let (mut watcher, mut stream) = client
            .watch(prefix, Some(options))
            .await
            .map_err(|e| CoreError::Watch(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut shutdown = self.shutdown.subscribe();
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            'stream: loop {
                let message = tokio::select! {
                    _ = shutdown.wait_for(|closed| *closed) => break,
                    _ = tx.closed() => break,
                    message = stream.message() => message,
                };

                match message {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            warn!("etcd canceled watch on {}: {}", prefix, resp.cancel_reason());
                            break;
                        }
                        for event in resp.events().iter().filter_map(convert_event) {
                            if tx.send(event).is_err() {
                                break 'stream;
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("etcd watch stream on {} ended", prefix);
                        break;
                    }
                    Err(e) => {
                        warn!("etcd watch stream on {} failed: {}", prefix, e);
                        break;
                    }
                }
            }

            if let Err(e) = watcher.cancel().await {
                debug!("Cancel of watch on {} failed: {}", prefix, e);
            }
        });

        Ok(rx)
    }

    async fn grant(&self, ttl: i64) -> Result<LeaseId> {
        let mut client = self.client()?;
        let resp = client
            .lease_grant(ttl, None)
            .await
            .map_err(|e| CoreError::LeaseGrant(e.to_string()))?;
        Ok(resp.id())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        let mut client = self.client()?;
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        client
            .put(key, value, options)
            .await
            .map_err(|e| CoreError::Put(e.to_string()))?;
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        let mut client = self.client()?;
        let (mut keeper, mut stream) = client
            .lease_keep_alive(lease)
            .await
            .map_err(|e| CoreError::KeepAlive(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut shutdown = self.shutdown.subscribe();

        // etcd only renews when asked, so this task drives the renewals.
        tokio::spawn(async move {
            loop {
                if let Err(e) = keeper.keep_alive().await {
                    warn!("Keepalive request for lease {} failed: {}", lease, e);
                    break;
                }

                let message = tokio::select! {
                    _ = shutdown.wait_for(|closed| *closed) => break,
                    _ = tx.closed() => break,
                    message = stream.message() => message,
                };

                let ttl = match message {
                    Ok(Some(resp)) if resp.ttl() > 0 => resp.ttl(),
                    Ok(Some(_)) => {
                        debug!("Lease {} no longer exists", lease);
                        break;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Keepalive stream for lease {} failed: {}", lease, e);
                        break;
                    }
                };

                if tx.send(LeaseKeepAlive { lease_id: lease, ttl }).is_err() {
                    break;
                }

                tokio::select! {
                    _ = shutdown.wait_for(|closed| *closed) => break,
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(keep_alive_period(ttl)) => {}
                }
            }
        });

        Ok(rx)
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client()?;
        client
            .lease_revoke(lease)
            .await
            .map_err(|e| CoreError::Revoke(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.slot()?.take().is_none() {
            return Ok(());
        }
        self.shutdown.send_replace(true);
        info!("Closed etcd connection");
        Ok(())
    }
}
