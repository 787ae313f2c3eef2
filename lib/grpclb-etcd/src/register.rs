//! Service registration under a renewable lease

use crate::client::EtcdStore;
use crate::metrics::DiscoveryMetrics;
use grpclb_core::{
    instance_key, CoordinationStore, CoreError, KeepAliveStream, LeaseId, Result, StoreConfig,
    SCHEME,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Registrar publishes one instance address and keeps its lease alive.
///
/// `close` revokes the lease so the key disappears immediately. A Registrar
/// dropped without `close` stops renewing, and the key expires with the TTL.
pub struct Registrar<S: CoordinationStore = EtcdStore> {
    store: S,
    lease_id: LeaseId,
    key: String,
    value: String,
    renewals: Arc<AtomicU64>,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Registrar<EtcdStore> {
    /// Connect to etcd and register `address` for `service`
    pub async fn connect(
        config: &StoreConfig,
        service: &str,
        address: &str,
        ttl: i64,
    ) -> Result<Self> {
        validate(service, address, ttl)?;
        let store = EtcdStore::connect(config).await?;
        Self::create(store, service, address, ttl).await
    }
}

impl<S: CoordinationStore> Registrar<S> {
    /// Register `address` for `service` with a lease of `ttl` seconds
    pub async fn create(store: S, service: &str, address: &str, ttl: i64) -> Result<Self> {
        Self::create_with_metrics(store, service, address, ttl, None).await
    }

    /// Like `create`, counting lease renewals into `metrics`
    pub async fn create_with_metrics(
        store: S,
        service: &str,
        address: &str,
        ttl: i64,
        metrics: Option<DiscoveryMetrics>,
    ) -> Result<Self> {
        validate(service, address, ttl)?;

        let key = instance_key(SCHEME, service, address);
        let value = address.to_string();

        let lease_id = store.grant(ttl).await?;
        let acks = match publish(&store, &key, &value, lease_id).await {
            Ok(acks) => acks,
            Err(e) => {
                if let Err(revoke_err) = store.revoke(lease_id).await {
                    warn!("Failed to revoke lease {} after setup error: {}", lease_id, revoke_err);
                }
                return Err(e);
            }
        };

        let renewals = Arc::new(AtomicU64::new(0));
        let listener = tokio::spawn(listen_lease_renewals(
            lease_id,
            acks,
            renewals.clone(),
            metrics,
        ));

        info!("Registered {} -> {} with lease {} (ttl {}s)", key, value, lease_id, ttl);

        Ok(Self {
            store,
            lease_id,
            key,
            value,
            renewals,
            listener: Mutex::new(Some(listener)),
            closed: AtomicBool::new(false),
        })
    }

    /// Revoke the lease and close the store connection.
    ///
    /// Only the first call does anything; later calls return `Ok(())`.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Registrar for {} already closed", self.key);
            return Ok(());
        }

        let revoked = self.store.revoke(self.lease_id).await;
        let closed = self.store.close().await;

        if let Some(listener) = self.take_listener() {
            if let Err(e) = listener.await {
                warn!("Lease renewal listener ended abnormally: {}", e);
            }
        }

        revoked?;
        closed?;
        info!("Revoked lease {} for {}", self.lease_id, self.key);
        Ok(())
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn lease_id(&self) -> LeaseId {
        self.lease_id
    }

    /// Renewal acks received so far
    pub fn renewals(&self) -> u64 {
        self.renewals.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn take_listener(&self) -> Option<JoinHandle<()>> {
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl<S: CoordinationStore> Drop for Registrar<S> {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Some(listener) = self.take_listener() {
            listener.abort();
        }
        warn!(
            "Registrar for {} dropped without close; key stays until lease {} expires",
            self.key, self.lease_id
        );
    }
}

fn validate(service: &str, address: &str, ttl: i64) -> Result<()> {
    if service.is_empty() {
        return Err(CoreError::InvalidArgument("service name is empty".to_string()));
    }
    if address.is_empty() {
        return Err(CoreError::InvalidArgument("instance address is empty".to_string()));
    }
    if ttl <= 0 {
        return Err(CoreError::InvalidArgument(format!("lease ttl must be positive, got {}", ttl)));
    }
    Ok(())
}

async fn publish<S: CoordinationStore>(
    store: &S,
    key: &str,
    value: &str,
    lease_id: LeaseId,
) -> Result<KeepAliveStream> {
    store.put(key, value, Some(lease_id)).await?;
    store.keep_alive(lease_id).await
}

/// Consume renewal acks until the lease is revoked or the connection closes
async fn listen_lease_renewals(
    lease_id: LeaseId,
    mut acks: KeepAliveStream,
    renewals: Arc<AtomicU64>,
    metrics: Option<DiscoveryMetrics>,
) {
    while let Some(ack) = acks.recv().await {
        renewals.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &metrics {
            metrics.lease_renewals_total.inc();
        }
        debug!("Renewed lease {} (ttl {}s)", ack.lease_id, ack.ttl);
    }
    info!("Lease {} renewal stream closed", lease_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Discoverer;
    use grpclb_core::{service_prefix, Address, FailPoint, MemoryStore, Resolver, Target};
    use std::time::Duration;

    async fn registered_keys(store: &MemoryStore, service: &str) -> Vec<String> {
        store
            .get_prefix(&service_prefix(SCHEME, service))
            .await
            .unwrap()
            .kvs
            .into_iter()
            .map(|kv| kv.key)
            .collect()
    }

    #[tokio::test]
    async fn test_create_publishes_key_and_value() {
        let store = MemoryStore::new();
        let registrar = Registrar::create(store.connect(), "user-center", "127.0.0.1:9000", 5)
            .await
            .unwrap();

        assert_eq!(registrar.key(), "/grpc-load-balance/user-center/127.0.0.1:9000");
        assert_eq!(registrar.value(), "127.0.0.1:9000");

        let snapshot = store
            .get_prefix(&service_prefix(SCHEME, "user-center"))
            .await
            .unwrap();
        assert_eq!(snapshot.kvs.len(), 1);
        assert_eq!(snapshot.kvs[0].value, "127.0.0.1:9000");
        assert_eq!(store.lease_count(), 1);

        registrar.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_arguments() {
        let store = MemoryStore::new();
        for (service, address, ttl) in [("", "1:1", 5), ("svc", "", 5), ("svc", "1:1", 0)] {
            let result = Registrar::create(store.connect(), service, address, ttl).await;
            assert!(matches!(result, Err(CoreError::InvalidArgument(_))));
        }
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_grant_failure_leaves_nothing_behind() {
        let store = MemoryStore::new();
        store.fail_next(FailPoint::Grant);

        let result = Registrar::create(store.connect(), "user-center", "127.0.0.1:9000", 5).await;

        assert!(matches!(result, Err(CoreError::LeaseGrant(_))));
        assert_eq!(store.lease_count(), 0);
        assert!(registered_keys(&store, "user-center").await.is_empty());
    }

    #[tokio::test]
    async fn test_put_failure_revokes_lease() {
        let store = MemoryStore::new();
        store.fail_next(FailPoint::Put);

        let result = Registrar::create(store.connect(), "user-center", "127.0.0.1:9000", 5).await;

        assert!(matches!(result, Err(CoreError::Put(_))));
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_keepalive_failure_revokes_lease_and_key() {
        let store = MemoryStore::new();
        store.fail_next(FailPoint::KeepAlive);

        let result = Registrar::create(store.connect(), "user-center", "127.0.0.1:9000", 5).await;

        assert!(matches!(result, Err(CoreError::KeepAlive(_))));
        assert_eq!(store.lease_count(), 0);
        assert!(registered_keys(&store, "user-center").await.is_empty());
    }

    #[tokio::test]
    async fn test_close_removes_key_and_is_idempotent() {
        let store = MemoryStore::new();
        let registrar = Registrar::create(store.connect(), "user-center", "127.0.0.1:9000", 5)
            .await
            .unwrap();

        registrar.close().await.unwrap();
        registrar.close().await.unwrap();

        assert!(registrar.is_closed());
        assert!(registered_keys(&store, "user-center").await.is_empty());
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_close_reports_revoke_failure() {
        let store = MemoryStore::new();
        let registrar = Registrar::create(store.connect(), "user-center", "127.0.0.1:9000", 5)
            .await
            .unwrap();
        store.fail_next(FailPoint::Revoke);

        assert!(matches!(registrar.close().await, Err(CoreError::Revoke(_))));
        assert!(registrar.close().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewals_keep_registration_alive() {
        let store = MemoryStore::new();
        let metrics = DiscoveryMetrics::new().unwrap();
        let registrar = Registrar::create_with_metrics(
            store.connect(),
            "user-center",
            "127.0.0.1:9000",
            3,
            Some(metrics.clone()),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(registered_keys(&store, "user-center").await.len(), 1);
        assert!(registrar.renewals() >= 3);
        assert_eq!(metrics.lease_renewals_total.get(), registrar.renewals());

        registrar.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_registration_expires_for_discoverers() {
        let store = MemoryStore::new();
        let pushes = Arc::new(Mutex::new(Vec::<Vec<Address>>::new()));
        let recorder = pushes.clone();
        let discoverer = Discoverer::new(store.connect());
        discoverer
            .build(
                &Target::for_service("user-center"),
                Arc::new(move |addrs: Vec<Address>| recorder.lock().unwrap().push(addrs)),
            )
            .await
            .unwrap();

        let registrar = Registrar::create(store.connect(), "user-center", "127.0.0.1:9000", 5)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(pushes.lock().unwrap().last().map(Vec::len), Some(1));

        // Simulates the provider dying without calling close.
        drop(registrar);
        tokio::time::sleep(Duration::from_secs(7)).await;

        assert_eq!(pushes.lock().unwrap().last().map(Vec::len), Some(0));
        assert!(registered_keys(&store, "user-center").await.is_empty());
        discoverer.close().await;
    }

    #[tokio::test]
    async fn test_closed_registration_disappears_for_discoverers() {
        let store = MemoryStore::new();
        let registrar = Registrar::create(store.connect(), "user-center", "127.0.0.1:9000", 5)
            .await
            .unwrap();
        let discoverer = Discoverer::new(store.connect());
        let pushes = Arc::new(Mutex::new(Vec::<usize>::new()));
        let recorder = pushes.clone();
        discoverer
            .build(
                &Target::for_service("user-center"),
                Arc::new(move |addrs: Vec<Address>| recorder.lock().unwrap().push(addrs.len())),
            )
            .await
            .unwrap();

        registrar.close().await.unwrap();
        for _ in 0..100 {
            if pushes.lock().unwrap().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(*pushes.lock().unwrap(), vec![1, 0]);
    }
}
