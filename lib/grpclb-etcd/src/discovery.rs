//! Service discovery over a coordination-store prefix
//!
//! A Discoverer scans the prefix once, loads the result into its address
//! table, then applies the store's change feed from the revision after the
//! scan so nothing committed in between is missed.

use crate::client::EtcdStore;
use crate::metrics::{DiscoveryMetrics, MeteredSink};
use async_trait::async_trait;
use grpclb_core::{
    Address, AddressSink, AddressTable, CoordinationStore, CoreError, Resolver, Result,
    StoreConfig, Target, WatchEvent, WatchStream, SCHEME,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle of a Discoverer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryState {
    /// Only the store connection exists
    Uninitialized,
    /// Initial prefix scan in progress
    Building,
    /// Change feed is being applied
    Watching,
    /// Closed, or the change feed ended; no further pushes happen
    Closed,
}

impl fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryState::Uninitialized => write!(f, "uninitialized"),
            DiscoveryState::Building => write!(f, "building"),
            DiscoveryState::Watching => write!(f, "watching"),
            DiscoveryState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Default)]
struct Bound {
    table: Option<Arc<AddressTable>>,
    watch_task: Option<JoinHandle<()>>,
}

/// Discoverer keeps one address table in sync with one watched prefix
pub struct Discoverer<S: CoordinationStore = EtcdStore> {
    store: S,
    scheme: String,
    metrics: Option<DiscoveryMetrics>,
    bound: Mutex<Bound>,
    state: Arc<watch::Sender<DiscoveryState>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Discoverer<EtcdStore> {
    /// Connect to etcd and create an unbound discoverer
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let store = EtcdStore::connect(config).await?;
        Ok(Self::new(store))
    }
}

impl<S: CoordinationStore> Discoverer<S> {
    pub fn new(store: S) -> Self {
        let (state, _) = watch::channel(DiscoveryState::Uninitialized);
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            scheme: SCHEME.to_string(),
            metrics: None,
            bound: Mutex::new(Bound::default()),
            state: Arc::new(state),
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    /// Answer for a scheme other than the default namespace
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Record watch events and pushes into `metrics`
    pub fn with_metrics(mut self, metrics: DiscoveryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Bind to `service` under the default namespace
    pub async fn discover(&self, service: &str, sink: Arc<dyn AddressSink>) -> Result<()> {
        let target = Target {
            scheme: self.scheme.clone(),
            authority: String::new(),
            endpoint: service.to_string(),
        };
        self.build(&target, sink).await
    }

    /// Current lifecycle state
    pub fn state(&self) -> DiscoveryState {
        *self.state.borrow()
    }

    /// Follow lifecycle changes, e.g. to notice the change feed ending
    pub fn subscribe_state(&self) -> watch::Receiver<DiscoveryState> {
        self.state.subscribe()
    }

    /// Addresses currently in the table
    pub async fn services(&self) -> Vec<Address> {
        let bound = self.bound.lock().await;
        match &bound.table {
            Some(table) => table.services().await,
            None => Vec::new(),
        }
    }

    async fn bind(&self, target: &Target, sink: Arc<dyn AddressSink>) -> Result<()> {
        let mut bound = self.bound.lock().await;
        let prefix = target.prefix();

        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::Closed);
        }
        if bound.table.is_some() {
            return Err(CoreError::AlreadyBuilt(prefix));
        }

        self.state.send_replace(DiscoveryState::Building);
        info!("Loading all keys under {}", prefix);

        let snapshot = self.store.get_prefix(&prefix).await?;
        let events = self
            .store
            .watch_prefix(&prefix, snapshot.revision + 1)
            .await?;

        // close() may have run while the scan or watch setup was pending
        if self.closed.load(Ordering::SeqCst) {
            debug!("Discoverer closed while building {}", prefix);
            return Err(CoreError::Closed);
        }

        let sink: Arc<dyn AddressSink> = match &self.metrics {
            Some(metrics) => Arc::new(MeteredSink {
                inner: sink,
                metrics: metrics.clone(),
            }),
            None => sink,
        };
        let table = Arc::new(AddressTable::new(sink));
        table
            .load(
                snapshot
                    .kvs
                    .into_iter()
                    .map(|kv| (kv.key, Address::from(kv.value))),
            )
            .await;

        let watch_task = tokio::spawn(watch_events(
            prefix,
            table.clone(),
            events,
            self.shutdown.subscribe(),
            self.state.clone(),
            self.metrics.clone(),
        ));

        bound.table = Some(table);
        bound.watch_task = Some(watch_task);
        self.state.send_replace(DiscoveryState::Watching);
        Ok(())
    }
}

/// Apply change events in delivery order until closed or the feed ends
async fn watch_events(
    prefix: String,
    table: Arc<AddressTable>,
    mut events: WatchStream,
    mut shutdown: watch::Receiver<bool>,
    state: Arc<watch::Sender<DiscoveryState>>,
    metrics: Option<DiscoveryMetrics>,
) {
    info!("Watching {} for changes", prefix);

    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.wait_for(|closed| *closed) => {
                debug!("Watch on {} stopped by close", prefix);
                return;
            }
            event = events.recv() => event,
        };

        match event {
            Some(WatchEvent::Put { key, value, .. }) => {
                if let Some(metrics) = &metrics {
                    metrics.watch_events_total.with_label_values(&["put"]).inc();
                }
                table.set_service(key, Address::from(value)).await;
            }
            Some(WatchEvent::Delete { key, .. }) => {
                if let Some(metrics) = &metrics {
                    metrics.watch_events_total.with_label_values(&["delete"]).inc();
                }
                table.del_service(&key).await;
            }
            None => {
                warn!("Watch stream on {} closed, discovery stopped", prefix);
                state.send_replace(DiscoveryState::Closed);
                return;
            }
        }
    }
}

#[async_trait]
impl<S: CoordinationStore> Resolver for Discoverer<S> {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    async fn build(&self, target: &Target, sink: Arc<dyn AddressSink>) -> Result<()> {
        let result = self.bind(target, sink).await;
        if let Err(e) = &result {
            if !matches!(e, CoreError::AlreadyBuilt(_) | CoreError::Closed) {
                warn!("Resolving {} failed: {}", target, e);
                self.state.send_replace(DiscoveryState::Uninitialized);
            }
        }
        result
    }

    fn resolve_now(&self) {
        debug!("ResolveNow requested; the watch keeps addresses current");
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);

        let mut bound = self.bound.lock().await;
        if let Some(task) = bound.watch_task.take() {
            if let Err(e) = task.await {
                warn!("Watch task ended abnormally: {}", e);
            }
        }
        if let Err(e) = self.store.close().await {
            warn!("Closing store connection failed: {}", e);
        }
        if let Some(table) = bound.table.take() {
            table.clear().await;
        }

        self.state.send_replace(DiscoveryState::Closed);
        info!("Discoverer closed");
    }
}
