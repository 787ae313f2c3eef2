//! Lock-guarded address table feeding the load-balancing sink

use crate::{Address, AddressSink};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// AddressTable maps registration keys to instance addresses.
///
/// Every mutation pushes the complete address set to the sink before the
/// lock is released, so the sink never observes a half-applied change.
pub struct AddressTable {
    // Map of registration key to dialable address
    services: Mutex<HashMap<String, Address>>,
    sink: Arc<dyn AddressSink>,
}

impl AddressTable {
    pub fn new(sink: Arc<dyn AddressSink>) -> Self {
        Self {
            services: Mutex::new(HashMap::new()),
            sink,
        }
    }

    /// Insert a batch of entries and push once
    pub async fn load<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, Address)>,
    {
        let mut services = self.services.lock().await;
        for (key, addr) in entries {
            services.insert(key, addr);
        }
        self.sink.update_addresses(snapshot(&services));
        info!("Loaded {} service addresses", services.len());
    }

    /// Insert or overwrite a key, then push
    pub async fn set_service(&self, key: String, addr: Address) {
        let mut services = self.services.lock().await;
        let previous = services.insert(key, addr.clone());
        self.sink.update_addresses(snapshot(&services));

        match previous {
            Some(old) if old != addr => info!("Updated service address {} -> {}", old, addr),
            Some(_) => debug!("Service address {} unchanged", addr),
            None => info!("Added service address {} to balancer", addr),
        }
    }

    /// Remove a key, then push. Removing an absent key leaves the table as is.
    pub async fn del_service(&self, key: &str) {
        let mut services = self.services.lock().await;
        let removed = services.remove(key);
        self.sink.update_addresses(snapshot(&services));

        match removed {
            Some(addr) => info!("Removed service address {} from balancer", addr),
            None => debug!("Delete for unknown key {}", key),
        }
    }

    /// Current addresses, in no particular order
    pub async fn services(&self) -> Vec<Address> {
        let services = self.services.lock().await;
        snapshot(&services)
    }

    /// Look up the address registered under a key
    pub async fn get(&self, key: &str) -> Option<Address> {
        let services = self.services.lock().await;
        services.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.services.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.services.lock().await.is_empty()
    }

    /// Discard all entries without notifying the sink
    pub async fn clear(&self) {
        self.services.lock().await.clear();
    }
}

fn snapshot(services: &HashMap<String, Address>) -> Vec<Address> {
    services.values().cloned().collect()
}
