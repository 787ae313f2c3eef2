//! Load balancing strategies for distributing calls across instances

use grpclb_core::{Address, AddressSink};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use tracing::{debug, info};

/// Load balancing strategy
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum LoadBalancingStrategy {
    /// Round-robin: distribute calls evenly across instances
    #[default]
    RoundRobin,
    /// Random: pick any instance uniformly
    Random,
}

/// Load balancer holding the latest address set pushed by discovery
pub struct LoadBalancer {
    strategy: LoadBalancingStrategy,
    addresses: RwLock<Vec<Address>>,
    round_robin_counter: AtomicUsize,
}

impl LoadBalancer {
    /// Create a new load balancer with the specified strategy
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        Self {
            strategy,
            addresses: RwLock::new(Vec::new()),
            round_robin_counter: AtomicUsize::new(0),
        }
    }

    /// Select an address based on the configured strategy.
    ///
    /// `None` means no instance is registered right now; callers should
    /// treat that as the service being temporarily unavailable.
    pub fn pick(&self) -> Option<Address> {
        let addresses = self.read();
        if addresses.is_empty() {
            return None;
        }

        let index = match self.strategy {
            LoadBalancingStrategy::RoundRobin => {
                self.round_robin_counter.fetch_add(1, Ordering::SeqCst) % addresses.len()
            }
            LoadBalancingStrategy::Random => rand::thread_rng().gen_range(0..addresses.len()),
        };
        addresses.get(index).cloned()
    }

    /// Hash-based selection so the same key keeps landing on the same instance
    pub fn pick_by_hash(&self, hash_key: &str) -> Option<Address> {
        let addresses = self.read();
        if addresses.is_empty() {
            return None;
        }

        let hash = Self::compute_hash(hash_key);
        addresses.get(hash % addresses.len()).cloned()
    }

    /// Addresses from the latest push, sorted
    pub fn addresses(&self) -> Vec<Address> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Address>> {
        self.addresses
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Compute hash for a string
    fn compute_hash(s: &str) -> usize {
        // FNV-1a
        const FNV_OFFSET_BASIS: usize = 14695981039346656037;
        const FNV_PRIME: usize = 1099511628211;

        let mut hash = FNV_OFFSET_BASIS;
        for byte in s.bytes() {
            hash ^= byte as usize;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(LoadBalancingStrategy::default())
    }
}

impl AddressSink for LoadBalancer {
    fn update_addresses(&self, mut addresses: Vec<Address>) {
        // Table iteration order is arbitrary; sort so rotation is stable.
        addresses.sort();
        addresses.dedup();

        let mut current = self
            .addresses
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *current != addresses {
            info!("Balancer now has {} addresses: {:?}", addresses.len(), addresses);
        } else {
            debug!("Balancer address set unchanged");
        }
        *current = addresses;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(list: &[&str]) -> Vec<Address> {
        list.iter().map(|s| Address::from(*s)).collect()
    }

    #[test]
    fn test_empty_balancer_picks_nothing() {
        let lb = LoadBalancer::default();
        assert_eq!(lb.pick(), None);
        assert_eq!(lb.pick_by_hash("user-1"), None);
        assert!(lb.is_empty());
    }

    #[test]
    fn test_round_robin_cycles_through_addresses() {
        let lb = LoadBalancer::new(LoadBalancingStrategy::RoundRobin);
        lb.update_addresses(addrs(&["10.0.0.2:9000", "10.0.0.1:9000"]));

        let picks: Vec<String> = (0..4).map(|_| lb.pick().unwrap().to_string()).collect();
        assert_eq!(
            picks,
            vec!["10.0.0.1:9000", "10.0.0.2:9000", "10.0.0.1:9000", "10.0.0.2:9000"]
        );
    }

    #[test]
    fn test_push_replaces_previous_set() {
        let lb = LoadBalancer::default();
        lb.update_addresses(addrs(&["10.0.0.1:9000", "10.0.0.2:9000"]));
        lb.update_addresses(addrs(&["10.0.0.3:9000"]));

        assert_eq!(lb.addresses(), addrs(&["10.0.0.3:9000"]));
        assert_eq!(lb.pick(), Some(Address::from("10.0.0.3:9000")));

        lb.update_addresses(Vec::new());
        assert_eq!(lb.pick(), None);
    }

    #[test]
    fn test_random_picks_known_address() {
        let lb = LoadBalancer::new(LoadBalancingStrategy::Random);
        let set = addrs(&["10.0.0.1:9000", "10.0.0.2:9000", "10.0.0.3:9000"]);
        lb.update_addresses(set.clone());

        for _ in 0..20 {
            assert!(set.contains(&lb.pick().unwrap()));
        }
    }

    #[test]
    fn test_hash_pick_is_stable() {
        let lb = LoadBalancer::default();
        lb.update_addresses(addrs(&["10.0.0.1:9000", "10.0.0.2:9000", "10.0.0.3:9000"]));

        let first = lb.pick_by_hash("session-42");
        assert_eq!(lb.pick_by_hash("session-42"), first);
    }

    #[test]
    fn test_duplicate_addresses_collapse() {
        let lb = LoadBalancer::default();
        lb.update_addresses(addrs(&["10.0.0.1:9000", "10.0.0.1:9000"]));
        assert_eq!(lb.len(), 1);
    }
}
