//! etcd-backed service registration and discovery
pub mod client;
pub mod discovery;
pub mod metrics;
pub mod register;

pub use client::EtcdStore;
pub use discovery::{DiscoveryState, Discoverer};
pub use metrics::DiscoveryMetrics;
pub use register::Registrar;
