//! Core service discovery building blocks
//!
//! This library provides:
//! - Registration key naming and resolver targets
//! - The lock-guarded address table pushed to the load balancer
//! - The coordination store abstraction and an in-memory store
//! - Store connection configuration

pub mod config;
pub mod endpoint;
pub mod error;
pub mod memory;
pub mod resolver;
pub mod store;
pub mod table;

pub use config::StoreConfig;
pub use endpoint::{instance_key, service_prefix, Address, Target, SCHEME};
pub use error::{CoreError, Result};
pub use memory::{FailPoint, MemoryStore, HISTORY_LIMIT};
pub use resolver::{AddressSink, Resolver};
pub use store::{
    keep_alive_period, CoordinationStore, KeepAliveStream, KeyValue, LeaseId, LeaseKeepAlive, Snapshot, WatchEvent,
    WatchStream,
};
pub use table::AddressTable;
