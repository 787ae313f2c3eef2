//! Contracts between discovery and the load-balancing layer

use crate::{Address, Result, Target};
use async_trait::async_trait;
use std::sync::Arc;

/// Receives the full address set every time the table changes.
///
/// Each push is authoritative and replaces whatever the sink held before.
/// Implementations are called while the address table lock is held, so they
/// must not block or call back into the discoverer.
pub trait AddressSink: Send + Sync {
    fn update_addresses(&self, addresses: Vec<Address>);
}

impl<F> AddressSink for F
where
    F: Fn(Vec<Address>) + Send + Sync,
{
    fn update_addresses(&self, addresses: Vec<Address>) {
        self(addresses)
    }
}

/// Name-resolution hooks a balancing framework drives
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Scheme this resolver answers for
    fn scheme(&self) -> &str;

    /// Resolve `target` and keep `sink` updated until closed
    async fn build(&self, target: &Target, sink: Arc<dyn AddressSink>) -> Result<()>;

    /// Hint that the caller wants a fresh resolution
    fn resolve_now(&self);

    /// Stop resolving and release the store connection
    async fn close(&self);
}
