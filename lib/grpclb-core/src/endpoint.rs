//! Instance addresses, registration key naming and resolver targets

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Namespace shared by providers and consumers; the first key segment.
pub const SCHEME: &str = "grpc-load-balance";

/// A dialable instance address such as `10.0.0.1:9000`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Address {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Build the watched prefix for a service: `/{namespace}/{service}/`
pub fn service_prefix(namespace: &str, service: &str) -> String {
    format!("/{}/{}/", namespace, service)
}

/// Build the registration key for one instance: `/{namespace}/{service}/{addr}`
pub fn instance_key(namespace: &str, service: &str, addr: &str) -> String {
    format!("{}{}", service_prefix(namespace, service), addr)
}

/// Resolver target parsed from `scheme://authority/endpoint`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub scheme: String,
    pub authority: String,
    pub endpoint: String,
}

impl Target {
    /// Target for a service name under the default namespace
    pub fn for_service(service: &str) -> Self {
        Self {
            scheme: SCHEME.to_string(),
            authority: String::new(),
            endpoint: service.to_string(),
        }
    }

    /// Parse `scheme://authority/endpoint`; the authority may be empty.
    pub fn parse(target: &str) -> Result<Self> {
        let (scheme, rest) = target
            .split_once("://")
            .ok_or_else(|| CoreError::InvalidTarget(target.to_string()))?;
        let (authority, endpoint) = rest
            .split_once('/')
            .ok_or_else(|| CoreError::InvalidTarget(target.to_string()))?;

        if scheme.is_empty() || endpoint.is_empty() {
            return Err(CoreError::InvalidTarget(target.to_string()));
        }

        Ok(Self {
            scheme: scheme.to_string(),
            authority: authority.to_string(),
            endpoint: endpoint.to_string(),
        })
    }

    /// Prefix every instance of this target is registered under
    pub fn prefix(&self) -> String {
        service_prefix(&self.scheme, &self.endpoint)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.authority, self.endpoint)
    }
}
