//! Coordination store connection settings

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable holding comma-separated store endpoints
pub const ENDPOINTS_ENV: &str = "GRPCLB_ETCD_ENDPOINTS";
/// Environment variable overriding the dial timeout, in seconds
pub const DIAL_TIMEOUT_ENV: &str = "GRPCLB_DIAL_TIMEOUT_SECS";

/// Where and how to reach the coordination store
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store endpoints as `host:port`
    pub endpoints: Vec<String>,
    /// Upper bound on establishing the connection
    #[serde(default = "default_dial_timeout", with = "seconds")]
    pub dial_timeout: Duration,
}

fn default_dial_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:2379".to_string()],
            dial_timeout: default_dial_timeout(),
        }
    }
}

impl StoreConfig {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            ..Default::default()
        }
    }

    /// Defaults overridden by `GRPCLB_ETCD_ENDPOINTS` and `GRPCLB_DIAL_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(endpoints) = std::env::var(ENDPOINTS_ENV) {
            config.endpoints = parse_endpoints(&endpoints);
        }
        if let Ok(secs) = std::env::var(DIAL_TIMEOUT_ENV) {
            let secs: u64 = secs.trim().parse().map_err(|_| {
                CoreError::Configuration(format!("{} must be an integer, got {:?}", DIAL_TIMEOUT_ENV, secs))
            })?;
            config.dial_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// File if given, else environment; non-empty `endpoints` override either
    pub fn load(path: Option<&Path>, endpoints: &[String]) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::from_env()?,
        };
        if !endpoints.is_empty() {
            config.endpoints = endpoints.to_vec();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(CoreError::Configuration("no store endpoints configured".to_string()));
        }
        if self.endpoints.iter().any(|e| e.trim().is_empty()) {
            return Err(CoreError::Configuration("empty store endpoint".to_string()));
        }
        if self.dial_timeout.is_zero() {
            return Err(CoreError::Configuration("dial timeout must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Split a comma-separated endpoint list, dropping blanks
pub fn parse_endpoints(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.endpoints, vec!["127.0.0.1:2379"]);
        assert_eq!(config.dial_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_endpoints() {
        assert_eq!(
            parse_endpoints("10.0.0.1:2379, 10.0.0.2:2379,,"),
            vec!["10.0.0.1:2379", "10.0.0.2:2379"]
        );
        assert!(parse_endpoints(" , ").is_empty());
    }

    #[test]
    fn test_validate_rejects_empty_endpoints() {
        let config = StoreConfig::new(Vec::new());
        assert!(matches!(config.validate(), Err(CoreError::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = StoreConfig {
            dial_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_dial_timeout_defaults() {
        let config: StoreConfig = serde_yaml::from_str("endpoints: [\"121.5.62.93:2379\"]\n").unwrap();
        assert_eq!(config.endpoints, vec!["121.5.62.93:2379"]);
        assert_eq!(config.dial_timeout, Duration::from_secs(5));

        let config: StoreConfig =
            serde_yaml::from_str("endpoints: [\"a:1\"]\ndial_timeout: 2\n").unwrap();
        assert_eq!(config.dial_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_load_flag_endpoints_override_file() {
        let path = std::env::temp_dir().join(format!("grpclb-config-{}.yaml", std::process::id()));
        std::fs::write(&path, "endpoints: [\"10.0.0.1:2379\"]\ndial_timeout: 3\n").unwrap();

        let from_file = StoreConfig::load(Some(&path), &[]).unwrap();
        assert_eq!(from_file.endpoints, vec!["10.0.0.1:2379"]);

        let overridden = StoreConfig::load(Some(&path), &["10.0.0.2:2379".to_string()]).unwrap();
        assert_eq!(overridden.endpoints, vec!["10.0.0.2:2379"]);
        assert_eq!(overridden.dial_timeout, Duration::from_secs(3));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_from_file_missing() {
        assert!(matches!(
            StoreConfig::from_file("/nonexistent/grpclb.yaml"),
            Err(CoreError::Io(_))
        ));
    }
}
