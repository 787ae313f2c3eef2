use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Failed to connect to coordination store: {0}")]
    Connect(String),

    #[error("Prefix scan failed: {0}")]
    Get(String),

    #[error("Watch subscription failed: {0}")]
    Watch(String),

    #[error("Lease grant failed: {0}")]
    LeaseGrant(String),

    #[error("Key write failed: {0}")]
    Put(String),

    #[error("Lease keepalive failed: {0}")]
    KeepAlive(String),

    #[error("Lease revoke failed: {0}")]
    Revoke(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid resolver target: {0}")]
    InvalidTarget(String),

    #[error("Resolver already built for prefix {0}")]
    AlreadyBuilt(String),

    #[error("Component is closed")]
    Closed,

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Config file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
}
