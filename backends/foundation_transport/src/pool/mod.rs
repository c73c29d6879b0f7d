//! Connection pooling.
//!
//! [`registry::PoolRegistry`] is the sharded index of pooled connections;
//! [`manager::PoolManager`] is the supervised coordinator that decides what
//! enters and leaves it.

pub mod manager;
pub mod registry;

use crate::errors::ClientResult;
use crate::url::{self, Endpoint};
use std::fmt;

pub use manager::{global, PoolManager};
pub use registry::{CheckinOutcome, PoolRegistry, RegistryStats};

/// Connections are shared only between identical protocol, host and port.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub protocol: String,
    pub host: String,
    pub port: u16,
}

impl PoolKey {
    /// # Errors
    ///
    /// [`crate::ClientError::InvalidUrl`] when `url` does not decompose.
    pub fn from_url(url: &str) -> ClientResult<Self> {
        Ok(Self::from(&url::decompose(url)?))
    }
}

impl From<&Endpoint> for PoolKey {
    fn from(endpoint: &Endpoint) -> Self {
        Self {
            protocol: endpoint.protocol.clone(),
            host: endpoint.hostname.to_ascii_lowercase(),
            port: endpoint.port,
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
    }
}
