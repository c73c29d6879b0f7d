use crate::errors::{ClientError, ClientResult};
use std::fmt;

/// Socket flavour used for a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Plaintext TCP.
    Tcp,
    /// TCP wrapped in TLS.
    Tls,
}

impl TransportKind {
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Tls)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Tls => write!(f, "tls"),
        }
    }
}

/// Maps a protocol token to its transport.
///
/// # Errors
///
/// [`ClientError::UnsupportedProtocol`] for anything but `http` and `https`.
pub fn select(protocol: &str) -> ClientResult<TransportKind> {
    match protocol {
        "http" => Ok(TransportKind::Tcp),
        "https" => Ok(TransportKind::Tls),
        other => Err(ClientError::UnsupportedProtocol(other.to_string())),
    }
}
