use crate::types::{ConnectionId, RequestRef};
use derive_more::From;
use std::io;
use std::time::Duration;

/// DNS resolution errors.
///
/// These errors occur during DNS hostname resolution.
#[derive(From, Debug)]
pub enum DnsError {
    /// DNS resolution failed for the given hostname.
    #[from(ignore)]
    ResolutionFailed(String),

    /// Invalid hostname provided.
    #[from(ignore)]
    InvalidHost(String),

    /// No addresses found for the given hostname.
    #[from(ignore)]
    NoAddressesFound(String),

    /// I/O error during DNS resolution.
    #[from(ignore)]
    IoError(String),
}

impl From<io::Error> for DnsError {
    fn from(err: io::Error) -> Self {
        DnsError::IoError(err.to_string())
    }
}

impl Clone for DnsError {
    fn clone(&self) -> Self {
        match self {
            Self::ResolutionFailed(s) => Self::ResolutionFailed(s.clone()),
            Self::InvalidHost(s) => Self::InvalidHost(s.clone()),
            Self::NoAddressesFound(s) => Self::NoAddressesFound(s.clone()),
            Self::IoError(s) => Self::IoError(s.clone()),
        }
    }
}

impl std::error::Error for DnsError {}

impl core::fmt::Display for DnsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ResolutionFailed(host) => {
                write!(f, "DNS resolution failed for host: {host}")
            }
            Self::InvalidHost(host) => {
                write!(f, "Invalid hostname: {host}")
            }
            Self::NoAddressesFound(host) => {
                write!(f, "No addresses found for host: {host}")
            }
            Self::IoError(err) => {
                write!(f, "I/O error during DNS resolution: {err}")
            }
        }
    }
}

/// Failures raised by the socket and wire engine.
///
/// The connection layer forwards these untouched inside
/// [`ClientError::Transport`].
#[derive(From, Debug)]
pub enum TransportError {
    /// DNS resolution error.
    #[from]
    Dns(DnsError),

    /// Connection refused, unreachable, reset during connect.
    #[from(ignore)]
    ConnectionFailed(String),

    /// Connection timeout exceeded.
    #[from(ignore)]
    ConnectionTimeout(String),

    /// TLS handshake failed.
    #[from(ignore)]
    TlsHandshakeFailed(String),

    /// The peer closed the connection.
    #[from(ignore)]
    Closed,

    /// The socket reader reported a read failure.
    #[from(ignore)]
    ReadFailed(String),

    /// Bytes on the wire did not form a valid HTTP/1.1 response.
    #[from(ignore)]
    Protocol(String),

    /// I/O error while writing to the connection.
    #[from]
    IoError(io::Error),
}

impl TransportError {
    /// Returns true when the error means the socket is no longer usable.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Dns(_))
    }
}

impl std::error::Error for TransportError {}

impl core::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dns(err) => write!(f, "DNS error: {err}"),
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::ConnectionTimeout(msg) => write!(f, "Connection timeout: {msg}"),
            Self::TlsHandshakeFailed(msg) => write!(f, "TLS handshake failed: {msg}"),
            Self::Closed => write!(f, "Connection closed by peer"),
            Self::ReadFailed(msg) => write!(f, "Read failed: {msg}"),
            Self::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            Self::IoError(err) => write!(f, "I/O error: {err}"),
        }
    }
}

/// Transport client errors.
///
/// `Timeout` is the only variant this crate synthesises on its own, transport
/// failures are passed through as [`TransportError`] values.
#[derive(From, Debug)]
pub enum ClientError {
    /// Malformed or incomplete URL at the decompose or relativize step.
    #[from(ignore)]
    InvalidUrl(String),

    /// Protocol other than `http` or `https`.
    #[from(ignore)]
    UnsupportedProtocol(String),

    /// Header name or value that cannot be written on the wire.
    #[from(ignore)]
    InvalidHeader(String),

    /// Failure forwarded from the socket or wire engine.
    #[from]
    Transport(TransportError),

    /// No transport message arrived within the configured window.
    #[from(ignore)]
    Timeout(Duration),

    /// The connection already has an outstanding request.
    #[from(ignore)]
    RequestInFlight(RequestRef),

    /// A mailbox message that belongs to another connection.
    #[from(ignore)]
    UnknownMessage(ConnectionId),

    /// The pool coordinator is stopped or did not answer.
    #[from(ignore)]
    PoolUnavailable,
}

impl ClientError {
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    #[must_use]
    pub fn is_invalid_url(&self) -> bool {
        matches!(self, Self::InvalidUrl(_))
    }
}

impl From<DnsError> for ClientError {
    fn from(err: DnsError) -> Self {
        ClientError::Transport(TransportError::Dns(err))
    }
}

impl From<::url::ParseError> for ClientError {
    fn from(err: ::url::ParseError) -> Self {
        ClientError::InvalidUrl(err.to_string())
    }
}

impl std::error::Error for ClientError {}

impl core::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidUrl(url) => write!(f, "Invalid URL: {url}"),
            Self::UnsupportedProtocol(protocol) => write!(
                f,
                "Unsupported protocol: {protocol} (only http and https are supported)"
            ),
            Self::InvalidHeader(header) => write!(f, "Invalid header: {header}"),
            Self::Transport(err) => write!(f, "Transport error: {err}"),
            Self::Timeout(window) => {
                write!(f, "No transport message received within {window:?}")
            }
            Self::RequestInFlight(pending) => {
                write!(f, "Request {pending} is still in flight on this connection")
            }
            Self::UnknownMessage(owner) => {
                write!(f, "Message belongs to {owner}, not to this connection")
            }
            Self::PoolUnavailable => write!(f, "Connection pool manager is not running"),
        }
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
