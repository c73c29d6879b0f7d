//! Connection-level HTTP/1.1 transport with a pooled connection registry.

#[macro_use]
mod macros;

pub mod config;
pub mod connection;
pub mod dns;
pub mod errors;
pub mod mailbox;
pub mod pool;
pub mod response;
pub mod streaming;
pub mod transport;
pub mod types;
pub mod url;

mod engine;

pub use config::{ConfigError, PoolSettings, TransportConfig};
pub use connection::{ConnectOptions, Connection, ConnectionState, RequestFailed, StreamOutcome};
pub use engine::{MessageKind, TransportMessage};
pub use errors::{ClientError, ClientResult, DnsError, TransportError};
pub use pool::{PoolKey, PoolManager, PoolRegistry};
pub use response::{apply_events, Response, TransportEvent};
pub use streaming::{stream_response, StreamFailed, StreamOptions};
pub use transport::TransportKind;
pub use types::{ConnectionId, ConnectionWatch, RequestRef};
pub use crate::url::Endpoint;
