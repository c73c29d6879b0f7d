//! Connection handles.
//!
//! WHY: Callers need connection-level control: open once, issue requests one
//! at a time, and decide themselves when to read the response and when to give
//! the socket back to a pool.
//!
//! WHAT: [`Connection`] wraps one engine connection. `connect`, `request` and
//! `stream` take the handle by value and return it, so a stale handle cannot
//! be used after a call. Failures that leave the socket intact hand the
//! connection back inside the error value.

use crate::config;
use crate::dns::{DnsResolver, SystemDnsResolver};
use crate::engine::codec;
use crate::engine::{EngineConn, Streamed, TransportMessage};
use crate::errors::{ClientError, ClientResult, TransportError};
use crate::mailbox::ReceiverError;
use crate::response::TransportEvent;
use crate::transport::{self, TransportKind};
use crate::types::{ConnectionId, ConnectionWatch, RequestRef};
use crate::url::{self, Endpoint};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How a connection is opened.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    pub resolver: Arc<dyn DnsResolver>,
    /// Bound on TCP connect per resolved address, and on the TLS handshake.
    /// Without one, the handshake is bounded by the streaming timeout.
    pub connect_timeout: Option<Duration>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            resolver: Arc::new(SystemDnsResolver::new()),
            connect_timeout: config::global().connect_timeout(),
        }
    }
}

impl ConnectOptions {
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn DnsResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

/// Lifecycle position of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Open, no request issued yet.
    Connected,
    /// A request is outstanding; its response has not completed.
    RequestPending(RequestRef),
    /// Open, previous response complete.
    Idle,
    Closed,
}

pub struct Connection {
    endpoint: Endpoint,
    transport: TransportKind,
    engine: EngineConn,
    requests: u64,
    lease: Arc<()>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("endpoint", &self.endpoint)
            .field("transport", &self.transport)
            .field("state", &self.state())
            .finish()
    }
}

/// A request that could not be issued, with the connection handed back.
#[derive(Debug)]
pub struct RequestFailed {
    pub connection: Connection,
    pub error: ClientError,
}

impl RequestFailed {
    #[must_use]
    pub fn into_parts(self) -> (Connection, ClientError) {
        (self.connection, self.error)
    }
}

impl fmt::Display for RequestFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request on {} failed: {}", self.connection.id(), self.error)
    }
}

impl std::error::Error for RequestFailed {}

/// What one mailbox message did to a connection.
#[derive(Debug)]
pub enum StreamOutcome {
    /// Protocol events for the pending request, possibly none.
    Events(Connection, Vec<TransportEvent>),
    /// The message was produced by a different connection.
    Unknown(Connection, TransportMessage),
    /// The engine rejected the input or the socket failed.
    Error(Connection, TransportError),
}

impl Connection {
    /// Opens a connection to the origin of `url` with default options.
    ///
    /// # Errors
    ///
    /// [`ClientError::InvalidUrl`], [`ClientError::UnsupportedProtocol`], or
    /// the transport failure from resolving, connecting or the TLS handshake.
    pub fn connect(url: &str) -> ClientResult<Self> {
        Self::connect_with(url, &ConnectOptions::default())
    }

    /// Opens a connection with an explicit resolver and connect timeout.
    ///
    /// # Errors
    ///
    /// Same as [`Connection::connect`].
    pub fn connect_with(url: &str, options: &ConnectOptions) -> ClientResult<Self> {
        let endpoint = url::decompose(url)?;
        let transport = transport::select(&endpoint.protocol)?;
        Self::open(endpoint, transport, options)
    }

    pub(crate) fn open(
        endpoint: Endpoint,
        transport: TransportKind,
        options: &ConnectOptions,
    ) -> ClientResult<Self> {
        let engine = EngineConn::connect(
            &endpoint,
            transport,
            options.resolver.as_ref(),
            options.connect_timeout,
        )
        .map_err(|err| {
            warn!("connect to {} failed: {}", endpoint, err);
            ClientError::Transport(err)
        })?;

        info!("{} opened to {}", engine.id(), endpoint);
        Ok(Self {
            endpoint,
            transport,
            engine,
            requests: 0,
            lease: Arc::new(()),
        })
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.engine.id()
    }

    /// A weak handle that reports whether this connection still exists.
    #[must_use]
    pub fn watch(&self) -> ConnectionWatch {
        ConnectionWatch::new(self.id(), &self.lease)
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    #[must_use]
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    #[must_use]
    pub fn pending_request(&self) -> Option<RequestRef> {
        self.engine.pending()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        if !self.engine.is_open() {
            return ConnectionState::Closed;
        }
        match self.engine.pending() {
            Some(request) => ConnectionState::RequestPending(request),
            None if self.requests == 0 => ConnectionState::Connected,
            None => ConnectionState::Idle,
        }
    }

    /// True until the peer closes, a read fails, or the connection is closed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.engine.is_open()
    }

    /// True when the connection can serve another request right away: open,
    /// keep-alive, no request pending and no unread transport messages.
    #[must_use]
    pub fn is_reusable(&self) -> bool {
        self.engine.is_reusable()
    }

    /// Issues a request. `url` must be absolute and share the connection's
    /// origin; only its path and query go on the wire.
    ///
    /// # Errors
    ///
    /// The connection comes back inside [`RequestFailed`] together with
    /// [`ClientError::RequestInFlight`], [`ClientError::InvalidHeader`],
    /// [`ClientError::InvalidUrl`] or the transport error from the write.
    pub fn request(
        mut self,
        method: &str,
        url: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<(Self, RequestRef), RequestFailed> {
        let target = match self.prepare(method, url, headers) {
            Ok(target) => target,
            Err(error) => {
                return Err(RequestFailed {
                    connection: self,
                    error,
                })
            }
        };

        let host = self.endpoint.host_header();
        match self.engine.send(method, &target, &host, headers, body) {
            Ok(request) => {
                self.requests += 1;
                Ok((self, request))
            }
            Err(err) => {
                warn!("{} write failed: {}", self.id(), err);
                Err(RequestFailed {
                    connection: self,
                    error: ClientError::Transport(err),
                })
            }
        }
    }

    fn prepare(&self, method: &str, url: &str, headers: &[(&str, &str)]) -> ClientResult<String> {
        if let Some(pending) = self.engine.pending() {
            return Err(ClientError::RequestInFlight(pending));
        }
        codec::validate_request(method, headers)?;

        let target = url::make_relative(url)?;
        let origin = url::decompose(url)?;
        if !origin.same_origin(&self.endpoint) {
            return Err(ClientError::InvalidUrl(format!(
                "{url} does not belong to {}",
                self.endpoint
            )));
        }

        Ok(target)
    }

    /// Waits up to `timeout` for the next message from this connection's
    /// socket reader.
    ///
    /// # Errors
    ///
    /// [`ClientError::Timeout`] when nothing arrives in time, and
    /// [`TransportError::Closed`] once the reader has stopped and every
    /// message has been consumed.
    pub fn next_message(&self, timeout: Duration) -> ClientResult<TransportMessage> {
        match self.engine.recv(timeout) {
            Ok(message) => Ok(message),
            Err(ReceiverError::Timeout | ReceiverError::Empty) => Err(ClientError::Timeout(timeout)),
            Err(ReceiverError::Closed) => Err(ClientError::Transport(TransportError::Closed)),
        }
    }

    /// Hands one mailbox message to the engine.
    #[must_use]
    pub fn stream(mut self, message: TransportMessage) -> StreamOutcome {
        match self.engine.stream(message) {
            Streamed::Events(events) => StreamOutcome::Events(self, events),
            Streamed::Unknown(message) => StreamOutcome::Unknown(self, message),
            Streamed::Error(err) => StreamOutcome::Error(self, err),
        }
    }

    /// Shuts the socket down and stops its reader.
    pub fn close(mut self) {
        debug!("{} closed", self.id());
        self.engine.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::StaticSocketAddr;
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener};
    use std::thread;

    fn serve_once(reply: &'static [u8]) -> (SocketAddr, thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut received = vec![0u8; 4096];
            let read = stream.read(&mut received).unwrap();
            received.truncate(read);
            stream.write_all(reply).unwrap();
            thread::sleep(Duration::from_millis(100));
            received
        });
        (addr, handle)
    }

    /// WHY: Only http and https can be connected
    /// WHAT: Tests connect rejects other protocols before any IO
    #[test]
    fn test_connect_rejects_unknown_protocol() {
        let err = Connection::connect("ftp://example.com:21/").unwrap_err();
        assert!(matches!(err, ClientError::UnsupportedProtocol(ref p) if p == "ftp"));
        assert!(Connection::connect("not a url").unwrap_err().is_invalid_url());
    }

    /// WHY: The request line must carry only the relative target
    /// WHAT: Tests the bytes written for a GET and the state transitions
    #[test]
    fn test_request_writes_relative_target() {
        let (addr, server) = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
        let url = format!("http://{addr}/a/b?q=1");

        let conn = Connection::connect(&url).unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);

        let (conn, request) = conn
            .request("GET", &url, &[("accept", "*/*")], b"")
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::RequestPending(request));
        assert_eq!(request.connection(), conn.id());

        let written = String::from_utf8(server.join().unwrap()).unwrap();
        assert!(written.starts_with("GET /a/b?q=1 HTTP/1.1\r\n"));
        assert!(written.contains(&format!("Host: {addr}\r\n")));
        assert!(written.contains("accept: */*\r\n"));
    }

    /// WHY: One in-flight request per connection
    /// WHAT: Tests RequestInFlight hands the connection back unchanged
    #[test]
    fn test_second_request_rejected_while_pending() {
        let (addr, _server) = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        let url = format!("http://{addr}/");

        let (conn, first) = Connection::connect(&url)
            .unwrap()
            .request("GET", &url, &[], b"")
            .unwrap();

        let failed = conn.request("GET", &url, &[], b"").unwrap_err();
        assert!(matches!(failed.error, ClientError::RequestInFlight(r) if r == first));
        assert_eq!(failed.connection.pending_request(), Some(first));
    }

    /// WHY: Requests must stay on the connection's origin
    /// WHAT: Tests relative paths and foreign hosts are rejected with InvalidUrl
    #[test]
    fn test_request_url_checks() {
        let (addr, _server) = serve_once(b"");
        let url = format!("http://{addr}/");
        let conn = Connection::connect(&url).unwrap();

        let failed = conn.request("GET", "/relative", &[], b"").unwrap_err();
        assert!(failed.error.is_invalid_url());

        let (conn, error) = failed.into_parts();
        let failed = conn
            .request("GET", "http://elsewhere.test/", &[], b"")
            .unwrap_err();
        assert!(error.is_invalid_url());
        assert!(failed.error.is_invalid_url());
        assert_eq!(failed.connection.state(), ConnectionState::Connected);
    }

    /// WHY: The engine feeds events for the pending request only
    /// WHAT: Tests driving stream() by hand until Done
    #[test]
    fn test_stream_by_hand() {
        let (addr, _server) = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
        let url = format!("http://{addr}/");
        let options = ConnectOptions::default().with_resolver(Arc::new(StaticSocketAddr::new(addr)));

        let (mut conn, request) = Connection::connect_with(&url, &options)
            .unwrap()
            .request("GET", &url, &[], b"")
            .unwrap();

        let mut events = Vec::new();
        while !events.contains(&TransportEvent::Done(request)) {
            let message = conn.next_message(Duration::from_secs(5)).unwrap();
            conn = match conn.stream(message) {
                StreamOutcome::Events(conn, batch) => {
                    events.extend(batch);
                    conn
                }
                other => panic!("unexpected outcome: {other:?}"),
            };
        }

        assert_eq!(events[0], TransportEvent::Status(request, 200));
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(conn.is_reusable());
    }

    /// WHY: Messages from another socket must not be parsed
    /// WHAT: Tests a foreign message is returned as Unknown
    #[test]
    fn test_stream_foreign_message() {
        let (addr, _server) = serve_once(b"");
        let conn = Connection::connect(&format!("http://{addr}/")).unwrap();
        let foreign = TransportMessage {
            connection: ConnectionId::next(),
            kind: crate::engine::MessageKind::Closed,
        };

        match conn.stream(foreign.clone()) {
            StreamOutcome::Unknown(conn, message) => {
                assert_eq!(message, foreign);
                assert!(conn.is_open());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    /// WHY: The pool notices handles dropped while checked out through their watch
    /// WHAT: Tests a watch outlives moves and dies with the connection
    #[test]
    fn test_watch_tracks_handle() {
        let (addr, _server) = serve_once(b"");
        let conn = Connection::connect(&format!("http://{addr}/")).unwrap();
        let watch = conn.watch();
        assert_eq!(watch.id(), conn.id());

        let moved = conn;
        assert!(watch.is_alive());

        moved.close();
        assert!(!watch.is_alive());
    }
}
