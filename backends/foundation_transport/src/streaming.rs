//! The blocking response loop.
//!
//! WHY: A caller that issued a request wants the finished response, but must
//! stay in control of how long it waits and must get its connection back
//! whatever happens.
//!
//! WHAT: [`stream_response`] pulls messages from the connection's mailbox in
//! the calling thread, feeds them through the engine and folds the events into
//! the response until `Done`. Each wait is bounded by the stream timeout; a
//! timeout hands back the connection and the partial response, both usable.

use crate::config;
use crate::connection::{Connection, StreamOutcome};
use crate::errors::ClientError;
use crate::response::Response;
use std::fmt;
use std::time::Duration;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamOptions {
    /// Longest wait for any single transport message. `None` uses the
    /// process-wide default.
    pub timeout: Option<Duration>,
}

impl StreamOptions {
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.timeout.unwrap_or_else(|| config::global().timeout())
    }
}

/// A response loop that stopped early.
///
/// Carries the connection and the response as they were when the loop
/// stopped. After a [`ClientError::Timeout`] both can be passed straight back
/// to [`stream_response`].
#[derive(Debug)]
pub struct StreamFailed {
    pub connection: Connection,
    pub response: Response,
    pub error: ClientError,
}

impl StreamFailed {
    #[must_use]
    pub fn into_parts(self) -> (Connection, Response, ClientError) {
        (self.connection, self.response, self.error)
    }
}

impl fmt::Display for StreamFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "streaming on {} stopped: {}",
            self.connection.id(),
            self.error
        )
    }
}

impl std::error::Error for StreamFailed {}

/// Drives `connection` until `response` is done.
///
/// Returns at once, without touching the mailbox, when `response` is already
/// done.
///
/// # Errors
///
/// [`ClientError::Timeout`] when no message arrives within the window,
/// [`ClientError::UnknownMessage`] for a message from another connection, and
/// [`ClientError::Transport`] for engine or socket failures. None are
/// retried.
pub fn stream_response(
    connection: Connection,
    response: Response,
    options: StreamOptions,
) -> Result<(Connection, Response), StreamFailed> {
    let window = options.window();
    let mut connection = connection;
    let mut response = response;

    while !response.is_done() {
        let message = match connection.next_message(window) {
            Ok(message) => message,
            Err(error) => {
                debug!("{} stream wait ended: {}", connection.id(), error);
                return Err(StreamFailed {
                    connection,
                    response,
                    error,
                });
            }
        };

        match connection.stream(message) {
            StreamOutcome::Events(next, events) => {
                connection = next;
                response = response.apply_events(events);
            }
            StreamOutcome::Unknown(next, message) => {
                warn!(
                    "{} received a message for {}",
                    next.id(),
                    message.connection
                );
                return Err(StreamFailed {
                    connection: next,
                    response,
                    error: ClientError::UnknownMessage(message.connection),
                });
            }
            StreamOutcome::Error(next, err) => {
                warn!("{} transport error while streaming: {}", next.id(), err);
                return Err(StreamFailed {
                    connection: next,
                    response,
                    error: ClientError::Transport(err),
                });
            }
        }
    }

    Ok((connection, response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Instant;

    /// WHY: Per-call options override the process default
    /// WHAT: Tests window() with and without an explicit timeout
    #[test]
    fn test_window() {
        assert_eq!(
            StreamOptions::with_timeout(Duration::from_millis(7)).window(),
            Duration::from_millis(7)
        );
        assert_eq!(StreamOptions::default().window(), config::global().timeout());
    }

    /// WHY: A finished response must never block
    /// WHAT: Tests stream_response returns immediately when done, on an idle socket
    #[test]
    fn test_done_response_returns_immediately() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = thread::spawn(move || listener.accept().map(|(stream, _)| stream));

        let conn = Connection::connect(&format!("http://{addr}/")).unwrap();
        let r = crate::types::RequestRef::new(conn.id(), 1);
        let done = Response::new().apply_events([crate::response::TransportEvent::Done(r)]);

        let started = Instant::now();
        let (conn, response) =
            stream_response(conn, done.clone(), StreamOptions::with_timeout(Duration::from_secs(30)))
                .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(response, done);
        assert!(conn.is_open());
    }

    /// WHY: A timeout must leave the connection usable for the next call
    /// WHAT: Tests Timeout on a silent server, then completion once it answers
    #[test]
    fn test_timeout_then_resume() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).unwrap();
            thread::sleep(Duration::from_millis(300));
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .unwrap();
            thread::sleep(Duration::from_millis(200));
        });

        let url = format!("http://{addr}/slow");
        let (conn, _) = Connection::connect(&url)
            .unwrap()
            .request("GET", &url, &[], b"")
            .unwrap();

        let failed = stream_response(
            conn,
            Response::new(),
            StreamOptions::with_timeout(Duration::from_millis(50)),
        )
        .unwrap_err();
        assert!(failed.error.is_timeout());
        assert!(failed.connection.is_open());

        let (conn, partial, _) = failed.into_parts();
        let (conn, response) = stream_response(
            conn,
            partial,
            StreamOptions::with_timeout(Duration::from_secs(5)),
        )
        .unwrap();

        assert_eq!(response.status(), Some(200));
        assert_eq!(response.body().as_ref(), b"ok");
        assert!(conn.is_reusable());
        server.join().unwrap();
    }

    /// WHY: Extra bytes after a complete response must not strand the connection
    /// WHAT: Tests the response is delivered and the connection is no longer pending
    #[test]
    fn test_trailing_bytes_after_response() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok\r\n")
                .unwrap();
            thread::sleep(Duration::from_millis(200));
        });

        let url = format!("http://{addr}/");
        let (conn, _) = Connection::connect(&url)
            .unwrap()
            .request("GET", &url, &[], b"")
            .unwrap();

        let (conn, response) = stream_response(
            conn,
            Response::new(),
            StreamOptions::with_timeout(Duration::from_secs(5)),
        )
        .unwrap();

        assert_eq!(response.status(), Some(200));
        assert_eq!(response.body().as_ref(), b"ok");
        assert_eq!(conn.pending_request(), None);
        assert!(!conn.is_reusable());
        server.join().unwrap();
    }
}
