//! Test HTTP server implementation.
//!
//! WHY: Provides a real HTTP/1.1 peer for transport integration tests: keep-alive
//! reuse, chunked and close-delimited bodies, slow responses and servers that
//! drop idle connections.
//!
//! WHAT: `TestHttpServer` listens on localhost, serves every request on an
//! accepted connection in turn, records what it received and counts accepted
//! connections.
//!
//! HOW: Uses stdlib's `TcpListener` and one thread per connection with manually
//! crafted HTTP/1.1 responses.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

type ResponseHandler = Arc<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

/// Simple HTTP request representation for testing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// HTTP method (GET, POST, etc.)
    pub method: String,
    /// Request target as sent (e.g., "/test?x=1")
    pub path: String,
    /// HTTP version (e.g., "HTTP/1.1")
    pub proto: String,
    /// Request headers in arrival order
    pub headers: Vec<(String, String)>,
    /// Body of the request
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// First header value with the given name, ignoring ASCII case.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// How a response body is framed on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// Sent as-is after the head; the headers carry the framing.
    Full(Vec<u8>),
    /// Sent with chunked transfer encoding, one chunk per entry.
    Chunked(Vec<Vec<u8>>),
    /// Sent as-is, then the connection is closed to end the body.
    UntilClose(Vec<u8>),
}

/// Simple HTTP response representation for testing.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code (e.g., 200)
    pub status: u16,
    /// Status text (e.g., "OK")
    pub status_text: String,
    /// Response headers
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: ResponseBody,
    /// Pause before anything is written
    pub delay: Option<Duration>,
    /// Close the connection after this response without announcing it
    pub close_after: bool,
}

impl HttpResponse {
    /// Create 200 OK response with body.
    #[must_use]
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        let body_bytes = body.into();
        Self {
            status: 200,
            status_text: "OK".to_string(),
            headers: vec![
                ("Content-Type".to_string(), "text/plain".to_string()),
                ("Content-Length".to_string(), body_bytes.len().to_string()),
            ],
            body: ResponseBody::Full(body_bytes),
            delay: None,
            close_after: false,
        }
    }

    /// Create 200 OK response sent with chunked transfer encoding.
    #[must_use]
    pub fn chunked<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Vec<u8>>,
    {
        Self {
            status: 200,
            status_text: "OK".to_string(),
            headers: vec![
                ("Content-Type".to_string(), "text/plain".to_string()),
                ("Transfer-Encoding".to_string(), "chunked".to_string()),
            ],
            body: ResponseBody::Chunked(chunks.into_iter().map(Into::into).collect()),
            delay: None,
            close_after: false,
        }
    }

    /// Create 200 OK response whose body ends when the server closes.
    #[must_use]
    pub fn until_close(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            status_text: "OK".to_string(),
            headers: vec![("Connection".to_string(), "close".to_string())],
            body: ResponseBody::UntilClose(body.into()),
            delay: None,
            close_after: true,
        }
    }

    /// Create 302 redirect response.
    #[must_use]
    pub fn redirect(location: &str) -> Self {
        Self::status(302, "Found").with_header("Location", location)
    }

    /// Create custom status response.
    #[must_use]
    pub fn status(code: u16, text: &str) -> Self {
        Self {
            status: code,
            status_text: text.to_string(),
            headers: vec![("Content-Length".to_string(), "0".to_string())],
            body: ResponseBody::Full(Vec::new()),
            delay: None,
            close_after: false,
        }
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Wait before writing the response.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Close the connection once this response is written, without a
    /// `Connection: close` header.
    #[must_use]
    pub fn then_close(mut self) -> Self {
        self.close_after = true;
        self
    }

    /// Render response to HTTP/1.1 format.
    fn render(&self) -> Vec<u8> {
        let mut response = format!("HTTP/1.1 {} {}\r\n", self.status, self.status_text);

        for (key, value) in &self.headers {
            response.push_str(&format!("{key}: {value}\r\n"));
        }

        response.push_str("\r\n");

        let mut bytes = response.into_bytes();
        match &self.body {
            ResponseBody::Full(body) | ResponseBody::UntilClose(body) => {
                bytes.extend_from_slice(body);
            }
            ResponseBody::Chunked(chunks) => {
                for chunk in chunks.iter().filter(|chunk| !chunk.is_empty()) {
                    bytes.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
                    bytes.extend_from_slice(chunk);
                    bytes.extend_from_slice(b"\r\n");
                }
                bytes.extend_from_slice(b"0\r\n\r\n");
            }
        }
        bytes
    }
}

/// Test HTTP server for integration testing.
///
/// # Purpose (WHY)
///
/// Provides a real HTTP server for testing transport clients without external
/// dependencies.
///
/// # What it does
///
/// Starts a local HTTP server on a random port. Each accepted connection is
/// served in its own thread, request after request, until the client hangs up
/// or a response asks for the connection to close.
///
/// # Examples
///
/// ```rust
/// use foundation_testing::http::TestHttpServer;
///
/// let server = TestHttpServer::start();
/// assert!(server.url("/test").starts_with("http://127.0.0.1:"));
/// assert_eq!(server.connections(), 0);
/// ```
pub struct TestHttpServer {
    addr: String,
    _handle: Option<thread::JoinHandle<()>>,
    running: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
}

impl TestHttpServer {
    /// Start a new test HTTP server on random port.
    ///
    /// A running `TestHttpServer` that responds with 200 OK to all requests.
    #[must_use]
    pub fn start() -> Self {
        Self::with_response(|_req| HttpResponse::ok(b"OK"))
    }

    /// Start server with custom response handler.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use foundation_testing::http::{TestHttpServer, HttpResponse};
    ///
    /// let server = TestHttpServer::with_response(|req| {
    ///     if req.path == "/redirect" {
    ///         HttpResponse::redirect("/target")
    ///     } else {
    ///         HttpResponse::ok(b"Success")
    ///     }
    /// });
    /// assert!(server.base_url().starts_with("http://"));
    /// ```
    ///
    /// # Panics
    ///
    /// Panics when no localhost port can be bound.
    #[must_use]
    pub fn with_response<F>(handler: F) -> Self
    where
        F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    {
        let listener =
            TcpListener::bind("127.0.0.1:0").expect("Failed to bind test HTTP server to localhost");
        let addr = format!(
            "http://{}",
            listener.local_addr().expect("bound listener has an address")
        );

        let running = Arc::new(AtomicBool::new(true));
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: ResponseHandler = Arc::new(handler);

        let running_clone = Arc::clone(&running);
        let connections_clone = Arc::clone(&connections);
        let requests_clone = Arc::clone(&requests);

        let handle = thread::spawn(move || {
            // Set non-blocking so we can check running flag
            listener
                .set_nonblocking(true)
                .expect("Failed to set non-blocking");

            while running_clone.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, sock_addr)) => {
                        tracing::info!("Got a client connection: {sock_addr:?}");
                        connections_clone.fetch_add(1, Ordering::SeqCst);
                        let handler = Arc::clone(&handler);
                        let requests = Arc::clone(&requests_clone);
                        let running = Arc::clone(&running_clone);
                        thread::spawn(move || {
                            if let Err(e) =
                                Self::handle_connection(stream, &handler, &requests, &running)
                            {
                                tracing::info!("TestHttpServer connection error: {e}");
                            }
                        });
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        // No connection available, sleep briefly and check again
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(e) => {
                        tracing::info!("TestHttpServer accept error: {e}");
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            _handle: Some(handle),
            running,
            connections,
            requests,
        }
    }

    /// Get full URL for a path on this test server.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Get base URL of this test server.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.addr
    }

    /// Number of TCP connections accepted so far.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Requests received so far, across all connections, in arrival order.
    ///
    /// # Panics
    ///
    /// Panics if a connection thread panicked while recording a request.
    #[must_use]
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().expect("request log poisoned").clone()
    }

    /// Serve requests on one connection until it closes.
    fn handle_connection(
        stream: TcpStream,
        handler: &ResponseHandler,
        requests: &Mutex<Vec<HttpRequest>>,
        running: &AtomicBool,
    ) -> std::io::Result<()> {
        stream.set_nonblocking(false)?;
        let mut writer = stream.try_clone()?;
        let mut reader = BufReader::new(stream);

        while running.load(Ordering::Relaxed) {
            let Some(request) = Self::read_request(&mut reader)? else {
                tracing::debug!("client closed the connection");
                return Ok(());
            };

            tracing::info!("Got request: {} {}", request.method, request.path);
            let wants_close = request
                .header("connection")
                .is_some_and(|value| value.eq_ignore_ascii_case("close"));

            let response = handler(&request);
            if let Ok(mut log) = requests.lock() {
                log.push(request);
            }

            if let Some(delay) = response.delay {
                thread::sleep(delay);
            }

            writer.write_all(&response.render())?;
            writer.flush()?;

            if response.close_after || wants_close {
                tracing::debug!("closing connection after response");
                writer.shutdown(Shutdown::Both)?;
                return Ok(());
            }
        }

        Ok(())
    }

    /// Read one request head and its content-length body. `None` on a clean
    /// close before the first byte.
    fn read_request(reader: &mut BufReader<TcpStream>) -> std::io::Result<Option<HttpRequest>> {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }

        let mut intro = line.trim_end().splitn(3, ' ');
        let method = intro.next().unwrap_or_default().to_string();
        let path = intro.next().unwrap_or_default().to_string();
        let proto = intro.next().unwrap_or_default().to_string();

        let mut headers = Vec::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                break;
            }
            if let Some((name, value)) = trimmed.split_once(':') {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }

        let length = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.parse::<usize>().ok())
            .unwrap_or(0);
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body)?;

        Ok(Some(HttpRequest {
            method,
            path,
            proto,
            headers,
            body,
        }))
    }
}

impl Drop for TestHttpServer {
    fn drop(&mut self) {
        // Signal server thread to stop
        self.running.store(false, Ordering::Relaxed);
        // Thread will exit on next loop iteration
    }
}
