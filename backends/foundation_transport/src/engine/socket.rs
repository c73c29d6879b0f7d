//! Sockets and their reader threads.
//!
//! WHY: The streaming loop consumes transport activity as discrete mailbox
//! messages rather than by reading the socket itself, so a caller can wait on
//! one queue with a deadline and hand the connection back untouched on
//! timeout.
//!
//! WHAT: [`Socket`] owns a TCP or TLS stream plus one reader thread that turns
//! every read into a [`TransportMessage`] on the connection's mailbox. Writes
//! go through the same shared stream. TLS state cannot be split between two
//! owners, so the TLS reader polls under the stream lock with a short socket
//! timeout and lets writers in between polls.

use super::{MessageKind, TransportMessage};
use crate::dns::DnsResolver;
use crate::errors::TransportError;
use crate::mailbox::Sender;
use crate::transport::TransportKind;
use crate::types::ConnectionId;
use crate::url::Endpoint;
use bytes::Bytes;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const READ_BUFFER_SIZE: usize = 16 * 1024;

#[cfg(feature = "ssl-rustls")]
const TLS_POLL_INTERVAL: Duration = Duration::from_millis(20);

pub(crate) enum Stream {
    Plain(TcpStream),
    #[cfg(feature = "ssl-rustls")]
    Tls(Box<super::tls::TlsStream>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Self::Plain(stream) => stream,
            #[cfg(feature = "ssl-rustls")]
            Self::Tls(stream) => stream.get_ref(),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.write(buf),
            #[cfg(feature = "ssl-rustls")]
            Self::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(stream) => stream.flush(),
            #[cfg(feature = "ssl-rustls")]
            Self::Tls(stream) => stream.flush(),
        }
    }
}

/// Resolves the endpoint and opens a stream to the first address that
/// accepts, running the TLS handshake for [`TransportKind::Tls`].
pub(crate) fn open(
    endpoint: &Endpoint,
    kind: TransportKind,
    resolver: &dyn DnsResolver,
    connect_timeout: Option<Duration>,
) -> Result<Stream, TransportError> {
    let addrs = resolver.resolve(&endpoint.hostname, endpoint.port)?;
    let tcp = connect_any(endpoint, &addrs, connect_timeout)?;
    tcp.set_nodelay(true)?;

    match kind {
        TransportKind::Tcp => Ok(Stream::Plain(tcp)),
        TransportKind::Tls => wrap_tls(tcp, &endpoint.hostname, connect_timeout),
    }
}

#[cfg(feature = "ssl-rustls")]
fn wrap_tls(
    tcp: TcpStream,
    hostname: &str,
    timeout: Option<Duration>,
) -> Result<Stream, TransportError> {
    let stream = super::tls::handshake(tcp, hostname, timeout)?;
    Ok(Stream::Tls(Box::new(stream)))
}

#[cfg(not(feature = "ssl-rustls"))]
fn wrap_tls(
    _tcp: TcpStream,
    hostname: &str,
    _timeout: Option<Duration>,
) -> Result<Stream, TransportError> {
    Err(TransportError::TlsHandshakeFailed(format!(
        "{hostname}: built without a TLS backend, enable the ssl-rustls feature"
    )))
}

fn connect_any(
    endpoint: &Endpoint,
    addrs: &[SocketAddr],
    timeout: Option<Duration>,
) -> Result<TcpStream, TransportError> {
    let mut last_error = None;

    for addr in addrs {
        let attempt = match timeout {
            Some(window) => TcpStream::connect_timeout(addr, window),
            None => TcpStream::connect(addr),
        };

        match attempt {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                debug!("connect to {} ({}) failed: {}", endpoint, addr, err);
                last_error = Some(err);
            }
        }
    }

    match last_error {
        Some(err) if err.kind() == io::ErrorKind::TimedOut => Err(
            TransportError::ConnectionTimeout(format!("{}: {err}", endpoint.authority())),
        ),
        Some(err) => Err(TransportError::ConnectionFailed(format!(
            "{}: {err}",
            endpoint.authority()
        ))),
        None => Err(TransportError::ConnectionFailed(format!(
            "{}: no addresses to connect to",
            endpoint.authority()
        ))),
    }
}

/// An open stream plus the thread feeding its reads into a mailbox.
pub(crate) struct Socket {
    stream: Arc<Mutex<Stream>>,
    control: TcpStream,
    open: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl Socket {
    /// Starts the reader thread for `stream`, delivering to `mailbox`.
    pub(crate) fn spawn(
        stream: Stream,
        id: ConnectionId,
        mailbox: Sender<TransportMessage>,
    ) -> Result<Self, TransportError> {
        let control = stream.tcp().try_clone()?;
        let open = Arc::new(AtomicBool::new(true));
        let stopping = Arc::new(AtomicBool::new(false));

        let reader_source = match &stream {
            Stream::Plain(tcp) => ReadSource::Plain(tcp.try_clone()?),
            #[cfg(feature = "ssl-rustls")]
            Stream::Tls(tls) => {
                tls.get_ref().set_read_timeout(Some(TLS_POLL_INTERVAL))?;
                ReadSource::Shared
            }
        };

        let stream = Arc::new(Mutex::new(stream));
        let reader = Reader {
            id,
            source: reader_source,
            stream: stream.clone(),
            mailbox,
            open: open.clone(),
            stopping: stopping.clone(),
        };

        let handle = thread::Builder::new()
            .name(format!("transport-reader-{}", id.as_u64()))
            .spawn(move || reader.run())?;

        Ok(Self {
            stream,
            control,
            open,
            stopping,
            reader: Some(handle),
        })
    }

    /// True until the peer closes, a read fails, or [`Socket::close`] runs.
    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn write_all(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut stream = lock(&self.stream);
        stream.write_all(bytes)?;
        stream.flush()?;
        Ok(())
    }

    /// Stops the reader and shuts the socket down. Safe to call twice.
    pub(crate) fn close(&mut self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        self.open.store(false, Ordering::Release);

        #[cfg(feature = "ssl-rustls")]
        {
            let mut stream = lock(&self.stream);
            if let Stream::Tls(tls) = &mut *stream {
                tls.conn.send_close_notify();
                let _ = tls.flush();
            }
        }

        let _ = self.control.shutdown(Shutdown::Both);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock(stream: &Mutex<Stream>) -> MutexGuard<'_, Stream> {
    stream.lock().unwrap_or_else(PoisonError::into_inner)
}

enum ReadSource {
    Plain(TcpStream),
    #[cfg(feature = "ssl-rustls")]
    Shared,
}

struct Reader {
    id: ConnectionId,
    source: ReadSource,
    stream: Arc<Mutex<Stream>>,
    mailbox: Sender<TransportMessage>,
    open: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
}

enum ReadOutcome {
    Data(usize),
    Eof,
    Idle,
    Failed(io::Error),
}

impl Reader {
    fn run(mut self) {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];

        loop {
            if self.stopping.load(Ordering::Acquire) {
                break;
            }

            let kind = match self.read(&mut buffer) {
                ReadOutcome::Idle => continue,
                ReadOutcome::Data(read) => {
                    MessageKind::Data(Bytes::copy_from_slice(&buffer[..read]))
                }
                ReadOutcome::Eof => MessageKind::Closed,
                ReadOutcome::Failed(err) => MessageKind::Error(err.to_string()),
            };

            let terminal = !matches!(kind, MessageKind::Data(_));
            if terminal {
                self.open.store(false, Ordering::Release);
                if self.stopping.load(Ordering::Acquire) {
                    break;
                }
            }

            let message = TransportMessage {
                connection: self.id,
                kind,
            };
            if self.mailbox.send(message).is_err() || terminal {
                break;
            }
        }

        debug!("reader for {} stopped", self.id);
    }

    fn read(&mut self, buffer: &mut [u8]) -> ReadOutcome {
        let result = match &mut self.source {
            ReadSource::Plain(tcp) => tcp.read(buffer),
            #[cfg(feature = "ssl-rustls")]
            ReadSource::Shared => {
                let mut stream = lock(&self.stream);
                match &mut *stream {
                    Stream::Tls(tls) => tls.read(buffer),
                    Stream::Plain(tcp) => tcp.read(buffer),
                }
            }
        };

        match result {
            Ok(0) => ReadOutcome::Eof,
            Ok(read) => ReadOutcome::Data(read),
            Err(err) => match err.kind() {
                io::ErrorKind::Interrupted => ReadOutcome::Idle,
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                    // TLS poll window elapsed; release the lock for writers.
                    thread::yield_now();
                    ReadOutcome::Idle
                }
                io::ErrorKind::UnexpectedEof => ReadOutcome::Eof,
                _ => ReadOutcome::Failed(err),
            },
        }
    }
}
