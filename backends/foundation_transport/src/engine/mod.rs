//! HTTP/1.1 wire engine.
//!
//! WHY: The connection layer works in terms of protocol events and mailbox
//! messages; something has to own the socket and turn bytes into events.
//!
//! WHAT: [`EngineConn`] pairs a [`socket::Socket`] (and its reader thread) with
//! the connection's mailbox and an incremental [`codec::ResponseParser`].
//! `send` writes a request, `stream` turns one mailbox message into zero or
//! more [`TransportEvent`]s for the pending request.

pub(crate) mod codec;
pub(crate) mod socket;
#[cfg(feature = "ssl-rustls")]
pub(crate) mod tls;

use crate::dns::DnsResolver;
use crate::errors::TransportError;
use crate::mailbox::{self, Receiver, ReceiverError};
use crate::response::TransportEvent;
use crate::transport::TransportKind;
use crate::types::{ConnectionId, RequestRef};
use crate::url::Endpoint;
use bytes::Bytes;
use codec::{Parsed, ResponseParser};
use socket::Socket;
use std::time::Duration;

/// One unit of socket activity, as queued on a connection's mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    /// Connection whose socket produced the message.
    pub connection: ConnectionId,
    pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// Bytes read from the socket.
    Data(Bytes),
    /// The peer closed its side.
    Closed,
    /// The read failed; the description comes from the IO error.
    Error(String),
}

/// Result of feeding one message to the engine.
#[derive(Debug)]
pub(crate) enum Streamed {
    Events(Vec<TransportEvent>),
    Unknown(TransportMessage),
    Error(TransportError),
}

pub(crate) struct EngineConn {
    id: ConnectionId,
    socket: Socket,
    mailbox: Receiver<TransportMessage>,
    parser: ResponseParser,
    pending: Option<RequestRef>,
    sequence: u64,
    keep_alive: bool,
    peer_closed: bool,
}

impl EngineConn {
    pub(crate) fn connect(
        endpoint: &Endpoint,
        kind: TransportKind,
        resolver: &dyn DnsResolver,
        connect_timeout: Option<Duration>,
    ) -> Result<Self, TransportError> {
        let stream = socket::open(endpoint, kind, resolver, connect_timeout)?;
        let id = ConnectionId::next();
        let (sender, receiver) = mailbox::mailbox();
        let socket = Socket::spawn(stream, id, sender)?;

        debug!("{} connected to {} over {}", id, endpoint, kind);
        Ok(Self {
            id,
            socket,
            mailbox: receiver,
            parser: ResponseParser::default(),
            pending: None,
            sequence: 0,
            keep_alive: true,
            peer_closed: false,
        })
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn pending(&self) -> Option<RequestRef> {
        self.pending
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.peer_closed && self.socket.is_open()
    }

    /// Open, keep-alive, nothing pending and nothing unread in the mailbox.
    pub(crate) fn is_reusable(&self) -> bool {
        self.is_open()
            && self.keep_alive
            && self.pending.is_none()
            && self.parser.is_idle()
            && self.mailbox.is_empty()
    }

    /// Writes one request and arms the parser for its response.
    pub(crate) fn send(
        &mut self,
        method: &str,
        target: &str,
        host: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<RequestRef, TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }

        let encoded = codec::encode_request(method, target, host, headers, body);
        if let Err(err) = self.socket.write_all(&encoded) {
            self.keep_alive = false;
            return Err(err);
        }

        self.sequence += 1;
        let request = RequestRef::new(self.id, self.sequence);
        self.parser.expect(method);
        self.pending = Some(request);

        debug!("{} sent {} {}", request, method, target);
        Ok(request)
    }

    pub(crate) fn recv(&self, timeout: Duration) -> Result<TransportMessage, ReceiverError> {
        self.mailbox.recv_timeout(timeout)
    }

    /// Feeds one mailbox message through the parser.
    pub(crate) fn stream(&mut self, message: TransportMessage) -> Streamed {
        if message.connection != self.id {
            return Streamed::Unknown(message);
        }

        let parsed = match message.kind {
            MessageKind::Data(bytes) => self.parser.feed(&bytes),
            MessageKind::Closed => {
                self.peer_closed = true;
                self.keep_alive = false;
                self.parser.finish()
            }
            MessageKind::Error(reason) => {
                self.peer_closed = true;
                self.keep_alive = false;
                Err(TransportError::ReadFailed(reason))
            }
        };

        match parsed {
            Ok(items) => Streamed::Events(self.translate(items)),
            Err(err) => {
                self.keep_alive = false;
                if self.parser.is_idle() {
                    self.pending = None;
                }
                Streamed::Error(err)
            }
        }
    }

    fn translate(&mut self, items: Vec<Parsed>) -> Vec<TransportEvent> {
        let Some(request) = self.pending else {
            return Vec::new();
        };

        items
            .into_iter()
            .map(|item| match item {
                Parsed::Status(code) => TransportEvent::Status(request, code),
                Parsed::Headers(pairs) => TransportEvent::Headers(request, pairs),
                Parsed::Data(chunk) => TransportEvent::Data(request, chunk),
                Parsed::Done { keep_alive } => {
                    self.keep_alive = self.keep_alive && keep_alive;
                    self.pending = None;
                    TransportEvent::Done(request)
                }
            })
            .collect()
    }

    pub(crate) fn close(&mut self) {
        self.keep_alive = false;
        self.socket.close();
    }
}
