//! Response accumulation.
//!
//! Protocol events are folded into a [`Response`] in arrival order. Body chunks
//! are kept as a list and only joined into one buffer when `Done` arrives; after
//! that the response is terminal and later events change nothing.

use crate::types::RequestRef;
use bytes::{Bytes, BytesMut};

/// Protocol event produced by the engine for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Status(RequestRef, u16),
    Headers(RequestRef, Vec<(String, String)>),
    Data(RequestRef, Bytes),
    Done(RequestRef),
}

impl TransportEvent {
    #[must_use]
    pub fn request(&self) -> RequestRef {
        match self {
            Self::Status(request, _)
            | Self::Headers(request, _)
            | Self::Data(request, _)
            | Self::Done(request) => *request,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    status: Option<u16>,
    headers: Vec<(String, String)>,
    chunks: Vec<Bytes>,
    body: Bytes,
    done: bool,
}

impl Response {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First header value whose name matches, ignoring ASCII case.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The materialised body. Empty until the response is done.
    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Chunks received so far on a response that is not done yet.
    #[must_use]
    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Applies one event. Events after `Done` are ignored.
    pub fn apply(&mut self, event: TransportEvent) {
        if self.done {
            return;
        }

        match event {
            TransportEvent::Status(_, code) => self.status = Some(code),
            TransportEvent::Headers(_, pairs) => self.headers = pairs,
            TransportEvent::Data(_, chunk) => self.chunks.push(chunk),
            TransportEvent::Done(_) => {
                self.body = materialise(std::mem::take(&mut self.chunks));
                self.done = true;
            }
        }
    }

    #[must_use]
    pub fn apply_events<I>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = TransportEvent>,
    {
        for event in events {
            self.apply(event);
        }
        self
    }
}

/// Folds `events` into `response`.
#[must_use]
pub fn apply_events<I>(response: Response, events: I) -> Response
where
    I: IntoIterator<Item = TransportEvent>,
{
    response.apply_events(events)
}

fn materialise(chunks: Vec<Bytes>) -> Bytes {
    match chunks.len() {
        0 => Bytes::new(),
        1 => chunks.into_iter().next().unwrap_or_default(),
        _ => {
            let total = chunks.iter().map(Bytes::len).sum();
            let mut body = BytesMut::with_capacity(total);
            for chunk in chunks {
                body.extend_from_slice(&chunk);
            }
            body.freeze()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConnectionId;

    fn request() -> RequestRef {
        RequestRef::new(ConnectionId::next(), 1)
    }

    /// WHY: The accumulator is the heart of the streaming loop
    /// WHAT: Tests status, headers, two chunks and done produce "hello"
    #[test]
    fn test_apply_full_sequence() {
        let r = request();
        let response = apply_events(
            Response::new(),
            vec![
                TransportEvent::Status(r, 200),
                TransportEvent::Headers(r, vec![("content-type".into(), "text/plain".into())]),
                TransportEvent::Data(r, Bytes::from_static(b"hel")),
                TransportEvent::Data(r, Bytes::from_static(b"lo")),
                TransportEvent::Done(r),
            ],
        );

        assert_eq!(response.status(), Some(200));
        assert_eq!(
            response.headers(),
            &[("content-type".to_string(), "text/plain".to_string())]
        );
        assert_eq!(response.body(), &Bytes::from_static(b"hello"));
        assert!(response.is_done());
        assert!(response.chunks().is_empty());
    }

    /// WHY: The body is only joined once
    /// WHAT: Tests that chunks accumulate and the body stays empty before done
    #[test]
    fn test_body_not_materialised_before_done() {
        let r = request();
        let response = Response::new().apply_events([
            TransportEvent::Status(r, 200),
            TransportEvent::Data(r, Bytes::from_static(b"a")),
            TransportEvent::Data(r, Bytes::from_static(b"b")),
        ]);

        assert!(!response.is_done());
        assert!(response.body().is_empty());
        assert_eq!(response.chunks().len(), 2);
    }

    /// WHY: A finished response is terminal
    /// WHAT: Tests events after done leave the response unchanged
    #[test]
    fn test_events_after_done_are_ignored() {
        let r = request();
        let done = Response::new().apply_events([
            TransportEvent::Status(r, 204),
            TransportEvent::Done(r),
        ]);

        let after = done.clone().apply_events([
            TransportEvent::Status(r, 500),
            TransportEvent::Data(r, Bytes::from_static(b"late")),
            TransportEvent::Done(r),
        ]);
        assert_eq!(after, done);
    }

    /// WHY: Events are applied without ordering checks
    /// WHAT: Tests that a later Headers replaces and a later Status wins
    #[test]
    fn test_last_write_wins() {
        let r = request();
        let response = Response::new().apply_events([
            TransportEvent::Headers(r, vec![("a".into(), "1".into())]),
            TransportEvent::Status(r, 100),
            TransportEvent::Headers(r, vec![("B".into(), "2".into())]),
            TransportEvent::Status(r, 200),
        ]);

        assert_eq!(response.status(), Some(200));
        assert_eq!(response.header("b"), Some("2"));
        assert_eq!(response.header("a"), None);
    }

    #[test]
    fn test_done_without_data() {
        let r = request();
        let response = Response::new().apply_events([TransportEvent::Done(r)]);
        assert!(response.is_done());
        assert!(response.body().is_empty());
        assert_eq!(response.status(), None);
    }
}
