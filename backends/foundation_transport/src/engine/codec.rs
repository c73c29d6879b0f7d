//! HTTP/1.1 request encoding and incremental response parsing.

use crate::errors::{ClientError, ClientResult, TransportError};
use bytes::{Buf, Bytes, BytesMut};
use memchr::memmem;

/// Largest status line plus header block accepted from a peer.
const MAX_HEAD_SIZE: usize = 64 * 1024;

const CRLF: &[u8] = b"\r\n";
const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

fn is_token(value: &str) -> bool {
    !value.is_empty()
        && value.bytes().all(|byte| {
            byte.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&byte)
        })
}

/// Checks that a method and header list can be written on the wire as-is.
///
/// # Errors
///
/// [`ClientError::InvalidHeader`] for non-token methods or names, and values
/// carrying CR, LF or NUL.
pub(crate) fn validate_request(method: &str, headers: &[(&str, &str)]) -> ClientResult<()> {
    if !is_token(method) {
        return Err(ClientError::InvalidHeader(format!("method {method:?}")));
    }

    for (name, value) in headers {
        if !is_token(name) {
            return Err(ClientError::InvalidHeader(format!("name {name:?}")));
        }
        if value.bytes().any(|byte| matches!(byte, b'\r' | b'\n' | 0)) {
            return Err(ClientError::InvalidHeader(format!("value of {name}")));
        }
    }

    Ok(())
}

/// Serialises one request. `Host` and `Content-Length` are added unless the
/// caller supplied them.
pub(crate) fn encode_request(
    method: &str,
    target: &str,
    host: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> BytesMut {
    let has = |wanted: &str| headers.iter().any(|(name, _)| name.eq_ignore_ascii_case(wanted));

    let mut out = BytesMut::with_capacity(256 + body.len());
    out.extend_from_slice(format!("{method} {target} HTTP/1.1\r\n").as_bytes());

    if !has("host") {
        out.extend_from_slice(format!("Host: {host}\r\n").as_bytes());
    }
    for (name, value) in headers {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }

    let sends_body = !body.is_empty()
        || ["POST", "PUT", "PATCH"]
            .iter()
            .any(|verb| verb.eq_ignore_ascii_case(method));
    if sends_body && !has("content-length") && !has("transfer-encoding") {
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }

    out.extend_from_slice(CRLF);
    out.extend_from_slice(body);
    out
}

/// One step of a decoded response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Parsed {
    Status(u16),
    Headers(Vec<(String, String)>),
    Data(Bytes),
    Done { keep_alive: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Head,
    Length(u64),
    Chunked(Chunk),
    UntilClose,
}

/// Incremental HTTP/1.1 response decoder.
///
/// Bytes are fed as they arrive; every call returns whatever events the
/// buffered input completes. Partial lines stay buffered for the next call.
#[derive(Debug)]
pub(crate) struct ResponseParser {
    buffer: BytesMut,
    stage: Stage,
    head_request: bool,
    keep_alive: bool,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self {
            buffer: BytesMut::new(),
            stage: Stage::Idle,
            head_request: false,
            keep_alive: true,
        }
    }
}

impl ResponseParser {
    /// Arms the parser for the response to a request sent with `method`.
    pub(crate) fn expect(&mut self, method: &str) {
        self.stage = Stage::Head;
        self.head_request = method.eq_ignore_ascii_case("HEAD");
        self.keep_alive = true;
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.stage == Stage::Idle
    }

    pub(crate) fn feed(&mut self, data: &[u8]) -> Result<Vec<Parsed>, TransportError> {
        if self.stage == Stage::Idle && !data.is_empty() {
            return Err(TransportError::Protocol(format!(
                "{} bytes received with no request pending",
                data.len()
            )));
        }

        self.buffer.extend_from_slice(data);
        let mut events = Vec::new();
        while self.step(&mut events)? {}

        // Bytes past a complete response belong to no request. The response
        // stands, but the stream can no longer be trusted for reuse.
        if self.stage == Stage::Idle && !self.buffer.is_empty() {
            warn!(
                "discarding {} trailing bytes after the response",
                self.buffer.len()
            );
            self.buffer.clear();
            self.keep_alive = false;
            if let Some(Parsed::Done { keep_alive }) = events
                .iter_mut()
                .rev()
                .find(|event| matches!(event, Parsed::Done { .. }))
            {
                *keep_alive = false;
            }
        }
        Ok(events)
    }

    /// Handles end of stream. Only a close-delimited body ends cleanly here.
    pub(crate) fn finish(&mut self) -> Result<Vec<Parsed>, TransportError> {
        match self.stage {
            Stage::Idle => Ok(Vec::new()),
            Stage::UntilClose => {
                let mut events = Vec::new();
                if !self.buffer.is_empty() {
                    events.push(Parsed::Data(self.buffer.split().freeze()));
                }
                self.keep_alive = false;
                events.push(self.complete());
                Ok(events)
            }
            _ => Err(TransportError::Closed),
        }
    }

    fn complete(&mut self) -> Parsed {
        self.stage = Stage::Idle;
        Parsed::Done {
            keep_alive: self.keep_alive,
        }
    }

    /// Advances by one unit of work; false when more input is needed.
    fn step(&mut self, events: &mut Vec<Parsed>) -> Result<bool, TransportError> {
        match self.stage {
            Stage::Idle => Ok(false),
            Stage::Head => self.parse_head(events),
            Stage::Length(remaining) => {
                if self.buffer.is_empty() {
                    return Ok(false);
                }
                let take = self.take_body(remaining);
                let left = remaining - take.len() as u64;
                events.push(Parsed::Data(take));
                if left == 0 {
                    events.push(self.complete());
                } else {
                    self.stage = Stage::Length(left);
                }
                Ok(true)
            }
            Stage::UntilClose => {
                if self.buffer.is_empty() {
                    return Ok(false);
                }
                events.push(Parsed::Data(self.buffer.split().freeze()));
                Ok(false)
            }
            Stage::Chunked(chunk) => self.parse_chunk(chunk, events),
        }
    }

    fn take_body(&mut self, remaining: u64) -> Bytes {
        let available = self.buffer.len();
        let take = usize::try_from(remaining).map_or(available, |wanted| wanted.min(available));
        self.buffer.split_to(take).freeze()
    }

    fn take_line(&mut self) -> Option<Bytes> {
        let end = memmem::find(&self.buffer, CRLF)?;
        let line = self.buffer.split_to(end).freeze();
        self.buffer.advance(CRLF.len());
        Some(line)
    }

    fn parse_chunk(&mut self, chunk: Chunk, events: &mut Vec<Parsed>) -> Result<bool, TransportError> {
        match chunk {
            Chunk::Size => {
                let Some(line) = self.take_line() else {
                    return Ok(false);
                };
                let text = std::str::from_utf8(&line)
                    .map_err(|_| TransportError::Protocol("chunk size is not ASCII".into()))?;
                let digits = text.split(';').next().unwrap_or_default().trim();
                let size = u64::from_str_radix(digits, 16).map_err(|_| {
                    TransportError::Protocol(format!("invalid chunk size {digits:?}"))
                })?;

                self.stage = if size == 0 {
                    Stage::Chunked(Chunk::Trailers)
                } else {
                    Stage::Chunked(Chunk::Data(size))
                };
                Ok(true)
            }
            Chunk::Data(remaining) => {
                if self.buffer.is_empty() {
                    return Ok(false);
                }
                let take = self.take_body(remaining);
                let left = remaining - take.len() as u64;
                events.push(Parsed::Data(take));
                self.stage = if left == 0 {
                    Stage::Chunked(Chunk::DataEnd)
                } else {
                    Stage::Chunked(Chunk::Data(left))
                };
                Ok(true)
            }
            Chunk::DataEnd => {
                if self.buffer.len() < CRLF.len() {
                    return Ok(false);
                }
                if &self.buffer[..CRLF.len()] != CRLF {
                    return Err(TransportError::Protocol("chunk data not followed by CRLF".into()));
                }
                self.buffer.advance(CRLF.len());
                self.stage = Stage::Chunked(Chunk::Size);
                Ok(true)
            }
            Chunk::Trailers => {
                let Some(line) = self.take_line() else {
                    return Ok(false);
                };
                if line.is_empty() {
                    events.push(self.complete());
                }
                Ok(true)
            }
        }
    }

    fn parse_head(&mut self, events: &mut Vec<Parsed>) -> Result<bool, TransportError> {
        let Some(end) = memmem::find(&self.buffer, HEAD_TERMINATOR) else {
            if self.buffer.len() > MAX_HEAD_SIZE {
                return Err(TransportError::Protocol(format!(
                    "response head exceeds {MAX_HEAD_SIZE} bytes"
                )));
            }
            return Ok(false);
        };

        let head = self.buffer.split_to(end).freeze();
        self.buffer.advance(HEAD_TERMINATOR.len());
        let head = std::str::from_utf8(&head)
            .map_err(|_| TransportError::Protocol("response head is not valid UTF-8".into()))?;

        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap_or_default();
        let (version, status) = parse_status_line(status_line)?;

        // Interim responses carry no body and precede the real one.
        if (100..200).contains(&status) && status != 101 {
            debug!("skipping interim {} response", status);
            return Ok(true);
        }

        let mut headers = Vec::new();
        for line in lines.filter(|line| !line.is_empty()) {
            let (name, value) = line.split_once(':').ok_or_else(|| {
                TransportError::Protocol(format!("malformed header line {line:?}"))
            })?;
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }

        let header = |wanted: &str| {
            headers
                .iter()
                .filter(|(name, _)| name == wanted)
                .map(|(_, value)| value.as_str())
                .collect::<Vec<_>>()
        };
        let connection_tokens = header("connection").join(",").to_ascii_lowercase();
        let has_token = |token: &str| connection_tokens.split(',').any(|t| t.trim() == token);

        self.keep_alive = if version == "HTTP/1.0" {
            has_token("keep-alive")
        } else {
            !has_token("close")
        };

        let chunked = header("transfer-encoding")
            .iter()
            .any(|value| value.to_ascii_lowercase().contains("chunked"));
        let content_length = match header("content-length").first() {
            Some(value) => Some(value.parse::<u64>().map_err(|_| {
                TransportError::Protocol(format!("invalid content-length {value:?}"))
            })?),
            None => None,
        };

        events.push(Parsed::Status(status));
        events.push(Parsed::Headers(headers));

        if status == 101 {
            self.keep_alive = false;
            events.push(self.complete());
        } else if self.head_request || status == 204 || status == 304 {
            events.push(self.complete());
        } else if chunked {
            self.stage = Stage::Chunked(Chunk::Size);
        } else if let Some(length) = content_length {
            if length == 0 {
                events.push(self.complete());
            } else {
                self.stage = Stage::Length(length);
            }
        } else {
            self.keep_alive = false;
            self.stage = Stage::UntilClose;
        }

        Ok(true)
    }
}

fn parse_status_line(line: &str) -> Result<(&str, u16), TransportError> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        return Err(TransportError::Protocol(format!(
            "unsupported status line {line:?}"
        )));
    }

    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .filter(|code| (100..1000).contains(code))
        .ok_or_else(|| TransportError::Protocol(format!("invalid status code in {line:?}")))?;

    Ok((version, status))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_of(events: &[Parsed]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|event| match event {
                Parsed::Data(bytes) => Some(bytes.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn test_encode_adds_host_and_length() {
        let encoded = encode_request("POST", "/submit?x=1", "example.com:8080", &[], b"abc");
        let text = String::from_utf8(encoded.to_vec()).unwrap();
        assert_eq!(
            text,
            "POST /submit?x=1 HTTP/1.1\r\nHost: example.com:8080\r\nContent-Length: 3\r\n\r\nabc"
        );
    }

    #[test]
    fn test_encode_keeps_caller_headers() {
        let encoded = encode_request(
            "GET",
            "/",
            "ignored",
            &[("Host", "override.test"), ("Accept", "*/*")],
            b"",
        );
        let text = String::from_utf8(encoded.to_vec()).unwrap();
        assert_eq!(text, "GET / HTTP/1.1\r\nHost: override.test\r\nAccept: */*\r\n\r\n");
    }

    /// WHY: Header injection would let a caller smuggle a second request
    /// WHAT: Tests rejection of CR/LF in values and bad tokens
    #[test]
    fn test_validate_request() {
        assert!(validate_request("GET", &[("accept", "text/plain")]).is_ok());
        assert!(validate_request("GE T", &[]).is_err());
        assert!(validate_request("GET", &[("bad name", "x")]).is_err());
        assert!(matches!(
            validate_request("GET", &[("x-evil", "a\r\nHost: other")]),
            Err(ClientError::InvalidHeader(_))
        ));
    }

    /// WHY: Responses arrive in arbitrary fragments
    /// WHAT: Tests a content-length response fed one byte at a time
    #[test]
    fn test_content_length_fragmented() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello";
        let mut parser = ResponseParser::default();
        parser.expect("GET");

        let mut events = Vec::new();
        for byte in raw {
            events.extend(parser.feed(&[*byte]).unwrap());
        }

        assert_eq!(events[0], Parsed::Status(200));
        assert_eq!(
            events[1],
            Parsed::Headers(vec![
                ("content-type".into(), "text/plain".into()),
                ("content-length".into(), "5".into()),
            ])
        );
        assert_eq!(body_of(&events), b"hello");
        assert_eq!(events.last(), Some(&Parsed::Done { keep_alive: true }));
        assert!(parser.is_idle());
    }

    #[test]
    fn test_chunked_body_with_trailers() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3;ext=1\r\nhel\r\n2\r\nlo\r\n0\r\nX-Trailer: y\r\n\r\n";
        let mut parser = ResponseParser::default();
        parser.expect("GET");

        let (first, second) = raw.split_at(40);
        let mut events = parser.feed(first).unwrap();
        events.extend(parser.feed(second).unwrap());

        assert_eq!(body_of(&events), b"hello");
        assert_eq!(events.last(), Some(&Parsed::Done { keep_alive: true }));
    }

    #[test]
    fn test_close_delimited_body() {
        let mut parser = ResponseParser::default();
        parser.expect("GET");

        let mut events = parser.feed(b"HTTP/1.1 200 OK\r\n\r\npartial ").unwrap();
        events.extend(parser.feed(b"body").unwrap());
        assert!(!events.iter().any(|event| matches!(event, Parsed::Done { .. })));

        events.extend(parser.finish().unwrap());
        assert_eq!(body_of(&events), b"partial body");
        assert_eq!(events.last(), Some(&Parsed::Done { keep_alive: false }));
    }

    /// WHY: 100 Continue must not be mistaken for the final response
    /// WHAT: Tests interim responses are skipped
    #[test]
    fn test_interim_response_skipped() {
        let mut parser = ResponseParser::default();
        parser.expect("POST");
        let events = parser
            .feed(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n")
            .unwrap();

        assert_eq!(events[0], Parsed::Status(201));
        assert_eq!(events.last(), Some(&Parsed::Done { keep_alive: true }));
    }

    #[test]
    fn test_no_body_for_head_and_204() {
        let mut parser = ResponseParser::default();
        parser.expect("HEAD");
        let events = parser
            .feed(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n")
            .unwrap();
        assert_eq!(events.last(), Some(&Parsed::Done { keep_alive: true }));

        parser.expect("DELETE");
        let events = parser.feed(b"HTTP/1.1 204 No Content\r\n\r\n").unwrap();
        assert_eq!(events.last(), Some(&Parsed::Done { keep_alive: true }));
    }

    /// WHY: Servers announcing close must not be reused
    /// WHAT: Tests connection: close and HTTP/1.0 defaults
    #[test]
    fn test_keep_alive_detection() {
        let mut parser = ResponseParser::default();
        parser.expect("GET");
        let events = parser
            .feed(b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
        assert_eq!(events.last(), Some(&Parsed::Done { keep_alive: false }));

        parser.expect("GET");
        let events = parser
            .feed(b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
        assert_eq!(events.last(), Some(&Parsed::Done { keep_alive: false }));

        parser.expect("GET");
        let events = parser
            .feed(b"HTTP/1.0 200 OK\r\nConnection: Keep-Alive\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
        assert_eq!(events.last(), Some(&Parsed::Done { keep_alive: true }));
    }

    #[test]
    fn test_protocol_errors() {
        let mut parser = ResponseParser::default();
        assert!(matches!(
            parser.feed(b"HTTP/1.1 200 OK\r\n"),
            Err(TransportError::Protocol(_))
        ));

        parser.expect("GET");
        assert!(matches!(
            parser.feed(b"SPDY/3 200 OK\r\n\r\n"),
            Err(TransportError::Protocol(_))
        ));

        let mut parser = ResponseParser::default();
        parser.expect("GET");
        assert!(matches!(
            parser.feed(b"HTTP/1.1 200 OK\r\nContent-Length: ten\r\n\r\n"),
            Err(TransportError::Protocol(_))
        ));
    }

    /// WHY: Junk after a complete response must not cost the caller that response
    /// WHAT: Tests trailing bytes are dropped and the response is marked not reusable
    #[test]
    fn test_trailing_bytes_keep_response() {
        let mut parser = ResponseParser::default();
        parser.expect("GET");
        let events = parser
            .feed(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok\r\n")
            .unwrap();

        assert_eq!(events[0], Parsed::Status(200));
        assert_eq!(events[2], Parsed::Data(Bytes::from_static(b"ok")));
        assert_eq!(events.last(), Some(&Parsed::Done { keep_alive: false }));
        assert!(parser.is_idle());
        assert!(parser.buffer.is_empty());
    }

    /// WHY: A peer closing mid-body is a transport failure
    /// WHAT: Tests finish() before a content-length body completes
    #[test]
    fn test_eof_mid_body() {
        let mut parser = ResponseParser::default();
        parser.expect("GET");
        parser
            .feed(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort")
            .unwrap();
        assert!(matches!(parser.finish(), Err(TransportError::Closed)));
    }

    #[test]
    fn test_oversized_head() {
        let mut parser = ResponseParser::default();
        parser.expect("GET");
        let mut raw = b"HTTP/1.1 200 OK\r\nX-Big: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_SIZE + 1));
        assert!(matches!(parser.feed(&raw), Err(TransportError::Protocol(_))));
    }
}
