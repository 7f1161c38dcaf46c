//! Incremental request framing.
//!
//! # Responsibilities
//! - Accept bytes as they arrive and report how many were consumed
//! - Detect the end of one message so trailing bytes stay with the next
//! - Enforce head, header count and body size limits
//!
//! # Design Decisions
//! - `write` consumes whole framing units only. A partial request line,
//!   header block or chunk-size line is left unconsumed and presented again
//!   together with the next bytes read from the transport.
//! - End of stream never terminates a request; bodies are always length
//!   delimited or chunked.
//! - One parser per request. The connection creates a fresh one before each
//!   read cycle so no state can leak from one request into the next.

use bytes::BytesMut;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri, Version};
use thiserror::Error;

use crate::proto::Request;

/// Size limits applied while framing a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserLimits {
    /// Largest accepted request line plus header block, in bytes.
    pub max_head_size: usize,
    /// Largest number of header fields.
    pub max_headers: usize,
    /// Largest decoded body, in bytes.
    pub max_body_size: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_head_size: 8 * 1024,
            max_headers: 64,
            max_body_size: 2 * 1024 * 1024,
        }
    }
}

/// Framing violations reported by a [`Parser`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid request syntax")]
    InvalidSyntax,

    #[error("invalid method")]
    InvalidMethod,

    #[error("invalid request target")]
    InvalidUri,

    #[error("invalid version")]
    InvalidVersion,

    #[error("invalid header name")]
    InvalidHeaderName,

    #[error("invalid header value")]
    InvalidHeaderValue,

    #[error("too many headers")]
    TooManyHeaders,

    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("invalid Content-Length header")]
    InvalidContentLength,

    #[error("different Content-Length headers")]
    DifferentContentLengths,

    #[error("unsupported transfer coding")]
    UnsupportedTransferEncoding,

    #[error("invalid chunk framing")]
    InvalidChunk,
}

impl ParseError {
    fn from_httparse(err: httparse::Error) -> Self {
        match err {
            httparse::Error::HeaderName => ParseError::InvalidHeaderName,
            httparse::Error::HeaderValue => ParseError::InvalidHeaderValue,
            httparse::Error::Version => ParseError::InvalidVersion,
            httparse::Error::TooManyHeaders => ParseError::TooManyHeaders,
            httparse::Error::Token | httparse::Error::NewLine | httparse::Error::Status => {
                ParseError::InvalidSyntax
            }
        }
    }
}

/// Protocol framing collaborator driven by the connection's read loop.
pub trait Parser: Send + 'static {
    /// Create a parser for a single request.
    fn new(limits: &ParserLimits) -> Self
    where
        Self: Sized;

    /// Feed received bytes, returning how many were consumed.
    ///
    /// Bytes that were not consumed must be presented again, followed by
    /// whatever arrives next. Once the message is complete nothing past its
    /// end is consumed.
    fn write(&mut self, buf: &[u8]) -> Result<usize, ParseError>;

    /// Signal that the peer will send no more bytes.
    fn write_eof(&mut self) -> Result<(), ParseError>;

    /// Whether a full message has been framed.
    fn is_complete(&self) -> bool;

    /// Take the framed message. Returns `None` until [`is_complete`](Self::is_complete).
    fn take_request(&mut self) -> Option<Request>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Body(u64),
    Chunked(Chunk),
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
}

#[derive(Debug)]
struct Head {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
}

/// HTTP/1.0 and HTTP/1.1 request parser.
#[derive(Debug)]
pub struct HttpParser {
    limits: ParserLimits,
    state: State,
    head: Option<Head>,
    body: BytesMut,
}

impl Parser for HttpParser {
    fn new(limits: &ParserLimits) -> Self {
        Self {
            limits: *limits,
            state: State::Head,
            head: None,
            body: BytesMut::new(),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, ParseError> {
        let mut consumed = 0;
        loop {
            let rest = &buf[consumed..];
            let used = match self.state {
                State::Head => self.parse_head(rest)?,
                State::Body(remaining) => self.read_body(remaining, rest),
                State::Chunked(chunk) => self.parse_chunk(chunk, rest)?,
                State::Done => None,
            };
            match used {
                Some(n) => consumed += n,
                None => return Ok(consumed),
            }
        }
    }

    fn write_eof(&mut self) -> Result<(), ParseError> {
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.state == State::Done
    }

    fn take_request(&mut self) -> Option<Request> {
        if !self.is_complete() {
            return None;
        }
        let head = self.head.take()?;
        Some(Request::new(
            head.method,
            head.uri,
            head.version,
            head.headers,
            self.body.split().freeze(),
        ))
    }
}

impl HttpParser {
    fn parse_head(&mut self, rest: &[u8]) -> Result<Option<usize>, ParseError> {
        let mut slots = vec![httparse::EMPTY_HEADER; self.limits.max_headers];
        let mut req = httparse::Request::new(&mut slots);
        let len = match req.parse(rest).map_err(ParseError::from_httparse)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return self.partial(rest),
        };
        if len > self.limits.max_head_size {
            return Err(ParseError::HeadTooLarge(self.limits.max_head_size));
        }

        let method = req.method.ok_or(ParseError::InvalidSyntax)?;
        let method = Method::from_bytes(method.as_bytes()).map_err(|_| ParseError::InvalidMethod)?;
        let uri = req
            .path
            .ok_or(ParseError::InvalidSyntax)?
            .parse::<Uri>()
            .map_err(|_| ParseError::InvalidUri)?;
        let version = match req.version {
            Some(0) => Version::HTTP_10,
            Some(1) => Version::HTTP_11,
            _ => return Err(ParseError::InvalidVersion),
        };

        // RFC 9112 section 6.3: Transfer-Encoding overrides Content-Length,
        // differing Content-Length values are unrecoverable.
        let mut headers = HeaderMap::with_capacity(req.headers.len());
        let mut content_length: Option<u64> = None;
        let mut transfer_encoding: Option<bool> = None;
        for field in req.headers.iter() {
            let name = HeaderName::from_bytes(field.name.as_bytes())
                .map_err(|_| ParseError::InvalidHeaderName)?;
            let value = HeaderValue::from_bytes(field.value).map_err(|_| ParseError::InvalidHeaderValue)?;
            if name == CONTENT_LENGTH {
                let length = parse_content_length(field.value)?;
                match content_length {
                    Some(previous) if previous != length => {
                        return Err(ParseError::DifferentContentLengths)
                    }
                    _ => content_length = Some(length),
                }
            } else if name == TRANSFER_ENCODING {
                transfer_encoding = Some(is_chunked_last(&value));
            }
            headers.append(name, value);
        }

        self.state = match (transfer_encoding, content_length) {
            (Some(true), _) => State::Chunked(Chunk::Size),
            (Some(false), _) => return Err(ParseError::UnsupportedTransferEncoding),
            (None, None) | (None, Some(0)) => State::Done,
            (None, Some(length)) if length > self.limits.max_body_size as u64 => {
                return Err(ParseError::BodyTooLarge(self.limits.max_body_size))
            }
            (None, Some(length)) => State::Body(length),
        };
        self.head = Some(Head {
            method,
            uri,
            version,
            headers,
        });
        Ok(Some(len))
    }

    fn read_body(&mut self, remaining: u64, rest: &[u8]) -> Option<usize> {
        if rest.is_empty() {
            return None;
        }
        let take = remaining.min(rest.len() as u64) as usize;
        self.body.extend_from_slice(&rest[..take]);
        let left = remaining - take as u64;
        self.state = if left == 0 { State::Done } else { State::Body(left) };
        Some(take)
    }

    fn parse_chunk(&mut self, chunk: Chunk, rest: &[u8]) -> Result<Option<usize>, ParseError> {
        match chunk {
            Chunk::Size => {
                let Some(end) = find_crlf(rest) else {
                    return self.partial(rest);
                };
                let size = parse_chunk_size(&rest[..end])?;
                self.state = if size == 0 {
                    State::Chunked(Chunk::Trailer)
                } else if size > self.limits.max_body_size.saturating_sub(self.body.len()) as u64 {
                    return Err(ParseError::BodyTooLarge(self.limits.max_body_size));
                } else {
                    State::Chunked(Chunk::Data(size))
                };
                Ok(Some(end + 2))
            }
            Chunk::Data(remaining) => {
                if rest.is_empty() {
                    return Ok(None);
                }
                let take = remaining.min(rest.len() as u64) as usize;
                self.body.extend_from_slice(&rest[..take]);
                let left = remaining - take as u64;
                self.state = State::Chunked(if left == 0 { Chunk::DataEnd } else { Chunk::Data(left) });
                Ok(Some(take))
            }
            Chunk::DataEnd => {
                if rest.len() < 2 {
                    return Ok(None);
                }
                if &rest[..2] != b"\r\n" {
                    return Err(ParseError::InvalidChunk);
                }
                self.state = State::Chunked(Chunk::Size);
                Ok(Some(2))
            }
            Chunk::Trailer => {
                let Some(end) = find_crlf(rest) else {
                    return self.partial(rest);
                };
                // Trailer fields are skipped.
                if end == 0 {
                    self.state = State::Done;
                }
                Ok(Some(end + 2))
            }
        }
    }

    fn partial(&self, rest: &[u8]) -> Result<Option<usize>, ParseError> {
        if rest.len() > self.limits.max_head_size {
            return Err(ParseError::HeadTooLarge(self.limits.max_head_size));
        }
        Ok(None)
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == b"\r\n")
}

fn parse_content_length(value: &[u8]) -> Result<u64, ParseError> {
    let value = std::str::from_utf8(value)
        .map_err(|_| ParseError::InvalidContentLength)?
        .trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidContentLength);
    }
    value.parse().map_err(|_| ParseError::InvalidContentLength)
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let size = line.split(|&b| b == b';').next().unwrap_or_default();
    let size = std::str::from_utf8(size)
        .map_err(|_| ParseError::InvalidChunk)?
        .trim_matches(|c| c == ' ' || c == '\t');
    if size.is_empty() {
        return Err(ParseError::InvalidChunk);
    }
    u64::from_str_radix(size, 16).map_err(|_| ParseError::InvalidChunk)
}

fn is_chunked_last(value: &HeaderValue) -> bool {
    value
        .to_str()
        .ok()
        .and_then(|codings| codings.rsplit(',').next())
        .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> HttpParser {
        HttpParser::new(&ParserLimits::default())
    }

    #[test]
    fn parses_request_without_body() {
        let mut p = parser();
        let raw = b"GET /health HTTP/1.1\r\nHost: example\r\n\r\n";
        assert_eq!(p.write(raw).unwrap(), raw.len());
        assert!(p.is_complete());

        let request = p.take_request().unwrap();
        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.uri().path(), "/health");
        assert_eq!(request.version(), Version::HTTP_11);
        assert_eq!(request.headers()["host"], "example");
        assert!(request.body().is_empty());
    }

    #[test]
    fn partial_head_is_left_unconsumed() {
        let mut p = parser();
        let raw = b"GET / HTTP/1.1\r\nHost: exa";
        assert_eq!(p.write(raw).unwrap(), 0);
        assert!(!p.is_complete());

        let full = b"GET / HTTP/1.1\r\nHost: example\r\n\r\n";
        assert_eq!(p.write(full).unwrap(), full.len());
        assert!(p.is_complete());
    }

    #[test]
    fn stops_at_message_boundary() {
        let mut p = parser();
        let first = b"POST /a HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let mut raw = first.to_vec();
        raw.extend_from_slice(b"GET /b HTTP/1.1\r\n\r\n");

        assert_eq!(p.write(&raw).unwrap(), first.len());
        let request = p.take_request().unwrap();
        assert_eq!(&request.body()[..], b"hello");
    }

    #[test]
    fn body_across_writes() {
        let mut p = parser();
        let head = b"PUT /x HTTP/1.1\r\nContent-Length: 6\r\n\r\nabc";
        assert_eq!(p.write(head).unwrap(), head.len());
        assert!(!p.is_complete());
        assert_eq!(p.write(b"def").unwrap(), 3);
        assert_eq!(&p.take_request().unwrap().body()[..], b"abcdef");
    }

    #[test]
    fn decodes_chunked_body() {
        let mut p = parser();
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
            5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: yes\r\n\r\n";
        assert_eq!(p.write(raw).unwrap(), raw.len());
        assert_eq!(&p.take_request().unwrap().body()[..], b"hello world");
    }

    #[test]
    fn chunk_size_line_waits_for_crlf() {
        let mut p = parser();
        let head = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n";
        let mut raw = head.to_vec();
        raw.extend_from_slice(b"1");
        assert_eq!(p.write(&raw).unwrap(), head.len());
        assert_eq!(p.write(b"1\r\nx\r\n0\r\n\r\n").unwrap(), 11);
        assert!(p.is_complete());
    }

    #[test]
    fn rejects_framing_violations() {
        let mut p = parser();
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\n";
        assert_eq!(p.write(raw), Err(ParseError::DifferentContentLengths));

        let mut p = parser();
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 1x\r\n\r\n";
        assert_eq!(p.write(raw), Err(ParseError::InvalidContentLength));

        let mut p = parser();
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n";
        assert_eq!(p.write(raw), Err(ParseError::UnsupportedTransferEncoding));

        let mut p = parser();
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n";
        assert_eq!(p.write(raw), Err(ParseError::InvalidChunk));

        let mut p = parser();
        assert_eq!(p.write(b"GET / HTTP/1.1\r\nBad Header\r\n\r\n"), Err(ParseError::InvalidHeaderName));
    }

    #[test]
    fn enforces_limits() {
        let tight_head = ParserLimits {
            max_head_size: 32,
            ..ParserLimits::default()
        };
        let mut p = HttpParser::new(&tight_head);
        let raw = b"GET /a-very-long-path-that-keeps-going HTTP/1.1\r\n";
        assert_eq!(p.write(raw), Err(ParseError::HeadTooLarge(32)));

        let small_body = ParserLimits {
            max_body_size: 4,
            ..ParserLimits::default()
        };
        let mut p = HttpParser::new(&small_body);
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n";
        assert_eq!(p.write(raw), Err(ParseError::BodyTooLarge(4)));

        let mut p = HttpParser::new(&small_body);
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\n";
        assert_eq!(p.write(raw), Err(ParseError::BodyTooLarge(4)));

        let mut p = parser();
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n1\r\na\r\nffffffffffffffff\r\n";
        assert_eq!(
            p.write(raw),
            Err(ParseError::BodyTooLarge(ParserLimits::default().max_body_size))
        );

        let few_headers = ParserLimits {
            max_headers: 2,
            ..ParserLimits::default()
        };
        let mut p = HttpParser::new(&few_headers);
        let raw = b"GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\nC: 3\r\n\r\n";
        assert_eq!(p.write(raw), Err(ParseError::TooManyHeaders));
    }

    #[test]
    fn eof_does_not_complete_a_request() {
        let mut p = parser();
        assert_eq!(p.write(b"GET / HT").unwrap(), 0);
        p.write_eof().unwrap();
        assert!(!p.is_complete());
        assert!(p.take_request().is_none());
    }
}
