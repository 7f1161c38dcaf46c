//! Response encoding helpers for handlers.
//!
//! The connection engine only ever sees opaque bytes; these helpers exist so
//! that handlers do not have to hand-assemble status lines.

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};

/// An HTTP/1.1 response to be serialized and written through a session.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Response {
    /// Create an empty response with the given status.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Append a header field.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Replace the body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Serialize head and body, adding `Content-Length` and `Connection`.
    pub fn encode(&self, keep_alive: bool) -> Vec<u8> {
        let mut dst = Vec::with_capacity(128 + self.body.len());
        self.encode_status_and_headers(&mut dst, keep_alive);
        if !self.headers.contains_key(CONTENT_LENGTH) {
            dst.extend_from_slice(b"content-length: ");
            dst.extend_from_slice(self.body.len().to_string().as_bytes());
            dst.extend_from_slice(b"\r\n");
        }
        dst.extend_from_slice(b"\r\n");
        dst.extend_from_slice(&self.body);
        dst
    }

    /// Serialize the head only, for bodies produced by a streaming writer.
    ///
    /// The caller is responsible for framing the body that follows, either by
    /// setting `Content-Length` or by closing the connection afterwards.
    pub fn encode_head(&self, keep_alive: bool) -> Vec<u8> {
        let mut dst = Vec::with_capacity(128);
        self.encode_status_and_headers(&mut dst, keep_alive);
        dst.extend_from_slice(b"\r\n");
        dst
    }

    fn encode_status_and_headers(&self, dst: &mut Vec<u8>, keep_alive: bool) {
        dst.extend_from_slice(b"HTTP/1.1 ");
        dst.extend_from_slice(self.status.as_str().as_bytes());
        dst.push(b' ');
        dst.extend_from_slice(self.status.canonical_reason().unwrap_or("Unknown").as_bytes());
        dst.extend_from_slice(b"\r\n");

        for (name, value) in &self.headers {
            if name == CONNECTION {
                continue;
            }
            dst.extend_from_slice(name.as_str().as_bytes());
            dst.extend_from_slice(b": ");
            dst.extend_from_slice(value.as_bytes());
            dst.extend_from_slice(b"\r\n");
        }
        dst.extend_from_slice(if keep_alive {
            b"connection: keep-alive\r\n".as_slice()
        } else {
            b"connection: close\r\n".as_slice()
        });
    }
}
