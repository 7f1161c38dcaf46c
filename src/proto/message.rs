//! Parsed request model.
//!
//! A `Request` is produced by a [`Parser`](crate::proto::Parser) once a full
//! message has been framed. It is handed to the application behind an `Arc`
//! and is only meaningful until the request is marked complete.

use bytes::Bytes;
use http::header::CONNECTION;
use http::{HeaderMap, Method, Uri, Version};

/// A fully framed request: head plus body.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
}

impl Request {
    /// Assemble a request from its parts.
    pub fn new(method: Method, uri: Uri, version: Version, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            uri,
            version,
            headers,
            body,
        }
    }

    /// Request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request target.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Protocol version from the request line.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Header fields in arrival order.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Decoded body (chunked framing already removed).
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Whether the client asked for the connection to be reused.
    ///
    /// HTTP/1.1 is persistent unless `Connection: close` is present;
    /// HTTP/1.0 is persistent only with `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        let mut close = false;
        let mut keep_alive = false;
        for value in self.headers.get_all(CONNECTION) {
            let Ok(value) = value.to_str() else { continue };
            for token in value.split(',').map(str::trim) {
                if token.eq_ignore_ascii_case("close") {
                    close = true;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    keep_alive = true;
                }
            }
        }

        if close {
            return false;
        }
        match self.version {
            Version::HTTP_10 | Version::HTTP_09 => keep_alive,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn request(version: Version, connection: Option<&'static str>) -> Request {
        let mut headers = HeaderMap::new();
        if let Some(value) = connection {
            headers.insert(CONNECTION, HeaderValue::from_static(value));
        }
        Request::new(Method::GET, Uri::from_static("/"), version, headers, Bytes::new())
    }

    #[test]
    fn http11_defaults_to_keep_alive() {
        assert!(request(Version::HTTP_11, None).keep_alive());
        assert!(!request(Version::HTTP_11, Some("close")).keep_alive());
        assert!(!request(Version::HTTP_11, Some("Upgrade, Close")).keep_alive());
    }

    #[test]
    fn http10_requires_explicit_keep_alive() {
        assert!(!request(Version::HTTP_10, None).keep_alive());
        assert!(request(Version::HTTP_10, Some("Keep-Alive")).keep_alive());
    }
}
