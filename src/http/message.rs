//! Aggregated HTTP/1.1 messages.
//!
//! A full message carries its head and its entire body. The decoders only
//! emit a message once the whole Content-Length body has arrived.

use bytes::Bytes;
use http::header::{HeaderName, CONNECTION};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Version};

/// An HTTP request with its complete body.
#[derive(Debug, Clone)]
pub struct FullHttpRequest {
    /// Request method.
    pub method: Method,
    /// Request target as sent on the request line.
    pub uri: String,
    /// Protocol version.
    pub version: Version,
    /// Header fields.
    pub headers: HeaderMap,
    /// Body bytes.
    pub body: Bytes,
}

impl FullHttpRequest {
    /// Creates an HTTP/1.1 request with no headers and an empty body.
    #[must_use]
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Appends a header field.
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Replaces the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of `name`, if present and valid UTF-8.
    #[must_use]
    pub fn header(&self, name: impl http::header::AsHeaderName) -> Option<&str> {
        header_str(&self.headers, name)
    }

    /// The request target without its query string.
    #[must_use]
    pub fn path(&self) -> &str {
        self.uri
            .split_once('?')
            .map_or(self.uri.as_str(), |(path, _)| path)
    }

    /// True if the connection should stay open after this request.
    #[must_use]
    pub fn is_keep_alive(&self) -> bool {
        is_keep_alive(self)
    }
}

/// An HTTP response with its complete body.
#[derive(Debug, Clone)]
pub struct FullHttpResponse {
    /// Status code.
    pub status: StatusCode,
    /// Protocol version.
    pub version: Version,
    /// Header fields.
    pub headers: HeaderMap,
    /// Body bytes.
    pub body: Bytes,
}

impl FullHttpResponse {
    /// Creates an HTTP/1.1 response with no headers and an empty body.
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Appends a header field.
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Replaces the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of `name`, if present and valid UTF-8.
    #[must_use]
    pub fn header(&self, name: impl http::header::AsHeaderName) -> Option<&str> {
        header_str(&self.headers, name)
    }
}

/// True if `headers` has a `name` field listing `token` (comma-separated,
/// case-insensitive).
#[must_use]
pub fn header_contains_token(
    headers: &HeaderMap,
    name: impl http::header::AsHeaderName,
    token: &str,
) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// HTTP/1.1 connections persist unless `Connection: close` is sent;
/// HTTP/1.0 connections persist only with `Connection: keep-alive`.
#[must_use]
pub fn is_keep_alive(request: &FullHttpRequest) -> bool {
    if header_contains_token(&request.headers, CONNECTION, "close") {
        return false;
    }
    if request.version == Version::HTTP_10 {
        return header_contains_token(&request.headers, CONNECTION, "keep-alive");
    }
    request.version >= Version::HTTP_11
}

fn header_str(headers: &HeaderMap, name: impl http::header::AsHeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
