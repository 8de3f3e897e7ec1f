//! HTTP/1.1 head parsing with Content-Length body aggregation.
//!
//! The decoders emit one [`FullHttpRequest`] / [`FullHttpResponse`] per
//! message, only once the whole body has arrived, and always leave a
//! `content-length` header on the emitted message. Chunked transfer coding is
//! rejected.
//!
//! # Limits
//!
//! - Maximum header block size: 64 KiB
//! - Maximum aggregated body: 64 KiB
//! - Maximum number of headers: 128
//! - Maximum start line: 8 KiB

use crate::codec::{Decoder, DecoderStage, Encoder, EncoderStage};
use crate::http::{FullHttpRequest, FullHttpResponse};
use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Version};
use thiserror::Error;

/// Default maximum header block size (64 KiB).
pub const DEFAULT_MAX_HEADERS_SIZE: usize = 64 * 1024;

/// Default maximum aggregated body size (64 KiB).
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 64 * 1024;

const MAX_HEADERS: usize = 128;

const MAX_START_LINE: usize = 8192;

/// HTTP/1.1 codec errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    /// The request line is malformed.
    #[error("malformed request line")]
    BadRequestLine,
    /// The status line is malformed.
    #[error("malformed status line")]
    BadStatusLine,
    /// A header line is malformed.
    #[error("malformed header")]
    BadHeader,
    /// Header name contains invalid characters.
    #[error("invalid header name")]
    InvalidHeaderName,
    /// Header value contains invalid characters.
    #[error("invalid header value")]
    InvalidHeaderValue,
    /// Unparseable method token.
    #[error("unrecognised HTTP method")]
    BadMethod,
    /// Only HTTP/1.0 and HTTP/1.1 are spoken.
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
    /// Content-Length is not a valid integer.
    #[error("invalid Content-Length")]
    BadContentLength,
    /// Multiple Content-Length headers present.
    #[error("duplicate Content-Length")]
    DuplicateContentLength,
    /// Transfer codings are not supported.
    #[error("unsupported Transfer-Encoding")]
    UnsupportedTransferEncoding,
    /// Header block exceeds the configured limit.
    #[error("header block too large")]
    HeadersTooLarge,
    /// Too many headers.
    #[error("too many headers")]
    TooManyHeaders,
    /// Request or status line too long.
    #[error("start line too long")]
    StartLineTooLong,
    /// Body exceeds the aggregation limit.
    #[error("body exceeds size limit")]
    BodyTooLarge,
}

/// Inbound stage decoding requests (server side).
pub type HttpRequestDecoder = DecoderStage<RequestDecoder>;

/// Inbound stage decoding responses (client side).
pub type HttpResponseDecoder = DecoderStage<ResponseDecoder>;

/// Outbound stage encoding requests (client side).
pub type HttpRequestEncoder = EncoderStage<RequestEncoder, FullHttpRequest>;

/// Outbound stage encoding responses (server side).
pub type HttpResponseEncoder = EncoderStage<ResponseEncoder, FullHttpResponse>;

#[derive(Debug)]
enum DecodeState<H> {
    /// Waiting for a complete start line + header block.
    Head,
    /// Head parsed; waiting for `len` body bytes.
    Body {
        start: H,
        headers: HeaderMap,
        len: usize,
    },
}

/// Shared head/body state machine behind both decoders.
#[derive(Debug)]
struct Aggregator<H> {
    state: DecodeState<H>,
    max_headers_size: usize,
    max_content_length: usize,
}

impl<H> Aggregator<H> {
    fn new() -> Self {
        Self {
            state: DecodeState::Head,
            max_headers_size: DEFAULT_MAX_HEADERS_SIZE,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
        }
    }

    /// `parse_start` parses the start line; `body_len` decides the body
    /// length from the parsed head.
    fn decode(
        &mut self,
        src: &mut BytesMut,
        parse_start: impl Fn(&str) -> Result<H, HttpError>,
        body_len: impl Fn(&H, &HeaderMap) -> Result<usize, HttpError>,
    ) -> Result<Option<(H, HeaderMap, Bytes)>, HttpError> {
        loop {
            match &self.state {
                DecodeState::Head => {
                    let Some((line, headers)) = decode_head(src, self.max_headers_size)? else {
                        return Ok(None);
                    };
                    let start = parse_start(&line)?;
                    let len = body_len(&start, &headers)?;
                    if len > self.max_content_length {
                        return Err(HttpError::BodyTooLarge);
                    }
                    self.state = DecodeState::Body {
                        start,
                        headers,
                        len,
                    };
                }
                DecodeState::Body { len, .. } => {
                    let need = *len;
                    if src.len() < need {
                        return Ok(None);
                    }
                    let body = src.split_to(need).freeze();
                    let DecodeState::Body {
                        start, mut headers, ..
                    } = std::mem::replace(&mut self.state, DecodeState::Head)
                    else {
                        return Ok(None);
                    };
                    if !headers.contains_key(CONTENT_LENGTH) {
                        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
                    }
                    return Ok(Some((start, headers, body)));
                }
            }
        }
    }
}

/// Find the position of `\r\n\r\n` in `buf`, returning the index of the
/// first byte after the delimiter.
fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Splits off the head (start line + headers) once it has fully arrived.
fn decode_head(
    src: &mut BytesMut,
    max_headers_size: usize,
) -> Result<Option<(String, HeaderMap)>, HttpError> {
    if let Some(line_end) = src.windows(2).position(|w| w == b"\r\n") {
        if line_end > MAX_START_LINE {
            return Err(HttpError::StartLineTooLong);
        }
    } else if src.len() > MAX_START_LINE {
        return Err(HttpError::StartLineTooLong);
    }

    let Some(end) = find_headers_end(src) else {
        if src.len() > max_headers_size {
            return Err(HttpError::HeadersTooLarge);
        }
        return Ok(None);
    };
    if end > max_headers_size {
        return Err(HttpError::HeadersTooLarge);
    }

    let head = src.split_to(end);
    let head = std::str::from_utf8(&head).map_err(|_| HttpError::BadHeader)?;
    let mut lines = head.split("\r\n");
    let start = lines.next().unwrap_or_default().to_owned();

    let mut headers = HeaderMap::new();
    for line in lines.take_while(|l| !l.is_empty()) {
        let (name, value) = parse_header_line(line)?;
        headers.append(name, value);
        if headers.len() > MAX_HEADERS {
            return Err(HttpError::TooManyHeaders);
        }
    }
    Ok(Some((start, headers)))
}

/// Parse a single `Name: Value` header line.
fn parse_header_line(line: &str) -> Result<(HeaderName, HeaderValue), HttpError> {
    let (raw_name, value) = line.split_once(':').ok_or(HttpError::BadHeader)?;
    if raw_name.is_empty() || raw_name.trim() != raw_name {
        return Err(HttpError::InvalidHeaderName);
    }
    let name = HeaderName::from_bytes(raw_name.as_bytes())
        .map_err(|_| HttpError::InvalidHeaderName)?;
    let value =
        HeaderValue::from_str(value.trim()).map_err(|_| HttpError::InvalidHeaderValue)?;
    Ok((name, value))
}

fn parse_version(token: &str) -> Result<Version, HttpError> {
    match token {
        "HTTP/1.1" => Ok(Version::HTTP_11),
        "HTTP/1.0" => Ok(Version::HTTP_10),
        _ => Err(HttpError::UnsupportedVersion),
    }
}

fn version_str(version: Version) -> Result<&'static str, HttpError> {
    match version {
        Version::HTTP_11 => Ok("HTTP/1.1"),
        Version::HTTP_10 => Ok("HTTP/1.0"),
        _ => Err(HttpError::UnsupportedVersion),
    }
}

/// Content-Length of a message head; absent means an empty body.
fn content_length(headers: &HeaderMap) -> Result<usize, HttpError> {
    if headers.contains_key(TRANSFER_ENCODING) {
        return Err(HttpError::UnsupportedTransferEncoding);
    }
    let mut values = headers.get_all(CONTENT_LENGTH).iter();
    let Some(value) = values.next() else {
        return Ok(0);
    };
    if values.next().is_some() {
        return Err(HttpError::DuplicateContentLength);
    }
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .ok_or(HttpError::BadContentLength)
}

fn parse_request_line(line: &str) -> Result<(Method, String, Version), HttpError> {
    let mut parts = line.split_ascii_whitespace();
    let method = parts.next().ok_or(HttpError::BadRequestLine)?;
    let uri = parts.next().ok_or(HttpError::BadRequestLine)?;
    let version = parts.next().ok_or(HttpError::BadRequestLine)?;
    if parts.next().is_some() {
        return Err(HttpError::BadRequestLine);
    }
    let method = Method::from_bytes(method.as_bytes()).map_err(|_| HttpError::BadMethod)?;
    Ok((method, uri.to_owned(), parse_version(version)?))
}

fn parse_status_line(line: &str) -> Result<(Version, StatusCode), HttpError> {
    // The reason phrase may contain spaces and is ignored.
    let mut parts = line.splitn(3, ' ');
    let version = parse_version(parts.next().ok_or(HttpError::BadStatusLine)?)?;
    let status = parts
        .next()
        .and_then(|code| StatusCode::from_bytes(code.as_bytes()).ok())
        .ok_or(HttpError::BadStatusLine)?;
    Ok((version, status))
}

/// Responses that never carry a body.
fn is_bodyless(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

fn write_headers(headers: &HeaderMap, dst: &mut BytesMut) {
    for (name, value) in headers {
        dst.extend_from_slice(name.as_str().as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }
}

/// Decodes aggregated requests.
#[derive(Debug)]
pub struct RequestDecoder {
    inner: Aggregator<(Method, String, Version)>,
}

impl RequestDecoder {
    /// Creates a decoder with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Aggregator::new(),
        }
    }

    /// Sets the maximum aggregated body size.
    #[must_use]
    pub fn max_content_length(mut self, size: usize) -> Self {
        self.inner.max_content_length = size;
        self
    }

    /// Wraps the decoder in a pipeline stage.
    #[must_use]
    pub fn into_stage(self) -> HttpRequestDecoder {
        DecoderStage::new("http-request-decoder", self)
    }
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RequestDecoder {
    type Item = FullHttpRequest;
    type Error = HttpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<FullHttpRequest>, HttpError> {
        let decoded = self
            .inner
            .decode(src, parse_request_line, |_, headers| content_length(headers))?;
        Ok(decoded.map(|((method, uri, version), headers, body)| FullHttpRequest {
            method,
            uri,
            version,
            headers,
            body,
        }))
    }
}

/// Decodes aggregated responses.
#[derive(Debug)]
pub struct ResponseDecoder {
    inner: Aggregator<(Version, StatusCode)>,
}

impl ResponseDecoder {
    /// Creates a decoder with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Aggregator::new(),
        }
    }

    /// Sets the maximum aggregated body size.
    #[must_use]
    pub fn max_content_length(mut self, size: usize) -> Self {
        self.inner.max_content_length = size;
        self
    }

    /// Wraps the decoder in a pipeline stage.
    #[must_use]
    pub fn into_stage(self) -> HttpResponseDecoder {
        DecoderStage::new("http-response-decoder", self)
    }
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ResponseDecoder {
    type Item = FullHttpResponse;
    type Error = HttpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<FullHttpResponse>, HttpError> {
        let decoded = self.inner.decode(src, parse_status_line, |(_, status), headers| {
            if is_bodyless(*status) {
                Ok(0)
            } else {
                content_length(headers)
            }
        })?;
        Ok(decoded.map(|((version, status), headers, body)| FullHttpResponse {
            status,
            version,
            headers,
            body,
        }))
    }
}

/// Serializes requests.
///
/// A `content-length` header is added only when the body is non-empty and
/// the header is missing.
#[derive(Debug, Default)]
pub struct RequestEncoder;

impl RequestEncoder {
    /// Wraps the encoder in a pipeline stage.
    #[must_use]
    pub fn into_stage(self) -> HttpRequestEncoder {
        EncoderStage::new("http-request-encoder", self)
    }
}

impl Encoder<FullHttpRequest> for RequestEncoder {
    type Error = HttpError;

    fn encode(&mut self, req: FullHttpRequest, dst: &mut BytesMut) -> Result<(), HttpError> {
        if req.uri.is_empty() || req.uri.contains([' ', '\r', '\n']) {
            return Err(HttpError::BadRequestLine);
        }
        let version = version_str(req.version)?;
        dst.reserve(64 + req.body.len());
        dst.extend_from_slice(req.method.as_str().as_bytes());
        dst.extend_from_slice(b" ");
        dst.extend_from_slice(req.uri.as_bytes());
        dst.extend_from_slice(b" ");
        dst.extend_from_slice(version.as_bytes());
        dst.extend_from_slice(b"\r\n");
        write_headers(&req.headers, dst);
        if !req.body.is_empty() && !req.headers.contains_key(CONTENT_LENGTH) {
            dst.extend_from_slice(format!("content-length: {}\r\n", req.body.len()).as_bytes());
        }
        dst.extend_from_slice(b"\r\n");
        dst.extend_from_slice(&req.body);
        Ok(())
    }
}

/// Serializes responses.
///
/// A `content-length` header is added when missing, except for statuses that
/// never carry a body.
#[derive(Debug, Default)]
pub struct ResponseEncoder;

impl ResponseEncoder {
    /// Wraps the encoder in a pipeline stage.
    #[must_use]
    pub fn into_stage(self) -> HttpResponseEncoder {
        EncoderStage::new("http-response-encoder", self)
    }
}

impl Encoder<FullHttpResponse> for ResponseEncoder {
    type Error = HttpError;

    fn encode(&mut self, resp: FullHttpResponse, dst: &mut BytesMut) -> Result<(), HttpError> {
        let version = version_str(resp.version)?;
        let bodyless = is_bodyless(resp.status);
        if bodyless && !resp.body.is_empty() {
            return Err(HttpError::BadContentLength);
        }
        dst.reserve(64 + resp.body.len());
        dst.extend_from_slice(version.as_bytes());
        dst.extend_from_slice(b" ");
        dst.extend_from_slice(resp.status.as_str().as_bytes());
        dst.extend_from_slice(b" ");
        dst.extend_from_slice(
            resp.status
                .canonical_reason()
                .unwrap_or_default()
                .as_bytes(),
        );
        dst.extend_from_slice(b"\r\n");
        write_headers(&resp.headers, dst);
        if !bodyless && !resp.headers.contains_key(CONTENT_LENGTH) {
            dst.extend_from_slice(format!("content-length: {}\r\n", resp.body.len()).as_bytes());
        }
        dst.extend_from_slice(b"\r\n");
        dst.extend_from_slice(&resp.body);
        Ok(())
    }
}
