//! Minimal HTTP/1.1 support for the WebSocket upgrade.
//!
//! Only what an upgrade exchange needs: request and response heads,
//! Content-Length bodies aggregated into full messages, and pipeline stages
//! that decode and encode them. Chunked transfer coding and request
//! pipelining are not supported.

mod codec;
mod message;

pub use codec::{
    HttpError, HttpRequestDecoder, HttpRequestEncoder, HttpResponseDecoder, HttpResponseEncoder,
    RequestDecoder, RequestEncoder, ResponseDecoder, ResponseEncoder, DEFAULT_MAX_CONTENT_LENGTH,
    DEFAULT_MAX_HEADERS_SIZE,
};
pub use message::{header_contains_token, is_keep_alive, FullHttpRequest, FullHttpResponse};
