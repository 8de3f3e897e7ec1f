//! WebSocket opening handshake (RFC 6455 Section 4).
//!
//! Handshakers build and validate the upgrade messages for one connection
//! and switch its pipeline from the HTTP codec to the frame codec.
//!
//! # Client Handshake
//!
//! ```http
//! GET /chat HTTP/1.1
//! Host: server.example.com
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Version: 13
//! ```
//!
//! # Server Response
//!
//! ```http
//! HTTP/1.1 101 Switching Protocols
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=
//! ```
//!
//! Only version 13 is spoken. A server asked for anything else answers
//! `426 Upgrade Required` with `Sec-WebSocket-Version: 13`.

use crate::error::Error;
use crate::http::{header_contains_token, FullHttpRequest, FullHttpResponse};
use crate::net::websocket::client::ClientProtocolConfig;
use crate::net::websocket::codec::{frame_decoder, WsFrameEncoder};
use crate::net::websocket::{stage_names, CloseTracker, Frame, FrameCodec, Role};
use crate::pipeline::Context;
use crate::promise::Promise;
use crate::tracing_compat::debug;
use base64::Engine;
use http::header::{
    CONNECTION, HOST, ORIGIN, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL,
    SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// RFC 6455 GUID for Sec-WebSocket-Accept calculation.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version spoken.
pub const WEBSOCKET_VERSION: &str = "13";

/// Server-side subprotocol entry that accepts whatever the client asks for.
pub const SUBPROTOCOL_WILDCARD: &str = "*";

/// Compute the Sec-WebSocket-Accept value from a client key.
///
/// Per RFC 6455 Section 4.2.2:
/// 1. Concatenate the client's Sec-WebSocket-Key with the GUID
/// 2. Take the SHA-1 hash
/// 3. Base64 encode the result
///
/// # Example
///
/// ```
/// use wsgate::net::websocket::compute_accept_key;
///
/// let client_key = "dGhlIHNhbXBsZSBub25jZQ==";
/// let accept = compute_accept_key(client_key);
/// assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
#[must_use]
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Generate a random 16-byte key for the client handshake.
fn generate_client_key() -> String {
    let mut key = [0u8; 16];
    getrandom::fill(&mut key).expect("OS RNG unavailable");
    base64::engine::general_purpose::STANDARD.encode(key)
}

/// Picks the first requested subprotocol (in the client's order) that the
/// server supports. A supported entry of `*` matches anything.
#[must_use]
pub fn select_subprotocol(requested: &str, supported: &[String]) -> Option<String> {
    requested
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .find(|requested| {
            supported
                .iter()
                .any(|s| s == SUBPROTOCOL_WILDCARD || s == requested)
        })
        .map(str::to_string)
}

/// Splits a comma-separated subprotocol list.
pub(crate) fn parse_subprotocols(list: Option<&str>) -> Vec<String> {
    list.map(|list| {
        list.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// WebSocket handshake errors.
#[derive(Debug, Clone, Error)]
pub enum HandshakeError {
    /// Invalid URL format.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    /// Invalid HTTP request or response.
    #[error("invalid HTTP request: {0}")]
    InvalidRequest(String),
    /// Missing required header.
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),
    /// Invalid Sec-WebSocket-Key.
    #[error("invalid Sec-WebSocket-Key")]
    InvalidKey,
    /// Invalid Sec-WebSocket-Accept (response validation).
    #[error("invalid Sec-WebSocket-Accept: expected {expected}, got {actual}")]
    InvalidAccept {
        /// Expected accept value.
        expected: String,
        /// Actual accept value.
        actual: String,
    },
    /// Unsupported WebSocket version.
    #[error("unsupported WebSocket version: {0}")]
    UnsupportedVersion(String),
    /// The server selected a subprotocol that was not requested.
    #[error("invalid subprotocol: requested {requested:?}, selected {selected:?}")]
    ProtocolMismatch {
        /// Subprotocols the client asked for.
        requested: Option<String>,
        /// Subprotocol the server answered with.
        selected: Option<String>,
    },
    /// HTTP response not 101 Switching Protocols.
    #[error("expected 101 Switching Protocols, got {0}")]
    NotSwitchingProtocols(u16),
    /// The handshake did not complete in time.
    #[error("handshake timed out")]
    Timeout,
    /// The connection closed before the handshake completed.
    #[error("connection closed with handshake in progress")]
    ConnectionClosed,
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

impl HandshakeError {
    /// True for errors caused by a malformed upgrade request, which a server
    /// answers with `400 Bad Request`.
    #[must_use]
    pub fn is_bad_request(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_) | Self::MissingHeader(_) | Self::InvalidKey
        )
    }
}

impl From<io::Error> for HandshakeError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// Parsed WebSocket URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    /// Host name or IP address.
    pub host: String,
    /// Port number (default: 80 for ws, 443 for wss).
    pub port: u16,
    /// Request path including any query (default: "/").
    pub path: String,
    /// Whether TLS is required (wss://).
    pub tls: bool,
}

impl WsUrl {
    /// Parse a WebSocket URL (ws:// or wss://).
    ///
    /// # Errors
    ///
    /// Returns `HandshakeError::InvalidUrl` if the URL is malformed.
    pub fn parse(url: &str) -> Result<Self, HandshakeError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| HandshakeError::InvalidUrl("missing scheme".into()))?;

        let tls = match scheme.to_ascii_lowercase().as_str() {
            "ws" => false,
            "wss" => true,
            _ => {
                return Err(HandshakeError::InvalidUrl(format!(
                    "unsupported scheme: {scheme}"
                )))
            }
        };

        let default_port = if tls { 443 } else { 80 };

        // Split host:port from path
        let (host_port, path) = match rest.find(['/', '?']) {
            Some(idx) if rest.as_bytes()[idx] == b'?' => (&rest[..idx], format!("/{}", &rest[idx..])),
            Some(idx) => (&rest[..idx], rest[idx..].to_string()),
            None => (rest, "/".to_string()),
        };

        let invalid_port = || HandshakeError::InvalidUrl("invalid port".into());
        let (host, port) = if let Some(v6) = host_port.strip_prefix('[') {
            // IPv6: [::1]:8080
            let (host, after) = v6
                .split_once(']')
                .ok_or_else(|| HandshakeError::InvalidUrl("unterminated IPv6 host".into()))?;
            let port = match after.strip_prefix(':') {
                Some(port) => port.parse().map_err(|_| invalid_port())?,
                None if after.is_empty() => default_port,
                None => return Err(invalid_port()),
            };
            (host.to_string(), port)
        } else if let Some((host, port)) = host_port.rsplit_once(':') {
            (host.to_string(), port.parse().map_err(|_| invalid_port())?)
        } else {
            (host_port.to_string(), default_port)
        };

        if host.is_empty() {
            return Err(HandshakeError::InvalidUrl("empty host".into()));
        }

        Ok(Self {
            host,
            port,
            path,
            tls,
        })
    }

    fn default_port(&self) -> u16 {
        if self.tls {
            443
        } else {
            80
        }
    }

    fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == self.default_port() {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }

    /// Returns the Host header value.
    #[must_use]
    pub fn host_header(&self) -> String {
        self.authority()
    }

    /// Returns the Origin header value: `http://` or `https://` plus the
    /// lowercased authority.
    #[must_use]
    pub fn origin(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}", self.authority().to_ascii_lowercase())
    }
}

impl fmt::Display for WsUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "wss" } else { "ws" };
        write!(f, "{scheme}://{}{}", self.authority(), self.path)
    }
}

fn header_value(value: &str, what: &'static str) -> Result<HeaderValue, HandshakeError> {
    HeaderValue::from_str(value)
        .map_err(|_| HandshakeError::InvalidRequest(format!("invalid {what} header value")))
}

fn check_upgrade_headers(headers: &HeaderMap) -> Result<(), HandshakeError> {
    let upgrade = headers
        .get(UPGRADE)
        .ok_or(HandshakeError::MissingHeader("Upgrade"))?;
    if !upgrade.as_bytes().eq_ignore_ascii_case(b"websocket") {
        return Err(HandshakeError::InvalidRequest(format!(
            "Upgrade header must be 'websocket', got {upgrade:?}"
        )));
    }
    if !headers.contains_key(CONNECTION) {
        return Err(HandshakeError::MissingHeader("Connection"));
    }
    if !header_contains_token(headers, CONNECTION, "upgrade") {
        return Err(HandshakeError::InvalidRequest(
            "Connection header must include 'Upgrade'".into(),
        ));
    }
    Ok(())
}

/// Creates [`ServerHandshaker`]s for one endpoint.
#[derive(Debug, Clone)]
pub struct ServerHandshakerFactory {
    websocket_url: String,
    subprotocols: Vec<String>,
    max_frame_payload: usize,
    force_close_timeout: Option<Duration>,
}

impl ServerHandshakerFactory {
    /// Creates a factory for the endpoint at `websocket_url` supporting the
    /// comma-separated `subprotocols`.
    #[must_use]
    pub fn new(websocket_url: impl Into<String>, subprotocols: Option<&str>) -> Self {
        Self {
            websocket_url: websocket_url.into(),
            subprotocols: parse_subprotocols(subprotocols),
            max_frame_payload: FrameCodec::DEFAULT_MAX_PAYLOAD_SIZE,
            force_close_timeout: None,
        }
    }

    /// Sets the largest frame payload accepted after the upgrade.
    #[must_use]
    pub fn max_frame_payload(mut self, size: usize) -> Self {
        self.max_frame_payload = size;
        self
    }

    /// Sets how long a server-initiated close waits for the peer's close frame.
    #[must_use]
    pub fn force_close_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.force_close_timeout = timeout;
        self
    }

    /// Returns a handshaker for the version the request asks for, or `None`
    /// if that version is not supported.
    #[must_use]
    pub fn new_handshaker(&self, request: &FullHttpRequest) -> Option<ServerHandshaker> {
        match request.header(SEC_WEBSOCKET_VERSION) {
            Some(version) if version.trim() == WEBSOCKET_VERSION => Some(ServerHandshaker {
                inner: Arc::new(ServerInner {
                    websocket_url: self.websocket_url.clone(),
                    subprotocols: self.subprotocols.clone(),
                    max_frame_payload: self.max_frame_payload,
                    tracker: CloseTracker::new(self.force_close_timeout),
                    selected_subprotocol: Mutex::new(None),
                }),
            }),
            _ => None,
        }
    }

    /// Writes `426 Upgrade Required` advertising the supported version.
    pub fn send_unsupported_version_response(ctx: &mut Context<'_>) -> Promise {
        let response = FullHttpResponse::new(StatusCode::UPGRADE_REQUIRED).with_header(
            SEC_WEBSOCKET_VERSION,
            HeaderValue::from_static(WEBSOCKET_VERSION),
        );
        ctx.write_and_flush(response)
    }
}

struct ServerInner {
    websocket_url: String,
    subprotocols: Vec<String>,
    max_frame_payload: usize,
    tracker: CloseTracker,
    selected_subprotocol: Mutex<Option<String>>,
}

/// Server end of one connection's handshake.
///
/// Cloning yields another handle to the same handshaker.
#[derive(Clone)]
pub struct ServerHandshaker {
    inner: Arc<ServerInner>,
}

impl ServerHandshaker {
    /// Location of the endpoint, e.g. `ws://example.com/chat`.
    #[must_use]
    pub fn websocket_url(&self) -> &str {
        &self.inner.websocket_url
    }

    /// Subprotocols this endpoint supports.
    #[must_use]
    pub fn subprotocols(&self) -> &[String] {
        &self.inner.subprotocols
    }

    /// The subprotocol chosen for this connection, once the response was built.
    #[must_use]
    pub fn selected_subprotocol(&self) -> Option<String> {
        self.inner.selected_subprotocol.lock().clone()
    }

    /// Largest frame payload accepted after the upgrade.
    #[must_use]
    pub fn max_frame_payload(&self) -> usize {
        self.inner.max_frame_payload
    }

    /// Close handshake state of this connection.
    #[must_use]
    pub fn close_tracker(&self) -> &CloseTracker {
        &self.inner.tracker
    }

    /// True once a server-initiated close had to be forced.
    #[must_use]
    pub fn is_force_close_complete(&self) -> bool {
        self.inner.tracker.is_force_close_complete()
    }

    /// Validates `request` and builds the `101 Switching Protocols` response.
    ///
    /// # Errors
    ///
    /// Returns an error if the request lacks a valid key or the upgrade
    /// headers.
    pub fn new_handshake_response(
        &self,
        request: &FullHttpRequest,
    ) -> Result<FullHttpResponse, HandshakeError> {
        let key = request
            .header(SEC_WEBSOCKET_KEY)
            .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;
        check_upgrade_headers(&request.headers)?;

        // Valid keys are base64 of 16 bytes (24 chars with padding).
        match base64::engine::general_purpose::STANDARD.decode(key.trim()) {
            Ok(decoded) if decoded.len() == 16 => {}
            _ => return Err(HandshakeError::InvalidKey),
        }

        let accept = compute_accept_key(key.trim());
        let mut response = FullHttpResponse::new(StatusCode::SWITCHING_PROTOCOLS)
            .with_header(UPGRADE, HeaderValue::from_static("websocket"))
            .with_header(CONNECTION, HeaderValue::from_static("Upgrade"))
            .with_header(SEC_WEBSOCKET_ACCEPT, header_value(&accept, "accept")?);

        if let Some(requested) = request.header(SEC_WEBSOCKET_PROTOCOL) {
            match select_subprotocol(requested, &self.inner.subprotocols) {
                Some(selected) => {
                    response = response
                        .with_header(SEC_WEBSOCKET_PROTOCOL, header_value(&selected, "subprotocol")?);
                    *self.inner.selected_subprotocol.lock() = Some(selected);
                }
                None => debug!(requested, "requested subprotocols not supported"),
            }
        }
        Ok(response)
    }

    /// Writes the upgrade response and switches the pipeline to the frame
    /// codec.
    ///
    /// The codecs are swapped before this returns, so bytes following the
    /// request are decoded as frames. The returned promise completes with
    /// the response write; it is already failed if the request was invalid.
    pub fn handshake(&self, ctx: &mut Context<'_>, request: &FullHttpRequest) -> Promise {
        let response = match self.new_handshake_response(request) {
            Ok(response) => response,
            Err(err) => return Promise::failed(err.into()),
        };
        debug!(
            conn = %ctx.connection_id(),
            url = %self.inner.websocket_url,
            subprotocol = ?self.selected_subprotocol(),
            "writing upgrade response"
        );
        let written = ctx.write_and_flush(response);
        if let Err(err) = self.install_frame_codec(ctx) {
            return Promise::failed(err.into());
        }
        written
    }

    fn install_frame_codec(&self, ctx: &mut Context<'_>) -> Result<(), crate::pipeline::PipelineError> {
        let max = self.inner.max_frame_payload;
        ctx.replace(
            stage_names::HTTP_DECODER,
            stage_names::WS_DECODER,
            frame_decoder(Role::Server, max),
        )?;
        ctx.replace(
            stage_names::HTTP_ENCODER,
            stage_names::WS_ENCODER,
            WsFrameEncoder::new(FrameCodec::server().max_payload_size(max), self.inner.tracker.clone()),
        )?;
        Ok(())
    }

    /// Starts the closing handshake by writing `frame`.
    ///
    /// Without a force-close timeout the connection is closed as soon as the
    /// frame is written; otherwise the peer gets that long to answer.
    pub fn close(&self, ctx: &mut Context<'_>, frame: Frame) -> Promise {
        let written = ctx.write_and_flush(frame);
        if self.inner.tracker.force_close_timeout().is_none() {
            ctx.on_complete(&written, |ctx, _| {
                ctx.close();
            });
        }
        written
    }
}

impl fmt::Debug for ServerHandshaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandshaker")
            .field("websocket_url", &self.inner.websocket_url)
            .field("subprotocols", &self.inner.subprotocols)
            .field("selected_subprotocol", &self.selected_subprotocol())
            .field("close", &self.inner.tracker)
            .finish()
    }
}

#[derive(Default)]
struct ClientState {
    expected_accept: Option<String>,
    actual_subprotocol: Option<String>,
    complete: bool,
}

struct ClientInner {
    url: WsUrl,
    expected_subprotocol: Option<String>,
    custom_headers: HeaderMap,
    max_frame_payload: usize,
    generate_origin_header: bool,
    tracker: CloseTracker,
    state: Mutex<ClientState>,
}

/// Client end of one connection's handshake.
///
/// Cloning yields another handle to the same handshaker.
#[derive(Clone)]
pub struct ClientHandshaker {
    inner: Arc<ClientInner>,
}

impl ClientHandshaker {
    pub(crate) fn from_config(config: &ClientProtocolConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                url: config.url.clone(),
                expected_subprotocol: config.subprotocol.clone(),
                custom_headers: config.custom_headers.clone(),
                max_frame_payload: config.max_frame_payload,
                generate_origin_header: config.generate_origin_header,
                tracker: CloseTracker::new(config.force_close_timeout),
                state: Mutex::new(ClientState::default()),
            }),
        }
    }

    /// The server URL.
    #[must_use]
    pub fn url(&self) -> &WsUrl {
        &self.inner.url
    }

    /// Subprotocols requested from the server (comma-separated).
    #[must_use]
    pub fn expected_subprotocol(&self) -> Option<&str> {
        self.inner.expected_subprotocol.as_deref()
    }

    /// Subprotocol the server selected, once the handshake completed.
    #[must_use]
    pub fn actual_subprotocol(&self) -> Option<String> {
        self.inner.state.lock().actual_subprotocol.clone()
    }

    /// True once a valid response was received and the pipeline switched.
    #[must_use]
    pub fn is_handshake_complete(&self) -> bool {
        self.inner.state.lock().complete
    }

    /// Close handshake state of this connection.
    #[must_use]
    pub fn close_tracker(&self) -> &CloseTracker {
        &self.inner.tracker
    }

    /// True once the force-close timer closed the connection.
    #[must_use]
    pub fn is_force_close_complete(&self) -> bool {
        self.inner.tracker.is_force_close_complete()
    }

    /// Builds the upgrade request with a fresh key.
    ///
    /// Custom headers are sent as configured, but the upgrade headers always
    /// win; `Host` and `Origin` are only filled in when not set already.
    ///
    /// # Errors
    ///
    /// Returns an error if a generated header value is not valid.
    pub fn new_handshake_request(&self) -> Result<FullHttpRequest, HandshakeError> {
        let url = &self.inner.url;
        let key = generate_client_key();

        let mut request = FullHttpRequest::new(Method::GET, url.path.clone());
        request.headers = self.inner.custom_headers.clone();
        let headers = &mut request.headers;
        if !headers.contains_key(HOST) {
            headers.insert(HOST, header_value(&url.host_header(), "Host")?);
        }
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(SEC_WEBSOCKET_KEY, header_value(&key, "key")?);
        if self.inner.generate_origin_header && !headers.contains_key(ORIGIN) {
            headers.insert(ORIGIN, header_value(&url.origin(), "Origin")?);
        }
        if let Some(protocol) = self.expected_subprotocol().filter(|p| !p.is_empty()) {
            headers.insert(SEC_WEBSOCKET_PROTOCOL, header_value(protocol, "subprotocol")?);
        }
        headers.insert(
            SEC_WEBSOCKET_VERSION,
            HeaderValue::from_static(WEBSOCKET_VERSION),
        );

        self.inner.state.lock().expected_accept = Some(compute_accept_key(&key));
        Ok(request)
    }

    /// Writes the upgrade request.
    ///
    /// The returned promise completes with the write; it is already failed
    /// if the request could not be built.
    pub fn handshake(&self, ctx: &mut Context<'_>) -> Promise {
        match self.new_handshake_request() {
            Ok(request) => {
                debug!(conn = %ctx.connection_id(), url = %self.inner.url, "writing upgrade request");
                ctx.write_and_flush(request)
            }
            Err(err) => Promise::failed(err.into()),
        }
    }

    /// Checks the server's response; returns the selected subprotocol.
    ///
    /// # Errors
    ///
    /// Returns an error if the status is not 101, an upgrade header is
    /// missing or wrong, the accept value does not match the key sent, or the
    /// server selected a subprotocol that was not requested.
    pub fn verify(&self, response: &FullHttpResponse) -> Result<Option<String>, HandshakeError> {
        if response.status != StatusCode::SWITCHING_PROTOCOLS {
            return Err(HandshakeError::NotSwitchingProtocols(response.status.as_u16()));
        }
        check_upgrade_headers(&response.headers)?;

        let expected = self
            .inner
            .state
            .lock()
            .expected_accept
            .clone()
            .ok_or_else(|| HandshakeError::InvalidRequest("upgrade request was never sent".into()))?;
        let accept = response
            .header(SEC_WEBSOCKET_ACCEPT)
            .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Accept"))?;
        if accept.trim() != expected {
            return Err(HandshakeError::InvalidAccept {
                expected,
                actual: accept.to_string(),
            });
        }

        let received = response
            .header(SEC_WEBSOCKET_PROTOCOL)
            .map(str::trim)
            .filter(|p| !p.is_empty());
        let requested = self.expected_subprotocol().unwrap_or_default();
        match received {
            None if requested.is_empty() => Ok(None),
            Some(received) if requested.split(',').any(|p| p.trim() == received) => {
                Ok(Some(received.to_string()))
            }
            _ => Err(HandshakeError::ProtocolMismatch {
                requested: self.inner.expected_subprotocol.clone(),
                selected: received.map(str::to_string),
            }),
        }
    }

    /// Verifies `response` and switches the pipeline to the frame codec.
    ///
    /// # Errors
    ///
    /// Returns the verification error, or a pipeline error if the HTTP codec
    /// stages are missing.
    pub fn finish_handshake(
        &self,
        ctx: &mut Context<'_>,
        response: &FullHttpResponse,
    ) -> Result<(), Error> {
        let selected = self.verify(response)?;
        {
            let mut state = self.inner.state.lock();
            state.actual_subprotocol = selected;
            state.complete = true;
        }
        let max = self.inner.max_frame_payload;
        ctx.replace(
            stage_names::HTTP_DECODER,
            stage_names::WS_DECODER,
            frame_decoder(Role::Client, max),
        )?;
        ctx.replace(
            stage_names::HTTP_ENCODER,
            stage_names::WS_ENCODER,
            WsFrameEncoder::new(FrameCodec::client().max_payload_size(max), self.inner.tracker.clone()),
        )?;
        Ok(())
    }

    /// Starts the closing handshake by writing `frame`; the force-close
    /// timer, if configured, starts once it is encoded.
    pub fn close(&self, ctx: &mut Context<'_>, frame: Frame) -> Promise {
        ctx.write_and_flush(frame)
    }
}

impl fmt::Debug for ClientHandshaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandshaker")
            .field("url", &self.inner.url)
            .field("expected_subprotocol", &self.inner.expected_subprotocol)
            .field("complete", &self.is_handshake_complete())
            .field("close", &self.inner.tracker)
            .finish()
    }
}
