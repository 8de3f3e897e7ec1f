//! Server side of the upgrade: admits handshakes on one path and hands the
//! connection over to the frame codec.
//!
//! # Example
//!
//! ```
//! use wsgate::net::websocket::{ServerProtocolConfig, WebSocketServerProtocol};
//! use wsgate::pipeline::LabConnection;
//! use std::time::Duration;
//!
//! let config = ServerProtocolConfig::new("/chat")
//!     .subprotocols("chat, superchat")
//!     .handshake_timeout(Duration::from_secs(5));
//! let protocol = WebSocketServerProtocol::new(config);
//!
//! let mut conn = LabConnection::new();
//! protocol.install(&mut conn).unwrap();
//! assert_eq!(conn.pipeline_names(), ["http-decoder", "http-encoder", "ws-handshake"]);
//! ```
//!
//! Pipeline states of an admitted connection:
//!
//! ```text
//! [http-decoder][http-encoder][ws-handshake][app]       request arrives
//! [ws-decoder][ws-encoder][ws-403-responder][app]       101 being written
//! [ws-decoder][ws-encoder][ws-protocol][app]            101 written
//! ```

use crate::error::Error;
use crate::http::{FullHttpRequest, FullHttpResponse, RequestDecoder, ResponseEncoder};
use crate::net::websocket::event::HandshakeComplete;
use crate::net::websocket::protocol::FrameProtocolStage;
use crate::net::websocket::{
    stage_names, timeout, FrameCodec, ServerHandshakeStateEvent, ServerHandshaker,
    ServerHandshakerFactory,
};
use crate::pipeline::{Context, LabConnection, Message, PipelineError, Stage, UserEvent};
use crate::promise::Promise;
use crate::tracing_compat::{debug, warn};
use http::header::HOST;
use http::{Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;

/// Default handshake timeout.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Server endpoint configuration.
#[derive(Debug, Clone)]
pub struct ServerProtocolConfig {
    path: String,
    subprotocols: Option<String>,
    check_starts_with: bool,
    secure: bool,
    handshake_timeout: Duration,
    handle_close_frames: bool,
    force_close_timeout: Option<Duration>,
    max_frame_payload: usize,
    drop_pong_frames: bool,
}

impl Default for ServerProtocolConfig {
    fn default() -> Self {
        Self::new("/")
    }
}

impl ServerProtocolConfig {
    /// Endpoint at `path`, matched exactly.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            subprotocols: None,
            check_starts_with: false,
            secure: false,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            handle_close_frames: true,
            force_close_timeout: None,
            max_frame_payload: FrameCodec::DEFAULT_MAX_PAYLOAD_SIZE,
            drop_pong_frames: false,
        }
    }

    /// Comma-separated subprotocols; `*` accepts any.
    #[must_use]
    pub fn subprotocols(mut self, subprotocols: impl Into<String>) -> Self {
        self.subprotocols = Some(subprotocols.into());
        self
    }

    /// Match any request whose URI starts with the path.
    #[must_use]
    pub fn check_starts_with(mut self, enabled: bool) -> Self {
        self.check_starts_with = enabled;
        self
    }

    /// Advertise `wss://` locations even on connections not marked secure.
    #[must_use]
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// How long an admitted handshake may take; zero disables the timeout.
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Answer close frames automatically instead of delivering them.
    #[must_use]
    pub fn handle_close_frames(mut self, enabled: bool) -> Self {
        self.handle_close_frames = enabled;
        self
    }

    /// Grace period for the peer to answer a close frame we sent.
    #[must_use]
    pub fn force_close_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.force_close_timeout = timeout;
        self
    }

    /// Largest frame payload accepted.
    #[must_use]
    pub fn max_frame_payload(mut self, size: usize) -> Self {
        self.max_frame_payload = size;
        self
    }

    /// Swallow pong frames instead of delivering them.
    #[must_use]
    pub fn drop_pong_frames(mut self, enabled: bool) -> Self {
        self.drop_pong_frames = enabled;
        self
    }

    /// The endpoint path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    fn matches(&self, request: &FullHttpRequest) -> bool {
        if self.check_starts_with {
            request.uri.starts_with(&self.path)
        } else {
            request.uri == self.path
        }
    }
}

/// Installs the server handshake on a connection.
///
/// One instance serves one connection; [`Self::handshake_future`] reports
/// that connection's outcome.
#[derive(Debug)]
pub struct WebSocketServerProtocol {
    config: Arc<ServerProtocolConfig>,
    handshake: Promise,
}

impl WebSocketServerProtocol {
    /// Creates the protocol for `config`.
    #[must_use]
    pub fn new(config: ServerProtocolConfig) -> Self {
        Self {
            config: Arc::new(config),
            handshake: Promise::new(),
        }
    }

    /// Completes once an admitted handshake succeeded or failed. Requests
    /// that are rejected before admission leave it pending.
    #[must_use]
    pub fn handshake_future(&self) -> Promise {
        self.handshake.clone()
    }

    /// Appends the HTTP codec and the handshake stage.
    ///
    /// # Errors
    ///
    /// Fails if a stage with one of the names is already installed.
    pub fn install(&self, conn: &mut LabConnection) -> Result<(), PipelineError> {
        conn.add_last(stage_names::HTTP_DECODER, RequestDecoder::new().into_stage())?;
        conn.add_last(stage_names::HTTP_ENCODER, ResponseEncoder.into_stage())?;
        conn.add_last(
            stage_names::HANDSHAKE,
            ServerHandshakeStage {
                config: self.config.clone(),
                promise: self.handshake.clone(),
            },
        )?;
        Ok(())
    }
}

/// Writes `response`, closing the connection afterwards unless it is a
/// `200 OK` to a keep-alive request.
fn send_http_response(ctx: &mut Context<'_>, keep_alive: bool, response: FullHttpResponse) -> Promise {
    let close = !keep_alive || response.status != StatusCode::OK;
    let written = ctx.write_and_flush(response);
    if close {
        ctx.on_complete(&written, |ctx, _| {
            ctx.close();
        });
    }
    written
}

/// Inbound stage that admits upgrade requests for the configured path.
struct ServerHandshakeStage {
    config: Arc<ServerProtocolConfig>,
    promise: Promise,
}

impl ServerHandshakeStage {
    fn websocket_location(&self, ctx: &Context<'_>, request: &FullHttpRequest) -> String {
        let scheme = if self.config.secure || ctx.is_secure() {
            "wss"
        } else {
            "ws"
        };
        let host = request.header(HOST).unwrap_or_default();
        format!("{scheme}://{host}{}", self.config.path)
    }

    fn fail(&self, ctx: &mut Context<'_>, err: impl Into<Error>) {
        let err = err.into();
        self.promise.try_failure(err.clone());
        ctx.fire_error(err);
    }
}

impl Stage for ServerHandshakeStage {
    fn on_read(&mut self, ctx: &mut Context<'_>, msg: Message) {
        let request = match msg {
            Message::Request(request) if self.config.matches(&request) => request,
            other => {
                ctx.fire_read(other);
                return;
            }
        };

        if request.method != Method::GET {
            debug!(
                conn = %ctx.connection_id(),
                method = %request.method,
                uri = %request.uri,
                "rejecting non-GET upgrade request"
            );
            send_http_response(
                ctx,
                request.is_keep_alive(),
                FullHttpResponse::new(StatusCode::FORBIDDEN),
            );
            return;
        }

        let factory = ServerHandshakerFactory::new(
            self.websocket_location(ctx, &request),
            self.config.subprotocols.as_deref(),
        )
        .max_frame_payload(self.config.max_frame_payload)
        .force_close_timeout(self.config.force_close_timeout);
        let Some(handshaker) = factory.new_handshaker(&request) else {
            debug!(
                conn = %ctx.connection_id(),
                version = ?request.header(http::header::SEC_WEBSOCKET_VERSION),
                "unsupported websocket version"
            );
            ServerHandshakerFactory::send_unsupported_version_response(ctx);
            return;
        };

        // The handshaker must be reachable before any frame stage exists.
        ctx.insert_attr(handshaker.clone());
        if let Err(err) = ctx.replace_self(stage_names::FORBIDDEN, ForbiddenResponder) {
            self.fail(ctx, err);
            return;
        }
        debug!(
            conn = %ctx.connection_id(),
            url = %handshaker.websocket_url(),
            "websocket upgrade admitted"
        );

        let written = handshaker.handshake(ctx, &request);
        let promise = self.promise.clone();
        let config = self.config.clone();
        let keep_alive = request.is_keep_alive();
        let uri = request.uri.clone();
        let headers = request.headers.clone();
        ctx.on_complete(&written, move |ctx, outcome| {
            complete_handshake(ctx, &promise, &config, &handshaker, outcome, keep_alive, uri, headers);
        });

        timeout::arm(
            ctx,
            &self.promise,
            self.config.handshake_timeout,
            UserEvent::ServerHandshake(ServerHandshakeStateEvent::HandshakeTimeout),
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn complete_handshake(
    ctx: &mut Context<'_>,
    promise: &Promise,
    config: &ServerProtocolConfig,
    handshaker: &ServerHandshaker,
    outcome: Result<(), Error>,
    keep_alive: bool,
    uri: String,
    headers: http::HeaderMap,
) {
    match outcome {
        Ok(()) => {
            if promise.is_done() {
                debug!(conn = %ctx.connection_id(), "upgrade response written after handshake ended");
                return;
            }
            let stage = FrameProtocolStage::new(
                handshaker.close_tracker().clone(),
                config.handle_close_frames,
                config.drop_pong_frames,
            );
            if let Err(err) = ctx.replace(stage_names::FORBIDDEN, stage_names::PROTOCOL, stage) {
                let err = Error::from(err);
                promise.try_failure(err.clone());
                ctx.fire_error(err);
                return;
            }
            promise.try_success(());
            debug!(
                conn = %ctx.connection_id(),
                uri = %uri,
                subprotocol = ?handshaker.selected_subprotocol(),
                "websocket handshake complete"
            );
            ctx.fire_user_event(UserEvent::ServerHandshake(
                ServerHandshakeStateEvent::HandshakeComplete,
            ));
            ctx.fire_user_event(UserEvent::ServerHandshakeComplete(HandshakeComplete::new(
                uri,
                headers,
                handshaker.selected_subprotocol(),
            )));
        }
        Err(err) => {
            warn!(conn = %ctx.connection_id(), error = %err, "websocket handshake failed");
            promise.try_failure(err.clone());
            let bad_request = matches!(&err, Error::Handshake(e) if e.is_bad_request());
            ctx.fire_error(err);
            if bad_request && ctx.is_active() {
                send_http_response(ctx, keep_alive, FullHttpResponse::new(StatusCode::BAD_REQUEST));
            }
        }
    }
}

/// Placeholder left where the handshake stage was: answers any further
/// HTTP request with `403 Forbidden` and passes everything else on.
#[derive(Debug, Default)]
pub struct ForbiddenResponder;

impl Stage for ForbiddenResponder {
    fn on_read(&mut self, ctx: &mut Context<'_>, msg: Message) {
        match msg {
            Message::Request(request) => {
                debug!(conn = %ctx.connection_id(), uri = %request.uri, "request after upgrade, forbidden");
                send_http_response(
                    ctx,
                    request.is_keep_alive(),
                    FullHttpResponse::new(StatusCode::FORBIDDEN),
                );
            }
            other => ctx.fire_read(other),
        }
    }
}
