//! Client side of the upgrade: sends the request when the connection
//! becomes active and switches to the frame codec on a valid response.
//!
//! # Example
//!
//! ```
//! use wsgate::net::websocket::{ClientProtocolConfig, WebSocketClientProtocol};
//! use wsgate::pipeline::LabConnection;
//!
//! let config = ClientProtocolConfig::new("ws://localhost:1234/test")
//!     .unwrap()
//!     .subprotocol("test-proto-2");
//! let protocol = WebSocketClientProtocol::new(config);
//!
//! let mut conn = LabConnection::new();
//! protocol.install(&mut conn).unwrap();
//! conn.activate();
//! assert!(conn.read_outbound().is_some());
//! assert!(!protocol.handshake_future().is_done());
//! ```

use crate::error::Error;
use crate::http::{RequestEncoder, ResponseDecoder};
use crate::net::websocket::event::ClientHandshakeComplete;
use crate::net::websocket::protocol::FrameProtocolStage;
use crate::net::websocket::{
    stage_names, timeout, ClientHandshakeStateEvent, ClientHandshaker, FrameCodec,
    HandshakeError, WsUrl, DEFAULT_HANDSHAKE_TIMEOUT,
};
use crate::pipeline::{Context, LabConnection, Message, PipelineError, Stage, UserEvent};
use crate::promise::Promise;
use crate::tracing_compat::{debug, warn};
use http::{HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use std::time::Duration;

/// Default grace period for the server to answer our close frame.
pub const DEFAULT_FORCE_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client connection configuration.
#[derive(Debug, Clone)]
pub struct ClientProtocolConfig {
    pub(crate) url: WsUrl,
    pub(crate) subprotocol: Option<String>,
    pub(crate) custom_headers: HeaderMap,
    pub(crate) handshake_timeout: Duration,
    pub(crate) handle_close_frames: bool,
    pub(crate) force_close_timeout: Option<Duration>,
    pub(crate) close_on_handshake_failure: bool,
    pub(crate) max_frame_payload: usize,
    pub(crate) drop_pong_frames: bool,
    pub(crate) generate_origin_header: bool,
}

impl ClientProtocolConfig {
    /// Configuration for connecting to `url` (`ws://` or `wss://`).
    ///
    /// # Errors
    ///
    /// Returns `HandshakeError::InvalidUrl` if the URL cannot be parsed.
    pub fn new(url: &str) -> Result<Self, HandshakeError> {
        Ok(Self {
            url: WsUrl::parse(url)?,
            subprotocol: None,
            custom_headers: HeaderMap::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            handle_close_frames: true,
            force_close_timeout: Some(DEFAULT_FORCE_CLOSE_TIMEOUT),
            close_on_handshake_failure: true,
            max_frame_payload: FrameCodec::DEFAULT_MAX_PAYLOAD_SIZE,
            drop_pong_frames: true,
            generate_origin_header: true,
        })
    }

    /// Subprotocols to request, comma-separated.
    #[must_use]
    pub fn subprotocol(mut self, subprotocol: impl Into<String>) -> Self {
        self.subprotocol = Some(subprotocol.into());
        self
    }

    /// Extra header sent with the upgrade request.
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.custom_headers.append(name, value);
        self
    }

    /// How long to wait for the upgrade response; zero waits forever.
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

    /// Grace period for the server to answer our close frame; `None` waits
    /// forever.
    #[must_use]
    pub fn force_close_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.force_close_timeout = timeout;
        self
    }

    /// Close the connection when the upgrade response is rejected.
    #[must_use]
    pub fn close_on_handshake_failure(mut self, enabled: bool) -> Self {
        self.close_on_handshake_failure = enabled;
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

    /// Send an `Origin` header derived from the URL unless one is set.
    #[must_use]
    pub fn generate_origin_header(mut self, enabled: bool) -> Self {
        self.generate_origin_header = enabled;
        self
    }

    /// The server URL.
    #[must_use]
    pub fn url(&self) -> &WsUrl {
        &self.url
    }
}

/// Installs the client handshake on a connection.
///
/// One instance serves one connection.
#[derive(Debug)]
pub struct WebSocketClientProtocol {
    config: Arc<ClientProtocolConfig>,
    handshaker: ClientHandshaker,
    handshake: Promise,
}

impl WebSocketClientProtocol {
    /// Creates the protocol for `config`.
    #[must_use]
    pub fn new(config: ClientProtocolConfig) -> Self {
        let handshaker = ClientHandshaker::from_config(&config);
        Self {
            config: Arc::new(config),
            handshaker,
            handshake: Promise::new(),
        }
    }

    /// The connection's handshaker, also stored as a connection attribute.
    #[must_use]
    pub fn handshaker(&self) -> &ClientHandshaker {
        &self.handshaker
    }

    /// Completes when a valid response arrived, or fails on rejection,
    /// timeout, or a close before the response.
    #[must_use]
    pub fn handshake_future(&self) -> Promise {
        self.handshake.clone()
    }

    /// Appends the HTTP codec and the handshake stage. The request goes out
    /// as soon as the connection is active.
    ///
    /// # Errors
    ///
    /// Fails if a stage with one of the names is already installed.
    pub fn install(&self, conn: &mut LabConnection) -> Result<(), PipelineError> {
        conn.add_last(stage_names::HTTP_DECODER, ResponseDecoder::new().into_stage())?;
        conn.add_last(stage_names::HTTP_ENCODER, RequestEncoder.into_stage())?;
        conn.add_last(
            stage_names::HANDSHAKE,
            ClientHandshakeStage {
                config: self.config.clone(),
                handshaker: self.handshaker.clone(),
                promise: self.handshake.clone(),
                issued: false,
            },
        )?;
        Ok(())
    }
}

struct ClientHandshakeStage {
    config: Arc<ClientProtocolConfig>,
    handshaker: ClientHandshaker,
    promise: Promise,
    issued: bool,
}

impl ClientHandshakeStage {
    fn issue(&mut self, ctx: &mut Context<'_>) {
        if self.issued {
            return;
        }
        self.issued = true;

        let written = self.handshaker.handshake(ctx);
        let promise = self.promise.clone();
        ctx.on_complete(&written, move |ctx, outcome| match outcome {
            Ok(()) => ctx.fire_user_event(UserEvent::ClientHandshake(
                ClientHandshakeStateEvent::HandshakeIssued,
            )),
            Err(err) => {
                warn!(conn = %ctx.connection_id(), error = %err, "upgrade request write failed");
                if promise.try_failure(err.clone()) {
                    ctx.fire_error(err);
                }
            }
        });

        timeout::arm(
            ctx,
            &self.promise,
            self.config.handshake_timeout,
            UserEvent::ClientHandshake(ClientHandshakeStateEvent::HandshakeTimeout),
        );
    }

    fn fail(&self, ctx: &mut Context<'_>, err: Error) {
        warn!(conn = %ctx.connection_id(), error = %err, "websocket handshake rejected");
        self.promise.try_failure(err.clone());
        ctx.fire_error(err);
        if self.config.close_on_handshake_failure {
            ctx.close();
        }
    }
}

impl Stage for ClientHandshakeStage {
    fn on_added(&mut self, ctx: &mut Context<'_>) {
        ctx.insert_attr(self.handshaker.clone());
        if ctx.is_active() {
            self.issue(ctx);
        }
    }

    fn on_active(&mut self, ctx: &mut Context<'_>) {
        self.issue(ctx);
        ctx.fire_active();
    }

    fn on_inactive(&mut self, ctx: &mut Context<'_>) {
        if self.promise.try_failure(HandshakeError::ConnectionClosed) {
            debug!(conn = %ctx.connection_id(), "connection closed during handshake");
        }
        ctx.fire_inactive();
    }

    fn on_read(&mut self, ctx: &mut Context<'_>, msg: Message) {
        let response = match msg {
            Message::Response(response) => response,
            other => {
                ctx.fire_read(other);
                return;
            }
        };
        if self.promise.is_done() {
            debug!(
                conn = %ctx.connection_id(),
                status = response.status.as_u16(),
                "dropping upgrade response after handshake ended"
            );
            return;
        }

        if let Err(err) = self.handshaker.finish_handshake(ctx, &response) {
            self.fail(ctx, err);
            return;
        }
        let stage = FrameProtocolStage::new(
            self.handshaker.close_tracker().clone(),
            self.config.handle_close_frames,
            self.config.drop_pong_frames,
        );
        if let Err(err) = ctx.replace_self(stage_names::PROTOCOL, stage) {
            self.fail(ctx, err.into());
            return;
        }
        if !self.promise.try_success(()) {
            return;
        }
        let selected = self.handshaker.actual_subprotocol();
        debug!(
            conn = %ctx.connection_id(),
            subprotocol = ?selected,
            "websocket handshake complete"
        );
        ctx.fire_user_event(UserEvent::ClientHandshake(
            ClientHandshakeStateEvent::HandshakeComplete,
        ));
        ctx.fire_user_event(UserEvent::ClientHandshakeComplete(
            ClientHandshakeComplete::new(selected, response.headers),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Decoder, Encoder};
    use crate::http::{FullHttpRequest, FullHttpResponse, RequestDecoder, ResponseEncoder};
    use crate::net::websocket::{compute_accept_key, Frame, Opcode};
    use crate::test_utils::{client_connection, init_test_logging};
    use bytes::BytesMut;
    use http::header::{
        CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, UPGRADE,
    };
    use http::StatusCode;

    struct App;
    impl Stage for App {}

    fn config() -> ClientProtocolConfig {
        ClientProtocolConfig::new("ws://localhost:1234/test").unwrap()
    }

    fn sent_request(conn: &mut LabConnection) -> FullHttpRequest {
        let mut buf = BytesMut::new();
        for chunk in conn.drain_outbound() {
            buf.extend_from_slice(&chunk);
        }
        RequestDecoder::new().decode(&mut buf).unwrap().unwrap()
    }

    fn encode(response: FullHttpResponse) -> BytesMut {
        let mut buf = BytesMut::new();
        ResponseEncoder.encode(response, &mut buf).unwrap();
        buf
    }

    fn accepting(request: &FullHttpRequest) -> FullHttpResponse {
        let key = request.header(SEC_WEBSOCKET_KEY).unwrap();
        FullHttpResponse::new(StatusCode::SWITCHING_PROTOCOLS)
            .with_header(UPGRADE, HeaderValue::from_static("websocket"))
            .with_header(CONNECTION, HeaderValue::from_static("Upgrade"))
            .with_header(
                SEC_WEBSOCKET_ACCEPT,
                HeaderValue::from_str(&compute_accept_key(key)).unwrap(),
            )
    }

    #[test]
    fn request_issued_on_activation() {
        init_test_logging();
        let protocol = WebSocketClientProtocol::new(config());
        let mut conn = LabConnection::new();
        protocol.install(&mut conn).unwrap();
        conn.add_last("app", App).unwrap();
        assert!(conn.read_outbound().is_none());

        conn.activate();
        let request = sent_request(&mut conn);
        assert_eq!(request.uri, "/test");
        assert_eq!(request.header("origin"), Some("http://localhost:1234"));
        assert!(matches!(
            conn.user_events(),
            [UserEvent::ClientHandshake(ClientHandshakeStateEvent::HandshakeIssued)]
        ));
        assert!(!protocol.handshake_future().is_done());
        assert_eq!(conn.executor().armed_timers(), 1);
        assert!(conn.attr::<ClientHandshaker>().is_some());
    }

    #[test]
    fn request_issued_when_installed_on_active_connection() {
        init_test_logging();
        let protocol = WebSocketClientProtocol::new(config());
        let mut conn = LabConnection::new();
        conn.activate();
        protocol.install(&mut conn).unwrap();
        assert_eq!(sent_request(&mut conn).uri, "/test");
    }

    #[test]
    fn valid_response_completes_handshake() {
        init_test_logging();
        let protocol = WebSocketClientProtocol::new(config().subprotocol("test-proto-2"));
        let mut conn = LabConnection::new();
        protocol.install(&mut conn).unwrap();
        conn.add_last("app", App).unwrap();
        conn.activate();
        let request = sent_request(&mut conn);
        conn.take_user_events();

        let response = accepting(&request)
            .with_header(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("test-proto-2"));
        let mut bytes = encode(response);
        FrameCodec::server()
            .encode(Frame::text("hello"), &mut bytes)
            .unwrap();
        assert!(conn.write_inbound(bytes.freeze()));

        assert!(protocol.handshake_future().is_success());
        assert!(protocol.handshaker().is_handshake_complete());
        assert_eq!(
            protocol.handshaker().actual_subprotocol().as_deref(),
            Some("test-proto-2")
        );
        assert_eq!(
            conn.pipeline_names(),
            ["ws-decoder", "ws-encoder", "ws-protocol", "app"]
        );
        match conn.user_events() {
            [UserEvent::ClientHandshake(ClientHandshakeStateEvent::HandshakeComplete), UserEvent::ClientHandshakeComplete(done)] =>
            {
                assert_eq!(done.selected_subprotocol(), Some("test-proto-2"));
                assert!(done.response_headers().contains_key(SEC_WEBSOCKET_ACCEPT));
            }
            other => panic!("unexpected events: {other:?}"),
        }
        let frame = conn.read_inbound().and_then(|m| m.as_frame().cloned()).unwrap();
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(conn.executor().armed_timers(), 0);
    }

    #[test]
    fn rejected_response_fails_and_closes() {
        init_test_logging();
        let protocol = WebSocketClientProtocol::new(config());
        let mut conn = LabConnection::new();
        protocol.install(&mut conn).unwrap();
        conn.add_last("app", App).unwrap();
        conn.activate();
        sent_request(&mut conn);

        conn.write_inbound(encode(FullHttpResponse::new(StatusCode::NOT_FOUND)).freeze());

        let cause = protocol.handshake_future().cause().unwrap();
        assert!(matches!(
            cause,
            Error::Handshake(HandshakeError::NotSwitchingProtocols(404))
        ));
        assert_eq!(cause.to_string(), "expected 101 Switching Protocols, got 404");
        assert_eq!(conn.errors().len(), 1);
        assert!(!conn.is_active());
        assert_eq!(conn.executor().armed_timers(), 0);
    }

    #[test]
    fn rejected_response_keeps_connection_when_configured() {
        init_test_logging();
        let protocol = WebSocketClientProtocol::new(config().close_on_handshake_failure(false));
        let mut conn = LabConnection::new();
        protocol.install(&mut conn).unwrap();
        conn.activate();
        let request = sent_request(&mut conn);

        let mut wrong = accepting(&request);
        wrong
            .headers
            .insert(SEC_WEBSOCKET_ACCEPT, HeaderValue::from_static("bogus"));
        conn.write_inbound(encode(wrong).freeze());

        assert!(matches!(
            protocol.handshake_future().cause(),
            Some(Error::Handshake(HandshakeError::InvalidAccept { .. }))
        ));
        assert!(conn.is_active());
        assert_eq!(conn.pipeline_names()[2], "ws-handshake");

        // A second response after the failure is ignored.
        assert!(!conn.write_inbound(encode(accepting(&request)).freeze()));
        assert!(!protocol.handshake_future().is_success());
    }

    #[test]
    fn no_response_times_out() {
        init_test_logging();
        let protocol =
            WebSocketClientProtocol::new(config().handshake_timeout(Duration::from_millis(100)));
        let mut conn = LabConnection::new();
        protocol.install(&mut conn).unwrap();
        conn.add_last("app", App).unwrap();
        conn.activate();
        conn.take_user_events();

        conn.advance_time_by(Duration::from_millis(100));
        assert!(protocol
            .handshake_future()
            .cause()
            .is_some_and(|e| e.is_handshake_timeout()));
        assert!(matches!(
            conn.user_events(),
            [UserEvent::ClientHandshake(ClientHandshakeStateEvent::HandshakeTimeout)]
        ));
        assert!(!conn.is_active());
    }

    #[test]
    fn close_before_response_fails_promise() {
        init_test_logging();
        let protocol = WebSocketClientProtocol::new(config());
        let mut conn = LabConnection::new();
        protocol.install(&mut conn).unwrap();
        conn.activate();
        conn.close();

        assert!(matches!(
            protocol.handshake_future().cause(),
            Some(Error::Handshake(HandshakeError::ConnectionClosed))
        ));
        assert_eq!(conn.executor().armed_timers(), 0);
    }

    #[test]
    fn other_messages_pass_through() {
        init_test_logging();
        let mut conn = client_connection(config(), App);
        assert!(conn.write_inbound_message(Message::Frame(Frame::text("x"))));
        assert!(conn.read_inbound().and_then(|m| m.as_frame().cloned()).is_some());
        assert_eq!(conn.pipeline_names()[2], "ws-handshake");
    }
}
