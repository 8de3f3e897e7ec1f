//! WebSocket upgrade over a connection pipeline (RFC 6455).
//!
//! A connection starts out speaking HTTP/1.1. The handshake stage installed
//! by [`WebSocketServerProtocol`] or [`WebSocketClientProtocol`] performs the
//! opening handshake, swaps the HTTP codec for the frame codec, and leaves a
//! [`FrameProtocolStage`] behind that answers pings and drives the closing
//! handshake.
//!
//! # Architecture
//!
//! - `frame`: wire format encoding/decoding (RFC 6455 Section 5)
//! - `handshake`: HTTP upgrade negotiation (RFC 6455 Section 4)
//! - `close`: close handshake protocol and force-close timer (Section 7)
//! - `codec`: frame codec pipeline stages
//! - `protocol`: control-frame handling after the upgrade
//! - `server` / `client`: the handshake stages and their configuration
//! - `event`: user events fired on completion and timeout
//!
//! Every outcome of an admitted handshake is reported twice: through the
//! protocol's handshake promise and as a user event or error event.

mod client;
mod close;
mod codec;
mod event;
mod frame;
mod handshake;
mod protocol;
mod server;
pub(crate) mod timeout;

pub use client::{ClientProtocolConfig, WebSocketClientProtocol, DEFAULT_FORCE_CLOSE_TIMEOUT};
pub use close::{
    CloseCode, CloseHandshake, CloseReason, CloseState, CloseTracker, PeerCloseAction,
};
pub use codec::{frame_decoder, WsFrameEncoder};
pub use event::{
    ClientHandshakeComplete, ClientHandshakeStateEvent, HandshakeComplete,
    ServerHandshakeStateEvent,
};
pub use frame::{apply_mask, Frame, FrameCodec, Opcode, Role, WsError, MAX_CONTROL_PAYLOAD};
pub use handshake::{
    compute_accept_key, select_subprotocol, ClientHandshaker, HandshakeError, ServerHandshaker,
    ServerHandshakerFactory, WsUrl, SUBPROTOCOL_WILDCARD, WEBSOCKET_VERSION,
};
pub use protocol::FrameProtocolStage;
pub use server::{
    ForbiddenResponder, ServerProtocolConfig, WebSocketServerProtocol, DEFAULT_HANDSHAKE_TIMEOUT,
};

/// Names of the stages installed and swapped during an upgrade.
pub mod stage_names {
    /// HTTP decoder, replaced by [`WS_DECODER`].
    pub const HTTP_DECODER: &str = "http-decoder";
    /// HTTP encoder, replaced by [`WS_ENCODER`].
    pub const HTTP_ENCODER: &str = "http-encoder";
    /// Frame decoder.
    pub const WS_DECODER: &str = "ws-decoder";
    /// Frame encoder.
    pub const WS_ENCODER: &str = "ws-encoder";
    /// Server or client handshake stage.
    pub const HANDSHAKE: &str = "ws-handshake";
    /// Placeholder holding the handshake's position while the 101 is written.
    pub const FORBIDDEN: &str = "ws-403-responder";
    /// Control-frame handling after the upgrade.
    pub const PROTOCOL: &str = "ws-protocol";
}
