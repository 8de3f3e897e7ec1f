//! Pipeline stages for the WebSocket frame codec.
//!
//! These replace the HTTP codec stages once a handshake succeeds.

use crate::codec::{DecoderStage, Encoder};
use crate::net::websocket::{CloseTracker, Frame, FrameCodec, Role};
use crate::pipeline::{Context, Message, Stage};
use crate::promise::Promise;
use crate::tracing_compat::warn;
use bytes::BytesMut;
use std::fmt;

/// Inbound frame decoder for `role`, accepting payloads up to `max_payload` bytes.
#[must_use]
pub fn frame_decoder(role: Role, max_payload: usize) -> DecoderStage<FrameCodec> {
    DecoderStage::new("ws-decoder", FrameCodec::new(role).max_payload_size(max_payload))
}

/// Outbound frame encoder that reports sent close frames to the
/// connection's [`CloseTracker`].
pub struct WsFrameEncoder {
    codec: FrameCodec,
    tracker: CloseTracker,
}

impl WsFrameEncoder {
    /// Encodes with `codec`; close frames are recorded in `tracker`.
    #[must_use]
    pub fn new(codec: FrameCodec, tracker: CloseTracker) -> Self {
        Self { codec, tracker }
    }
}

impl Stage for WsFrameEncoder {
    fn handles_inbound(&self) -> bool {
        false
    }

    fn handles_outbound(&self) -> bool {
        true
    }

    fn on_write(&mut self, ctx: &mut Context<'_>, msg: Message, promise: Promise) {
        let frame = match msg {
            Message::Frame(frame) => frame,
            other => {
                ctx.forward_write(other, promise);
                return;
            }
        };
        let is_close = frame.is_close();
        let mut dst = BytesMut::new();
        match self.codec.encode(frame, &mut dst) {
            Ok(()) => {
                if is_close {
                    self.tracker.on_local_close(ctx, &promise);
                }
                ctx.forward_write(Message::Bytes(dst.freeze()), promise);
            }
            Err(err) => {
                warn!(conn = %ctx.connection_id(), error = %err, "frame encode failed");
                promise.try_failure(err);
            }
        }
    }
}

impl fmt::Debug for WsFrameEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsFrameEncoder")
            .field("role", &self.codec.role())
            .field("close", &self.tracker)
            .finish()
    }
}
