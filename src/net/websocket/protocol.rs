//! Control-frame handling once a connection speaks WebSocket.

use crate::error::Error;
use crate::net::websocket::{CloseTracker, Frame, Opcode, PeerCloseAction};
use crate::pipeline::{Context, Message, Stage};
use crate::tracing_compat::{debug, trace};
use std::fmt;

/// Answers pings, optionally swallows pongs, and runs the closing handshake.
///
/// Data frames pass through unchanged. With `handle_close_frames` set, a
/// peer's close frame is answered (or completes a close this side started)
/// and never reaches later stages; without it, close frames are delivered
/// like any other frame, and a peer's answer to our close also closes the
/// transport.
pub struct FrameProtocolStage {
    tracker: CloseTracker,
    handle_close_frames: bool,
    drop_pong_frames: bool,
}

impl FrameProtocolStage {
    /// Creates the stage around the connection's close tracker.
    #[must_use]
    pub fn new(tracker: CloseTracker, handle_close_frames: bool, drop_pong_frames: bool) -> Self {
        Self {
            tracker,
            handle_close_frames,
            drop_pong_frames,
        }
    }

    fn on_close_frame(&self, ctx: &mut Context<'_>, frame: Frame) {
        match self.tracker.on_peer_close(&frame, self.handle_close_frames) {
            PeerCloseAction::Respond => {
                debug!(
                    conn = %ctx.connection_id(),
                    code = ?frame.close_code(),
                    "peer started close, echoing"
                );
                let echoed = ctx.write_and_flush(Frame::close(frame.close_code(), None));
                ctx.on_complete(&echoed, |ctx, _| {
                    ctx.close();
                });
            }
            PeerCloseAction::Complete => {
                debug!(conn = %ctx.connection_id(), "close handshake complete");
                ctx.flush();
                ctx.close();
            }
            PeerCloseAction::Deliver => ctx.fire_read(frame),
            PeerCloseAction::DeliverAndClose => {
                debug!(
                    conn = %ctx.connection_id(),
                    "close handshake complete, delivering peer close"
                );
                ctx.fire_read(frame);
                ctx.flush();
                ctx.close();
            }
            PeerCloseAction::Ignore => {
                trace!(conn = %ctx.connection_id(), "ignoring close frame after close");
            }
        }
    }
}

impl Stage for FrameProtocolStage {
    fn on_read(&mut self, ctx: &mut Context<'_>, msg: Message) {
        let frame = match msg {
            Message::Frame(frame) => frame,
            other => {
                ctx.fire_read(other);
                return;
            }
        };
        match frame.opcode {
            Opcode::Ping => {
                ctx.write_and_flush(Frame::pong(frame.payload));
            }
            Opcode::Pong if self.drop_pong_frames => {
                trace!(conn = %ctx.connection_id(), "dropping pong");
            }
            Opcode::Close => self.on_close_frame(ctx, frame),
            _ => ctx.fire_read(frame),
        }
    }

    fn on_error(&mut self, ctx: &mut Context<'_>, error: Error) {
        if let Error::Frame(err) = &error {
            if self.tracker.state().is_open() && ctx.is_active() {
                debug!(conn = %ctx.connection_id(), error = %err, "protocol violation, sending close");
                ctx.write_and_flush(Frame::close(Some(err.close_code().into()), None));
            }
        }
        ctx.fire_error(error);
    }
}

impl fmt::Debug for FrameProtocolStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameProtocolStage")
            .field("close", &self.tracker)
            .field("handle_close_frames", &self.handle_close_frames)
            .field("drop_pong_frames", &self.drop_pong_frames)
            .finish()
    }
}
