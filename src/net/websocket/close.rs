//! WebSocket close handshake (RFC 6455 Section 7) and its forced-close escalation.
//!
//! The close handshake ensures clean connection termination:
//!
//! 1. Initiator sends a Close frame with an optional status code and reason
//! 2. Receiver echoes a Close frame back
//! 3. The transport is closed
//!
//! When the peer never answers, the initiator closes the transport itself once
//! the force-close timeout elapses.
//!
//! ```text
//!            local close          peer close
//!   Open ─────────────────► CloseSent ─────────► CloseExchanged
//!     │                        │
//!     │ peer close             │ timeout, still active
//!     ▼                        ▼
//!   CloseReceived ──────►  ForceClosed
//!         local close ─► CloseExchanged
//! ```
//!
//! Transitions are monotonic; nothing leads back to `Open`, and `ForceClosed`
//! is terminal.

use crate::net::websocket::{Frame, WsError};
use crate::pipeline::{Context, TimerHandle};
use crate::promise::Promise;
use crate::tracing_compat::{debug, trace};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// WebSocket close status codes (RFC 6455 Section 7.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    /// Normal closure (1000).
    Normal = 1000,
    /// Going away (1001).
    GoingAway = 1001,
    /// Protocol error (1002).
    ProtocolError = 1002,
    /// Unsupported data type (1003).
    Unsupported = 1003,
    /// Reserved (1004).
    Reserved = 1004,
    /// No status received (1005) - must not be sent in a frame.
    NoStatusReceived = 1005,
    /// Abnormal closure (1006) - must not be sent in a frame.
    Abnormal = 1006,
    /// Invalid payload data (1007).
    InvalidPayload = 1007,
    /// Policy violation (1008).
    PolicyViolation = 1008,
    /// Message too big (1009).
    MessageTooBig = 1009,
    /// Mandatory extension missing (1010).
    MandatoryExtension = 1010,
    /// Internal server error (1011).
    InternalError = 1011,
    /// TLS handshake failure (1015) - must not be sent in a frame.
    TlsHandshake = 1015,
}

impl CloseCode {
    /// Maps a registered code value to its variant.
    ///
    /// Returns `None` for reserved, private-use and invalid values.
    #[must_use]
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1000 => Some(Self::Normal),
            1001 => Some(Self::GoingAway),
            1002 => Some(Self::ProtocolError),
            1003 => Some(Self::Unsupported),
            1004 => Some(Self::Reserved),
            1005 => Some(Self::NoStatusReceived),
            1006 => Some(Self::Abnormal),
            1007 => Some(Self::InvalidPayload),
            1008 => Some(Self::PolicyViolation),
            1009 => Some(Self::MessageTooBig),
            1010 => Some(Self::MandatoryExtension),
            1011 => Some(Self::InternalError),
            1015 => Some(Self::TlsHandshake),
            _ => None,
        }
    }

    /// Check if a raw code value may appear in a close frame.
    ///
    /// Valid ranges per RFC 6455:
    /// - 1000-1003, 1007-1011: Standard codes
    /// - 3000-3999: Registered (IANA)
    /// - 4000-4999: Private use
    #[must_use]
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }

    /// Returns true if this code can be sent in a close frame.
    #[must_use]
    pub const fn is_sendable(self) -> bool {
        !matches!(
            self,
            Self::NoStatusReceived | Self::Abnormal | Self::TlsHandshake | Self::Reserved
        )
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code as Self
    }
}

/// Parsed close frame payload.
///
/// A close frame may carry nothing, a status code, or a status code followed
/// by UTF-8 reason text. Unregistered but valid codes (3000-4999) are kept as
/// raw values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code (if present).
    pub code: Option<u16>,
    /// Close reason text (if present).
    pub text: Option<String>,
}

impl CloseReason {
    /// Create a close reason.
    #[must_use]
    pub fn new(code: CloseCode, text: Option<&str>) -> Self {
        Self {
            code: Some(code.into()),
            text: text.map(String::from),
        }
    }

    /// Normal closure without text.
    #[must_use]
    pub fn normal() -> Self {
        Self::new(CloseCode::Normal, None)
    }

    /// Parse a close frame payload.
    ///
    /// # Errors
    ///
    /// Returns `WsError::InvalidClosePayload` for a one-byte payload or a
    /// code outside the sendable ranges, and `WsError::InvalidUtf8` for
    /// malformed reason text.
    pub fn parse(payload: &[u8]) -> Result<Self, WsError> {
        match payload {
            [] => Ok(Self::default()),
            [_] => Err(WsError::InvalidClosePayload),
            [hi, lo, rest @ ..] => {
                let code = u16::from_be_bytes([*hi, *lo]);
                if !CloseCode::is_valid_code(code) {
                    return Err(WsError::InvalidClosePayload);
                }
                let text = if rest.is_empty() {
                    None
                } else {
                    let text = std::str::from_utf8(rest).map_err(|_| WsError::InvalidUtf8)?;
                    Some(text.to_string())
                };
                Ok(Self {
                    code: Some(code),
                    text,
                })
            }
        }
    }

    /// The registered code, if the carried code is one.
    #[must_use]
    pub fn close_code(&self) -> Option<CloseCode> {
        self.code.and_then(CloseCode::from_u16)
    }

    /// Convert to a close frame.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        Frame::close(self.code, self.text.as_deref())
    }

    /// Check if this represents a normal closure.
    #[must_use]
    pub fn is_normal(&self) -> bool {
        self.close_code() == Some(CloseCode::Normal)
    }
}

/// State of the close handshake on one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CloseState {
    /// Connection is open (normal operation).
    #[default]
    Open,
    /// We sent a close frame and wait for the peer's.
    CloseSent,
    /// The peer sent a close frame first.
    CloseReceived,
    /// Both close frames have crossed.
    CloseExchanged,
    /// The peer stayed silent and the transport was closed unilaterally.
    ForceClosed,
}

impl CloseState {
    /// Check if the connection is still open for data.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }

    /// Check if we're in the process of closing.
    #[must_use]
    pub const fn is_closing(self) -> bool {
        matches!(self, Self::CloseSent | Self::CloseReceived)
    }

    /// Check if the close handshake has ended either way.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::CloseExchanged | Self::ForceClosed)
    }
}

/// What to do with a close frame received from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCloseAction {
    /// Echo a close frame, then close the transport.
    Respond,
    /// Our close frame is already out; close the transport.
    Complete,
    /// Pass the frame on to the application.
    Deliver,
    /// Our close frame is already out; pass the peer's frame on, then close
    /// the transport.
    DeliverAndClose,
    /// Duplicate or late frame; drop it.
    Ignore,
}

/// Close handshake state machine, without timers.
#[derive(Debug, Default)]
pub struct CloseHandshake {
    state: CloseState,
    force_close_complete: bool,
    peer_reason: Option<CloseReason>,
}

impl CloseHandshake {
    /// Creates a handshake in the `Open` state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CloseState {
        self.state
    }

    /// True once the transport was closed because the peer stayed silent.
    #[must_use]
    pub fn is_force_close_complete(&self) -> bool {
        self.force_close_complete
    }

    /// The reason the peer sent, if its close frame arrived.
    #[must_use]
    pub fn peer_reason(&self) -> Option<&CloseReason> {
        self.peer_reason.as_ref()
    }

    /// Records that a close frame was sent.
    ///
    /// Returns true if this opened the handshake, i.e. we are now waiting
    /// for the peer.
    pub fn on_send(&mut self) -> bool {
        match self.state {
            CloseState::Open => {
                self.transition(CloseState::CloseSent);
                true
            }
            CloseState::CloseReceived => {
                self.transition(CloseState::CloseExchanged);
                false
            }
            _ => false,
        }
    }

    /// Records a close frame from the peer.
    ///
    /// With `auto_respond`, the handshake is driven to completion without
    /// involving the application.
    pub fn on_receive(&mut self, reason: CloseReason, auto_respond: bool) -> PeerCloseAction {
        match self.state {
            CloseState::Open => {
                self.peer_reason = Some(reason);
                self.transition(CloseState::CloseReceived);
                if auto_respond {
                    PeerCloseAction::Respond
                } else {
                    PeerCloseAction::Deliver
                }
            }
            CloseState::CloseSent => {
                self.peer_reason = Some(reason);
                self.transition(CloseState::CloseExchanged);
                if auto_respond {
                    PeerCloseAction::Complete
                } else {
                    PeerCloseAction::DeliverAndClose
                }
            }
            CloseState::CloseReceived | CloseState::CloseExchanged | CloseState::ForceClosed => {
                PeerCloseAction::Ignore
            }
        }
    }

    /// Records that the force-close timeout elapsed.
    ///
    /// Returns true if the handshake was still waiting for the peer.
    pub fn on_force_close(&mut self) -> bool {
        if self.state != CloseState::CloseSent {
            return false;
        }
        self.transition(CloseState::ForceClosed);
        self.force_close_complete = true;
        true
    }

    fn transition(&mut self, to: CloseState) {
        trace!(from = ?self.state, to = ?to, "close state transition");
        self.state = to;
    }
}

struct TrackerInner {
    handshake: CloseHandshake,
    timer: Option<TimerHandle>,
}

/// Connection-wide close handshake, shared by the stages that send and
/// receive close frames.
///
/// Once the first close frame has been written, a force-close timer is
/// armed on the connection's executor; the peer's close frame or any other
/// close of the transport cancels it.
#[derive(Clone)]
pub struct CloseTracker {
    inner: Arc<Mutex<TrackerInner>>,
    force_close_timeout: Option<Duration>,
}

impl CloseTracker {
    /// Creates a tracker. `None` disables the force-close timer; a zero
    /// timeout force-closes on the executor turn after the close frame is
    /// flushed.
    #[must_use]
    pub fn new(force_close_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TrackerInner {
                handshake: CloseHandshake::new(),
                timer: None,
            })),
            force_close_timeout,
        }
    }

    /// Current close state.
    #[must_use]
    pub fn state(&self) -> CloseState {
        self.inner.lock().handshake.state()
    }

    /// True once the force-close timer closed the connection.
    #[must_use]
    pub fn is_force_close_complete(&self) -> bool {
        self.inner.lock().handshake.is_force_close_complete()
    }

    /// The configured force-close timeout.
    #[must_use]
    pub fn force_close_timeout(&self) -> Option<Duration> {
        self.force_close_timeout
    }

    /// The reason carried by the peer's close frame, once received.
    #[must_use]
    pub fn peer_reason(&self) -> Option<CloseReason> {
        self.inner.lock().handshake.peer_reason().cloned()
    }

    /// Records a close frame that was just encoded for sending.
    ///
    /// The force-close timer is armed once `written` completes, so it never
    /// runs ahead of the flush that puts the close frame on the wire.
    pub(crate) fn on_local_close(&self, ctx: &Context<'_>, written: &Promise) {
        let waiting = self.inner.lock().handshake.on_send();
        if !waiting {
            return;
        }
        let Some(timeout) = self.force_close_timeout else {
            return;
        };
        let tracker = self.clone();
        ctx.on_complete(written, move |ctx, _| tracker.arm_force_close(ctx, timeout));
    }

    fn arm_force_close(&self, ctx: &mut Context<'_>, timeout: Duration) {
        if !ctx.is_active() || self.state() != CloseState::CloseSent {
            return;
        }
        let tracker = self.clone();
        let timer = ctx.schedule(timeout, move |ctx| tracker.force_close(ctx));
        trace!(
            conn = %ctx.connection_id(),
            timeout_ms = timeout.as_millis(),
            "force-close timer armed"
        );
        self.inner.lock().timer = Some(timer.clone());
        ctx.close_future().add_listener(move |_| {
            timer.cancel();
        });
    }

    /// Records a close frame from the peer and says what to do with it.
    pub(crate) fn on_peer_close(&self, frame: &Frame, auto_respond: bool) -> PeerCloseAction {
        let reason = CloseReason::parse(&frame.payload).unwrap_or_default();
        let mut inner = self.inner.lock();
        let action = inner.handshake.on_receive(reason, auto_respond);
        if inner.handshake.state() == CloseState::CloseExchanged {
            if let Some(timer) = inner.timer.take() {
                timer.cancel();
            }
        }
        action
    }

    fn force_close(&self, ctx: &mut Context<'_>) {
        if !ctx.is_active() {
            return;
        }
        let forced = self.inner.lock().handshake.on_force_close();
        if forced {
            debug!(conn = %ctx.connection_id(), "peer did not answer close, forcing close");
            ctx.close();
        }
    }
}

impl fmt::Debug for CloseTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CloseTracker")
            .field("state", &inner.handshake.state())
            .field("force_close_complete", &inner.handshake.is_force_close_complete())
            .field("force_close_timeout", &self.force_close_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_ranges() {
        assert!(CloseCode::is_valid_code(1000));
        assert!(CloseCode::is_valid_code(3000));
        assert!(CloseCode::is_valid_code(4999));
        assert!(!CloseCode::is_valid_code(1005));
        assert!(!CloseCode::is_valid_code(1006));
        assert!(!CloseCode::is_valid_code(2000));
        assert_eq!(CloseCode::from_u16(1009), Some(CloseCode::MessageTooBig));
        assert_eq!(CloseCode::from_u16(4000), None);
        assert!(!CloseCode::Abnormal.is_sendable());
        assert_eq!(u16::from(CloseCode::GoingAway), 1001);
    }

    #[test]
    fn reason_parse_forms() {
        assert_eq!(CloseReason::parse(&[]).unwrap(), CloseReason::default());
        assert_eq!(
            CloseReason::parse(&[0x03]).unwrap_err(),
            WsError::InvalidClosePayload
        );

        let reason = CloseReason::parse(&[0x03, 0xE8]).unwrap();
        assert!(reason.is_normal());
        assert_eq!(reason.text, None);

        let mut payload = 4001u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        let reason = CloseReason::parse(&payload).unwrap();
        assert_eq!(reason.code, Some(4001));
        assert_eq!(reason.close_code(), None);
        assert_eq!(reason.text.as_deref(), Some("bye"));

        assert_eq!(
            CloseReason::parse(&[0x03, 0xE8, 0xFF]).unwrap_err(),
            WsError::InvalidUtf8
        );
    }

    #[test]
    fn reason_round_trips_through_frame() {
        let reason = CloseReason::new(CloseCode::GoingAway, Some("shutdown"));
        let frame = reason.to_frame();
        assert!(frame.is_close());
        assert_eq!(frame.close_code(), Some(1001));
        assert_eq!(CloseReason::parse(&frame.payload).unwrap(), reason);
    }

    #[test]
    fn initiator_path_completes_on_peer_reply() {
        let mut hs = CloseHandshake::new();
        assert!(hs.on_send());
        assert_eq!(hs.state(), CloseState::CloseSent);
        assert!(hs.state().is_closing());

        // A second local close frame does not restart the handshake.
        assert!(!hs.on_send());

        let action = hs.on_receive(CloseReason::normal(), true);
        assert_eq!(action, PeerCloseAction::Complete);
        assert_eq!(hs.state(), CloseState::CloseExchanged);
        assert!(hs.peer_reason().unwrap().is_normal());
        assert!(!hs.on_force_close());
        assert!(!hs.is_force_close_complete());
    }

    #[test]
    fn responder_path_echoes_then_exchanges() {
        let mut hs = CloseHandshake::new();
        assert_eq!(
            hs.on_receive(CloseReason::normal(), true),
            PeerCloseAction::Respond
        );
        assert_eq!(hs.state(), CloseState::CloseReceived);
        assert!(!hs.on_send());
        assert_eq!(hs.state(), CloseState::CloseExchanged);
        assert!(hs.state().is_terminal());
    }

    #[test]
    fn without_auto_respond_frames_are_delivered() {
        let mut hs = CloseHandshake::new();
        assert_eq!(
            hs.on_receive(CloseReason::default(), false),
            PeerCloseAction::Deliver
        );
        assert_eq!(
            hs.on_receive(CloseReason::default(), false),
            PeerCloseAction::Ignore
        );

        let mut hs = CloseHandshake::new();
        hs.on_send();
        assert_eq!(
            hs.on_receive(CloseReason::default(), false),
            PeerCloseAction::DeliverAndClose
        );
        assert_eq!(hs.state(), CloseState::CloseExchanged);
    }

    #[test]
    fn force_close_is_terminal() {
        let mut hs = CloseHandshake::new();
        assert!(!hs.on_force_close(), "nothing to force while open");
        hs.on_send();
        assert!(hs.on_force_close());
        assert_eq!(hs.state(), CloseState::ForceClosed);
        assert!(hs.is_force_close_complete());

        assert!(!hs.on_force_close());
        assert_eq!(
            hs.on_receive(CloseReason::normal(), true),
            PeerCloseAction::Ignore
        );
        assert!(!hs.on_send());
        assert_eq!(hs.state(), CloseState::ForceClosed);
        assert!(hs.peer_reason().is_none());
    }

    #[test]
    fn tracker_peer_close_cancels_nothing_without_timer() {
        let tracker = CloseTracker::new(None);
        let action = tracker.on_peer_close(&Frame::close(Some(1000), Some("done")), true);
        assert_eq!(action, PeerCloseAction::Respond);
        assert_eq!(tracker.state(), CloseState::CloseReceived);
        assert_eq!(tracker.peer_reason().unwrap().text.as_deref(), Some("done"));
        assert_eq!(tracker.force_close_timeout(), None);
    }
}
