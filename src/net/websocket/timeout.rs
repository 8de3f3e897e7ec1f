//! Handshake timeout shared by the client and server stages.

use crate::net::websocket::HandshakeError;
use crate::pipeline::{Context, TimerHandle, UserEvent};
use crate::promise::Promise;
use crate::tracing_compat::warn;
use std::time::Duration;

/// Fails `promise` with [`HandshakeError::Timeout`] if it is still pending
/// after `timeout`; the timer then fires `event` and closes the connection.
///
/// Completing the promise first cancels the timer. Nothing is armed for a
/// zero timeout or an already completed promise.
pub(crate) fn arm(
    ctx: &mut Context<'_>,
    promise: &Promise,
    timeout: Duration,
    event: UserEvent,
) -> Option<TimerHandle> {
    if timeout.is_zero() || promise.is_done() {
        return None;
    }
    let pending = promise.clone();
    let timer = ctx.schedule(timeout, move |ctx| {
        if !pending.try_failure(HandshakeError::Timeout) {
            return;
        }
        warn!(
            conn = %ctx.connection_id(),
            timeout_ms = timeout.as_millis(),
            "websocket handshake timed out, closing connection"
        );
        ctx.flush();
        ctx.fire_user_event(event);
        ctx.close();
    });
    let cancel = timer.clone();
    promise.add_listener(move |_| {
        cancel.cancel();
    });
    Some(timer)
}
