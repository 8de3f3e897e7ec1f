//! Test utilities for wsgate.
//!
//! This module provides shared helpers for unit tests:
//! - Consistent tracing-based logging initialization
//! - Phase/section macros for readable test output
//! - Lab connection constructors for the server and client stacks

use crate::net::websocket::{
    ClientProtocolConfig, ServerProtocolConfig, WebSocketClientProtocol, WebSocketServerProtocol,
};
use crate::pipeline::{LabConnection, Stage};
use std::sync::Once;
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Build an active server-side lab connection: HTTP codec, the server
/// protocol, then `user`.
pub(crate) fn server_connection(config: ServerProtocolConfig, user: impl Stage) -> LabConnection {
    let mut conn = LabConnection::new();
    WebSocketServerProtocol::new(config)
        .install(&mut conn)
        .expect("install server protocol");
    conn.add_last("user", user).expect("add user stage");
    conn.activate();
    conn
}

/// Build a client-side lab connection: HTTP codec, the client protocol, then `user`.
///
/// The connection is activated, so the upgrade request is already queued.
pub(crate) fn client_connection(config: ClientProtocolConfig, user: impl Stage) -> LabConnection {
    let mut conn = LabConnection::new();
    WebSocketClientProtocol::new(config)
        .install(&mut conn)
        .expect("install client protocol");
    conn.add_last("user", user).expect("add user stage");
    conn.activate();
    conn
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}
