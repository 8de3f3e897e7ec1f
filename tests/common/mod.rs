#![allow(dead_code)]
#![allow(unused_imports)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

use bytes::BytesMut;
use parking_lot::Mutex;
use proptest::prelude::ProptestConfig;
use proptest::test_runner::RngSeed;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use tracing_subscriber::fmt::format::FmtSpan;
use wsgate::net::websocket::{
    ClientProtocolConfig, Frame, ServerProtocolConfig, WebSocketClientProtocol,
    WebSocketServerProtocol,
};
use wsgate::pipeline::{Context, LabConnection, Message, Stage, UserEvent};

static INIT_LOGGING: Once = Once::new();

/// Default seed for property tests when running under CI.
pub const DEFAULT_PROPTEST_SEED: u64 = 0x5EED5EED;

const PROPTEST_SEED_ENV: &str = "WSGATE_PROPTEST_SEED";
const PROPTEST_MAX_SHRINK_ITERS_ENV: &str = "WSGATE_PROPTEST_MAX_SHRINK_ITERS";

/// Configuration for property tests with optional deterministic seed support.
#[derive(Debug, Clone)]
pub struct PropertyTestConfig {
    /// Fixed seed for reproducibility (overrides CI default when set).
    pub seed: Option<u64>,
    /// Number of successful cases required.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl PropertyTestConfig {
    /// Build a config with defaults for property tests.
    #[must_use]
    pub fn new(cases: u32) -> Self {
        Self {
            seed: read_proptest_seed(),
            cases,
            max_shrink_iters: read_max_shrink_iters()
                .unwrap_or(ProptestConfig::default().max_shrink_iters),
        }
    }

    /// Convert into a ProptestConfig, applying deterministic seed rules.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        let mut config = ProptestConfig::with_cases(self.cases);

        // Honor existing PROPTEST_RNG_SEED, otherwise apply our own.
        if matches!(config.rng_seed, RngSeed::Random) {
            if let Some(seed) = self.seed {
                config.rng_seed = RngSeed::Fixed(seed);
            }
        }

        config.max_shrink_iters = self.max_shrink_iters;
        config
    }
}

/// Build a ProptestConfig with deterministic seed support for CI.
#[must_use]
pub fn test_proptest_config(cases: u32) -> ProptestConfig {
    PropertyTestConfig::new(cases).to_proptest_config()
}

fn read_proptest_seed() -> Option<u64> {
    if let Ok(value) = std::env::var(PROPTEST_SEED_ENV) {
        return value.parse::<u64>().ok();
    }

    // If CI is set and no explicit seed is provided, use a fixed seed.
    if std::env::var("CI").is_ok() {
        return Some(DEFAULT_PROPTEST_SEED);
    }

    None
}

fn read_max_shrink_iters() -> Option<u32> {
    std::env::var(PROPTEST_MAX_SHRINK_ITERS_ENV)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
}

/// Initialize test logging with trace-level output.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
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

/// Application stage that passes everything on; the lab tail records it.
#[derive(Debug, Default)]
pub struct PassThrough;

impl Stage for PassThrough {}

/// Server connection with `user` after the handshake stage; not yet active.
pub fn server_pipeline(
    config: ServerProtocolConfig,
    user: impl Stage,
) -> (LabConnection, WebSocketServerProtocol) {
    let protocol = WebSocketServerProtocol::new(config);
    let mut conn = LabConnection::new();
    protocol.install(&mut conn).expect("install server protocol");
    conn.add_last("user", user).expect("add user stage");
    (conn, protocol)
}

/// Client connection with `user` after the handshake stage; not yet active.
pub fn client_pipeline(
    config: ClientProtocolConfig,
    user: impl Stage,
) -> (LabConnection, WebSocketClientProtocol) {
    let protocol = WebSocketClientProtocol::new(config);
    let mut conn = LabConnection::new();
    protocol.install(&mut conn).expect("install client protocol");
    conn.add_last("user", user).expect("add user stage");
    (conn, protocol)
}

/// Move every outbound buffer of `src` into `dst` as one merged inbound buffer.
///
/// Returns false if there was nothing to move.
pub fn transfer_all(src: &mut LabConnection, dst: &mut LabConnection) -> bool {
    let mut merged = BytesMut::new();
    while let Some(chunk) = src.read_outbound() {
        merged.extend_from_slice(&chunk);
    }
    if merged.is_empty() {
        return false;
    }
    dst.write_inbound(merged.freeze());
    true
}

/// Counts drops of the value it is attached to.
#[derive(Debug, Clone, Default)]
pub struct DropCounter(Arc<AtomicUsize>);

impl DropCounter {
    /// Number of tracked values dropped so far.
    #[must_use]
    pub fn drops(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// A byte buffer whose backing storage reports to this counter on release.
    #[must_use]
    pub fn tracked_body(&self, content: &[u8]) -> bytes::Bytes {
        bytes::Bytes::from_owner(Tracked {
            data: content.to_vec(),
            counter: self.clone(),
        })
    }
}

struct Tracked {
    data: Vec<u8>,
    counter: DropCounter,
}

impl AsRef<[u8]> for Tracked {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.counter.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records every frame it sees and swallows close frames.
#[derive(Debug, Clone, Default)]
pub struct CloseSwallower {
    seen: Arc<Mutex<Vec<Frame>>>,
}

impl CloseSwallower {
    /// Frames seen so far.
    #[must_use]
    pub fn seen(&self) -> Vec<Frame> {
        self.seen.lock().clone()
    }
}

impl Stage for CloseSwallower {
    fn on_read(&mut self, ctx: &mut Context<'_>, msg: Message) {
        match msg {
            Message::Frame(frame) => {
                let is_close = frame.is_close();
                self.seen.lock().push(frame.clone());
                if !is_close {
                    ctx.fire_read(frame);
                }
            }
            other => ctx.fire_read(other),
        }
    }
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
