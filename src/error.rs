//! Error types and error handling strategy for wsgate.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Every error is `Clone`, so one failure can be stored in a promise and
//!   propagated down the pipeline as an error event at the same time
//! - Failures before a handshake is admitted stay local (an HTTP response is
//!   written); failures after admission surface through both channels
//!
//! # Error Categories
//!
//! - **Handshake**: upgrade validation, negotiation, timeout ([`HandshakeError`])
//! - **Frame**: WebSocket wire format violations ([`WsError`])
//! - **Http**: HTTP/1.1 head and body decoding ([`HttpError`])
//! - **Pipeline**: stage lookup and naming ([`PipelineError`])
//! - **Io / Closed**: transport failures

use std::io;
use std::sync::Arc;
use thiserror::Error;

pub use crate::http::HttpError;
pub use crate::net::websocket::{HandshakeError, WsError};
pub use crate::pipeline::PipelineError;

/// Crate-level error carried by promises and error events.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// WebSocket handshake failed.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// WebSocket frame codec error.
    #[error(transparent)]
    Frame(#[from] WsError),

    /// HTTP codec error.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// Pipeline mutation error.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Underlying transport I/O error.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// The connection was already closed.
    #[error("connection closed")]
    Closed,
}

impl Error {
    /// Returns true if this error is a handshake timeout.
    #[must_use]
    pub fn is_handshake_timeout(&self) -> bool {
        matches!(self, Self::Handshake(HandshakeError::Timeout))
    }

    /// Returns the underlying I/O error kind, if any.
    #[must_use]
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Io(e) => Some(e.kind()),
            Self::Handshake(HandshakeError::Io(e)) => Some(e.kind()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// Convenience alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
