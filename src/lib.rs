//! wsgate: WebSocket upgrade handshake and closing handshake over a
//! serialized, pipeline-based connection model.
//!
//! # Overview
//!
//! A connection is an ordered chain of named stages driven by one serialized
//! executor. The WebSocket protocols install a handshake stage on an HTTP
//! pipeline; once the upgrade succeeds they swap the HTTP codec for the
//! frame codec without ever letting a frame reach HTTP logic, or an HTTP
//! message reach frame logic.
//!
//! # Core Guarantees
//!
//! - **Single resolution**: a handshake promise completes exactly once, by
//!   success, failure, or timeout, never by two of them
//! - **Atomic replacement**: once a stage replaces itself, the next event
//!   reaches the replacement
//! - **Timers on the connection**: handshake and force-close timers run on
//!   the connection's own executor and are cancelled when made moot
//! - **Deterministic testing**: [`pipeline::LabConnection`] runs everything
//!   in-process on a virtual clock
//!
//! # Module Structure
//!
//! - [`types`]: identifiers and virtual time
//! - [`error`]: error types
//! - [`promise`]: single-assignment completion cells
//! - [`pipeline`]: stages, contexts, the executor and the lab driver
//! - [`codec`]: decoder/encoder traits and their pipeline stages
//! - [`http`]: the minimal HTTP/1.1 codec used by the upgrade
//! - [`net`]: the WebSocket protocol
//!
//! # Example
//!
//! ```
//! use wsgate::net::websocket::{
//!     ClientProtocolConfig, ServerProtocolConfig, WebSocketClientProtocol,
//!     WebSocketServerProtocol,
//! };
//! use wsgate::pipeline::LabConnection;
//!
//! let server = WebSocketServerProtocol::new(ServerProtocolConfig::new("/chat"));
//! let mut server_conn = LabConnection::new();
//! server.install(&mut server_conn).unwrap();
//! server_conn.activate();
//!
//! let config = ClientProtocolConfig::new("ws://localhost/chat").unwrap();
//! let client = WebSocketClientProtocol::new(config);
//! let mut client_conn = LabConnection::new();
//! client.install(&mut client_conn).unwrap();
//! client_conn.activate();
//!
//! for bytes in client_conn.drain_outbound() {
//!     server_conn.write_inbound(bytes);
//! }
//! for bytes in server_conn.drain_outbound() {
//!     client_conn.write_inbound(bytes);
//! }
//! assert!(server.handshake_future().is_success());
//! assert!(client.handshake_future().is_success());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod codec;
pub mod error;
pub mod http;
pub mod net;
pub mod pipeline;
pub mod promise;
pub mod tracing_compat;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use error::{Error, Result};
pub use net::websocket::{
    ClientProtocolConfig, HandshakeError, ServerProtocolConfig, WebSocketClientProtocol,
    WebSocketServerProtocol,
};
pub use pipeline::{Context, LabConnection, Message, Stage, UserEvent};
pub use promise::Promise;
