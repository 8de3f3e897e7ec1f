//! Networking protocols layered on the connection pipeline.

pub mod websocket;
