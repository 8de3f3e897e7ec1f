//! Core types shared across the crate.
//!
//! - [`id`]: Identifier types (`ConnectionId`, `StageId`, `TimerId`, `Time`)

pub mod id;

pub use id::{ConnectionId, StageId, TimerId, Time};
