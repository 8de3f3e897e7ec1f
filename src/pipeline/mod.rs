//! Per-connection processing pipelines.
//!
//! A connection's processing logic is an ordered chain of named [`Stage`]s.
//! Inbound events (bytes read, activation, user events, errors) travel from
//! the head towards the tail; outbound writes travel from the tail towards
//! the head, where bytes reach the transport.
//!
//! All stages of one connection run on that connection's serialized
//! [`EventExecutor`]: one event at a time, never concurrently with each
//! other. Stage replacement is therefore atomic with respect to event
//! delivery: once [`Context::replace_self`] returns, the next event reaches
//! the replacement and never the replaced stage.
//!
//! # Module Structure
//!
//! - `connection`: the connection core (transport head, tail sinks, dispatch)
//! - `executor`: serialized task queue with a virtual clock and timers
//! - `lab`: [`LabConnection`], an in-process driver for tests and embedding
//! - `message`: [`Message`] and [`UserEvent`]
//! - `pipeline`: slot bookkeeping and routing for removed stages
//! - `stage`: the [`Stage`] trait and its [`Context`]

mod connection;
mod executor;
mod lab;
mod message;
#[allow(clippy::module_inception)]
mod pipeline;
mod stage;

pub use connection::Connection;
pub use executor::{task, EventExecutor, Task, TimerHandle, TimerState};
pub use lab::LabConnection;
pub use message::{Message, UserEvent};
pub use stage::{Context, Stage};

use thiserror::Error;

/// Errors from pipeline mutation and routing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// A live stage already uses this name.
    #[error("duplicate stage name: {0}")]
    DuplicateName(String),

    /// No live stage matches.
    #[error("no such stage: {0}")]
    NoSuchStage(String),

    /// A non-byte message reached the transport without being encoded.
    #[error("unencoded {0} message reached the transport")]
    Unencoded(&'static str),
}
