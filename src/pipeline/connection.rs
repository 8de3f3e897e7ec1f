//! The connection core: transport head, pipeline dispatch, and tail sinks.
//!
//! Dispatch takes a stage out of its slot for the duration of its hook, so
//! the hook can freely fire further events or mutate the pipeline through its
//! [`Context`]. A stage reached again while it is still executing is skipped.
//! When a hook returns and its stage was removed in the meantime, the stage's
//! `on_removed` runs and its slot is unlinked.

use crate::error::Error;
use crate::pipeline::executor::task;
use crate::pipeline::pipeline::{Pipeline, Position};
use crate::pipeline::{Context, EventExecutor, Message, PipelineError, Stage, UserEvent};
use crate::promise::Promise;
use crate::tracing_compat::{debug, trace, warn};
use crate::types::{ConnectionId, StageId};
use bytes::Bytes;
use http::Extensions;
use std::collections::VecDeque;
use std::fmt;

enum Inbound {
    Active,
    Inactive,
    Read(Message),
    UserEvent(UserEvent),
    Error(Error),
}

impl Inbound {
    fn deliver(self, stage: &mut dyn Stage, ctx: &mut Context<'_>) {
        match self {
            Self::Active => stage.on_active(ctx),
            Self::Inactive => stage.on_inactive(ctx),
            Self::Read(msg) => stage.on_read(ctx, msg),
            Self::UserEvent(event) => stage.on_user_event(ctx, event),
            Self::Error(error) => stage.on_error(ctx, error),
        }
    }
}

#[derive(Default)]
struct Transport {
    active: bool,
    closed: bool,
    unflushed: Vec<(Bytes, Promise)>,
    outbound: VecDeque<Bytes>,
    write_failure: Option<Error>,
}

/// Whatever falls off the end of the pipeline.
#[derive(Default)]
pub(crate) struct Tail {
    pub(crate) messages: VecDeque<Message>,
    pub(crate) events: Vec<UserEvent>,
    pub(crate) errors: Vec<Error>,
}

/// One connection: its pipeline, transport, attributes, and executor.
pub struct Connection {
    id: ConnectionId,
    pub(crate) pipeline: Pipeline,
    executor: EventExecutor,
    transport: Transport,
    pub(crate) tail: Tail,
    close_promise: Promise,
    attributes: Extensions,
    secure: bool,
}

impl Connection {
    pub(crate) fn new(secure: bool) -> Self {
        Self {
            id: ConnectionId::next(),
            pipeline: Pipeline::new(),
            executor: EventExecutor::new(),
            transport: Transport::default(),
            tail: Tail::default(),
            close_promise: Promise::new(),
            attributes: Extensions::new(),
            secure,
        }
    }

    /// Connection ID.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// True while the connection is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.transport.active && !self.transport.closed
    }

    /// True if the connection runs over TLS.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// The connection's executor.
    #[must_use]
    pub fn executor(&self) -> &EventExecutor {
        &self.executor
    }

    /// Promise completed when the connection closes.
    #[must_use]
    pub fn close_future(&self) -> Promise {
        self.close_promise.clone()
    }

    pub(crate) fn insert_attr<T>(&mut self, value: T) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.attributes.insert(value)
    }

    pub(crate) fn attr<T>(&self) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.attributes.get::<T>().cloned()
    }

    // --- pipeline mutation -------------------------------------------------

    pub(crate) fn add(
        &mut self,
        position: Position,
        name: &str,
        stage: Box<dyn Stage>,
    ) -> Result<StageId, PipelineError> {
        let id = self.pipeline.insert(position, name, stage.as_ref())?;
        debug!(conn = %self.id, stage = %name, id = %id, "stage added");
        self.run_added(id, stage);
        Ok(id)
    }

    pub(crate) fn replace(
        &mut self,
        old: StageId,
        name: &str,
        stage: Box<dyn Stage>,
    ) -> Result<StageId, PipelineError> {
        let id = self.pipeline.replace(old, name, stage.as_ref())?;
        debug!(
            conn = %self.id,
            old = ?self.pipeline.name_of(old),
            new = %name,
            "stage replaced"
        );
        self.run_added(id, stage);
        self.unlink_if_idle(old);
        Ok(id)
    }

    pub(crate) fn remove(&mut self, id: StageId) -> Result<(), PipelineError> {
        self.pipeline.mark_removed(id)?;
        debug!(conn = %self.id, stage = ?self.pipeline.name_of(id), "stage removed");
        self.unlink_if_idle(id);
        Ok(())
    }

    fn run_added(&mut self, id: StageId, mut stage: Box<dyn Stage>) {
        {
            let mut ctx = Context::new(self, id);
            stage.on_added(&mut ctx);
        }
        self.finish_dispatch(id, stage);
    }

    /// Completes a removal right away unless the stage is mid-hook; a busy
    /// stage is finished by [`Self::finish_dispatch`] when its hook returns.
    fn unlink_if_idle(&mut self, id: StageId) {
        let Some(index) = self.pipeline.index_of(id) else {
            return;
        };
        if let Some(mut stage) = self.pipeline.slots[index].stage.take() {
            {
                let mut ctx = Context::new(self, id);
                stage.on_removed(&mut ctx);
            }
            self.pipeline.unlink(id);
        }
    }

    fn finish_dispatch(&mut self, id: StageId, mut stage: Box<dyn Stage>) {
        let Some(index) = self.pipeline.index_of(id) else {
            return;
        };
        if self.pipeline.slots[index].removed {
            {
                let mut ctx = Context::new(self, id);
                stage.on_removed(&mut ctx);
            }
            self.pipeline.unlink(id);
            trace!(conn = %self.id, id = %id, "stage unlinked after dispatch");
        } else {
            self.pipeline.slots[index].stage = Some(stage);
        }
    }

    // --- inbound -------------------------------------------------------------

    pub(crate) fn fire_active(&mut self, from: StageId) {
        self.fire_inbound(from, Inbound::Active);
    }

    pub(crate) fn fire_inactive(&mut self, from: StageId) {
        self.fire_inbound(from, Inbound::Inactive);
    }

    pub(crate) fn fire_read(&mut self, from: StageId, msg: Message) {
        self.fire_inbound(from, Inbound::Read(msg));
    }

    pub(crate) fn fire_user_event(&mut self, from: StageId, event: UserEvent) {
        self.fire_inbound(from, Inbound::UserEvent(event));
    }

    pub(crate) fn fire_error(&mut self, from: StageId, error: Error) {
        self.fire_inbound(from, Inbound::Error(error));
    }

    fn fire_inbound(&mut self, from: StageId, event: Inbound) {
        let mut cursor = self.pipeline.inbound_start(from, false);
        while let Some(index) = self.pipeline.next_inbound(cursor) {
            let id = self.pipeline.slots[index].id;
            let Some(mut stage) = self.pipeline.slots[index].stage.take() else {
                warn!(conn = %self.id, id = %id, "skipping re-entrant inbound dispatch");
                cursor = index + 1;
                continue;
            };
            {
                let mut ctx = Context::new(self, id);
                event.deliver(stage.as_mut(), &mut ctx);
            }
            self.finish_dispatch(id, stage);
            return;
        }
        self.reach_tail(event);
    }

    fn reach_tail(&mut self, event: Inbound) {
        match event {
            Inbound::Read(msg) => {
                trace!(conn = %self.id, kind = msg.kind(), "message reached the tail");
                self.tail.messages.push_back(msg);
            }
            Inbound::UserEvent(event) => self.tail.events.push(event),
            Inbound::Error(error) => {
                warn!(conn = %self.id, error = %error, "error reached the tail of the pipeline");
                self.tail.errors.push(error);
            }
            Inbound::Active | Inbound::Inactive => {}
        }
    }

    // --- outbound ------------------------------------------------------------

    pub(crate) fn fire_write(&mut self, from: StageId, msg: Message, promise: Promise) {
        let mut cursor = self.pipeline.outbound_start(from, false);
        while let Some(index) = cursor.and_then(|c| self.pipeline.prev_outbound(c)) {
            let id = self.pipeline.slots[index].id;
            let Some(mut stage) = self.pipeline.slots[index].stage.take() else {
                warn!(conn = %self.id, id = %id, "skipping re-entrant outbound dispatch");
                cursor = index.checked_sub(1);
                continue;
            };
            {
                let mut ctx = Context::new(self, id);
                stage.on_write(&mut ctx, msg, promise);
            }
            self.finish_dispatch(id, stage);
            return;
        }
        self.head_write(msg, promise);
    }

    fn head_write(&mut self, msg: Message, promise: Promise) {
        let Message::Bytes(bytes) = msg else {
            warn!(conn = %self.id, kind = msg.kind(), "unencoded message reached the head");
            promise.try_failure(PipelineError::Unencoded(msg.kind()));
            return;
        };
        if !self.is_active() {
            promise.try_failure(Error::Closed);
            return;
        }
        self.transport.unflushed.push((bytes, promise));
    }

    /// Moves written bytes to the outbound queue; their promises complete on
    /// the next turn of the executor.
    pub(crate) fn flush(&mut self) {
        let pending = std::mem::take(&mut self.transport.unflushed);
        if pending.is_empty() {
            return;
        }
        let failure = self.transport.write_failure.clone();
        let mut promises = Vec::with_capacity(pending.len());
        for (bytes, promise) in pending {
            if failure.is_none() {
                self.transport.outbound.push_back(bytes);
            }
            promises.push(promise);
        }
        self.executor.execute(
            StageId::HEAD,
            task(move |_ctx| {
                for promise in promises {
                    match &failure {
                        None => promise.try_success(()),
                        Some(error) => promise.try_failure(error.clone()),
                    };
                }
            }),
        );
    }

    pub(crate) fn close(&mut self) -> Promise {
        if self.transport.closed {
            return self.close_promise.clone();
        }
        let was_active = self.transport.active;
        self.transport.closed = true;
        self.transport.active = false;
        for (_, promise) in std::mem::take(&mut self.transport.unflushed) {
            promise.try_failure(Error::Closed);
        }
        debug!(conn = %self.id, "connection closed");
        self.close_promise.try_success(());
        if was_active {
            self.executor
                .execute(StageId::HEAD, task(|ctx| ctx.fire_inactive()));
        }
        self.close_promise.clone()
    }

    // --- driver hooks ----------------------------------------------------------

    pub(crate) fn activate(&mut self) {
        if self.transport.active || self.transport.closed {
            return;
        }
        self.transport.active = true;
        self.fire_active(StageId::HEAD);
    }

    pub(crate) fn set_write_failure(&mut self, failure: Option<Error>) {
        self.transport.write_failure = failure;
    }

    pub(crate) fn pop_outbound(&mut self) -> Option<Bytes> {
        self.transport.outbound.pop_front()
    }

    pub(crate) fn has_outbound(&self) -> bool {
        !self.transport.outbound.is_empty()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("stages", &self.pipeline.names())
            .field("active", &self.is_active())
            .field("outbound", &self.transport.outbound.len())
            .finish_non_exhaustive()
    }
}
