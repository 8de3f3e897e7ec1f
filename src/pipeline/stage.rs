//! The [`Stage`] trait and the [`Context`] handed to every stage hook.

use crate::error::Error;
use crate::pipeline::connection::Connection;
use crate::pipeline::pipeline::Position;
use crate::pipeline::executor::task;
use crate::pipeline::{EventExecutor, Message, PipelineError, TimerHandle, UserEvent};
use crate::promise::Promise;
use crate::types::{ConnectionId, StageId, Time};
use std::time::Duration;

/// One unit of per-connection processing logic.
///
/// Every hook has a pass-through default, so a stage overrides only what it
/// handles. A stage declares once, when added, whether it takes part in
/// inbound dispatch, outbound dispatch, or both; events of the other
/// direction skip it.
pub trait Stage: Send + 'static {
    /// Whether inbound events (read, active, user event, error) visit this stage.
    fn handles_inbound(&self) -> bool {
        true
    }

    /// Whether outbound writes visit this stage.
    fn handles_outbound(&self) -> bool {
        false
    }

    /// Called once the stage has been linked into the pipeline.
    fn on_added(&mut self, _ctx: &mut Context<'_>) {}

    /// Called once the stage has been unlinked (or replaced) and is no
    /// longer executing.
    fn on_removed(&mut self, _ctx: &mut Context<'_>) {}

    /// The connection became active.
    fn on_active(&mut self, ctx: &mut Context<'_>) {
        ctx.fire_active();
    }

    /// The connection was closed.
    fn on_inactive(&mut self, ctx: &mut Context<'_>) {
        ctx.fire_inactive();
    }

    /// An inbound message arrived.
    fn on_read(&mut self, ctx: &mut Context<'_>, msg: Message) {
        ctx.fire_read(msg);
    }

    /// A user event was fired upstream.
    fn on_user_event(&mut self, ctx: &mut Context<'_>, event: UserEvent) {
        ctx.fire_user_event(event);
    }

    /// An error was fired upstream.
    fn on_error(&mut self, ctx: &mut Context<'_>, error: Error) {
        ctx.fire_error(error);
    }

    /// An outbound message is being written.
    fn on_write(&mut self, ctx: &mut Context<'_>, msg: Message, promise: Promise) {
        ctx.forward_write(msg, promise);
    }
}

/// A stage's view of its connection during one hook invocation.
///
/// Events fired through a context start at the stage's position. If the
/// stage has since been replaced, they start at the replacement instead.
pub struct Context<'a> {
    conn: &'a mut Connection,
    stage: StageId,
}

impl<'a> Context<'a> {
    pub(crate) fn new(conn: &'a mut Connection, stage: StageId) -> Self {
        Self { conn, stage }
    }

    /// ID of the stage this context belongs to.
    #[must_use]
    pub fn stage_id(&self) -> StageId {
        self.stage
    }

    /// Name of the stage, while it is still linked.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.conn.pipeline.name_of(self.stage)
    }

    /// ID of the connection.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.conn.id()
    }

    /// True once this stage has been removed or replaced.
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.conn.pipeline.is_removed(self.stage)
    }

    /// True while the connection is active (activated and not closed).
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.conn.is_active()
    }

    /// True if the connection is secured by TLS.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.conn.is_secure()
    }

    /// Current time on the connection's clock.
    #[must_use]
    pub fn now(&self) -> Time {
        self.conn.executor().now()
    }

    /// The connection's executor.
    #[must_use]
    pub fn executor(&self) -> EventExecutor {
        self.conn.executor().clone()
    }

    /// Promise that completes when the connection closes.
    #[must_use]
    pub fn close_future(&self) -> Promise {
        self.conn.close_future()
    }

    /// Live stage names in pipeline order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<String> {
        self.conn.pipeline.names()
    }

    /// Creates a new pending promise.
    #[must_use]
    pub fn new_promise<T>(&self) -> Promise<T>
    where
        T: Clone + Send + 'static,
    {
        Promise::new()
    }

    /// Passes activation to the next inbound stage.
    pub fn fire_active(&mut self) {
        self.conn.fire_active(self.stage);
    }

    /// Passes deactivation to the next inbound stage.
    pub fn fire_inactive(&mut self) {
        self.conn.fire_inactive(self.stage);
    }

    /// Passes a message to the next inbound stage.
    pub fn fire_read(&mut self, msg: impl Into<Message>) {
        self.conn.fire_read(self.stage, msg.into());
    }

    /// Passes a user event to the next inbound stage.
    pub fn fire_user_event(&mut self, event: UserEvent) {
        self.conn.fire_user_event(self.stage, event);
    }

    /// Passes an error to the next inbound stage.
    pub fn fire_error(&mut self, error: impl Into<Error>) {
        self.conn.fire_error(self.stage, error.into());
    }

    /// Writes a message towards the head without flushing.
    pub fn write(&mut self, msg: impl Into<Message>) -> Promise {
        let promise = Promise::new();
        self.conn.fire_write(self.stage, msg.into(), promise.clone());
        promise
    }

    /// Writes a message towards the head and flushes the transport.
    pub fn write_and_flush(&mut self, msg: impl Into<Message>) -> Promise {
        let promise = self.write(msg);
        self.flush();
        promise
    }

    /// Forwards an outbound message with an existing promise.
    pub fn forward_write(&mut self, msg: Message, promise: Promise) {
        self.conn.fire_write(self.stage, msg, promise);
    }

    /// Flushes written bytes to the transport.
    pub fn flush(&mut self) {
        self.conn.flush();
    }

    /// Closes the connection.
    pub fn close(&mut self) -> Promise {
        self.conn.close()
    }

    /// Queues `f` to run on this stage's context at the next turn of the executor.
    pub fn execute<F>(&self, f: F)
    where
        F: for<'b> FnOnce(&mut Context<'b>) + Send + 'static,
    {
        self.conn.executor().execute(self.stage, task(f));
    }

    /// Schedules `f` to run on this stage's context after `delay`.
    pub fn schedule<F>(&self, delay: Duration, f: F) -> TimerHandle
    where
        F: for<'b> FnOnce(&mut Context<'b>) + Send + 'static,
    {
        self.conn.executor().schedule(self.stage, delay, task(f))
    }

    /// Runs `f` on this stage's context once `promise` completes.
    ///
    /// The continuation always runs as a separate executor task, even when
    /// the promise has already completed.
    pub fn on_complete<T, F>(&self, promise: &Promise<T>, f: F)
    where
        T: Clone + Send + 'static,
        F: for<'b> FnOnce(&mut Context<'b>, Result<T, Error>) + Send + 'static,
    {
        let executor = self.conn.executor().clone();
        let stage = self.stage;
        promise.add_listener(move |outcome| {
            let outcome = outcome.clone();
            executor.execute(stage, task(move |ctx| f(ctx, outcome)));
        });
    }

    /// Replaces this stage with `stage` under `name`.
    ///
    /// Takes effect immediately: the next event reaches the new stage. This
    /// stage's `on_removed` runs once its current hook returns.
    pub fn replace_self(
        &mut self,
        name: &str,
        stage: impl Stage,
    ) -> Result<StageId, PipelineError> {
        self.conn.replace(self.stage, name, Box::new(stage))
    }

    /// Replaces the live stage named `old` with `stage` under `name`.
    pub fn replace(
        &mut self,
        old: &str,
        name: &str,
        stage: impl Stage,
    ) -> Result<StageId, PipelineError> {
        let target = self.lookup(old)?;
        self.conn.replace(target, name, Box::new(stage))
    }

    /// Adds `stage` before the live stage named `base`.
    pub fn add_before(
        &mut self,
        base: &str,
        name: &str,
        stage: impl Stage,
    ) -> Result<StageId, PipelineError> {
        let base = self.lookup(base)?;
        self.conn.add(Position::Before(base), name, Box::new(stage))
    }

    /// Adds `stage` after the live stage named `base`.
    pub fn add_after(
        &mut self,
        base: &str,
        name: &str,
        stage: impl Stage,
    ) -> Result<StageId, PipelineError> {
        let base = self.lookup(base)?;
        self.conn.add(Position::After(base), name, Box::new(stage))
    }

    /// Removes the live stage named `name`.
    pub fn remove(&mut self, name: &str) -> Result<(), PipelineError> {
        let target = self.lookup(name)?;
        self.conn.remove(target)
    }

    /// Removes this stage.
    pub fn remove_self(&mut self) -> Result<(), PipelineError> {
        self.conn.remove(self.stage)
    }

    /// Stores a connection attribute, returning the previous value of that type.
    pub fn insert_attr<T>(&mut self, value: T) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.conn.insert_attr(value)
    }

    /// Returns a copy of the connection attribute of type `T`.
    #[must_use]
    pub fn attr<T>(&self) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.conn.attr()
    }

    fn lookup(&self, name: &str) -> Result<StageId, PipelineError> {
        self.conn
            .pipeline
            .live_by_name(name)
            .ok_or_else(|| PipelineError::NoSuchStage(name.to_string()))
    }
}
