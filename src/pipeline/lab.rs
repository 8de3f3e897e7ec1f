//! In-process connection driver.
//!
//! A [`LabConnection`] owns a [`Connection`] and drives it without any real
//! I/O:
//! - Inbound bytes are injected at the head
//! - Bytes written at the head are collected in an outbound queue
//! - Queued tasks run when the driver asks, one at a time
//! - Time is virtual and only moves when advanced
//!
//! Every driver call that injects an event runs the pending tasks before it
//! returns, so tests observe the connection at rest.

use crate::error::Error;
use crate::pipeline::connection::Connection;
use crate::pipeline::pipeline::Position;
use crate::pipeline::{Context, EventExecutor, Message, PipelineError, Stage, Task, UserEvent};
use crate::promise::Promise;
use crate::tracing_compat::{debug, trace};
use crate::types::{ConnectionId, StageId, Time};
use bytes::Bytes;
use std::time::Duration;

/// A connection driven entirely in-process.
#[derive(Debug)]
pub struct LabConnection {
    conn: Connection,
}

impl Default for LabConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl LabConnection {
    /// Creates an inactive, empty, plaintext connection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            conn: Connection::new(false),
        }
    }

    /// Creates an inactive, empty connection that reports itself as TLS-secured.
    #[must_use]
    pub fn secure() -> Self {
        Self {
            conn: Connection::new(true),
        }
    }

    /// Connection ID.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    /// The connection's executor.
    #[must_use]
    pub fn executor(&self) -> &EventExecutor {
        self.conn.executor()
    }

    /// Appends `stage` at the tail of the pipeline.
    pub fn add_last(&mut self, name: &str, stage: impl Stage) -> Result<StageId, PipelineError> {
        let id = self.conn.add(Position::Last, name, Box::new(stage))?;
        self.run_pending_tasks();
        Ok(id)
    }

    /// Marks the connection active and fires activation from the head.
    pub fn activate(&mut self) {
        self.conn.activate();
        self.run_pending_tasks();
    }

    /// True while the connection is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.conn.is_active()
    }

    /// Delivers `bytes` at the head as if read from the transport.
    ///
    /// Returns true if any message is waiting at the tail afterwards.
    pub fn write_inbound(&mut self, bytes: impl Into<Bytes>) -> bool {
        self.write_inbound_message(Message::Bytes(bytes.into()))
    }

    /// Delivers an arbitrary message at the head.
    pub fn write_inbound_message(&mut self, msg: Message) -> bool {
        trace!(conn = %self.conn.id(), kind = msg.kind(), "inbound message injected");
        self.conn.fire_read(StageId::HEAD, msg);
        self.run_pending_tasks();
        !self.conn.tail.messages.is_empty()
    }

    /// Pops the next message that reached the tail.
    pub fn read_inbound(&mut self) -> Option<Message> {
        self.conn.tail.messages.pop_front()
    }

    /// Writes `msg` from the tail and flushes.
    pub fn write_outbound(&mut self, msg: impl Into<Message>) -> Promise {
        let promise = Promise::new();
        self.conn
            .fire_write(StageId::TAIL, msg.into(), promise.clone());
        self.conn.flush();
        self.run_pending_tasks();
        promise
    }

    /// Flushes pending writes and runs what their completion schedules.
    pub fn flush(&mut self) {
        self.conn.flush();
        self.run_pending_tasks();
    }

    /// Pops the next flushed outbound buffer.
    pub fn read_outbound(&mut self) -> Option<Bytes> {
        self.conn.pop_outbound()
    }

    /// Pops every flushed outbound buffer.
    pub fn drain_outbound(&mut self) -> Vec<Bytes> {
        std::iter::from_fn(|| self.conn.pop_outbound()).collect()
    }

    /// User events that reached the tail, in order.
    #[must_use]
    pub fn user_events(&self) -> &[UserEvent] {
        &self.conn.tail.events
    }

    /// Takes the user events that reached the tail.
    pub fn take_user_events(&mut self) -> Vec<UserEvent> {
        std::mem::take(&mut self.conn.tail.events)
    }

    /// Errors that reached the tail, in order.
    #[must_use]
    pub fn errors(&self) -> &[Error] {
        &self.conn.tail.errors
    }

    /// Fires a user event from the head.
    pub fn fire_user_event(&mut self, event: UserEvent) {
        self.conn.fire_user_event(StageId::HEAD, event);
        self.run_pending_tasks();
    }

    /// Runs queued tasks and due timers until none are left.
    pub fn run_pending_tasks(&mut self) {
        loop {
            while let Some((stage, task)) = self.conn.executor().pop_immediate() {
                self.run_task(stage, task);
            }
            match self.conn.executor().pop_due() {
                Some((stage, task)) => self.run_task(stage, task),
                None => break,
            }
        }
    }

    /// Runs due timers (and the tasks they queue); returns the next deadline.
    pub fn run_scheduled_pending_tasks(&mut self) -> Option<Time> {
        self.run_pending_tasks();
        self.conn.executor().next_deadline()
    }

    /// Advances the virtual clock by `delta` and runs everything that became due.
    pub fn advance_time_by(&mut self, delta: Duration) {
        self.conn.executor().advance_time_by(delta);
        self.run_pending_tasks();
    }

    /// Current virtual time.
    #[must_use]
    pub fn now(&self) -> Time {
        self.conn.executor().now()
    }

    /// Closes the connection and runs the resulting tasks.
    pub fn close(&mut self) -> Promise {
        let promise = self.conn.close();
        self.run_pending_tasks();
        promise
    }

    /// Promise completed when the connection closes.
    #[must_use]
    pub fn close_future(&self) -> Promise {
        self.conn.close_future()
    }

    /// Live stage names in pipeline order.
    #[must_use]
    pub fn pipeline_names(&self) -> Vec<String> {
        self.conn.pipeline.names()
    }

    /// Makes every later flush fail with `failure`, or restores normal
    /// flushing with `None`. Failed writes never reach the outbound queue.
    pub fn set_write_failure(&mut self, failure: Option<Error>) {
        self.conn.set_write_failure(failure);
    }

    /// Returns a copy of the connection attribute of type `T`.
    #[must_use]
    pub fn attr<T>(&self) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.conn.attr()
    }

    /// Closes the connection, runs what remains, then drops every queued
    /// message, buffer, and timer.
    ///
    /// Returns true if anything was left unread.
    pub fn finish_and_release_all(&mut self) -> bool {
        self.close();
        let mut leftovers = self.conn.has_outbound() || !self.conn.tail.messages.is_empty();
        while self.conn.pop_outbound().is_some() {}
        self.conn.tail.messages.clear();
        let dropped = self.conn.executor().shutdown();
        leftovers |= dropped > 0;
        debug!(conn = %self.conn.id(), leftovers, "lab connection released");
        leftovers
    }

    fn run_task(&mut self, stage: StageId, task: Task) {
        let mut ctx = Context::new(&mut self.conn, stage);
        task(&mut ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Records every inbound hook and passes the event on.
    struct Recorder {
        tag: &'static str,
        log: Log,
    }

    impl Recorder {
        fn push(&self, what: &str) {
            self.log.lock().push(format!("{}:{what}", self.tag));
        }
    }

    impl Stage for Recorder {
        fn on_added(&mut self, _ctx: &mut Context<'_>) {
            self.push("added");
        }

        fn on_removed(&mut self, _ctx: &mut Context<'_>) {
            self.push("removed");
        }

        fn on_active(&mut self, ctx: &mut Context<'_>) {
            self.push("active");
            ctx.fire_active();
        }

        fn on_inactive(&mut self, ctx: &mut Context<'_>) {
            self.push("inactive");
            ctx.fire_inactive();
        }

        fn on_read(&mut self, ctx: &mut Context<'_>, msg: Message) {
            self.push("read");
            ctx.fire_read(msg);
        }
    }

    /// Prefixes outbound bytes with a marker byte.
    struct Tagger(u8);

    impl Stage for Tagger {
        fn handles_inbound(&self) -> bool {
            false
        }

        fn handles_outbound(&self) -> bool {
            true
        }

        fn on_write(&mut self, ctx: &mut Context<'_>, msg: Message, promise: Promise) {
            let Message::Bytes(bytes) = msg else {
                ctx.forward_write(msg, promise);
                return;
            };
            let mut tagged = vec![self.0];
            tagged.extend_from_slice(&bytes);
            ctx.forward_write(Message::Bytes(tagged.into()), promise);
        }
    }

    /// Replaces itself on the first read, then forwards the read.
    struct SwapOnRead {
        log: Log,
    }

    impl Stage for SwapOnRead {
        fn on_read(&mut self, ctx: &mut Context<'_>, msg: Message) {
            let log = Arc::clone(&self.log);
            ctx.replace_self("swapped", Recorder { tag: "new", log })
                .expect("replace self");
            ctx.fire_read(msg);
        }

        fn on_removed(&mut self, _ctx: &mut Context<'_>) {
            self.log.lock().push("old:removed".into());
        }
    }

    fn recorder(tag: &'static str, log: &Log) -> Recorder {
        Recorder {
            tag,
            log: Arc::clone(log),
        }
    }

    #[test]
    fn inbound_events_visit_stages_in_order() {
        init_test_logging();
        let log = Log::default();
        let mut conn = LabConnection::new();
        conn.add_last("a", recorder("a", &log)).unwrap();
        conn.add_last("b", recorder("b", &log)).unwrap();
        conn.activate();
        assert!(conn.write_inbound(Bytes::from_static(b"x")));

        assert_eq!(
            *log.lock(),
            vec!["a:added", "b:added", "a:active", "b:active", "a:read", "b:read"]
        );
        assert!(matches!(conn.read_inbound(), Some(Message::Bytes(b)) if b == "x"));
        assert!(conn.read_inbound().is_none());
    }

    #[test]
    fn outbound_writes_visit_stages_towards_the_head() {
        let mut conn = LabConnection::new();
        conn.add_last("outer", Tagger(b'1')).unwrap();
        conn.add_last("inner", Tagger(b'2')).unwrap();
        conn.activate();

        let promise = conn.write_outbound(Bytes::from_static(b"x"));
        assert!(promise.is_success());
        assert_eq!(conn.read_outbound().unwrap(), Bytes::from_static(b"12x"));
    }

    #[test]
    fn write_on_inactive_connection_fails_closed() {
        let mut conn = LabConnection::new();
        let promise = conn.write_outbound(Bytes::from_static(b"x"));
        assert!(matches!(promise.cause(), Some(Error::Closed)));
        assert!(conn.read_outbound().is_none());
    }

    #[test]
    fn unencoded_message_fails_at_the_head() {
        let mut conn = LabConnection::new();
        conn.activate();
        let frame = crate::net::websocket::Frame::text("hi");
        let promise = conn.write_outbound(frame);
        assert!(matches!(
            promise.cause(),
            Some(Error::Pipeline(PipelineError::Unencoded("frame")))
        ));
    }

    #[test]
    fn injected_write_failure_fails_the_promise() {
        let mut conn = LabConnection::new();
        conn.activate();
        conn.set_write_failure(Some(Error::Closed));
        let promise = conn.write_outbound(Bytes::from_static(b"x"));
        assert!(matches!(promise.cause(), Some(Error::Closed)));
        assert!(conn.read_outbound().is_none());
    }

    #[test]
    fn replace_self_hands_the_next_event_to_the_replacement() {
        init_test_logging();
        let log = Log::default();
        let mut conn = LabConnection::new();
        conn.add_last("swap", SwapOnRead { log: Arc::clone(&log) })
            .unwrap();
        conn.add_last("tail", recorder("tail", &log)).unwrap();
        log.lock().clear();

        conn.write_inbound(Bytes::from_static(b"1"));
        conn.write_inbound(Bytes::from_static(b"2"));

        assert_eq!(conn.pipeline_names(), vec!["swapped", "tail"]);
        assert_eq!(
            *log.lock(),
            vec![
                "new:added",
                "new:read",
                "tail:read",
                "old:removed",
                "new:read",
                "tail:read",
            ]
        );
    }

    #[test]
    fn close_fires_inactive_once_and_completes_close_future() {
        let log = Log::default();
        let mut conn = LabConnection::new();
        conn.add_last("a", recorder("a", &log)).unwrap();
        conn.activate();
        let close = conn.close_future();
        assert!(!close.is_done());

        conn.close();
        conn.close();
        assert!(close.is_success());
        assert!(!conn.is_active());
        let inactive = log.lock().iter().filter(|e| *e == "a:inactive").count();
        assert_eq!(inactive, 1);
    }

    #[test]
    fn scheduled_tasks_run_when_time_advances() {
        struct Arm(Log);
        impl Stage for Arm {
            fn on_active(&mut self, ctx: &mut Context<'_>) {
                let log = Arc::clone(&self.0);
                ctx.schedule(Duration::from_millis(50), move |ctx| {
                    log.lock().push(format!("fired@{}", ctx.now().as_millis()));
                });
            }
        }

        let log = Log::default();
        let mut conn = LabConnection::new();
        conn.add_last("arm", Arm(Arc::clone(&log))).unwrap();
        conn.activate();
        assert_eq!(conn.run_scheduled_pending_tasks(), Some(Time::from_millis(50)));

        conn.advance_time_by(Duration::from_millis(49));
        assert!(log.lock().is_empty());
        conn.advance_time_by(Duration::from_millis(1));
        assert_eq!(*log.lock(), vec!["fired@50"]);
    }

    #[test]
    fn finish_and_release_all_reports_leftovers() {
        let mut conn = LabConnection::new();
        conn.activate();
        conn.write_inbound(Bytes::from_static(b"unread"));
        assert!(conn.finish_and_release_all());
        assert!(conn.read_inbound().is_none());

        let mut clean = LabConnection::new();
        clean.activate();
        assert!(!clean.finish_and_release_all());
    }

    #[test]
    fn removing_a_stage_mid_pipeline_keeps_routing() {
        let log = Log::default();
        let mut conn = LabConnection::new();
        conn.add_last("a", recorder("a", &log)).unwrap();
        conn.add_last("b", recorder("b", &log)).unwrap();
        conn.add_last("c", recorder("c", &log)).unwrap();

        conn.conn.remove(conn.conn.pipeline.live_by_name("b").unwrap())
            .unwrap();
        log.lock().clear();
        conn.write_inbound(Bytes::from_static(b"x"));
        assert_eq!(*log.lock(), vec!["a:read", "c:read"]);
        assert_eq!(conn.pipeline_names(), vec!["a", "c"]);
    }
}
