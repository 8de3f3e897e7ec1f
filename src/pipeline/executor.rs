//! Serialized per-connection task executor with a virtual clock.
//!
//! Every connection owns one [`EventExecutor`]. All deferred work for the
//! connection (write-completion continuations, handshake timeouts, forced
//! close timers) is queued here and run one task at a time by the
//! connection driver, so no two mutations of a connection's state ever race.
//!
//! Time is virtual: the clock only moves when the driver advances it. Timers
//! whose deadline has been reached run in deadline order; timers sharing a
//! deadline run in submission order.
//!
//! ```text
//!   execute(task) ──► immediate queue ──┐
//!                                       ├──► driver runs (StageId, Task)
//!   schedule(d, t) ─► deadline heap ────┘     one at a time
//! ```

use crate::pipeline::Context;
use crate::tracing_compat::trace;
use crate::types::{StageId, Time, TimerId};
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A unit of deferred work, run against the context of the stage that queued it.
pub type Task = Box<dyn for<'a> FnOnce(&mut Context<'a>) + Send>;

/// Boxes a closure as a [`Task`].
pub fn task<F>(f: F) -> Task
where
    F: for<'a> FnOnce(&mut Context<'a>) + Send + 'static,
{
    Box::new(f)
}

const ARMED: u8 = 0;
const CANCELLED: u8 = 1;
const FIRED: u8 = 2;

/// Observable state of a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Waiting for its deadline.
    Armed,
    /// Cancelled before it fired.
    Cancelled,
    /// Its action has run (or is running).
    Fired,
}

/// Handle to a scheduled action.
///
/// A timer leaves the `Armed` state exactly once, either by firing or by
/// being cancelled. Cancelling a timer that already fired is a no-op.
#[derive(Clone)]
pub struct TimerHandle {
    id: TimerId,
    deadline: Time,
    state: Arc<AtomicU8>,
}

impl TimerHandle {
    fn new(id: TimerId, deadline: Time) -> Self {
        Self {
            id,
            deadline,
            state: Arc::new(AtomicU8::new(ARMED)),
        }
    }

    /// Returns the timer ID.
    #[must_use]
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Returns the virtual time at which the timer fires.
    #[must_use]
    pub fn deadline(&self) -> Time {
        self.deadline
    }

    /// Cancels the timer.
    ///
    /// Returns `true` if this call moved the timer from `Armed` to
    /// `Cancelled`; `false` if it had already fired or been cancelled.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(ARMED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            trace!(timer = %self.id, "timer cancelled");
        }
        cancelled
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TimerState {
        match self.state.load(Ordering::Acquire) {
            ARMED => TimerState::Armed,
            CANCELLED => TimerState::Cancelled,
            _ => TimerState::Fired,
        }
    }

    /// Returns true if the timer was cancelled before firing.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state() == TimerState::Cancelled
    }

    /// Returns true if the timer fired.
    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.state() == TimerState::Fired
    }

    fn try_fire(&self) -> bool {
        self.state
            .compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("id", &self.id)
            .field("deadline", &self.deadline)
            .field("state", &self.state())
            .finish()
    }
}

struct Scheduled {
    deadline: Time,
    seq: u64,
    stage: StageId,
    handle: TimerHandle,
    task: Task,
}

impl Eq for Scheduled {}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Min-heap ordering: earliest deadline first, then submission order
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Heap size below which cancelled timers are left for `pop_due` to skip.
const MIN_PRUNE_LEN: usize = 64;

struct Inner {
    now: Time,
    next_seq: u64,
    immediate: VecDeque<(StageId, Task)>,
    scheduled: BinaryHeap<Scheduled>,
    // Heap length that triggers the next sweep of cancelled timers.
    prune_at: usize,
}

/// The serialized execution context of one connection.
///
/// Cloning yields another handle to the same queue, so completion listeners
/// can enqueue continuations without borrowing the connection.
#[derive(Clone)]
pub struct EventExecutor {
    inner: Arc<Mutex<Inner>>,
}

impl Default for EventExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl EventExecutor {
    /// Creates an executor whose clock starts at [`Time::ZERO`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                now: Time::ZERO,
                next_seq: 0,
                immediate: VecDeque::new(),
                scheduled: BinaryHeap::new(),
                prune_at: MIN_PRUNE_LEN,
            })),
        }
    }

    /// Current virtual time.
    #[must_use]
    pub fn now(&self) -> Time {
        self.inner.lock().now
    }

    /// Queues `task` to run on the context of `stage` at the next turn.
    pub fn execute(&self, stage: StageId, task: Task) {
        self.inner.lock().immediate.push_back((stage, task));
    }

    /// Schedules `task` to run on the context of `stage` once `delay` has
    /// elapsed on the virtual clock.
    ///
    /// A zero delay still defers the task to a later turn.
    pub fn schedule(&self, stage: StageId, delay: Duration, task: Task) -> TimerHandle {
        let mut inner = self.inner.lock();
        if inner.scheduled.len() >= inner.prune_at {
            Self::prune_cancelled(&mut inner);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let deadline = inner.now + delay;
        let handle = TimerHandle::new(TimerId(seq), deadline);
        trace!(timer = %handle.id, deadline = %deadline, stage = %stage, "timer armed");
        inner.scheduled.push(Scheduled {
            deadline,
            seq,
            stage,
            handle: handle.clone(),
            task,
        });
        handle
    }

    /// Moves the virtual clock forward by `delta`.
    pub fn advance_time_by(&self, delta: Duration) {
        let mut inner = self.inner.lock();
        inner.now = inner.now + delta;
    }

    /// Moves the virtual clock to `time` if it lies in the future.
    pub fn advance_time_to(&self, time: Time) {
        let mut inner = self.inner.lock();
        if time > inner.now {
            inner.now = time;
        }
    }

    /// Deadline of the earliest armed timer.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Time> {
        let mut inner = self.inner.lock();
        Self::discard_cancelled(&mut inner);
        inner.scheduled.peek().map(|s| s.deadline)
    }

    /// Number of queued immediate tasks.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.inner.lock().immediate.len()
    }

    /// Number of timers still armed.
    #[must_use]
    pub fn armed_timers(&self) -> usize {
        self.inner
            .lock()
            .scheduled
            .iter()
            .filter(|s| s.handle.state() == TimerState::Armed)
            .count()
    }

    pub(crate) fn pop_immediate(&self) -> Option<(StageId, Task)> {
        self.inner.lock().immediate.pop_front()
    }

    /// Pops the next timer whose deadline has been reached, marking it fired.
    pub(crate) fn pop_due(&self) -> Option<(StageId, Task)> {
        let mut inner = self.inner.lock();
        loop {
            let due = inner
                .scheduled
                .peek()
                .is_some_and(|s| s.deadline <= inner.now);
            if !due {
                return None;
            }
            let entry = inner.scheduled.pop()?;
            if entry.handle.try_fire() {
                trace!(timer = %entry.handle.id, now = %inner.now, "timer fired");
                return Some((entry.stage, entry.task));
            }
        }
    }

    /// Drops every queued task and timer, cancelling armed timers.
    pub(crate) fn shutdown(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.immediate.len();
        inner.immediate.clear();
        for entry in inner.scheduled.drain() {
            entry.handle.cancel();
        }
        dropped
    }

    /// Drops every cancelled timer from the heap, not just those at the top.
    ///
    /// The next sweep waits until the heap has doubled, so the cost stays
    /// amortized O(1) per `schedule`.
    fn prune_cancelled(inner: &mut Inner) {
        let before = inner.scheduled.len();
        inner
            .scheduled
            .retain(|s| s.handle.state() == TimerState::Armed);
        let after = inner.scheduled.len();
        inner.prune_at = (after * 2).max(MIN_PRUNE_LEN);
        trace!(pruned = before - after, remaining = after, "cancelled timers pruned");
    }

    fn discard_cancelled(inner: &mut Inner) {
        while inner
            .scheduled
            .peek()
            .is_some_and(|s| s.handle.state() != TimerState::Armed)
        {
            inner.scheduled.pop();
        }
    }
}

impl fmt::Debug for EventExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("EventExecutor")
            .field("now", &inner.now)
            .field("immediate", &inner.immediate.len())
            .field("scheduled", &inner.scheduled.len())
            .finish()
    }
}
