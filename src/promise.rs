//! Single-assignment, observable outcome cell.
//!
//! A [`Promise`] starts pending and transitions to succeeded or failed at most
//! once. Every resolution attempt uses "try" semantics: the caller learns
//! whether *its* attempt won, and losing attempts are silent no-ops.
//!
//! ```text
//!                 try_success(v) ──► Succeeded(v)
//!   Pending ──┤
//!                 try_failure(e) ──► Failed(e)
//! ```
//!
//! Completion listeners run synchronously, in registration order, on the
//! thread that won the race, after the internal lock has been released. A
//! listener added to an already-resolved promise runs immediately.
//!
//! The promise is also a [`Future`], so code outside the connection's
//! serialized context can await the outcome.
//!
//! # Example
//!
//! ```
//! use wsgate::promise::Promise;
//!
//! let promise: Promise<u32> = Promise::new();
//! assert!(promise.try_success(7));
//! assert!(!promise.try_success(8));
//! assert_eq!(promise.result().unwrap().unwrap(), 7);
//! ```

use crate::error::Error;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

type Listener<T> = Box<dyn FnOnce(&Result<T, Error>) + Send>;

enum State<T> {
    Pending {
        listeners: SmallVec<[Listener<T>; 2]>,
        wakers: SmallVec<[Waker; 1]>,
    },
    Done(Result<T, Error>),
}

/// Observable state of a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    /// Not yet resolved.
    Pending,
    /// Resolved successfully.
    Succeeded,
    /// Resolved with a failure.
    Failed,
}

/// A single-assignment outcome shared between a resolver and its observers.
pub struct Promise<T = ()> {
    inner: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Promise<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T>
where
    T: Clone + Send + 'static,
{
    /// Creates a pending promise.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(State::Pending {
                listeners: SmallVec::new(),
                wakers: SmallVec::new(),
            })),
        }
    }

    /// Creates a promise that is already succeeded.
    #[must_use]
    pub fn succeeded(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(State::Done(Ok(value)))),
        }
    }

    /// Creates a promise that is already failed.
    #[must_use]
    pub fn failed(error: Error) -> Self {
        Self {
            inner: Arc::new(Mutex::new(State::Done(Err(error)))),
        }
    }

    /// Attempts to resolve the promise as succeeded.
    ///
    /// Returns `true` if this call performed the transition.
    pub fn try_success(&self, value: T) -> bool {
        self.try_complete(Ok(value))
    }

    /// Attempts to resolve the promise as failed.
    ///
    /// Returns `true` if this call performed the transition.
    pub fn try_failure(&self, error: impl Into<Error>) -> bool {
        self.try_complete(Err(error.into()))
    }

    /// Attempts to resolve the promise with `outcome`.
    pub fn try_complete(&self, outcome: Result<T, Error>) -> bool {
        let (listeners, wakers) = {
            let mut state = self.inner.lock();
            match &mut *state {
                State::Done(_) => return false,
                State::Pending { listeners, wakers } => {
                    let listeners = std::mem::take(listeners);
                    let wakers = std::mem::take(wakers);
                    *state = State::Done(outcome.clone());
                    (listeners, wakers)
                }
            }
        };

        for listener in listeners {
            listener(&outcome);
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Returns true once the promise has been resolved either way.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(*self.inner.lock(), State::Done(_))
    }

    /// Returns true if the promise resolved successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(*self.inner.lock(), State::Done(Ok(_)))
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> PromiseState {
        match &*self.inner.lock() {
            State::Pending { .. } => PromiseState::Pending,
            State::Done(Ok(_)) => PromiseState::Succeeded,
            State::Done(Err(_)) => PromiseState::Failed,
        }
    }

    /// Returns the failure cause, if the promise failed.
    #[must_use]
    pub fn cause(&self) -> Option<Error> {
        match &*self.inner.lock() {
            State::Done(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// Returns a copy of the outcome, if resolved.
    #[must_use]
    pub fn result(&self) -> Option<Result<T, Error>> {
        match &*self.inner.lock() {
            State::Done(outcome) => Some(outcome.clone()),
            State::Pending { .. } => None,
        }
    }

    /// Registers a completion listener.
    ///
    /// Runs immediately (on the calling thread) if the promise is already
    /// resolved.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Result<T, Error>) + Send + 'static,
    {
        let done = {
            let mut state = self.inner.lock();
            match &mut *state {
                State::Pending { listeners, .. } => {
                    listeners.push(Box::new(listener));
                    return;
                }
                State::Done(outcome) => outcome.clone(),
            }
        };
        listener(&done);
    }

    /// Returns true if both handles refer to the same promise.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Future for Promise<T>
where
    T: Clone + Send + 'static,
{
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.lock();
        match &mut *state {
            State::Done(outcome) => Poll::Ready(outcome.clone()),
            State::Pending { wakers, .. } => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.lock() {
            State::Pending { listeners, .. } => format!("Pending({} listeners)", listeners.len()),
            State::Done(Ok(_)) => "Succeeded".to_string(),
            State::Done(Err(e)) => format!("Failed({e})"),
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}
