//! Per-request completion object shared between the caller and the transport.
//!
//! A request produces a ([ResponseCompleter], [ResponseFuture]) pair. The
//! completer travels with the request into the transport and is consumed when
//! the response (or an error) arrives. The future stays with the caller, who can
//! either `.await` it or register callback pairs with
//! [ResponseFuture::add_callbacks].
//!
//! Callback dispatch rules:
//! - a pair registered while the request is pending runs on the thread that
//!   completes the request, after the completion has been recorded, in
//!   registration order;
//! - a pair registered after completion runs on the registering thread before
//!   `add_callbacks` returns, unless that thread is already running callbacks.
//!   In the latter case it is queued and run by the outermost dispatch loop as
//!   soon as the currently running callback returns. This keeps continuation
//!   chains (a callback sending the next request and registering itself again)
//!   at constant stack depth no matter how many requests complete inline.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use tracing::trace;

use crate::errors::RequestError;

/// Outcome of a single request.
pub type ResponseOutcome = Result<Bytes, RequestError>;

type SuccessCallback = Box<dyn FnOnce(Bytes) + Send + 'static>;
type ErrorCallback = Box<dyn FnOnce(RequestError) + Send + 'static>;

struct CallbackPair {
    on_success: SuccessCallback,
    on_error: ErrorCallback,
}

impl CallbackPair {
    fn invoke(self, outcome: &ResponseOutcome) {
        match outcome {
            Ok(body) => (self.on_success)(body.clone()),
            Err(err) => (self.on_error)(err.clone()),
        }
    }
}

enum FutureState {
    Pending {
        callbacks: Vec<CallbackPair>,
        wakers: Vec<Waker>,
    },
    Completed(ResponseOutcome),
}

struct SharedState {
    state: Mutex<FutureState>,
}

impl SharedState {
    fn lock(&self) -> MutexGuard<'_, FutureState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn complete(&self, outcome: ResponseOutcome) {
        let (callbacks, wakers) = {
            let mut state = self.lock();
            match &mut *state {
                FutureState::Pending { callbacks, wakers } => {
                    let taken = (std::mem::take(callbacks), std::mem::take(wakers));
                    *state = FutureState::Completed(outcome.clone());
                    taken
                }
                // The completer is consumed on completion, so this is unreachable
                // unless someone completes through a second handle.
                FutureState::Completed(_) => return,
            }
        };

        trace!(
            callbacks = callbacks.len(),
            success = outcome.is_ok(),
            "Response completed"
        );

        for waker in wakers {
            waker.wake();
        }
        dispatch(callbacks.into_iter().map(|pair| (pair, outcome.clone())));
    }
}

/// The caller's handle to the outcome of one request.
///
/// Cloning the future yields another handle to the same outcome.
#[derive(Clone)]
pub struct ResponseFuture {
    shared: Arc<SharedState>,
}

/// The transport's handle used to report the outcome of one request.
///
/// Completing consumes the completer, so a request is completed at most once.
/// A completer dropped without completing fails the request with
/// [RequestError::CompleterDropped].
pub struct ResponseCompleter {
    shared: Option<Arc<SharedState>>,
    release: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl ResponseFuture {
    /// Creates a pending request and returns both of its halves.
    pub fn new() -> (ResponseCompleter, ResponseFuture) {
        let shared = Arc::new(SharedState {
            state: Mutex::new(FutureState::Pending {
                callbacks: Vec::new(),
                wakers: Vec::new(),
            }),
        });
        let completer = ResponseCompleter {
            shared: Some(shared.clone()),
            release: None,
        };
        (completer, ResponseFuture { shared })
    }

    /// Creates a future which is already completed with the given outcome.
    pub fn completed(outcome: ResponseOutcome) -> ResponseFuture {
        ResponseFuture {
            shared: Arc::new(SharedState {
                state: Mutex::new(FutureState::Completed(outcome)),
            }),
        }
    }

    /// Registers a pair of callbacks. Exactly one of them will be called,
    /// exactly once.
    ///
    /// If the request is already completed, the matching callback is called
    /// on the current thread before this method returns (see the module docs
    /// for the nested case).
    pub fn add_callbacks<S, E>(&self, on_success: S, on_error: E)
    where
        S: FnOnce(Bytes) + Send + 'static,
        E: FnOnce(RequestError) + Send + 'static,
    {
        let pair = CallbackPair {
            on_success: Box::new(on_success),
            on_error: Box::new(on_error),
        };

        let outcome = {
            let mut state = self.shared.lock();
            match &mut *state {
                FutureState::Pending { callbacks, .. } => {
                    callbacks.push(pair);
                    return;
                }
                FutureState::Completed(outcome) => outcome.clone(),
            }
        };
        dispatch(std::iter::once((pair, outcome)));
    }

    /// Returns true if the request has completed.
    pub fn is_done(&self) -> bool {
        matches!(&*self.shared.lock(), FutureState::Completed(_))
    }

    /// Returns the outcome if the request has completed.
    pub fn outcome(&self) -> Option<ResponseOutcome> {
        match &*self.shared.lock() {
            FutureState::Completed(outcome) => Some(outcome.clone()),
            FutureState::Pending { .. } => None,
        }
    }
}

impl Debug for ResponseFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.shared.lock() {
            FutureState::Pending { callbacks, .. } => f
                .debug_struct("ResponseFuture")
                .field("state", &"Pending")
                .field("callbacks", &callbacks.len())
                .finish(),
            FutureState::Completed(outcome) => f
                .debug_struct("ResponseFuture")
                .field("state", &"Completed")
                .field("outcome", outcome)
                .finish(),
        }
    }
}

impl Future for ResponseFuture {
    type Output = ResponseOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.lock();
        match &mut *state {
            FutureState::Completed(outcome) => Poll::Ready(outcome.clone()),
            FutureState::Pending { wakers, .. } => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl ResponseCompleter {
    /// Completes the request with the given outcome.
    pub fn complete(mut self, outcome: ResponseOutcome) {
        self.finish(outcome);
    }

    /// Completes the request successfully.
    pub fn succeed(self, body: Bytes) {
        self.complete(Ok(body));
    }

    /// Completes the request with an error.
    pub fn fail(self, error: impl Into<RequestError>) {
        self.complete(Err(error.into()));
    }

    // Registers an action run right before the outcome becomes visible
    // to the caller. Used to give the connection back to its pool.
    pub(crate) fn on_release(&mut self, release: impl FnOnce() + Send + 'static) {
        self.release = Some(Box::new(release));
    }

    fn finish(&mut self, outcome: ResponseOutcome) {
        if let Some(release) = self.release.take() {
            release();
        }
        if let Some(shared) = self.shared.take() {
            shared.complete(outcome);
        }
    }
}

impl Debug for ResponseCompleter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCompleter")
            .field("completed", &self.shared.is_none())
            .finish_non_exhaustive()
    }
}

impl Drop for ResponseCompleter {
    fn drop(&mut self) {
        if self.shared.is_some() {
            self.finish(Err(RequestError::CompleterDropped));
        }
    }
}

thread_local! {
    // Some(_) while this thread is inside the dispatch loop.
    static DISPATCH_QUEUE: RefCell<Option<VecDeque<(CallbackPair, ResponseOutcome)>>> =
        const { RefCell::new(None) };
}

struct DispatchLoopGuard;

impl Drop for DispatchLoopGuard {
    fn drop(&mut self) {
        DISPATCH_QUEUE.with(|queue| *queue.borrow_mut() = None);
    }
}

fn dispatch(jobs: impl Iterator<Item = (CallbackPair, ResponseOutcome)>) {
    let nested = DISPATCH_QUEUE.with(|queue| {
        let mut queue = queue.borrow_mut();
        match queue.as_mut() {
            Some(pending) => {
                pending.extend(jobs);
                true
            }
            None => {
                *queue = Some(jobs.collect());
                false
            }
        }
    });
    if nested {
        return;
    }

    let _guard = DispatchLoopGuard;
    loop {
        let next = DISPATCH_QUEUE.with(|queue| {
            queue
                .borrow_mut()
                .as_mut()
                .and_then(VecDeque::pop_front)
        });
        match next {
            Some((pair, outcome)) => pair.invoke(&outcome),
            None => break,
        }
    }
}
