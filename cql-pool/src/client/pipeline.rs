//! Keeping a fixed window of requests in flight.
//!
//! [Pipeline] does it with callbacks: every completion callback issues the
//! next request and registers itself on it, so no task is parked per request.
//! [run_windowed] does the same with a stream of futures, for callers that
//! are already async.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Notify;
use tracing::{error, trace};

use crate::errors::RequestError;
use crate::response::ResponseFuture;

/// Summary of a finished pipelined run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSummary {
    /// Number of requests which completed, successfully or not.
    pub completed: usize,
    /// Number of requests which completed with an error.
    pub failed: usize,
    /// Highest number of requests outstanding at the same time.
    pub max_outstanding: usize,
}

/// Runs `total` requests, at most `window` of them outstanding at any time.
///
/// Each request is produced by calling `issue` with its index. `issue` is
/// called from completion callbacks, so it must not block; see
/// [HostConnectionPool::execute_async](crate::network::HostConnectionPool::execute_async).
pub struct Pipeline<F> {
    issue: F,
    total: usize,
    window: usize,
    started: AtomicUsize,
    finished: AtomicUsize,
    failed: AtomicUsize,
    outstanding: AtomicUsize,
    max_outstanding: AtomicUsize,
    done: AtomicBool,
    done_notify: Notify,
}

impl<F> Pipeline<F>
where
    F: Fn(usize) -> ResponseFuture + Send + Sync + 'static,
{
    /// Issues the first `window` requests and returns the running pipeline.
    ///
    /// A window of 0 is treated as 1.
    pub fn start(total: usize, window: usize, issue: F) -> Arc<Self> {
        let window = window.max(1);
        let pipeline = Arc::new(Self {
            issue,
            total,
            window,
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            max_outstanding: AtomicUsize::new(0),
            done: AtomicBool::new(total == 0),
            done_notify: Notify::new(),
        });

        trace!(total, window, "Starting pipeline");
        for _ in 0..window.min(total) {
            pipeline.issue_next();
        }
        pipeline
    }

    /// Waits until all requests have completed.
    pub async fn wait(&self) -> PipelineSummary {
        loop {
            let notified = self.done_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.done.load(Ordering::Acquire) {
                return self.summary();
            }
            notified.await;
        }
    }

    /// Returns true once all requests have completed.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Current counters of the pipeline.
    pub fn summary(&self) -> PipelineSummary {
        PipelineSummary {
            completed: self.finished.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
            max_outstanding: self.max_outstanding.load(Ordering::Acquire),
        }
    }

    /// Configured window size.
    pub fn window(&self) -> usize {
        self.window
    }

    fn issue_next(self: &Arc<Self>) {
        let total = self.total;
        let Ok(index) = self
            .started
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < total).then_some(n + 1)
            })
        else {
            return;
        };

        let outstanding = self.outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_outstanding.fetch_max(outstanding, Ordering::AcqRel);

        let future = (self.issue)(index);
        let on_success = self.clone();
        let on_error = self.clone();
        future.add_callbacks(
            move |_| on_success.on_complete(None),
            move |err| on_error.on_complete(Some(err)),
        );
    }

    fn on_complete(self: &Arc<Self>, error: Option<RequestError>) {
        if let Some(err) = error {
            error!("Error on pipelined request: {}", err);
            self.failed.fetch_add(1, Ordering::AcqRel);
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel);

        let finished = self.finished.fetch_add(1, Ordering::AcqRel) + 1;
        if finished >= self.total {
            trace!(finished, "Pipeline finished");
            self.done.store(true, Ordering::Release);
            self.done_notify.notify_waiters();
            return;
        }
        self.issue_next();
    }
}

/// Runs `total` requests, at most `window` of them outstanding at any time,
/// by polling their futures instead of chaining callbacks.
pub async fn run_windowed<F>(total: usize, window: usize, mut issue: F) -> PipelineSummary
where
    F: FnMut(usize) -> ResponseFuture,
{
    let outstanding = &AtomicUsize::new(0);
    let max_outstanding = &AtomicUsize::new(0);

    let outcomes: Vec<bool> = futures::stream::iter(0..total)
        .map(move |index| {
            let now = outstanding.fetch_add(1, Ordering::Relaxed) + 1;
            max_outstanding.fetch_max(now, Ordering::Relaxed);
            let future = issue(index);
            async move {
                let result = future.await;
                outstanding.fetch_sub(1, Ordering::Relaxed);
                if let Err(err) = &result {
                    error!("Error on pipelined request: {}", err);
                }
                result.is_ok()
            }
        })
        .buffer_unordered(window.max(1))
        .collect()
        .await;

    PipelineSummary {
        completed: outcomes.len(),
        failed: outcomes.iter().filter(|ok| !**ok).count(),
        max_outstanding: max_outstanding.load(Ordering::Relaxed),
    }
}
