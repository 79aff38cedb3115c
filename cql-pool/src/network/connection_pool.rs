use super::connection::{Connection, PooledConnection};

use crate::cluster::{Host, HostDistance};
use crate::errors::{
    BrokenConnectionError, BrokenConnectionErrorKind, ConnectionError, ConnectionPoolError,
    NoConnectionsReason,
};
use crate::observability::metrics::PoolMetrics;
use crate::policies::{PoolSizing, PoolSizingPolicy};
use crate::response::{ResponseCompleter, ResponseFuture};
use crate::utils::futures::BoxedFuture;

use async_trait::async_trait;
use bytes::Bytes;
use itertools::Itertools;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// The session-side collaborator of a [HostConnectionPool].
///
/// It knows which keyspace new connections should use, how large pools
/// should be, how to open a connection, and where background work runs.
#[async_trait]
pub trait PoolSession: Send + Sync + 'static {
    /// The transport type produced by [PoolSession::open_connection].
    type Connection: Connection;

    /// Keyspace which every connection handed out by the pool must use.
    fn keyspace(&self) -> Option<String>;

    /// Sizing policy, queried anew on every pool decision.
    fn pool_sizing(&self) -> &dyn PoolSizingPolicy;

    /// Opens a new, authenticated connection to `host`.
    async fn open_connection(&self, host: &Host) -> Result<Self::Connection, ConnectionError>;

    /// Runs `task` off the calling thread.
    ///
    /// `runtime` is the runtime the pool was created on. The pool may submit
    /// from threads outside of any runtime (e.g. a transport's completion
    /// thread), so implementations must not rely on an ambient runtime context.
    fn submit(&self, runtime: &Handle, task: BoxedFuture<'static, ()>) {
        runtime.spawn(task);
    }
}

// TODO: Make it configurable through the pool sizing policy
const MIN_FILL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_FILL_BACKOFF: Duration = Duration::from_secs(10);
const FILL_BACKOFF_MULTIPLIER: u32 = 2;

// A simple exponential strategy for connection creation retries.
#[derive(Debug)]
struct RefillDelayStrategy {
    current_delay: Duration,
}

impl RefillDelayStrategy {
    fn new() -> Self {
        Self {
            current_delay: MIN_FILL_BACKOFF,
        }
    }

    fn get_delay(&self) -> Duration {
        self.current_delay
    }

    fn on_successful_fill(&mut self) {
        self.current_delay = MIN_FILL_BACKOFF;
    }

    fn on_fill_error(&mut self) {
        self.current_delay = std::cmp::min(
            MAX_FILL_BACKOFF,
            self.current_delay * FILL_BACKOFF_MULTIPLIER,
        );
    }
}

/// A connection handed out by a [HostConnectionPool] for session type `S`.
pub type PoolEntry<S> = Arc<PooledConnection<<S as PoolSession>::Connection>>;

struct PoolState<C> {
    // Connections which accept new requests.
    open: Vec<Arc<PooledConnection<C>>>,
    // Connections which are being drained; closed once idle.
    trash: Vec<Arc<PooledConnection<C>>>,
    // Creation tasks submitted to the executor and not finished yet.
    scheduled_for_creation: usize,
    refill_delay_strategy: RefillDelayStrategy,
    is_shutdown: bool,
}

struct PoolInner<S: PoolSession> {
    host: Host,
    distance: HostDistance,
    session: Arc<S>,
    // Background work is spawned here, whichever thread triggers it.
    runtime: Handle,
    state: Mutex<PoolState<S::Connection>>,
    // Signaled when a connection may have gained capacity or a new one appeared.
    capacity_notify: Notify,
    metrics: Arc<PoolMetrics>,
}

/// A pool of multiplexed connections to a single host.
///
/// Borrowing a connection admits one request onto it: the connection's
/// in-flight counter is incremented in the same critical section that selects
/// it, and a connection is never handed out at its capacity. Returning the
/// connection gives the slot back and may retire the connection when the pool
/// holds more than its core number of connections.
///
/// Opening connections never happens on the borrowing or returning task;
/// it is delegated to [PoolSession::submit].
pub struct HostConnectionPool<S: PoolSession> {
    inner: Arc<PoolInner<S>>,
}

impl<S: PoolSession> Clone for HostConnectionPool<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: PoolSession> std::fmt::Debug for HostConnectionPool<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock_state();
        let describe = |conns: &Vec<PoolEntry<S>>| {
            conns
                .iter()
                .map(|conn| format!("{:p}(in_flight: {})", Arc::as_ptr(conn), conn.in_flight()))
                .format(", ")
                .to_string()
        };
        f.debug_struct("HostConnectionPool")
            .field("host", &self.inner.host.address)
            .field("distance", &self.inner.distance)
            .field("open", &describe(&state.open))
            .field("trash", &describe(&state.trash))
            .field("scheduled_for_creation", &state.scheduled_for_creation)
            .field("is_shutdown", &state.is_shutdown)
            .finish()
    }
}

impl<S: PoolSession> HostConnectionPool<S> {
    /// Creates a pool and opens its core connections.
    ///
    /// Must be called from within a tokio runtime; the pool runs its
    /// background work on that runtime.
    ///
    /// Fails only if none of the core connections could be opened. If some of
    /// them fail, the pool starts smaller and refills in the background.
    pub async fn new(
        host: Host,
        distance: HostDistance,
        session: Arc<S>,
    ) -> Result<Self, ConnectionError> {
        let inner = Arc::new(PoolInner {
            host,
            distance,
            session,
            runtime: Handle::current(),
            state: Mutex::new(PoolState {
                open: Vec::new(),
                trash: Vec::new(),
                scheduled_for_creation: 0,
                refill_delay_strategy: RefillDelayStrategy::new(),
                is_shutdown: false,
            }),
            capacity_notify: Notify::new(),
            metrics: Arc::new(PoolMetrics::new()),
        });

        let core_connections = inner.sizing().core_connections;
        debug!(
            "[{}] Opening {} core connections ({} host)",
            inner.address(),
            core_connections,
            inner.distance,
        );

        let results =
            futures::future::join_all((0..core_connections).map(|_| inner.open_connection()))
                .await;

        let mut last_error = None;
        {
            let mut state = inner.lock_state();
            for result in results {
                match result {
                    Ok(conn) => state.open.push(conn),
                    Err(err) => {
                        warn!("[{}] Failed to open core connection: {}", inner.address(), err);
                        inner.metrics.inc_connection_failures();
                        last_error = Some(err);
                    }
                }
            }

            if let Some(err) = last_error {
                if state.open.is_empty() {
                    return Err(err);
                }
                inner.maybe_schedule_creation(&mut state, core_connections);
            }
        }

        Ok(Self { inner })
    }

    /// Borrows a connection with spare capacity, waiting up to `timeout` for one.
    ///
    /// The returned connection already counts the caller's request in its
    /// in-flight counter; give it back with [HostConnectionPool::return_connection].
    pub async fn borrow_connection(
        &self,
        timeout: Duration,
    ) -> Result<PoolEntry<S>, ConnectionPoolError> {
        let conn = self.inner.wait_for_connection(timeout).await?;
        self.bind_keyspace(conn).await
    }

    /// Gives back a slot previously taken by [HostConnectionPool::borrow_connection].
    ///
    /// Never blocks. Defunct connections are dropped from the pool, idle
    /// connections above the core count are retired, and one waiting borrower
    /// is woken up.
    pub fn return_connection(&self, connection: &PoolEntry<S>) {
        self.inner.return_connection(connection);
    }

    /// Retires `connection` regardless of the core connection count.
    ///
    /// The connection stops accepting requests immediately and is closed as
    /// soon as its outstanding requests finish.
    pub fn trash_connection(&self, connection: &PoolEntry<S>) {
        self.inner.trash_connection(connection);
    }

    /// Borrows a connection, sends `request` on it and returns the future of
    /// the response. The connection is returned to the pool before any
    /// callback of the future runs.
    pub async fn send_request(
        &self,
        request: Bytes,
        timeout: Duration,
    ) -> Result<ResponseFuture, ConnectionPoolError> {
        let conn = self.borrow_connection(timeout).await?;
        let (completer, future) = ResponseFuture::new();
        self.send_on(conn, request, completer);
        Ok(future)
    }

    /// Sends `request` without waiting, suitable for use inside callbacks.
    ///
    /// If a connection with spare capacity and the right keyspace is at hand,
    /// the request is sent on the calling thread. Otherwise borrowing (with
    /// `timeout`) continues on the session's executor. Pool errors are
    /// delivered through the returned future.
    pub fn execute_async(&self, request: Bytes, timeout: Duration) -> ResponseFuture {
        let (completer, future) = ResponseFuture::new();
        let keyspace = self.inner.session.keyspace();

        match self.inner.try_borrow() {
            Err(err) => completer.fail(err),
            Ok(Some(conn)) if conn.has_keyspace(keyspace.as_deref()) => {
                self.send_on(conn, request, completer);
            }
            Ok(Some(conn)) => {
                let pool = self.clone();
                self.inner.submit(Box::pin(async move {
                    match pool.bind_keyspace(conn).await {
                        Ok(conn) => pool.send_on(conn, request, completer),
                        Err(err) => completer.fail(err),
                    }
                }));
            }
            Ok(None) => {
                let pool = self.clone();
                self.inner.submit(Box::pin(async move {
                    match pool.borrow_connection(timeout).await {
                        Ok(conn) => pool.send_on(conn, request, completer),
                        Err(err) => completer.fail(err),
                    }
                }));
            }
        }

        future
    }

    /// Closes all connections, both open and trashed.
    ///
    /// Requests in flight on them are failed by their transports. Borrowers
    /// waiting for capacity fail with [ConnectionPoolError::Shutdown].
    pub fn shutdown(&self) {
        let (open, trash) = {
            let mut state = self.inner.lock_state();
            if state.is_shutdown {
                return;
            }
            state.is_shutdown = true;
            (
                std::mem::take(&mut state.open),
                std::mem::take(&mut state.trash),
            )
        };

        debug!(
            "[{}] Shutting down pool, closing {} open and {} trashed connections",
            self.inner.address(),
            open.len(),
            trash.len(),
        );
        self.inner
            .metrics
            .inc_connections_closed((open.len() + trash.len()) as u64);
        for conn in open.iter().chain(trash.iter()) {
            conn.close();
        }

        self.inner.capacity_notify.notify_waiters();
    }

    /// The host this pool connects to.
    pub fn host(&self) -> &Host {
        &self.inner.host
    }

    /// The distance the pool was created for.
    pub fn distance(&self) -> HostDistance {
        self.inner.distance
    }

    /// Counters describing this pool.
    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.inner.metrics
    }

    /// Number of connections accepting new requests.
    pub fn open_count(&self) -> usize {
        self.inner.lock_state().open.len()
    }

    /// Number of connections waiting to be closed.
    pub fn trash_count(&self) -> usize {
        self.inner.lock_state().trash.len()
    }

    /// Number of connection creations submitted and not yet finished.
    pub fn scheduled_for_creation(&self) -> usize {
        self.inner.lock_state().scheduled_for_creation
    }

    /// Sum of in-flight requests over open and trashed connections.
    pub fn in_flight_total(&self) -> usize {
        let state = self.inner.lock_state();
        state
            .open
            .iter()
            .chain(state.trash.iter())
            .map(|conn| conn.in_flight())
            .sum()
    }

    /// Snapshot of the connections accepting new requests.
    pub fn open_connections(&self) -> Vec<PoolEntry<S>> {
        self.inner.lock_state().open.clone()
    }

    /// Returns true once [HostConnectionPool::shutdown] was called.
    pub fn is_shutdown(&self) -> bool {
        self.inner.lock_state().is_shutdown
    }

    async fn bind_keyspace(
        &self,
        conn: PoolEntry<S>,
    ) -> Result<PoolEntry<S>, ConnectionPoolError> {
        let keyspace = self.inner.session.keyspace();
        match conn.ensure_keyspace(keyspace.as_deref()).await {
            Ok(()) => Ok(conn),
            Err(error) => {
                warn!(
                    "[{}] Failed to bind keyspace {:?} onto connection {:p}: {}",
                    self.inner.address(),
                    keyspace,
                    Arc::as_ptr(&conn),
                    error,
                );
                self.return_connection(&conn);
                Err(ConnectionPoolError::UseKeyspace {
                    address: self.inner.address(),
                    error,
                })
            }
        }
    }

    fn send_on(&self, conn: PoolEntry<S>, request: Bytes, mut completer: ResponseCompleter) {
        let pool = self.clone();
        let borrowed = conn.clone();
        completer.on_release(move || pool.return_connection(&borrowed));

        // The connection may have broken since it was selected.
        if !conn.is_usable() {
            trace!(
                "[{}] Connection {:p} became unusable before sending",
                self.inner.address(),
                Arc::as_ptr(&conn),
            );
            completer.fail(BrokenConnectionError::from(BrokenConnectionErrorKind::Defunct));
            return;
        }
        conn.send_request(request, completer);
    }
}

impl<S: PoolSession> PoolInner<S> {
    fn lock_state(&self) -> MutexGuard<'_, PoolState<S::Connection>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn address(&self) -> SocketAddr {
        self.host.address
    }

    fn sizing(&self) -> PoolSizing {
        self.session.pool_sizing().sizing(self.distance)
    }

    async fn wait_for_connection(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<PoolEntry<S>, ConnectionPoolError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register before checking, so that a return happening between
            // the check and the wait is not missed.
            let notified = self.capacity_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(conn) = self.try_borrow()? {
                return Ok(conn);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // A wakeup is only a hint; the deadline passed, but look once more.
                if let Some(conn) = self.try_borrow()? {
                    return Ok(conn);
                }
                debug!(
                    "[{}] Timed out after {:?} waiting for a connection",
                    self.address(),
                    timeout,
                );
                self.metrics.inc_borrow_timeouts();
                return Err(ConnectionPoolError::NoConnectionsAvailable {
                    address: self.address(),
                    reason: NoConnectionsReason::Timeout(timeout),
                });
            }
        }
    }

    // Selects the least loaded open connection with spare capacity and admits
    // one request onto it. Ok(None) means the caller has to wait.
    fn try_borrow(self: &Arc<Self>) -> Result<Option<PoolEntry<S>>, ConnectionPoolError> {
        let mut broken = Vec::new();
        let result = {
            let mut state = self.lock_state();
            if state.is_shutdown {
                return Err(ConnectionPoolError::Shutdown(self.address()));
            }
            let sizing = self.sizing();

            state.open.retain(|conn| {
                if conn.is_usable() {
                    true
                } else {
                    broken.push(conn.clone());
                    false
                }
            });
            if !broken.is_empty() {
                debug!(
                    "[{}] Removed {} defunct connections from the pool",
                    self.address(),
                    broken.len(),
                );
                self.maybe_schedule_creation(&mut state, sizing.core_connections);
            }

            let chosen = state
                .open
                .iter()
                .filter(|conn| {
                    conn.in_flight() < conn.capacity(sizing.max_requests_per_connection)
                })
                .min_by_key(|conn| conn.in_flight())
                .cloned();

            match chosen {
                Some(conn) => {
                    let in_flight = conn.increment_in_flight();
                    self.metrics.inc_borrows();
                    trace!(
                        "[{}] Borrowed connection {:p}, in flight: {}",
                        self.address(),
                        Arc::as_ptr(&conn),
                        in_flight,
                    );
                    Ok(Some(conn))
                }
                None if state.open.is_empty() => {
                    // An empty pool can still recover if it is allowed to open anything.
                    let target = sizing
                        .core_connections
                        .max(sizing.max_connections.min(1));
                    self.maybe_schedule_creation(&mut state, target);
                    if state.scheduled_for_creation == 0 {
                        Err(ConnectionPoolError::NoConnectionsAvailable {
                            address: self.address(),
                            reason: NoConnectionsReason::Empty,
                        })
                    } else {
                        Ok(None)
                    }
                }
                None => {
                    // All connections are saturated; grow towards the maximum.
                    self.maybe_schedule_creation(&mut state, sizing.max_connections);
                    Ok(None)
                }
            }
        };

        self.close_connections(&broken);
        result
    }

    fn return_connection(self: &Arc<Self>, conn: &PoolEntry<S>) {
        let mut to_close = None;
        {
            let mut state = self.lock_state();
            let in_flight = conn.decrement_in_flight();
            let sizing = self.sizing();

            if !conn.is_usable() {
                let was_open = remove_connection(&mut state.open, conn);
                let was_trashed = remove_connection(&mut state.trash, conn);
                if was_open || was_trashed {
                    debug!(
                        "[{}] Dropping defunct connection {:p} from the pool",
                        self.address(),
                        Arc::as_ptr(conn),
                    );
                    to_close = Some(conn.clone());
                }
                if was_open {
                    self.maybe_schedule_creation(&mut state, sizing.core_connections);
                }
            } else if state.trash.iter().any(|c| Arc::ptr_eq(c, conn)) {
                if in_flight == 0 {
                    remove_connection(&mut state.trash, conn);
                    to_close = Some(conn.clone());
                }
            } else if in_flight == 0 && state.open.len() > sizing.core_connections {
                if remove_connection(&mut state.open, conn) {
                    debug!(
                        "[{}] Trashing idle connection {:p}, {} connections remain open",
                        self.address(),
                        Arc::as_ptr(conn),
                        state.open.len(),
                    );
                    self.metrics.inc_connections_trashed();
                    to_close = Some(conn.clone());
                }
            }
        }

        if let Some(conn) = to_close {
            self.close_connections(std::slice::from_ref(&conn));
        }
        self.capacity_notify.notify_one();
    }

    fn trash_connection(self: &Arc<Self>, conn: &PoolEntry<S>) {
        let mut close_now = false;
        {
            let mut state = self.lock_state();
            if !remove_connection(&mut state.open, conn) {
                return;
            }
            self.metrics.inc_connections_trashed();
            if conn.in_flight() == 0 {
                close_now = true;
            } else {
                state.trash.push(conn.clone());
            }
            debug!(
                "[{}] Trashed connection {:p}, {} connections remain open",
                self.address(),
                Arc::as_ptr(conn),
                state.open.len(),
            );
            let core_connections = self.sizing().core_connections;
            self.maybe_schedule_creation(&mut state, core_connections);
        }

        if close_now {
            self.close_connections(std::slice::from_ref(conn));
        }
    }

    // Submits a creation task if the pool is below `target` and no other
    // creation is in progress. Must be called with the state lock held.
    fn maybe_schedule_creation(
        self: &Arc<Self>,
        state: &mut PoolState<S::Connection>,
        target: usize,
    ) -> bool {
        if state.is_shutdown || state.scheduled_for_creation > 0 || state.open.len() >= target {
            return false;
        }
        state.scheduled_for_creation += 1;
        trace!(
            "[{}] Scheduling creation of a new connection, {} open, target {}",
            self.address(),
            state.open.len(),
            target,
        );
        self.submit_creation(Duration::ZERO);
        true
    }

    fn submit(&self, task: BoxedFuture<'static, ()>) {
        self.session.submit(&self.runtime, task);
    }

    fn submit_creation(self: &Arc<Self>, delay: Duration) {
        let pool: Weak<Self> = Arc::downgrade(self);
        self.submit(Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(pool) = pool.upgrade() {
                pool.create_new_connection().await;
            }
        }));
    }

    async fn create_new_connection(self: Arc<Self>) {
        let is_shutdown = self.lock_state().is_shutdown;
        let result = if is_shutdown {
            Err(ConnectionError::Closed)
        } else {
            self.open_connection().await
        };

        let mut state = self.lock_state();
        state.scheduled_for_creation = state.scheduled_for_creation.saturating_sub(1);

        if state.is_shutdown {
            drop(state);
            if let Ok(conn) = result {
                self.close_connections(&[conn]);
            }
            return;
        }

        let sizing = self.sizing();
        match result {
            Ok(conn) => {
                state.refill_delay_strategy.on_successful_fill();
                if state.open.len() >= sizing.max_connections {
                    debug!(
                        "[{}] Pool already holds {} connections, discarding the new one",
                        self.address(),
                        state.open.len(),
                    );
                    drop(state);
                    self.close_connections(&[conn]);
                    return;
                }

                state.open.push(conn);
                trace!(
                    "[{}] Added new connection, now there are {} open",
                    self.address(),
                    state.open.len(),
                );
                self.maybe_schedule_creation(&mut state, sizing.core_connections);
                drop(state);
                self.capacity_notify.notify_waiters();
            }
            Err(err) => {
                warn!("[{}] Failed to open new connection: {}", self.address(), err);
                self.metrics.inc_connection_failures();
                state.refill_delay_strategy.on_fill_error();

                if state.scheduled_for_creation == 0
                    && state.open.len() < sizing.core_connections
                {
                    let delay = state.refill_delay_strategy.get_delay();
                    debug!(
                        "[{}] Scheduling next connection attempt in {} ms",
                        self.address(),
                        delay.as_millis(),
                    );
                    state.scheduled_for_creation += 1;
                    self.submit_creation(delay);
                }
            }
        }
    }

    // Opens a connection through the session and binds the current keyspace.
    async fn open_connection(&self) -> Result<PoolEntry<S>, ConnectionError> {
        let connection = self.session.open_connection(&self.host).await?;
        let conn = Arc::new(PooledConnection::new(connection));
        self.metrics.inc_connections_opened();

        let keyspace = self.session.keyspace();
        if let Err(err) = conn.ensure_keyspace(keyspace.as_deref()).await {
            // Binding is retried when the connection is borrowed.
            warn!(
                "[{}] Failed to set keyspace for new connection: {}",
                self.address(),
                err,
            );
        }
        Ok(conn)
    }

    fn close_connections(&self, conns: &[PoolEntry<S>]) {
        if conns.is_empty() {
            return;
        }
        self.metrics.inc_connections_closed(conns.len() as u64);
        for conn in conns {
            trace!("[{}] Closing connection {:p}", self.address(), Arc::as_ptr(conn));
            conn.close();
        }
    }
}

fn remove_connection<C>(
    conns: &mut Vec<Arc<PooledConnection<C>>>,
    conn: &Arc<PooledConnection<C>>,
) -> bool {
    match conns.iter().position(|other| Arc::ptr_eq(other, conn)) {
        Some(idx) => {
            conns.remove(idx);
            true
        }
        None => false,
    }
}
