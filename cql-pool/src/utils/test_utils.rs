use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::runtime::Handle;

use crate::cluster::Host;
use crate::errors::{ConnectionError, RequestError};
use crate::network::{Connection, PoolSession, DEFAULT_MAX_IN_FLIGHT};
use crate::policies::{DefaultPoolSizing, PoolSizing, PoolSizingPolicy};
use crate::response::ResponseCompleter;
use crate::utils::futures::BoxedFuture;

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

pub(crate) fn test_host() -> Host {
    Host::new("127.0.0.1:9042".parse().unwrap())
}

/// A connection which keeps requests pending until the test completes them,
/// or echoes them back immediately if `complete_inline` is set.
pub(crate) struct MockConnection {
    pub(crate) id: usize,
    defunct: AtomicBool,
    closed: AtomicBool,
    fail_keyspace: AtomicBool,
    complete_inline: bool,
    max_in_flight: usize,
    keyspace_calls: Mutex<Vec<String>>,
    pending: Mutex<VecDeque<(Bytes, ResponseCompleter)>>,
}

impl MockConnection {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            defunct: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fail_keyspace: AtomicBool::new(false),
            complete_inline: false,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            keyspace_calls: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub(crate) fn completing_inline(mut self) -> Self {
        self.complete_inline = true;
        self
    }

    pub(crate) fn set_defunct(&self) {
        self.defunct.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_keyspace(&self, fail: bool) {
        self.fail_keyspace.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn keyspace_calls(&self) -> Vec<String> {
        self.keyspace_calls.lock().unwrap().clone()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Echoes back the oldest pending request.
    pub(crate) fn complete_next(&self) -> bool {
        let next = self.pending.lock().unwrap().pop_front();
        match next {
            Some((request, completer)) => {
                completer.succeed(request);
                true
            }
            None => false,
        }
    }

    pub(crate) fn fail_next(&self, error: RequestError) -> bool {
        let next = self.pending.lock().unwrap().pop_front();
        match next {
            Some((_, completer)) => {
                completer.fail(error);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn is_defunct(&self) -> bool {
        self.defunct.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    async fn use_keyspace(&self, keyspace: &str) -> Result<(), ConnectionError> {
        if self.fail_keyspace.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        self.keyspace_calls.lock().unwrap().push(keyspace.to_owned());
        Ok(())
    }

    fn send_request(&self, request: Bytes, completer: ResponseCompleter) {
        if self.is_closed() {
            completer.fail(RequestError::ConnectionClosed);
        } else if self.complete_inline {
            completer.succeed(request);
        } else {
            self.pending.lock().unwrap().push_back((request, completer));
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        for (_, completer) in pending {
            completer.fail(RequestError::ConnectionClosed);
        }
    }
}

/// A session which records every connection it opens and, unless told to run
/// them, every task submitted to its executor.
pub(crate) struct MockSession {
    keyspace: Mutex<Option<String>>,
    sizing: DefaultPoolSizing,
    opened: Mutex<Vec<Arc<MockConnection>>>,
    open_attempts: AtomicUsize,
    failures_left: AtomicUsize,
    run_submitted: bool,
    complete_inline: bool,
    submitted: Mutex<Vec<BoxedFuture<'static, ()>>>,
}

impl MockSession {
    pub(crate) fn new(sizing: PoolSizing) -> Self {
        Self {
            keyspace: Mutex::new(Some("foobarkeyspace".to_owned())),
            sizing: DefaultPoolSizing::uniform(sizing),
            opened: Mutex::new(Vec::new()),
            open_attempts: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            run_submitted: false,
            complete_inline: false,
            submitted: Mutex::new(Vec::new()),
        }
    }

    /// Submitted tasks are spawned on the runtime instead of being recorded.
    pub(crate) fn running_submitted(mut self) -> Self {
        self.run_submitted = true;
        self
    }

    pub(crate) fn completing_inline(mut self) -> Self {
        self.complete_inline = true;
        self
    }

    pub(crate) fn sizing(&self) -> &DefaultPoolSizing {
        &self.sizing
    }

    pub(crate) fn set_keyspace(&self, keyspace: Option<&str>) {
        *self.keyspace.lock().unwrap() = keyspace.map(str::to_owned);
    }

    pub(crate) fn fail_next_opens(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub(crate) fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn opened(&self) -> Vec<Arc<MockConnection>> {
        self.opened.lock().unwrap().clone()
    }

    pub(crate) fn take_submitted(&self) -> Vec<BoxedFuture<'static, ()>> {
        std::mem::take(&mut *self.submitted.lock().unwrap())
    }

    pub(crate) fn submitted_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }
}

#[async_trait]
impl PoolSession for MockSession {
    type Connection = Arc<MockConnection>;

    fn keyspace(&self) -> Option<String> {
        self.keyspace.lock().unwrap().clone()
    }

    fn pool_sizing(&self) -> &dyn PoolSizingPolicy {
        &self.sizing
    }

    async fn open_connection(&self, _host: &Host) -> Result<Self::Connection, ConnectionError> {
        let attempt = self.open_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ConnectionError::ConnectTimeout);
        }

        let mut conn = MockConnection::new(attempt);
        if self.complete_inline {
            conn = conn.completing_inline();
        }
        let conn = Arc::new(conn);
        self.opened.lock().unwrap().push(conn.clone());
        Ok(conn)
    }

    fn submit(&self, runtime: &Handle, task: BoxedFuture<'static, ()>) {
        if self.run_submitted {
            runtime.spawn(task);
        } else {
            self.submitted.lock().unwrap().push(task);
        }
    }
}
