use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use cql_pool::errors::{ConnectionError, RequestError};
use cql_pool::policies::{DefaultPoolSizing, PoolSizing, PoolSizingPolicy};
use cql_pool::{Connection, Host, PoolSession, ResponseCompleter};

pub(crate) fn init_logger() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .without_time()
        .try_init();
}

pub(crate) fn test_host() -> Host {
    Host::new("127.0.0.1:9042".parse().unwrap())
}

/// Counts requests outstanding on the transport across all connections.
#[derive(Default)]
pub(crate) struct TransportStats {
    outstanding: AtomicUsize,
    max_outstanding: AtomicUsize,
    sent: AtomicUsize,
}

impl TransportStats {
    fn on_send(&self) {
        self.sent.fetch_add(1, Ordering::SeqCst);
        let now = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_outstanding.fetch_max(now, Ordering::SeqCst);
    }

    fn on_complete(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn max_outstanding(&self) -> usize {
        self.max_outstanding.load(Ordering::SeqCst)
    }

    pub(crate) fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

/// Echoes every request back from a separate task.
///
/// With `hold` set, requests stay pending until the connection is closed.
pub(crate) struct LoopbackConnection {
    stats: Arc<TransportStats>,
    hold: bool,
    closed: AtomicBool,
    held: Mutex<Vec<ResponseCompleter>>,
}

#[async_trait]
impl Connection for LoopbackConnection {
    fn is_defunct(&self) -> bool {
        false
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn use_keyspace(&self, _keyspace: &str) -> Result<(), ConnectionError> {
        Ok(())
    }

    fn send_request(&self, request: Bytes, completer: ResponseCompleter) {
        if self.is_closed() {
            completer.fail(RequestError::ConnectionClosed);
            return;
        }
        self.stats.on_send();
        if self.hold {
            self.held.lock().unwrap().push(completer);
            return;
        }

        let stats = self.stats.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            stats.on_complete();
            completer.succeed(request);
        });
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let held = std::mem::take(&mut *self.held.lock().unwrap());
        for completer in held {
            self.stats.on_complete();
            completer.fail(RequestError::ConnectionClosed);
        }
    }
}

pub(crate) struct LoopbackSession {
    sizing: DefaultPoolSizing,
    hold: bool,
    pub(crate) stats: Arc<TransportStats>,
    pub(crate) opened: AtomicUsize,
}

impl LoopbackSession {
    pub(crate) fn new(sizing: PoolSizing) -> Self {
        Self {
            sizing: DefaultPoolSizing::uniform(sizing),
            hold: false,
            stats: Arc::new(TransportStats::default()),
            opened: AtomicUsize::new(0),
        }
    }

    pub(crate) fn holding_requests(mut self) -> Self {
        self.hold = true;
        self
    }
}

#[async_trait]
impl PoolSession for LoopbackSession {
    type Connection = LoopbackConnection;

    fn keyspace(&self) -> Option<String> {
        Some("ks".to_owned())
    }

    fn pool_sizing(&self) -> &dyn PoolSizingPolicy {
        &self.sizing
    }

    async fn open_connection(&self, _host: &Host) -> Result<Self::Connection, ConnectionError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(LoopbackConnection {
            stats: self.stats.clone(),
            hold: self.hold,
            closed: AtomicBool::new(false),
            held: Mutex::new(Vec::new()),
        })
    }
}
