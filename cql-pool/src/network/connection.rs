use std::fmt::Debug;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::errors::ConnectionError;
use crate::response::ResponseCompleter;

/// Number of stream ids a single CQL v3+ connection can multiplex.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 32768;

/// A multiplexed transport to a single host.
///
/// Frame encoding, authentication and the socket itself live behind this
/// trait; the pool only relies on the operations below.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Returns true if the transport detected a failure and must not be used.
    fn is_defunct(&self) -> bool;

    /// Returns true if the connection has been closed.
    fn is_closed(&self) -> bool;

    /// Hard limit of concurrently outstanding requests imposed by the transport.
    fn max_in_flight(&self) -> usize {
        DEFAULT_MAX_IN_FLIGHT
    }

    /// Makes `keyspace` the current keyspace of this connection (`USE <keyspace>`).
    async fn use_keyspace(&self, keyspace: &str) -> Result<(), ConnectionError>;

    /// Sends a serialized request.
    ///
    /// The transport must consume `completer` exactly once, with either the
    /// response body or the error that ended the request. Requests still
    /// pending when the connection closes must be failed, not dropped silently.
    fn send_request(&self, request: Bytes, completer: ResponseCompleter);

    /// Closes the connection. Closing an already closed connection is a no-op.
    fn close(&self);
}

#[async_trait]
impl<C: Connection> Connection for Arc<C> {
    fn is_defunct(&self) -> bool {
        (**self).is_defunct()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }

    fn max_in_flight(&self) -> usize {
        (**self).max_in_flight()
    }

    async fn use_keyspace(&self, keyspace: &str) -> Result<(), ConnectionError> {
        (**self).use_keyspace(keyspace).await
    }

    fn send_request(&self, request: Bytes, completer: ResponseCompleter) {
        (**self).send_request(request, completer)
    }

    fn close(&self) {
        (**self).close()
    }
}

/// A connection owned by a [HostConnectionPool](crate::network::HostConnectionPool),
/// together with the bookkeeping the pool keeps for it.
///
/// The in-flight counter is only modified by the pool, under the pool lock.
pub struct PooledConnection<C> {
    connection: C,
    in_flight: AtomicUsize,
    keyspace: Mutex<Option<String>>,
}

impl<C: Connection> PooledConnection<C> {
    pub(crate) fn new(connection: C) -> Self {
        Self {
            connection,
            in_flight: AtomicUsize::new(0),
            keyspace: Mutex::new(None),
        }
    }

    /// Number of requests currently outstanding on this connection.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Keyspace most recently bound onto this connection.
    pub fn keyspace(&self) -> Option<String> {
        self.keyspace
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub(crate) fn is_usable(&self) -> bool {
        !self.connection.is_defunct() && !self.connection.is_closed()
    }

    // Effective limit: the smaller of the pool policy and the transport cap.
    pub(crate) fn capacity(&self, max_requests_per_connection: usize) -> usize {
        max_requests_per_connection.min(self.connection.max_in_flight())
    }

    pub(crate) fn increment_in_flight(&self) -> usize {
        self.in_flight.fetch_add(1, Ordering::Relaxed) + 1
    }

    // Saturates at zero, so a double return cannot underflow.
    pub(crate) fn decrement_in_flight(&self) -> usize {
        let previous = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub(crate) fn has_keyspace(&self, keyspace: Option<&str>) -> bool {
        match keyspace {
            None => true,
            Some(keyspace) => self.keyspace().as_deref() == Some(keyspace),
        }
    }

    /// Binds `keyspace` onto the connection unless it is already bound.
    pub(crate) async fn ensure_keyspace(
        &self,
        keyspace: Option<&str>,
    ) -> Result<(), ConnectionError> {
        let Some(keyspace) = keyspace else {
            return Ok(());
        };
        if self.has_keyspace(Some(keyspace)) {
            return Ok(());
        }

        debug!("Binding keyspace {} onto connection {:p}", keyspace, self);
        self.connection.use_keyspace(keyspace).await?;
        *self
            .keyspace
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(keyspace.to_owned());
        Ok(())
    }
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.connection
    }
}

impl<C> Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("ptr", &(self as *const Self))
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
