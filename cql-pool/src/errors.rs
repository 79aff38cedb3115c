//! This module contains various errors which can be returned by the pool
//! and by the requests sent through it.

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Error that occurred when borrowing a connection from a host pool.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionPoolError {
    /// No connection could admit another request.
    #[error("[{address}] No connections available: {reason}")]
    NoConnectionsAvailable {
        /// Address of the host the pool connects to.
        address: SocketAddr,
        /// Why the borrow gave up.
        reason: NoConnectionsReason,
    },

    /// The pool was shut down and no longer hands out connections.
    #[error("[{0}] Connection pool is shut down")]
    Shutdown(SocketAddr),

    /// A connection was available, but binding the session keyspace onto it failed.
    #[error("[{address}] Failed to bind keyspace onto connection: {error}")]
    UseKeyspace {
        /// Address of the host the pool connects to.
        address: SocketAddr,
        /// Error returned by the connection.
        error: ConnectionError,
    },
}

/// The reason why [ConnectionPoolError::NoConnectionsAvailable] was returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NoConnectionsReason {
    /// All connections stayed saturated until the borrow timeout elapsed.
    #[error("timed out after {0:?} waiting for a connection with spare capacity")]
    Timeout(Duration),

    /// The pool holds no connections and is not going to open any.
    #[error("the pool is empty and its target size is zero")]
    Empty,
}

/// Error that occurred while opening a connection or preparing it for use.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    /// Input/Output error has occurred.
    #[error("Connect IO error: {0}")]
    IoError(Arc<std::io::Error>),

    /// Connecting to the host did not finish in time.
    #[error("Could not connect within the connect timeout")]
    ConnectTimeout,

    /// The host rejected our credentials.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The connection broke down while it was being set up.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// The connection was already closed.
    #[error("Connection is closed")]
    Closed,
}

impl From<std::io::Error> for ConnectionError {
    fn from(value: std::io::Error) -> Self {
        ConnectionError::IoError(Arc::new(value))
    }
}

/// Error delivered to the callbacks of a [ResponseFuture](crate::response::ResponseFuture).
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestError {
    /// Database sent a response containing some error with a message.
    #[error("Database returned an error: {0}")]
    DbError(String),

    /// Input/Output error has occurred, connection broken etc.
    #[error("IO Error: {0}")]
    IoError(Arc<std::io::Error>),

    /// The connection broke while the request was in flight.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// The connection was closed before a response arrived.
    #[error("Connection was closed before the response arrived")]
    ConnectionClosed,

    /// Client timeout occurred before any response arrived.
    #[error("Request timeout: {0:?}")]
    RequestTimeout(Duration),

    /// The transport dropped the completion handle without reporting an outcome.
    #[error("Response completer was dropped before completing the request")]
    CompleterDropped,

    /// No connection could be borrowed for the request.
    #[error(transparent)]
    ConnectionPool(#[from] ConnectionPoolError),
}

impl From<std::io::Error> for RequestError {
    fn from(value: std::io::Error) -> Self {
        RequestError::IoError(Arc::new(value))
    }
}

/// Error that occurred when a connection broke down.
#[derive(Error, Debug, Clone)]
#[error("Connection broken, reason: {0}")]
pub struct BrokenConnectionError(Arc<dyn Error + Sync + Send>);

impl BrokenConnectionError {
    /// Retrieve an error reason by downcasting to specific type.
    pub fn downcast_ref<T: Error + 'static>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

/// Common causes of [BrokenConnectionError].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BrokenConnectionErrorKind {
    /// The connection was defunct or closed by the time the request was sent on it.
    #[error("Connection is defunct")]
    Defunct,
}

impl From<BrokenConnectionErrorKind> for BrokenConnectionError {
    fn from(value: BrokenConnectionErrorKind) -> Self {
        BrokenConnectionError(Arc::new(value))
    }
}
