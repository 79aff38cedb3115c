//! This module holds entities that represent connections to the cluster
//! and management over them.
//!
//! This includes:
//! - the [Connection] trait, the boundary towards the transport,
//! - [HostConnectionPool], a pool of connections to a single host.

mod connection;
pub use connection::{Connection, PooledConnection, DEFAULT_MAX_IN_FLIGHT};

mod connection_pool;
pub use connection_pool::{HostConnectionPool, PoolEntry, PoolSession};
