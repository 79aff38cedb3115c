use std::fmt::Debug;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::cluster::HostDistance;

/// Sizing parameters of a single host pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizing {
    /// Number of connections the pool tries to keep open at all times.
    pub core_connections: usize,
    /// Upper bound on the number of open connections in the pool.
    pub max_connections: usize,
    /// Upper bound on the number of requests in flight on one connection.
    pub max_requests_per_connection: usize,
}

impl PoolSizing {
    /// Sizing of a pool which never opens any connection.
    pub const DISABLED: PoolSizing = PoolSizing {
        core_connections: 0,
        max_connections: 0,
        max_requests_per_connection: 0,
    };
}

/// Trait used to decide how large a host pool should be.
///
/// The pool queries the policy every time it makes a sizing decision,
/// so implementations are free to return different values over time.
pub trait PoolSizingPolicy: Send + Sync + Debug {
    /// Returns the sizing for pools of hosts at the given distance.
    fn sizing(&self, distance: HostDistance) -> PoolSizing;

    /// Returns the number of connections the pool tries to keep open.
    fn core_connections_per_host(&self, distance: HostDistance) -> usize {
        self.sizing(distance).core_connections
    }

    /// Returns the upper bound on the number of open connections.
    fn max_connections_per_host(&self, distance: HostDistance) -> usize {
        self.sizing(distance).max_connections
    }

    /// Returns the upper bound on in-flight requests per connection.
    fn max_requests_per_connection(&self, distance: HostDistance) -> usize {
        self.sizing(distance).max_requests_per_connection
    }
}

/// Pool sizing table which can be modified while pools are running.
///
/// Defaults:
/// - `LOCAL`: 2 core connections, at most 8, 100 requests per connection,
/// - `REMOTE`: 1 core connection, at most 2, 100 requests per connection,
/// - `IGNORED`: no connections.
#[derive(Debug)]
pub struct DefaultPoolSizing {
    table: ArcSwap<[PoolSizing; 3]>,
}

impl Default for DefaultPoolSizing {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultPoolSizing {
    /// Creates a sizing table with default values.
    pub fn new() -> Self {
        let local = PoolSizing {
            core_connections: 2,
            max_connections: 8,
            max_requests_per_connection: 100,
        };
        let remote = PoolSizing {
            core_connections: 1,
            max_connections: 2,
            max_requests_per_connection: 100,
        };
        Self {
            table: ArcSwap::new(Arc::new([local, remote, PoolSizing::DISABLED])),
        }
    }

    /// Replaces the sizing for the given distance.
    pub fn with_sizing(self, distance: HostDistance, sizing: PoolSizing) -> Self {
        self.set_sizing(distance, sizing);
        self
    }

    /// Uses the same sizing for every distance except `IGNORED`.
    pub fn uniform(sizing: PoolSizing) -> Self {
        Self::new()
            .with_sizing(HostDistance::Local, sizing)
            .with_sizing(HostDistance::Remote, sizing)
    }

    /// Replaces the sizing for the given distance.
    ///
    /// Running pools observe the change on their next sizing decision.
    pub fn set_sizing(&self, distance: HostDistance, sizing: PoolSizing) {
        self.update(distance, |s| *s = sizing);
    }

    /// Changes the number of core connections for the given distance.
    pub fn set_core_connections(&self, distance: HostDistance, core_connections: usize) {
        self.update(distance, |s| s.core_connections = core_connections);
    }

    /// Changes the maximum number of connections for the given distance.
    pub fn set_max_connections(&self, distance: HostDistance, max_connections: usize) {
        self.update(distance, |s| s.max_connections = max_connections);
    }

    /// Changes the maximum number of requests per connection for the given distance.
    pub fn set_max_requests_per_connection(&self, distance: HostDistance, max_requests: usize) {
        self.update(distance, |s| s.max_requests_per_connection = max_requests);
    }

    fn update(&self, distance: HostDistance, f: impl Fn(&mut PoolSizing)) {
        self.table.rcu(|table| {
            let mut table = **table;
            f(&mut table[distance.index()]);
            table
        });
    }
}

impl PoolSizingPolicy for DefaultPoolSizing {
    fn sizing(&self, distance: HostDistance) -> PoolSizing {
        self.table.load()[distance.index()]
    }
}
