use std::sync::atomic::{AtomicU64, Ordering};

const ORDER_TYPE: Ordering = Ordering::Relaxed;

/// Counters describing the lifetime of one host pool.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    connections_opened: AtomicU64,
    connection_failures: AtomicU64,
    connections_trashed: AtomicU64,
    connections_closed: AtomicU64,
    borrows: AtomicU64,
    borrow_timeouts: AtomicU64,
}

impl PoolMetrics {
    /// Creates a set of zeroed counters.
    pub fn new() -> Self {
        PoolMetrics::default()
    }

    pub(crate) fn inc_connections_opened(&self) {
        self.connections_opened.fetch_add(1, ORDER_TYPE);
    }

    pub(crate) fn inc_connection_failures(&self) {
        self.connection_failures.fetch_add(1, ORDER_TYPE);
    }

    pub(crate) fn inc_connections_trashed(&self) {
        self.connections_trashed.fetch_add(1, ORDER_TYPE);
    }

    pub(crate) fn inc_connections_closed(&self, count: u64) {
        self.connections_closed.fetch_add(count, ORDER_TYPE);
    }

    pub(crate) fn inc_borrows(&self) {
        self.borrows.fetch_add(1, ORDER_TYPE);
    }

    pub(crate) fn inc_borrow_timeouts(&self) {
        self.borrow_timeouts.fetch_add(1, ORDER_TYPE);
    }

    /// Returns the number of connections successfully opened by the pool.
    pub fn get_connections_opened(&self) -> u64 {
        self.connections_opened.load(ORDER_TYPE)
    }

    /// Returns the number of failed connection attempts.
    pub fn get_connection_failures(&self) -> u64 {
        self.connection_failures.load(ORDER_TYPE)
    }

    /// Returns the number of connections moved to the trash.
    pub fn get_connections_trashed(&self) -> u64 {
        self.connections_trashed.load(ORDER_TYPE)
    }

    /// Returns the number of connections closed by the pool.
    pub fn get_connections_closed(&self) -> u64 {
        self.connections_closed.load(ORDER_TYPE)
    }

    /// Returns the number of successful borrows.
    pub fn get_borrows(&self) -> u64 {
        self.borrows.load(ORDER_TYPE)
    }

    /// Returns the number of borrows which gave up after waiting for the full timeout.
    pub fn get_borrow_timeouts(&self) -> u64 {
        self.borrow_timeouts.load(ORDER_TYPE)
    }
}
