//! This module holds entities that represent nodes of the cluster,
//! as seen by a connection pool.
//!
//! This includes:
//! - host's representation ([Host]),
//! - host's proximity class ([HostDistance]), which selects the pool sizing.

mod host;
pub use host::{Host, HostDistance};
