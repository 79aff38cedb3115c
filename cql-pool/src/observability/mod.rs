//! This module holds entities that allow observing and measuring the pool's behaviour.
//! This includes:
//! - pool metrics.

pub mod metrics;
