//! This module holds policies, which are entities that allow configuring
//! the driver's behaviour in various aspects. The common feature of all policies
//! is that users can implement a policy on their own (because they simply need
//! to implement a certain trait), allowing flexible customizability of the driver.
//!
//! This includes:
//! - [PoolSizingPolicy], deciding how many connections a host pool keeps
//!   and how many requests each of them admits.

mod pool_sizing;
pub use pool_sizing::{DefaultPoolSizing, PoolSizing, PoolSizingPolicy};
