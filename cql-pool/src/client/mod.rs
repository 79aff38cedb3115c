//! This module holds helpers for issuing requests through a pool.

pub mod pipeline;
