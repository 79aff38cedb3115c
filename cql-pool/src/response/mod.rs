//! This module holds entities that deliver the outcome of a request to the caller.

mod future;
pub use future::{ResponseCompleter, ResponseFuture, ResponseOutcome};
