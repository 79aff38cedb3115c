use std::future::Future;
use std::pin::Pin;

/// A boxed, sendable future, as accepted by [PoolSession::submit](crate::PoolSession::submit).
pub type BoxedFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
