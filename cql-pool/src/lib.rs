//! Per-host connection pooling for a CQL driver.
//!
//! The crate covers the part of a driver which sits between request execution
//! and the transport:
//! - [HostConnectionPool] keeps a bounded set of multiplexed connections to one
//!   host, admits requests onto them under a per-connection in-flight limit,
//!   grows the set under load and retires idle surplus connections;
//! - [ResponseFuture] delivers the outcome of a request to callers, either as a
//!   Rust future or through chainable callback pairs;
//! - [Pipeline](client::pipeline::Pipeline) keeps a fixed window of requests in
//!   flight by chaining completion callbacks.
//!
//! The transport itself (frame encoding, authentication, sockets) is external
//! and plugs in through the [Connection] trait; the owning session plugs in
//! through [PoolSession].
//!
//! ```rust,no_run
//! # use cql_pool::{HostConnectionPool, PoolSession, Host, HostDistance};
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # async fn check_only_compiles<S: PoolSession>(session: Arc<S>) -> Result<(), Box<dyn std::error::Error>> {
//! let host = Host::new("127.0.0.1:9042".parse()?);
//! let pool = HostConnectionPool::new(host, HostDistance::Local, session).await?;
//!
//! let response = pool
//!     .send_request(bytes::Bytes::from_static(b"..."), Duration::from_secs(1))
//!     .await?;
//! response.add_callbacks(
//!     |body| println!("got {} bytes", body.len()),
//!     |err| eprintln!("request failed: {err}"),
//! );
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod client;
pub mod cluster;
pub mod errors;
pub mod network;
pub mod observability;
pub mod policies;
pub mod response;

pub(crate) mod utils;

pub use cluster::{Host, HostDistance};
pub use network::{Connection, HostConnectionPool, PoolSession, PooledConnection};
pub use response::{ResponseCompleter, ResponseFuture};
pub use utils::futures::BoxedFuture;
