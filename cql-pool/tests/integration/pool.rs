use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;

use cql_pool::client::pipeline::Pipeline;
use cql_pool::errors::{ConnectionPoolError, RequestError};
use cql_pool::policies::PoolSizing;
use cql_pool::{HostConnectionPool, HostDistance};

use crate::utils::{init_logger, test_host, LoopbackSession};

#[tokio::test]
#[ntest::timeout(10000)]
async fn shutdown_fails_outstanding_requests() {
    init_logger();
    let session = Arc::new(
        LoopbackSession::new(PoolSizing {
            core_connections: 2,
            max_connections: 2,
            max_requests_per_connection: 10,
        })
        .holding_requests(),
    );
    let pool = HostConnectionPool::new(test_host(), HostDistance::Remote, session.clone())
        .await
        .unwrap();

    let issuing = pool.clone();
    let pipeline = Pipeline::start(4, 4, move |index| {
        issuing.execute_async(Bytes::from(index.to_string()), Duration::from_secs(1))
    });
    assert_eq!(session.stats.sent(), 4);
    assert!(!pipeline.is_done());

    pool.shutdown();
    let summary = pipeline.wait().await;
    assert_eq!(summary.completed, 4);
    assert_eq!(summary.failed, 4);
    assert_eq!(pool.open_count(), 0);
    assert_eq!(pool.metrics().get_connections_closed(), 2);

    let response = pool.execute_async(Bytes::from_static(b"late"), Duration::from_secs(1));
    assert_matches!(
        response.await,
        Err(RequestError::ConnectionPool(ConnectionPoolError::Shutdown(_)))
    );
}

#[tokio::test]
async fn pool_reports_its_host() {
    init_logger();
    let session = Arc::new(LoopbackSession::new(PoolSizing {
        core_connections: 1,
        max_connections: 1,
        max_requests_per_connection: 1,
    }));
    let pool = HostConnectionPool::new(test_host(), HostDistance::Local, session)
        .await
        .unwrap();

    assert_eq!(pool.host().address, "127.0.0.1:9042".parse::<std::net::SocketAddr>().unwrap());
    assert_eq!(pool.distance(), HostDistance::Local);
    assert_eq!(pool.open_count(), 1);
    assert_eq!(pool.metrics().get_connections_opened(), 1);
}
