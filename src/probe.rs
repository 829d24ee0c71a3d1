//! Upstream reachability checks: plain TCP connects with a short timeout.
//! Used by the status IPC handler and by callers that want to wait for a
//! dev server to come up.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::{interval, timeout, Instant};

use crate::error::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(200);
const MAX_CONCURRENT_CHECKS: usize = 16;

/// Whether something is accepting TCP connections on `localhost:<port>`.
pub async fn check(port: u16) -> bool {
    matches!(
        timeout(CONNECT_TIMEOUT, TcpStream::connect(("localhost", port))).await,
        Ok(Ok(_))
    )
}

/// Poll until the upstream accepts a connection or the deadline passes.
pub async fn wait(port: u16, wait_timeout: Duration) -> Result<()> {
    if wait_timeout.is_zero() {
        return Err(Error::validation("timeout must be greater than 0"));
    }

    if check(port).await {
        return Ok(());
    }

    let deadline = Instant::now() + wait_timeout;
    let mut ticker = interval(POLL_INTERVAL);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if check(port).await {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::upstream(format!(
                "upstream localhost:{port} did not become reachable within {wait_timeout:?}"
            )));
        }
    }
}

/// Check many ports concurrently with bounded parallelism. Results line up
/// with the input order.
pub async fn check_many(ports: &[u16]) -> Vec<bool> {
    let sem = Arc::new(Semaphore::new(MAX_CONCURRENT_CHECKS));
    let checks = ports.iter().map(|&port| {
        let sem = sem.clone();
        async move {
            let _permit = sem.acquire().await.expect("probe semaphore closed");
            check(port).await
        }
    });
    futures_util::future::join_all(checks).await
}
