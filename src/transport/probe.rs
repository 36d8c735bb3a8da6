//! Broker reachability checks
//!
//! A plain TCP connect to the broker port. It says nothing about whether
//! the broker will accept the device, only that the network path is up.

use super::TransportError;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::debug;

/// Connect to `host:port` and report how long it took
pub async fn check_broker_reachable(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<Duration, TransportError> {
    let started = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => {
            let latency = started.elapsed();
            debug!(host, port, latency_ms = latency.as_millis() as u64, "Broker reachable");
            Ok(latency)
        }
        Ok(Err(source)) => Err(TransportError::Unreachable {
            host: host.to_string(),
            port,
            source,
        }),
        Err(_) => Err(TransportError::ConnectTimeout(timeout)),
    }
}

/// Run [`check_broker_reachable`] in the background
pub fn spawn_reachability_check(
    host: String,
    port: u16,
    timeout: Duration,
) -> oneshot::Receiver<Result<Duration, TransportError>> {
    let (result_tx, result_rx) = oneshot::channel();
    tokio::spawn(async move {
        let result = check_broker_reachable(&host, port, timeout).await;
        let _ = result_tx.send(result);
    });
    result_rx
}
