//! Network state handling
//!
//! Turns coarse connectivity changes into connection actions. The decision
//! itself is the pure [`NetworkPolicy::decide`]; [`NetworkMonitor`] follows a
//! status channel and applies decisions, and [`ReachabilityProbe`] produces
//! such a channel by polling the broker port.

use super::state::ConnectionState;
use crate::transport::probe::check_broker_reachable;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkStatus {
    Available,
    Unavailable,
}

impl NetworkStatus {
    pub fn is_available(self) -> bool {
        self == NetworkStatus::Available
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkAction {
    /// Tear the connection down and wait for the network
    Suspend,
    /// Connect with the stored settings
    Reconnect,
    Ignore,
}

pub struct NetworkPolicy;

impl NetworkPolicy {
    pub fn decide(
        state: ConnectionState,
        status: NetworkStatus,
        settings_configured: bool,
    ) -> NetworkAction {
        match (status, state) {
            (NetworkStatus::Unavailable, ConnectionState::Connected) => NetworkAction::Suspend,
            (
                NetworkStatus::Available,
                ConnectionState::WaitingForNetwork | ConnectionState::Disconnected,
            ) if settings_configured => NetworkAction::Reconnect,
            _ => NetworkAction::Ignore,
        }
    }
}

/// Anything that reacts to network status changes
pub trait NetworkAware: Send + Sync {
    fn network_changed(&self, status: NetworkStatus) -> NetworkAction;
}

/// Feeds status changes from a watch channel into a [`NetworkAware`] target
pub struct NetworkMonitor {
    target: Arc<dyn NetworkAware>,
    status_rx: watch::Receiver<NetworkStatus>,
}

impl NetworkMonitor {
    pub fn new(target: Arc<dyn NetworkAware>, status_rx: watch::Receiver<NetworkStatus>) -> Self {
        Self { target, status_rx }
    }

    /// Apply the current status, then every change until the sender is
    /// dropped
    pub fn spawn(self) -> JoinHandle<()> {
        let Self {
            target,
            mut status_rx,
        } = self;

        tokio::spawn(async move {
            let initial = *status_rx.borrow_and_update();
            debug!(status = ?initial, "Applying initial network status");
            target.network_changed(initial);

            while status_rx.changed().await.is_ok() {
                let status = *status_rx.borrow_and_update();
                let action = target.network_changed(status);
                info!(status = ?status, action = ?action, "Network status changed");
            }
            debug!("Network status source closed, monitor stopping");
        })
    }
}

/// Periodic TCP reachability check against the broker
pub struct ReachabilityProbe {
    host: String,
    port: u16,
    interval: Duration,
    timeout: Duration,
}

impl ReachabilityProbe {
    pub fn new<S: Into<String>>(host: S, port: u16, interval: Duration, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            interval,
            timeout,
        }
    }

    /// Start probing. The network is assumed available until the first
    /// probe says otherwise.
    pub fn spawn(self) -> (watch::Receiver<NetworkStatus>, JoinHandle<()>) {
        let (status_tx, status_rx) = watch::channel(NetworkStatus::Available);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if status_tx.is_closed() {
                    break;
                }

                let status = match check_broker_reachable(&self.host, self.port, self.timeout).await
                {
                    Ok(_) => NetworkStatus::Available,
                    Err(e) => {
                        debug!(error = %e, "Broker reachability probe failed");
                        NetworkStatus::Unavailable
                    }
                };

                status_tx.send_if_modified(|current| {
                    if *current == status {
                        false
                    } else {
                        *current = status;
                        true
                    }
                });
            }
        });

        (status_rx, handle)
    }
}
