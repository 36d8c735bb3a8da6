//! Periodic telemetry reporting
//!
//! While the bridge is connected, [`TelemetryReporter`] sends the device
//! location and a batch of measurements at a fixed interval. Reporting
//! pauses on disconnect and resumes on the next connection.

use crate::bridge::state::ConnectionState;
use crate::client::MessageSender;
use crate::config::ReporterSection;
use crate::error::MessagingError;
use crate::transport::BrokerTransport;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
}

/// Source of the values reported each tick
pub trait TelemetrySource: Send + Sync {
    fn location(&self) -> Option<GeoPoint>;

    fn measurements(&self) -> BTreeMap<String, f64>;
}

/// Fixed values taken from the `[reporter]` config section
#[derive(Debug, Clone, Default)]
pub struct StaticTelemetry {
    location: Option<GeoPoint>,
    measurements: BTreeMap<String, f64>,
}

impl StaticTelemetry {
    pub fn new(location: Option<GeoPoint>, measurements: BTreeMap<String, f64>) -> Self {
        Self {
            location,
            measurements,
        }
    }

    pub fn from_config(section: &ReporterSection) -> Self {
        let location = match (section.latitude, section.longitude) {
            (Some(latitude), Some(longitude)) => Some(GeoPoint {
                latitude,
                longitude,
                elevation: section.elevation,
            }),
            _ => None,
        };
        Self::new(location, section.measurements.clone())
    }
}

impl TelemetrySource for StaticTelemetry {
    fn location(&self) -> Option<GeoPoint> {
        self.location
    }

    fn measurements(&self) -> BTreeMap<String, f64> {
        self.measurements.clone()
    }
}

pub struct TelemetryReporter<T: BrokerTransport> {
    sender: MessageSender<T>,
    device_token: String,
    interval: Duration,
    source: Arc<dyn TelemetrySource>,
}

impl<T: BrokerTransport> TelemetryReporter<T> {
    pub fn new<S: Into<String>>(
        sender: MessageSender<T>,
        device_token: S,
        interval: Duration,
        source: Arc<dyn TelemetrySource>,
    ) -> Self {
        Self {
            sender,
            device_token: device_token.into(),
            interval,
            source,
        }
    }

    /// Send one round of telemetry, returning the number of frames sent
    pub async fn report_once(&self) -> Result<usize, MessagingError> {
        let now = Utc::now();
        let mut sent = 0;

        if let Some(point) = self.source.location() {
            self.sender
                .send_device_location(
                    &self.device_token,
                    None,
                    point.latitude,
                    point.longitude,
                    point.elevation,
                    Some(now),
                )
                .await?;
            sent += 1;
        }

        let measurements = self.source.measurements();
        if !measurements.is_empty() {
            self.sender
                .send_device_measurements(&self.device_token, None, &measurements, Some(now))
                .await?;
            sent += measurements.len();
        }

        debug!(device_id = %self.device_token, frames = sent, "Telemetry reported");
        Ok(sent)
    }

    /// Report on every tick while connected. Runs until aborted or the
    /// connection manager is gone.
    pub fn spawn(self, mut state_rx: tokio::sync::watch::Receiver<ConnectionState>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if state_rx
                    .wait_for(|state| *state == ConnectionState::Connected)
                    .await
                    .is_err()
                {
                    break;
                }
                info!(interval_secs = self.interval.as_secs(), "Telemetry reporting started");

                let mut ticker = tokio::time::interval(self.interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;

                loop {
                    tokio::select! {
                        changed = state_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            if *state_rx.borrow_and_update() != ConnectionState::Connected {
                                info!("Telemetry reporting paused");
                                break;
                            }
                        }
                        _ = ticker.tick() => {
                            if let Err(e) = self.report_once().await {
                                warn!(error = %e, "Unable to report telemetry");
                            }
                        }
                    }
                }
            }
            debug!("Telemetry reporter stopped");
        })
    }
}
