//! SiteWhere device bridge - command line entry point

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::Value;
use sitewhere_bridge::bridge::{
    ConnectionManager, ConnectionState, NetworkMonitor, ReachabilityProbe,
};
use sitewhere_bridge::client::{MessageClient, MessageClientCallback, MessageSender};
use sitewhere_bridge::config::BridgeConfig;
use sitewhere_bridge::observability::init_default_logging;
use sitewhere_bridge::protocol::{
    dispatch_custom_command, CustomCommandHandler, Direction, FrameCodec, Payload,
    RegistrationAck, RegistrationAckState,
};
use sitewhere_bridge::reporter::{StaticTelemetry, TelemetryReporter};
use sitewhere_bridge::transport::mqtt::{MqttTransport, MqttTransportOptions};
use sitewhere_bridge::transport::probe::check_broker_reachable;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};

type AppResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "sitewhere-bridge")]
#[command(about = "Connects a device to SiteWhere over MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, register the device and answer commands until stopped
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Check that the broker port is reachable
    Verify,
    /// Connect, send a single event and disconnect
    Send {
        #[command(subcommand)]
        event: SendEvent,
    },
}

#[derive(Subcommand)]
enum SendEvent {
    Measurement {
        #[arg(long)]
        name: String,
        #[arg(long)]
        value: f64,
    },
    Location {
        #[arg(long, allow_hyphen_values = true)]
        latitude: f64,
        #[arg(long, allow_hyphen_values = true)]
        longitude: f64,
        #[arg(long, default_value_t = 0.0)]
        elevation: f64,
    },
    Alert {
        #[arg(long = "type")]
        alert_type: String,
        #[arg(long)]
        message: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose > 0 && std::env::var("LOG_LEVEL").is_err() {
        let level = if cli.verbose > 1 { "TRACE" } else { "DEBUG" };
        std::env::set_var("LOG_LEVEL", level);
    }
    init_default_logging();

    info!("Starting sitewhere-bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_bridge(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Verify => verify_broker(&config).await,
        Commands::Send { event } => send_once(config, event).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Shutdown complete");
}

fn load_configuration(config_path: &Option<PathBuf>) -> AppResult<BridgeConfig> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(BridgeConfig::load_from_file(path)?);
    }

    let default_paths = ["sitewhere.toml", "config/sitewhere.toml"];
    for path_str in default_paths {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(BridgeConfig::load_from_file(&path)?);
        }
    }

    Err("no configuration file found; pass -c/--config or create sitewhere.toml".into())
}

fn build_manager(config: &BridgeConfig) -> AppResult<Arc<ConnectionManager<MqttTransport>>> {
    let options = MqttTransportOptions::from_config(config)?;
    Ok(Arc::new(ConnectionManager::new(
        MqttTransport::new(options),
        config.topic_scheme(),
    )))
}

async fn run_bridge(config: BridgeConfig) -> AppResult<()> {
    let device_id = config.device.id.clone();
    info!(device_id = %device_id, "Bridge starting");

    let manager = build_manager(&config)?;
    let sender = MessageSender::new(manager.clone());
    let app = Arc::new(DeviceApp {
        sender: sender.clone(),
        config: config.clone(),
    });
    let client = MessageClient::with_callback(manager.clone(), app).await;

    let mut background = Vec::new();
    if config.network.probe_enabled {
        let probe = ReachabilityProbe::new(
            config.broker.hostname.clone(),
            config.broker.port,
            config.probe_interval(),
            config.probe_timeout(),
        );
        let (status_rx, probe_handle) = probe.spawn();
        background.push(probe_handle);
        background.push(NetworkMonitor::new(manager.clone(), status_rx).spawn());
    }

    if config.reporter.enabled {
        let reporter = TelemetryReporter::new(
            sender,
            device_id.clone(),
            config.report_interval(),
            Arc::new(StaticTelemetry::from_config(&config.reporter)),
        );
        background.push(reporter.spawn(manager.watch_state()));
    }

    // Stored before connecting so every connection subscribes them
    for topic in &config.protocol.event_topics {
        if let Err(e) = manager.add_event_topic(topic).await {
            warn!(topic = %topic, error = %e, "Unable to register for events");
        }
    }

    let outcome = client.connect(config.connection_settings());
    debug!(outcome = ?outcome, "Connect requested");

    if !manager
        .wait_for_state(ConnectionState::Connected, config.connect_timeout())
        .await
    {
        warn!(
            state = %manager.state(),
            "Broker not connected yet, will connect when it becomes reachable"
        );
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Bridge running, waiting for commands");
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
    }

    for handle in background {
        handle.abort();
    }
    client.disconnect();
    if !manager
        .wait_for_state(ConnectionState::Disconnected, Duration::from_secs(5))
        .await
    {
        warn!("Broker connection did not close in time");
    }
    client.close().await;
    Ok(())
}

fn handle_config_command(config: &BridgeConfig, show: bool) -> AppResult<()> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    let topics = config.topic_scheme().topics_for(&config.connection_settings());
    info!(
        outbound = %topics.outbound,
        commands = %topics.command,
        system = %topics.system,
        "Configuration validation complete"
    );
    Ok(())
}

async fn verify_broker(config: &BridgeConfig) -> AppResult<()> {
    let latency = check_broker_reachable(
        &config.broker.hostname,
        config.broker.port,
        config.probe_timeout(),
    )
    .await?;
    println!(
        "Broker {}:{} reachable in {} ms",
        config.broker.hostname,
        config.broker.port,
        latency.as_millis()
    );
    Ok(())
}

async fn send_once(config: BridgeConfig, event: SendEvent) -> AppResult<()> {
    let manager = build_manager(&config)?;
    let sender = MessageSender::new(manager.clone());
    let token = config.device.id.as_str();

    manager.connect(config.connection_settings());
    if !manager
        .wait_for_state(
            ConnectionState::Connected,
            config.connect_timeout() + Duration::from_secs(1),
        )
        .await
    {
        return Err(format!("unable to connect to broker ({})", manager.state()).into());
    }

    let sent = match event {
        SendEvent::Measurement { name, value } => {
            sender
                .send_device_measurement(token, None, &name, value, None)
                .await
        }
        SendEvent::Location {
            latitude,
            longitude,
            elevation,
        } => {
            sender
                .send_device_location(token, None, latitude, longitude, elevation, None)
                .await
        }
        SendEvent::Alert {
            alert_type,
            message,
        } => {
            sender
                .send_device_alert(token, None, &alert_type, &message, None)
                .await
        }
    };

    manager.disconnect();
    manager
        .wait_for_state(ConnectionState::Disconnected, Duration::from_secs(5))
        .await;

    sent?;
    info!(device_id = %token, "Event sent");
    Ok(())
}

/// Device behaviour for `run`: registers on connect and answers commands
struct DeviceApp {
    sender: MessageSender<MqttTransport>,
    config: BridgeConfig,
}

impl DeviceApp {
    fn token(&self) -> &str {
        &self.config.device.id
    }

    async fn handle_registration_ack(&self, ack: &RegistrationAck) {
        match ack.state {
            RegistrationAckState::RegistrationError => {
                error!(
                    error_type = ?ack.error_type,
                    message = ack.error_message.as_deref().unwrap_or(""),
                    "Error registering device"
                );
                return;
            }
            RegistrationAckState::AlreadyRegistered => info!("Device was already registered"),
            RegistrationAckState::NewRegistration => info!("Device was registered successfully"),
        }

        if let Err(e) = self
            .sender
            .send_device_alert(
                self.token(),
                None,
                "sitewhere.connected",
                "Connected to SiteWhere.",
                None,
            )
            .await
        {
            error!(error = %e, "Unable to send connected alert");
        }
    }
}

#[async_trait]
impl MessageClientCallback for DeviceApp {
    async fn on_connected_to_sitewhere(&self) {
        let device = &self.config.device;
        let result = self
            .sender
            .send_device_registration(
                &device.id,
                None,
                device.area_token.as_deref(),
                device.customer_token.as_deref(),
                device.device_type_token.as_deref(),
                device.metadata.clone(),
            )
            .await;
        match result {
            Ok(()) => info!(device_id = %device.id, "Sent registration request"),
            Err(e) => error!(error = %e, "Unable to send registration request"),
        }
    }

    async fn on_disconnected_from_sitewhere(&self) {
        warn!("Disconnected from SiteWhere");
    }

    async fn on_received_system_command(&self, topic: &str, payload: &[u8]) {
        let frame = match FrameCodec::decode_frame(payload, Direction::Inbound) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(topic, error = %e, "Unable to decode system command");
                return;
            }
        };

        match &frame.payload {
            Payload::RegistrationAck(ack) => self.handle_registration_ack(ack).await,
            other => info!(command = %frame.header.command, kind = other.kind(), "Received system command"),
        }
    }

    async fn on_received_custom_command(&self, topic: &str, payload: &[u8]) {
        if let Err(e) = dispatch_custom_command(self, payload).await {
            warn!(topic, error = %e, "Unable to process custom command");
        }
    }

    async fn on_received_event_message(&self, topic: &str, payload: &[u8]) {
        let event: Value = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(_) => {
                debug!(topic, bytes = payload.len(), "Received non-JSON event message");
                return;
            }
        };

        if event.get("eventType").and_then(Value::as_str) == Some("Measurements") {
            let measurements = event.get("measurements").cloned().unwrap_or(Value::Null);
            info!(topic, measurements = %measurements, "Received measurements");
        } else {
            debug!(topic, "Received event message");
        }
    }
}

#[async_trait]
impl CustomCommandHandler for DeviceApp {
    async fn ping(&self, originator: Option<&str>) {
        match self
            .sender
            .send_ack(self.token(), originator, Some("Acknowledged."))
            .await
        {
            Ok(()) => info!("Sent response to 'ping' command"),
            Err(e) => error!(error = %e, "Unable to answer 'ping' command"),
        }
    }

    async fn test_events(&self, _originator: Option<&str>) {
        let mut measurements = BTreeMap::new();
        measurements.insert("engine.temp".to_string(), 170.0);

        let token = self.token();
        let result = async {
            self.sender
                .send_device_measurements(token, None, &measurements, None)
                .await?;
            self.sender
                .send_device_location(token, None, 33.7550, -84.3900, 0.0, None)
                .await?;
            self.sender
                .send_device_alert(token, None, "engine.overheat", "Engine is overheating!", None)
                .await
        }
        .await;

        match result {
            Ok(()) => info!("Sent response to 'testEvents' command"),
            Err(e) => error!(error = %e, "Unable to answer 'testEvents' command"),
        }
    }

    async fn change_background(&self, color: &str, originator: Option<&str>) {
        info!(color, "Background color change requested");
        match self
            .sender
            .send_ack(self.token(), originator, Some("Updated background color."))
            .await
        {
            Ok(()) => info!("Sent response to 'changeBackground' command"),
            Err(e) => error!(error = %e, "Unable to answer 'changeBackground' command"),
        }
    }
}
