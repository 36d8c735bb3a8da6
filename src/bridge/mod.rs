//! Connection lifecycle and inbound routing
//!
//! - [`state`]: connection states and the transition rules
//! - [`manager`]: the single owner of the broker connection
//! - [`registry`]: listener bookkeeping and fan-out
//! - [`network`]: reacting to connectivity changes

pub mod manager;
pub mod network;
pub mod registry;
pub mod state;

pub use manager::{validate_inbound, ConnectOutcome, ConnectionManager};
pub use network::{
    NetworkAction, NetworkAware, NetworkMonitor, NetworkPolicy, NetworkStatus, ReachabilityProbe,
};
pub use registry::{BridgeListener, ChannelListener, ListenerEvent, ListenerId, ListenerRegistry};
pub use state::{ConnectionEvent, ConnectionState, StateMachine};
