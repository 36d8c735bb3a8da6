//! Logging setup and span helpers

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use logging::{connection_span, mqtt_span};
