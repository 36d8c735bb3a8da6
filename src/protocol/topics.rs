//! Topic layout and inbound topic classification
//!
//! Every device publishes to one outbound input topic and listens on two
//! inbound topics of its own: the command topic for application-defined
//! custom commands and the system topic for server-generated frames.

use crate::config::ConnectionSettings;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_TOPIC_PREFIX: &str = "SiteWhere";

/// Where outbound frames are published
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundLayout {
    /// `<prefix>/<tenant>/input/protobuf`
    #[default]
    Tenant,
    /// `<prefix>/input/protobuf`, shared by all tenants
    Shared,
}

/// Category of a received message, decided from its topic alone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InboundKind {
    SystemCommand,
    CustomCommand,
    EventMessage,
}

/// The topics bound to one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    pub outbound: String,
    pub command: String,
    pub system: String,
}

impl TopicSet {
    /// Topics subscribed for every connection, command topic first
    pub fn inbound(&self) -> [&str; 2] {
        [&self.command, &self.system]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    prefix: String,
    layout: OutboundLayout,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_PREFIX, OutboundLayout::Tenant)
    }
}

impl TopicScheme {
    /// Trailing separators on `prefix` are dropped
    pub fn new<S: Into<String>>(prefix: S, layout: OutboundLayout) -> Self {
        let prefix = prefix.into();
        let prefix = prefix.trim_end_matches('/').to_string();
        Self { prefix, layout }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn layout(&self) -> OutboundLayout {
        self.layout
    }

    pub fn outbound_topic(&self, tenant: &str) -> String {
        match self.layout {
            OutboundLayout::Tenant => format!("{}/{tenant}/input/protobuf", self.prefix),
            OutboundLayout::Shared => format!("{}/input/protobuf", self.prefix),
        }
    }

    pub fn command_prefix(&self) -> String {
        format!("{}/commands/", self.prefix)
    }

    pub fn system_prefix(&self) -> String {
        format!("{}/system/", self.prefix)
    }

    pub fn command_topic(&self, device_id: &str) -> String {
        format!("{}{device_id}", self.command_prefix())
    }

    pub fn system_topic(&self, device_id: &str) -> String {
        format!("{}{device_id}", self.system_prefix())
    }

    pub fn topics_for(&self, settings: &ConnectionSettings) -> TopicSet {
        TopicSet {
            outbound: self.outbound_topic(&settings.tenant),
            command: self.command_topic(&settings.device_id),
            system: self.system_topic(&settings.device_id),
        }
    }

    /// Total over all topic strings; anything outside the two device
    /// prefixes is an event message.
    pub fn classify(&self, topic: &str) -> InboundKind {
        let Some(rest) = topic
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            return InboundKind::EventMessage;
        };

        if rest.starts_with("commands/") {
            InboundKind::CustomCommand
        } else if rest.starts_with("system/") {
            InboundKind::SystemCommand
        } else {
            InboundKind::EventMessage
        }
    }
}

/// Reject identifiers that would break the topic layout
pub fn validate_identifier(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty(field));
    }

    for ch in value.chars() {
        if matches!(ch, '+' | '#' | '/') || ch.is_whitespace() || ch.is_control() {
            return Err(ValidationError::InvalidChar { field, ch });
        }
    }

    Ok(())
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("{0} cannot be empty")]
    Empty(&'static str),
    #[error("{field} contains invalid character: '{ch}'")]
    InvalidChar { field: &'static str, ch: char },
}
