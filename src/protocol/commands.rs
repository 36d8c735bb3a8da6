//! Custom commands delivered on the device command topic
//!
//! Custom commands are defined per device type on the server. This module
//! carries the command set bundled with the reference device: `ping`,
//! `testEvents` and `changeBackground`. Frames use the same two-record layout
//! as system commands but with plain string header fields.

use super::messages::Direction;
use super::wire::{
    put_delimited, put_string_field, put_uint_field, take_delimited, CodecError, FieldReader,
};
use async_trait::async_trait;
use bytes::BytesMut;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomCommand {
    Ping,
    TestEvents,
    ChangeBackground { color: String },
}

/// A decoded custom command with its header context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomCommandEnvelope {
    pub command: CustomCommand,
    pub originator: Option<String>,
    pub nested_path: Option<String>,
    pub nested_spec: Option<String>,
}

impl CustomCommand {
    pub fn code(&self) -> u64 {
        match self {
            CustomCommand::Ping => 1,
            CustomCommand::TestEvents => 2,
            CustomCommand::ChangeBackground { .. } => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CustomCommand::Ping => "ping",
            CustomCommand::TestEvents => "testEvents",
            CustomCommand::ChangeBackground { .. } => "changeBackground",
        }
    }

    /// Encode as the server would send it
    pub fn encode(&self, originator: Option<&str>) -> Vec<u8> {
        let mut header = BytesMut::new();
        put_uint_field(&mut header, 1, self.code());
        if let Some(originator) = originator {
            put_string_field(&mut header, 2, originator);
        }

        let mut body = BytesMut::new();
        if let CustomCommand::ChangeBackground { color } = self {
            put_string_field(&mut body, 1, color);
        }

        let mut frame = BytesMut::with_capacity(header.len() + body.len() + 4);
        put_delimited(&mut frame, &header);
        put_delimited(&mut frame, &body);
        frame.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<CustomCommandEnvelope, CodecError> {
        let mut cursor = bytes;
        let header = take_delimited(&mut cursor)?;

        let mut code = 0;
        let mut originator = None;
        let mut nested_path = None;
        let mut nested_spec = None;
        for field in FieldReader::new(header) {
            match field? {
                (1, value) => code = value.varint("command")?,
                (2, value) => originator = Some(value.string("originator")?),
                (3, value) => nested_path = Some(value.string("nestedPath")?),
                (4, value) => nested_spec = Some(value.string("nestedSpec")?),
                _ => {}
            }
        }

        // Commands without parameters may omit the body record entirely
        let body = if cursor.is_empty() {
            &[][..]
        } else {
            take_delimited(&mut cursor)?
        };

        let command = match code {
            1 => CustomCommand::Ping,
            2 => CustomCommand::TestEvents,
            3 => {
                let mut color = String::new();
                for field in FieldReader::new(body) {
                    if let (1, value) = field? {
                        color = value.string("color")?;
                    }
                }
                CustomCommand::ChangeBackground { color }
            }
            other => {
                return Err(CodecError::UnknownCommand {
                    code: other,
                    direction: Direction::Inbound,
                })
            }
        };

        Ok(CustomCommandEnvelope {
            command,
            originator,
            nested_path,
            nested_spec,
        })
    }
}

/// Application hooks, one per custom command
#[async_trait]
pub trait CustomCommandHandler: Send + Sync {
    async fn ping(&self, originator: Option<&str>);

    async fn test_events(&self, originator: Option<&str>);

    async fn change_background(&self, color: &str, originator: Option<&str>);
}

/// Decode `payload` and invoke the matching handler method
pub async fn dispatch_custom_command<H>(
    handler: &H,
    payload: &[u8],
) -> Result<CustomCommand, CodecError>
where
    H: CustomCommandHandler + ?Sized,
{
    let envelope = CustomCommand::decode(payload)?;
    let originator = envelope.originator.as_deref();
    debug!(
        command = envelope.command.name(),
        originator = originator.unwrap_or("-"),
        "Dispatching custom command"
    );

    match &envelope.command {
        CustomCommand::Ping => handler.ping(originator).await,
        CustomCommand::TestEvents => handler.test_events(originator).await,
        CustomCommand::ChangeBackground { color } => {
            handler.change_background(color, originator).await
        }
    }

    Ok(envelope.command)
}
