//! Device frame model
//!
//! A frame is a [`Header`] naming the command followed by the payload record
//! that command carries. Outbound commands flow from the device to the
//! server on the tenant input topic; inbound commands arrive on the device's
//! system topic.

use super::wire::CodecError;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Free-form string metadata attached to registrations and events
pub type Metadata = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to server
    Outbound,
    /// Server to device
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => write!(f, "outbound"),
            Direction::Inbound => write!(f, "inbound"),
        }
    }
}

/// Header command codes
///
/// Outbound and inbound commands share the numeric space, so a code only
/// means something together with its [`Direction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    SendRegistration,
    SendAcknowledgement,
    SendMeasurement,
    SendLocation,
    SendAlert,
    RegistrationAck,
    DeviceStreamAck,
    ReceiveDeviceStreamData,
}

impl Command {
    pub fn direction(self) -> Direction {
        match self {
            Command::SendRegistration
            | Command::SendAcknowledgement
            | Command::SendMeasurement
            | Command::SendLocation
            | Command::SendAlert => Direction::Outbound,
            Command::RegistrationAck
            | Command::DeviceStreamAck
            | Command::ReceiveDeviceStreamData => Direction::Inbound,
        }
    }

    pub fn code(self) -> u64 {
        match self {
            Command::SendRegistration => 0,
            Command::SendAcknowledgement => 1,
            Command::SendMeasurement => 2,
            Command::SendLocation => 3,
            Command::SendAlert => 4,
            Command::RegistrationAck => 0,
            Command::DeviceStreamAck => 1,
            Command::ReceiveDeviceStreamData => 2,
        }
    }

    /// Resolve a wire code. Stream commands (outbound 5 to 7) are not
    /// produced by this crate and resolve to `None`.
    pub fn from_code(direction: Direction, code: u64) -> Option<Self> {
        match (direction, code) {
            (Direction::Outbound, 0) => Some(Command::SendRegistration),
            (Direction::Outbound, 1) => Some(Command::SendAcknowledgement),
            (Direction::Outbound, 2) => Some(Command::SendMeasurement),
            (Direction::Outbound, 3) => Some(Command::SendLocation),
            (Direction::Outbound, 4) => Some(Command::SendAlert),
            (Direction::Inbound, 0) => Some(Command::RegistrationAck),
            (Direction::Inbound, 1) => Some(Command::DeviceStreamAck),
            (Direction::Inbound, 2) => Some(Command::ReceiveDeviceStreamData),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::SendRegistration => "SEND_REGISTRATION",
            Command::SendAcknowledgement => "SEND_ACKNOWLEDGEMENT",
            Command::SendMeasurement => "SEND_MEASUREMENT",
            Command::SendLocation => "SEND_LOCATION",
            Command::SendAlert => "SEND_ALERT",
            Command::RegistrationAck => "ACK_REGISTRATION",
            Command::DeviceStreamAck => "ACK_DEVICE_STREAM",
            Command::ReceiveDeviceStreamData => "RECEIVE_DEVICE_STREAM_DATA",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub command: Command,
    /// Required for outbound frames
    pub device_token: Option<String>,
    /// Correlates a response with the command that caused it
    pub originator: Option<String>,
    pub nested_path: Option<String>,
    pub nested_spec: Option<String>,
}

impl Header {
    pub fn outbound<S: Into<String>>(command: Command, device_token: S) -> Self {
        Self {
            command,
            device_token: Some(device_token.into()),
            originator: None,
            nested_path: None,
            nested_spec: None,
        }
    }

    pub fn inbound(command: Command) -> Self {
        Self {
            command,
            device_token: None,
            originator: None,
            nested_path: None,
            nested_spec: None,
        }
    }

    pub fn with_originator(mut self, originator: Option<&str>) -> Self {
        self.originator = originator.map(str::to_string);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub device_type_token: Option<String>,
    pub customer_token: Option<String>,
    pub area_token: Option<String>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acknowledgement {
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub name: String,
    pub value: f64,
    /// Filled with the encode time when absent
    pub event_date: Option<DateTime<Utc>>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
    pub event_date: Option<DateTime<Utc>>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub alert_type: String,
    pub message: String,
    pub event_date: Option<DateTime<Utc>>,
    pub metadata: Metadata,
}

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident, $label:literal { $($variant:ident = $code:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn code(self) -> u64 {
                match self {
                    $($name::$variant => $code),+
                }
            }
        }

        impl TryFrom<u64> for $name {
            type Error = CodecError;

            fn try_from(value: u64) -> Result<Self, Self::Error> {
                match value {
                    $($code => Ok($name::$variant),)+
                    other => Err(CodecError::framing(format!(
                        concat!("unknown ", $label, " {}"),
                        other
                    ))),
                }
            }
        }
    };
}

wire_enum!(
    /// Outcome reported by the server for a registration request
    RegistrationAckState, "registration ack state" {
        NewRegistration = 0,
        AlreadyRegistered = 1,
        RegistrationError = 2,
    }
);

wire_enum!(
    RegistrationAckError, "registration error type" {
        InvalidSpecification = 0,
        SiteTokenRequired = 1,
        NewDevicesNotAllowed = 2,
    }
);

wire_enum!(
    DeviceStreamAckState, "device stream ack state" {
        StreamCreated = 0,
        StreamExists = 1,
        StreamFailed = 2,
    }
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationAck {
    pub state: RegistrationAckState,
    pub error_type: Option<RegistrationAckError>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStreamAck {
    pub stream_id: Option<String>,
    pub state: DeviceStreamAckState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStreamData {
    pub stream_id: Option<String>,
    pub sequence_number: Option<u64>,
    pub data: Vec<u8>,
}

/// Command-specific frame body
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Registration(RegistrationRequest),
    Acknowledgement(Acknowledgement),
    Measurement(Measurement),
    Location(Location),
    Alert(Alert),
    RegistrationAck(RegistrationAck),
    DeviceStreamAck(DeviceStreamAck),
    DeviceStreamData(DeviceStreamData),
}

impl Payload {
    /// The header command that carries this payload
    pub fn command(&self) -> Command {
        match self {
            Payload::Registration(_) => Command::SendRegistration,
            Payload::Acknowledgement(_) => Command::SendAcknowledgement,
            Payload::Measurement(_) => Command::SendMeasurement,
            Payload::Location(_) => Command::SendLocation,
            Payload::Alert(_) => Command::SendAlert,
            Payload::RegistrationAck(_) => Command::RegistrationAck,
            Payload::DeviceStreamAck(_) => Command::DeviceStreamAck,
            Payload::DeviceStreamData(_) => Command::ReceiveDeviceStreamData,
        }
    }

    /// Short label used in logs and encoding errors
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Registration(_) => "registration",
            Payload::Acknowledgement(_) => "acknowledgement",
            Payload::Measurement(_) => "measurement",
            Payload::Location(_) => "location",
            Payload::Alert(_) => "alert",
            Payload::RegistrationAck(_) => "registration ack",
            Payload::DeviceStreamAck(_) => "device stream ack",
            Payload::DeviceStreamData(_) => "device stream data",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes_resolve_per_direction() {
        for command in [
            Command::SendRegistration,
            Command::SendAcknowledgement,
            Command::SendMeasurement,
            Command::SendLocation,
            Command::SendAlert,
            Command::RegistrationAck,
            Command::DeviceStreamAck,
            Command::ReceiveDeviceStreamData,
        ] {
            assert_eq!(
                Command::from_code(command.direction(), command.code()),
                Some(command)
            );
        }
    }

    #[test]
    fn test_shared_code_differs_by_direction() {
        assert_eq!(
            Command::from_code(Direction::Outbound, 2),
            Some(Command::SendMeasurement)
        );
        assert_eq!(
            Command::from_code(Direction::Inbound, 2),
            Some(Command::ReceiveDeviceStreamData)
        );
    }

    #[test]
    fn test_stream_commands_are_not_resolved() {
        for code in 5..=7 {
            assert_eq!(Command::from_code(Direction::Outbound, code), None);
        }
        assert_eq!(Command::from_code(Direction::Inbound, 3), None);
    }

    #[test]
    fn test_wire_enum_conversion() {
        assert_eq!(
            RegistrationAckState::try_from(1).unwrap(),
            RegistrationAckState::AlreadyRegistered
        );
        assert_eq!(RegistrationAckError::NewDevicesNotAllowed.code(), 2);
        let err = DeviceStreamAckState::try_from(9).unwrap_err();
        assert_eq!(err.to_string(), "Malformed frame: unknown device stream ack state 9");
    }

    #[test]
    fn test_payload_command_mapping() {
        let payload = Payload::Acknowledgement(Acknowledgement {
            message: Some("ok".to_string()),
        });
        assert_eq!(payload.command(), Command::SendAcknowledgement);
        assert_eq!(payload.kind(), "acknowledgement");
    }

    #[test]
    fn test_header_builders() {
        let header = Header::outbound(Command::SendAlert, "dev-1").with_originator(Some("cmd-9"));
        assert_eq!(header.device_token.as_deref(), Some("dev-1"));
        assert_eq!(header.originator.as_deref(), Some("cmd-9"));
        assert_eq!(Header::inbound(Command::RegistrationAck).device_token, None);
    }
}
