//! Frame encoding and decoding
//!
//! A frame is two length-delimited records written back to back: the header,
//! then the payload selected by the header's command. Decoding is done in two
//! steps so a receiver can look at the command before committing to a
//! payload type.

use super::messages::{
    Acknowledgement, Alert, Command, DeviceStreamAck, DeviceStreamAckState, DeviceStreamData,
    Direction, Header, Location, Measurement, Metadata, Payload, RegistrationAck,
    RegistrationAckError, RegistrationAckState, RegistrationRequest,
};
use super::wire::{
    put_bytes_field, put_delimited, put_optional_double, put_optional_fixed64,
    put_optional_string, put_string_map, put_uint_field, take_delimited, CodecError, FieldReader,
    FieldValue,
};
use bytes::BytesMut;
use chrono::{DateTime, TimeZone, Utc};
use tracing::trace;

/// A decoded header and payload pair
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: Header,
    pub payload: Payload,
}

impl Frame {
    pub fn new(header: Header, payload: Payload) -> Self {
        Self { header, payload }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        FrameCodec::encode(&self.header, &self.payload)
    }
}

/// Stateless frame codec
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a header followed by its payload
    pub fn encode(header: &Header, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        if header.command != payload.command() {
            return Err(CodecError::PayloadMismatch {
                command: header.command,
                payload: payload.kind(),
            });
        }

        let mut record = BytesMut::new();
        encode_header(header, &mut record)?;
        let mut frame = BytesMut::with_capacity(record.len() + 64);
        put_delimited(&mut frame, &record);

        record.clear();
        encode_payload(payload, &mut record);
        put_delimited(&mut frame, &record);

        Ok(frame.to_vec())
    }

    /// Read the header record, returning it with the unread remainder
    pub fn decode_header(bytes: &[u8], direction: Direction) -> Result<(Header, &[u8]), CodecError> {
        let mut cursor = bytes;
        let record = take_delimited(&mut cursor)?;

        let mut code = 0;
        let mut device_token = None;
        let mut originator = None;
        let mut nested_path = None;
        let mut nested_spec = None;

        for field in FieldReader::new(record) {
            match (direction, field?) {
                (_, (1, value)) => code = value.varint("command")?,
                (Direction::Outbound, (2, value)) => {
                    device_token = Some(value.optional_string("deviceToken")?)
                }
                (Direction::Outbound, (3, value)) => {
                    originator = Some(value.optional_string("originator")?)
                }
                (Direction::Inbound, (2, value)) => {
                    originator = Some(value.optional_string("originator")?)
                }
                (Direction::Inbound, (3, value)) => {
                    nested_path = Some(value.optional_string("nestedPath")?)
                }
                (Direction::Inbound, (4, value)) => {
                    nested_spec = Some(value.optional_string("nestedSpec")?)
                }
                (_, (number, _)) => trace!(field = number, "Skipping unknown header field"),
            }
        }

        let command = Command::from_code(direction, code)
            .ok_or(CodecError::UnknownCommand { code, direction })?;

        let header = Header {
            command,
            device_token,
            originator,
            nested_path,
            nested_spec,
        };
        Ok((header, cursor))
    }

    /// Decode the payload record that follows a header
    pub fn decode_payload(command: Command, remainder: &[u8]) -> Result<Payload, CodecError> {
        let mut cursor = remainder;
        let record = take_delimited(&mut cursor)?;
        if !cursor.is_empty() {
            trace!(bytes = cursor.len(), "Ignoring bytes after payload record");
        }

        let payload = match command {
            Command::SendRegistration => Payload::Registration(decode_registration(record)?),
            Command::SendAcknowledgement => Payload::Acknowledgement(decode_ack(record)?),
            Command::SendMeasurement => Payload::Measurement(decode_measurement(record)?),
            Command::SendLocation => Payload::Location(decode_location(record)?),
            Command::SendAlert => Payload::Alert(decode_alert(record)?),
            Command::RegistrationAck => Payload::RegistrationAck(decode_registration_ack(record)?),
            Command::DeviceStreamAck => Payload::DeviceStreamAck(decode_stream_ack(record)?),
            Command::ReceiveDeviceStreamData => {
                Payload::DeviceStreamData(decode_stream_data(record)?)
            }
        };
        Ok(payload)
    }

    /// Decode a complete frame in one call
    pub fn decode_frame(bytes: &[u8], direction: Direction) -> Result<Frame, CodecError> {
        let (header, remainder) = Self::decode_header(bytes, direction)?;
        let payload = Self::decode_payload(header.command, remainder)?;
        Ok(Frame { header, payload })
    }
}

fn encode_header(header: &Header, buf: &mut BytesMut) -> Result<(), CodecError> {
    put_uint_field(buf, 1, header.command.code());
    match header.command.direction() {
        Direction::Outbound => {
            let token = header
                .device_token
                .as_deref()
                .filter(|token| !token.is_empty())
                .ok_or(CodecError::MissingField("deviceToken"))?;
            put_optional_string(buf, 2, Some(token));
            put_optional_string(buf, 3, header.originator.as_deref());
        }
        Direction::Inbound => {
            put_optional_string(buf, 2, header.originator.as_deref());
            put_optional_string(buf, 3, header.nested_path.as_deref());
            put_optional_string(buf, 4, header.nested_spec.as_deref());
        }
    }
    Ok(())
}

fn encode_payload(payload: &Payload, buf: &mut BytesMut) {
    match payload {
        Payload::Registration(registration) => {
            put_optional_string(buf, 1, registration.device_type_token.as_deref());
            put_optional_string(buf, 2, registration.customer_token.as_deref());
            put_optional_string(buf, 3, registration.area_token.as_deref());
            put_string_map(buf, 4, &registration.metadata);
        }
        Payload::Acknowledgement(ack) => {
            put_optional_string(buf, 1, ack.message.as_deref());
        }
        Payload::Measurement(measurement) => {
            put_optional_string(buf, 1, Some(&measurement.name));
            put_optional_double(buf, 2, Some(measurement.value));
            put_event_date(buf, 3, measurement.event_date);
            put_string_map(buf, 4, &measurement.metadata);
        }
        Payload::Location(location) => {
            put_optional_double(buf, 1, Some(location.latitude));
            put_optional_double(buf, 2, Some(location.longitude));
            put_optional_double(buf, 3, Some(location.elevation));
            put_event_date(buf, 4, location.event_date);
            put_string_map(buf, 5, &location.metadata);
        }
        Payload::Alert(alert) => {
            put_optional_string(buf, 1, Some(&alert.alert_type));
            put_optional_string(buf, 2, Some(&alert.message));
            put_event_date(buf, 3, alert.event_date);
            put_string_map(buf, 4, &alert.metadata);
        }
        Payload::RegistrationAck(ack) => {
            put_uint_field(buf, 1, ack.state.code());
            if let Some(error_type) = ack.error_type {
                put_uint_field(buf, 2, error_type.code());
            }
            put_optional_string(buf, 3, ack.error_message.as_deref());
        }
        Payload::DeviceStreamAck(ack) => {
            put_optional_string(buf, 1, ack.stream_id.as_deref());
            put_uint_field(buf, 2, ack.state.code());
        }
        Payload::DeviceStreamData(data) => {
            put_optional_string(buf, 1, data.stream_id.as_deref());
            put_optional_fixed64(buf, 2, data.sequence_number);
            put_bytes_field(buf, 3, &data.data);
        }
    }
}

fn put_event_date(buf: &mut BytesMut, field: u32, event_date: Option<DateTime<Utc>>) {
    let date = event_date.unwrap_or_else(Utc::now);
    put_optional_fixed64(buf, field, Some(date.timestamp_millis() as u64));
}

fn read_event_date(value: FieldValue<'_>) -> Result<DateTime<Utc>, CodecError> {
    let millis = value.optional_fixed64("eventDate")? as i64;
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| CodecError::framing(format!("event date {millis} is out of range")))
}

fn insert_entry(metadata: &mut Metadata, value: FieldValue<'_>) -> Result<(), CodecError> {
    let (key, value) = value.map_entry("metadata")?;
    metadata.insert(key, value);
    Ok(())
}

fn decode_registration(record: &[u8]) -> Result<RegistrationRequest, CodecError> {
    let mut registration = RegistrationRequest::default();
    for field in FieldReader::new(record) {
        match field? {
            (1, value) => {
                registration.device_type_token = Some(value.optional_string("deviceTypeToken")?)
            }
            (2, value) => {
                registration.customer_token = Some(value.optional_string("customerToken")?)
            }
            (3, value) => registration.area_token = Some(value.optional_string("areaToken")?),
            (4, value) => insert_entry(&mut registration.metadata, value)?,
            _ => {}
        }
    }
    Ok(registration)
}

fn decode_ack(record: &[u8]) -> Result<Acknowledgement, CodecError> {
    let mut ack = Acknowledgement::default();
    for field in FieldReader::new(record) {
        if let (1, value) = field? {
            ack.message = Some(value.optional_string("message")?);
        }
    }
    Ok(ack)
}

fn decode_measurement(record: &[u8]) -> Result<Measurement, CodecError> {
    let mut name = None;
    let mut value = 0.0;
    let mut event_date = None;
    let mut metadata = Metadata::new();
    for field in FieldReader::new(record) {
        match field? {
            (1, raw) => name = Some(raw.optional_string("measurementName")?),
            (2, raw) => value = raw.optional_double("measurementValue")?,
            (3, raw) => event_date = Some(read_event_date(raw)?),
            (4, raw) => insert_entry(&mut metadata, raw)?,
            _ => {}
        }
    }
    Ok(Measurement {
        name: name.ok_or(CodecError::MissingField("measurementName"))?,
        value,
        event_date,
        metadata,
    })
}

fn decode_location(record: &[u8]) -> Result<Location, CodecError> {
    let mut location = Location {
        latitude: 0.0,
        longitude: 0.0,
        elevation: 0.0,
        event_date: None,
        metadata: Metadata::new(),
    };
    for field in FieldReader::new(record) {
        match field? {
            (1, raw) => location.latitude = raw.optional_double("latitude")?,
            (2, raw) => location.longitude = raw.optional_double("longitude")?,
            (3, raw) => location.elevation = raw.optional_double("elevation")?,
            (4, raw) => location.event_date = Some(read_event_date(raw)?),
            (5, raw) => insert_entry(&mut location.metadata, raw)?,
            _ => {}
        }
    }
    Ok(location)
}

fn decode_alert(record: &[u8]) -> Result<Alert, CodecError> {
    let mut alert_type = None;
    let mut message = String::new();
    let mut event_date = None;
    let mut metadata = Metadata::new();
    for field in FieldReader::new(record) {
        match field? {
            (1, raw) => alert_type = Some(raw.optional_string("alertType")?),
            (2, raw) => message = raw.optional_string("alertMessage")?,
            (3, raw) => event_date = Some(read_event_date(raw)?),
            (4, raw) => insert_entry(&mut metadata, raw)?,
            _ => {}
        }
    }
    Ok(Alert {
        alert_type: alert_type.ok_or(CodecError::MissingField("alertType"))?,
        message,
        event_date,
        metadata,
    })
}

fn decode_registration_ack(record: &[u8]) -> Result<RegistrationAck, CodecError> {
    let mut ack = RegistrationAck {
        state: RegistrationAckState::NewRegistration,
        error_type: None,
        error_message: None,
    };
    for field in FieldReader::new(record) {
        match field? {
            (1, raw) => ack.state = RegistrationAckState::try_from(raw.varint("state")?)?,
            (2, raw) => {
                ack.error_type = Some(RegistrationAckError::try_from(raw.varint("errorType")?)?)
            }
            (3, raw) => ack.error_message = Some(raw.optional_string("errorMessage")?),
            _ => {}
        }
    }
    Ok(ack)
}

fn decode_stream_ack(record: &[u8]) -> Result<DeviceStreamAck, CodecError> {
    let mut ack = DeviceStreamAck {
        stream_id: None,
        state: DeviceStreamAckState::StreamCreated,
    };
    for field in FieldReader::new(record) {
        match field? {
            (1, raw) => ack.stream_id = Some(raw.optional_string("streamId")?),
            (2, raw) => ack.state = DeviceStreamAckState::try_from(raw.varint("state")?)?,
            _ => {}
        }
    }
    Ok(ack)
}

fn decode_stream_data(record: &[u8]) -> Result<DeviceStreamData, CodecError> {
    let mut data = DeviceStreamData {
        stream_id: None,
        sequence_number: None,
        data: Vec::new(),
    };
    for field in FieldReader::new(record) {
        match field? {
            (1, raw) => data.stream_id = Some(raw.optional_string("streamId")?),
            (2, raw) => data.sequence_number = Some(raw.optional_fixed64("sequenceNumber")?),
            (3, raw) => data.data = raw.bytes("data")?.to_vec(),
            _ => {}
        }
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::get_varint;

    fn fixed_date() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_123_456).single().unwrap()
    }

    fn measurement_frame() -> (Header, Payload) {
        let header = Header::outbound(Command::SendMeasurement, "dev-1");
        let payload = Payload::Measurement(Measurement {
            name: "temp".to_string(),
            value: 21.5,
            event_date: Some(fixed_date()),
            metadata: Metadata::new(),
        });
        (header, payload)
    }

    #[test]
    fn test_measurement_round_trip() {
        // Arrange
        let (header, payload) = measurement_frame();

        // Act
        let bytes = FrameCodec::encode(&header, &payload).unwrap();
        let frame = FrameCodec::decode_frame(&bytes, Direction::Outbound).unwrap();

        // Assert
        assert_eq!(frame.header, header);
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn test_frame_is_two_delimited_records() {
        let (header, payload) = measurement_frame();
        let bytes = FrameCodec::encode(&header, &payload).unwrap();

        let mut cursor: &[u8] = &bytes;
        let header_len = get_varint(&mut cursor).unwrap() as usize;
        cursor = &cursor[header_len..];
        let payload_len = get_varint(&mut cursor).unwrap() as usize;
        assert_eq!(cursor.len(), payload_len);
    }

    #[test]
    fn test_decode_header_leaves_payload_unread() {
        let (header, payload) = measurement_frame();
        let bytes = FrameCodec::encode(&header, &payload).unwrap();

        let (decoded, remainder) = FrameCodec::decode_header(&bytes, Direction::Outbound).unwrap();

        assert_eq!(decoded.command, Command::SendMeasurement);
        assert!(!remainder.is_empty());
        assert_eq!(
            FrameCodec::decode_payload(decoded.command, remainder).unwrap(),
            payload
        );
    }

    #[test]
    fn test_missing_event_date_uses_encode_time() {
        let header = Header::outbound(Command::SendAlert, "dev-1");
        let payload = Payload::Alert(Alert {
            alert_type: "engine.overheat".to_string(),
            message: "Engine temperature high".to_string(),
            event_date: None,
            metadata: Metadata::new(),
        });

        let before = Utc::now().timestamp_millis();
        let bytes = FrameCodec::encode(&header, &payload).unwrap();
        let after = Utc::now().timestamp_millis();

        let frame = FrameCodec::decode_frame(&bytes, Direction::Outbound).unwrap();
        let Payload::Alert(alert) = frame.payload else {
            panic!("expected alert payload");
        };
        let stamped = alert.event_date.unwrap().timestamp_millis();
        assert!(stamped >= before && stamped <= after);
    }

    #[test]
    fn test_truncated_frame_is_framing_error() {
        let (header, payload) = measurement_frame();
        let bytes = FrameCodec::encode(&header, &payload).unwrap();
        let truncated = &bytes[..bytes.len() - 3];

        let (decoded, remainder) =
            FrameCodec::decode_header(truncated, Direction::Outbound).unwrap();
        let err = FrameCodec::decode_payload(decoded.command, remainder).unwrap_err();

        assert!(matches!(err, CodecError::Framing(_)));
    }

    #[test]
    fn test_unknown_command_code() {
        let mut record = BytesMut::new();
        put_uint_field(&mut record, 1, 42);
        let mut bytes = BytesMut::new();
        put_delimited(&mut bytes, &record);

        let err = FrameCodec::decode_header(&bytes, Direction::Inbound).unwrap_err();

        assert_eq!(
            err,
            CodecError::UnknownCommand {
                code: 42,
                direction: Direction::Inbound
            }
        );
    }

    #[test]
    fn test_payload_mismatch_is_rejected() {
        let header = Header::outbound(Command::SendLocation, "dev-1");
        let payload = Payload::Acknowledgement(Acknowledgement::default());

        let err = FrameCodec::encode(&header, &payload).unwrap_err();

        assert_eq!(
            err,
            CodecError::PayloadMismatch {
                command: Command::SendLocation,
                payload: "acknowledgement"
            }
        );
    }

    #[test]
    fn test_outbound_frame_requires_device_token() {
        let mut header = Header::outbound(Command::SendAcknowledgement, "");
        let payload = Payload::Acknowledgement(Acknowledgement::default());
        assert_eq!(
            FrameCodec::encode(&header, &payload).unwrap_err(),
            CodecError::MissingField("deviceToken")
        );

        header.device_token = None;
        assert!(FrameCodec::encode(&header, &payload).is_err());
    }

    #[test]
    fn test_registration_ack_round_trip() {
        let mut header = Header::inbound(Command::RegistrationAck);
        header.originator = Some("reg-1".to_string());
        header.nested_path = Some("/child".to_string());
        let payload = Payload::RegistrationAck(RegistrationAck {
            state: RegistrationAckState::RegistrationError,
            error_type: Some(RegistrationAckError::InvalidSpecification),
            error_message: Some("Unknown device type".to_string()),
        });

        let bytes = FrameCodec::encode(&header, &payload).unwrap();
        let frame = FrameCodec::decode_frame(&bytes, Direction::Inbound).unwrap();

        assert_eq!(frame, Frame::new(header, payload));
    }

    #[test]
    fn test_registration_carries_metadata() {
        let mut metadata = Metadata::new();
        metadata.insert("manufacturer".to_string(), "acme".to_string());
        let header = Header::outbound(Command::SendRegistration, "dev-7").with_originator(None);
        let payload = Payload::Registration(RegistrationRequest {
            device_type_token: Some("android".to_string()),
            customer_token: None,
            area_token: Some("southeast".to_string()),
            metadata,
        });

        let bytes = Frame::new(header.clone(), payload.clone()).encode().unwrap();
        let frame = FrameCodec::decode_frame(&bytes, Direction::Outbound).unwrap();

        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn test_stream_data_keeps_raw_bytes() {
        let header = Header::inbound(Command::ReceiveDeviceStreamData);
        let payload = Payload::DeviceStreamData(DeviceStreamData {
            stream_id: Some("video".to_string()),
            sequence_number: Some(12),
            data: vec![0, 1, 2, 255],
        });

        let bytes = FrameCodec::encode(&header, &payload).unwrap();
        let frame = FrameCodec::decode_frame(&bytes, Direction::Inbound).unwrap();

        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn test_unknown_payload_fields_are_skipped() {
        let header = Header::outbound(Command::SendAcknowledgement, "dev-1");
        let mut record = BytesMut::new();
        put_uint_field(&mut record, 9, 77);
        put_optional_string(&mut record, 1, Some("done"));

        let mut header_record = BytesMut::new();
        encode_header(&header, &mut header_record).unwrap();
        let mut bytes = BytesMut::new();
        put_delimited(&mut bytes, &header_record);
        put_delimited(&mut bytes, &record);

        let frame = FrameCodec::decode_frame(&bytes, Direction::Outbound).unwrap();
        assert_eq!(
            frame.payload,
            Payload::Acknowledgement(Acknowledgement {
                message: Some("done".to_string())
            })
        );
    }
}
