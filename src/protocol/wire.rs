//! Protocol-buffer wire primitives for device frames
//!
//! Only the subset of the protobuf encoding that device frames use is
//! implemented here: varints, 64-bit fixed values, and length-delimited
//! fields. Readers borrow from the input buffer, so a decode only copies
//! bytes once a typed record is built from them.
//!
//! Optional scalars are carried in single-field wrapper messages
//! (`{ value = 1 }`) and maps are repeated `{ key = 1; value = 2 }` entries,
//! matching what the server-side proto definitions generate.

use super::messages::{Command, Direction};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::BTreeMap;
use thiserror::Error;

/// Longest legal varint encoding of a `u64`
pub const MAX_VARINT_LEN: usize = 10;

/// Errors raised while encoding or decoding frames
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Malformed frame: {0}")]
    Framing(String),
    #[error("Unknown {direction} command code {code}")]
    UnknownCommand { code: u64, direction: Direction },
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Payload {payload} does not match header command {command}")]
    PayloadMismatch {
        command: Command,
        payload: &'static str,
    },
}

impl CodecError {
    pub(crate) fn framing<S: Into<String>>(message: S) -> Self {
        Self::Framing(message.into())
    }
}

/// Protobuf wire types understood by the reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireType {
    Varint = 0,
    Fixed64 = 1,
    LengthDelimited = 2,
    Fixed32 = 5,
}

impl TryFrom<u8> for WireType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(WireType::Varint),
            1 => Ok(WireType::Fixed64),
            2 => Ok(WireType::LengthDelimited),
            5 => Ok(WireType::Fixed32),
            other => Err(CodecError::framing(format!(
                "unsupported wire type {other}"
            ))),
        }
    }
}

pub fn put_varint<B: BufMut>(buf: &mut B, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

pub fn varint_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

/// Read a varint, advancing `buf` past it
pub fn get_varint<B: Buf>(buf: &mut B) -> Result<u64, CodecError> {
    let mut value = 0u64;
    for index in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(CodecError::framing("truncated varint"));
        }
        let byte = buf.get_u8();
        if index == MAX_VARINT_LEN - 1 && byte > 0x01 {
            return Err(CodecError::framing("varint overflows 64 bits"));
        }
        value |= u64::from(byte & 0x7f) << (7 * index);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(CodecError::framing("varint longer than 10 bytes"))
}

pub fn put_key<B: BufMut>(buf: &mut B, field: u32, wire_type: WireType) {
    put_varint(buf, (u64::from(field) << 3) | wire_type as u64);
}

pub fn put_uint_field<B: BufMut>(buf: &mut B, field: u32, value: u64) {
    put_key(buf, field, WireType::Varint);
    put_varint(buf, value);
}

pub fn put_fixed64_field<B: BufMut>(buf: &mut B, field: u32, value: u64) {
    put_key(buf, field, WireType::Fixed64);
    buf.put_u64_le(value);
}

pub fn put_double_field<B: BufMut>(buf: &mut B, field: u32, value: f64) {
    put_key(buf, field, WireType::Fixed64);
    buf.put_f64_le(value);
}

pub fn put_bytes_field<B: BufMut>(buf: &mut B, field: u32, value: &[u8]) {
    put_key(buf, field, WireType::LengthDelimited);
    put_delimited(buf, value);
}

pub fn put_string_field<B: BufMut>(buf: &mut B, field: u32, value: &str) {
    put_bytes_field(buf, field, value.as_bytes());
}

/// Write an embedded message built by `build` as a length-delimited field
pub fn put_message_field<B, F>(buf: &mut B, field: u32, build: F)
where
    B: BufMut,
    F: FnOnce(&mut BytesMut),
{
    let mut inner = BytesMut::new();
    build(&mut inner);
    put_bytes_field(buf, field, &inner);
}

pub fn put_optional_string<B: BufMut>(buf: &mut B, field: u32, value: Option<&str>) {
    if let Some(value) = value {
        put_message_field(buf, field, |inner| put_string_field(inner, 1, value));
    }
}

pub fn put_optional_double<B: BufMut>(buf: &mut B, field: u32, value: Option<f64>) {
    if let Some(value) = value {
        put_message_field(buf, field, |inner| put_double_field(inner, 1, value));
    }
}

pub fn put_optional_fixed64<B: BufMut>(buf: &mut B, field: u32, value: Option<u64>) {
    if let Some(value) = value {
        put_message_field(buf, field, |inner| put_fixed64_field(inner, 1, value));
    }
}

pub fn put_string_map<B: BufMut>(buf: &mut B, field: u32, map: &BTreeMap<String, String>) {
    for (key, value) in map {
        put_message_field(buf, field, |entry| {
            put_string_field(entry, 1, key);
            put_string_field(entry, 2, value);
        });
    }
}

/// Prefix `record` with its varint length
pub fn put_delimited<B: BufMut>(buf: &mut B, record: &[u8]) {
    put_varint(buf, record.len() as u64);
    buf.put_slice(record);
}

/// Split one length-delimited record off the front of `buf`
pub fn take_delimited<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], CodecError> {
    let declared = get_varint(buf)?;
    let len = usize::try_from(declared)
        .map_err(|_| CodecError::framing(format!("record length {declared} is too large")))?;
    if buf.len() < len {
        return Err(CodecError::framing(format!(
            "record declares {len} bytes but only {} remain",
            buf.len()
        )));
    }
    let (record, rest) = buf.split_at(len);
    *buf = rest;
    Ok(record)
}

/// Check that `payload` is one or two well-formed delimited records
///
/// Used for command payloads whose schema is owned by the application: the
/// header record must be present and parse as protobuf fields, and an
/// optional body record may follow.
pub fn validate_delimited_records(payload: &[u8]) -> Result<(), CodecError> {
    let mut cursor = payload;
    let header = take_delimited(&mut cursor)?;
    for field in FieldReader::new(header) {
        field?;
    }
    if cursor.is_empty() {
        return Ok(());
    }
    let body = take_delimited(&mut cursor)?;
    for field in FieldReader::new(body) {
        field?;
    }
    Ok(())
}

/// A decoded field value, still in wire representation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    Varint(u64),
    Fixed64(u64),
    Bytes(&'a [u8]),
    Fixed32(u32),
}

impl<'a> FieldValue<'a> {
    fn wire_name(&self) -> &'static str {
        match self {
            FieldValue::Varint(_) => "varint",
            FieldValue::Fixed64(_) => "fixed64",
            FieldValue::Bytes(_) => "length-delimited",
            FieldValue::Fixed32(_) => "fixed32",
        }
    }

    fn mismatch(&self, name: &str, expected: &str) -> CodecError {
        CodecError::framing(format!(
            "field `{name}` is {}, expected {expected}",
            self.wire_name()
        ))
    }

    pub fn varint(self, name: &str) -> Result<u64, CodecError> {
        match self {
            FieldValue::Varint(value) => Ok(value),
            other => Err(other.mismatch(name, "varint")),
        }
    }

    pub fn fixed64(self, name: &str) -> Result<u64, CodecError> {
        match self {
            FieldValue::Fixed64(value) => Ok(value),
            other => Err(other.mismatch(name, "fixed64")),
        }
    }

    pub fn double(self, name: &str) -> Result<f64, CodecError> {
        self.fixed64(name).map(f64::from_bits)
    }

    pub fn bytes(self, name: &str) -> Result<&'a [u8], CodecError> {
        match self {
            FieldValue::Bytes(value) => Ok(value),
            other => Err(other.mismatch(name, "length-delimited")),
        }
    }

    pub fn string(self, name: &str) -> Result<String, CodecError> {
        let raw = self.bytes(name)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| CodecError::framing(format!("field `{name}` is not valid UTF-8")))
    }

    /// Unwrap a `{ value = 1 }` string wrapper
    pub fn optional_string(self, name: &str) -> Result<String, CodecError> {
        let mut value = String::new();
        for field in FieldReader::new(self.bytes(name)?) {
            if let (1, inner) = field? {
                value = inner.string(name)?;
            }
        }
        Ok(value)
    }

    /// Unwrap a `{ value = 1 }` double wrapper
    pub fn optional_double(self, name: &str) -> Result<f64, CodecError> {
        let mut value = 0.0;
        for field in FieldReader::new(self.bytes(name)?) {
            if let (1, inner) = field? {
                value = inner.double(name)?;
            }
        }
        Ok(value)
    }

    /// Unwrap a `{ value = 1 }` fixed64 wrapper
    pub fn optional_fixed64(self, name: &str) -> Result<u64, CodecError> {
        let mut value = 0;
        for field in FieldReader::new(self.bytes(name)?) {
            if let (1, inner) = field? {
                value = inner.fixed64(name)?;
            }
        }
        Ok(value)
    }

    /// Decode one `{ key = 1; value = 2 }` map entry
    pub fn map_entry(self, name: &str) -> Result<(String, String), CodecError> {
        let mut key = String::new();
        let mut value = String::new();
        for field in FieldReader::new(self.bytes(name)?) {
            match field? {
                (1, inner) => key = inner.string(name)?,
                (2, inner) => value = inner.string(name)?,
                _ => {}
            }
        }
        Ok((key, value))
    }
}

/// Iterates `(field number, value)` pairs of one encoded message
///
/// Unknown fields are yielded like any other and callers skip them. The
/// iterator stops after the first error.
pub struct FieldReader<'a> {
    buf: &'a [u8],
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn read_field(&mut self) -> Result<(u32, FieldValue<'a>), CodecError> {
        let key = get_varint(&mut self.buf)?;
        let field = u32::try_from(key >> 3)
            .map_err(|_| CodecError::framing(format!("field number in key {key} is too large")))?;
        if field == 0 {
            return Err(CodecError::framing("field number zero"));
        }
        let value = match WireType::try_from((key & 0x07) as u8)? {
            WireType::Varint => FieldValue::Varint(get_varint(&mut self.buf)?),
            WireType::Fixed64 => {
                if self.buf.remaining() < 8 {
                    return Err(CodecError::framing("truncated fixed64 field"));
                }
                FieldValue::Fixed64(self.buf.get_u64_le())
            }
            WireType::LengthDelimited => FieldValue::Bytes(take_delimited(&mut self.buf)?),
            WireType::Fixed32 => {
                if self.buf.remaining() < 4 {
                    return Err(CodecError::framing("truncated fixed32 field"));
                }
                FieldValue::Fixed32(self.buf.get_u32_le())
            }
        };
        Ok((field, value))
    }
}

impl<'a> Iterator for FieldReader<'a> {
    type Item = Result<(u32, FieldValue<'a>), CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        let result = self.read_field();
        if result.is_err() {
            self.buf = &[];
        }
        Some(result)
    }
}

/// Render the first bytes of a frame as hex for debug logs
pub fn hex_dump(bytes: &[u8]) -> String {
    const LIMIT: usize = 64;
    let mut out = bytes
        .iter()
        .take(LIMIT)
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(" ");
    if bytes.len() > LIMIT {
        out.push_str(&format!(" ... ({} bytes)", bytes.len()));
    }
    out
}
