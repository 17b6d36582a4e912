//! Connection handshake header.
//!
//! The header is exchanged once when two peers set up a topic connection.
//! It is a sequence of little-endian length-prefixed `name=value` records:
//!
//! ```text
//! +------------------+---------------------------------------+
//! | u32 total_len    | sum of (4 + record_len) over records  |
//! +------------------+---------------------------------------+
//! | u32 record_len   | first record                          |
//! | name=value       |                                       |
//! +------------------+---------------------------------------+
//! | ...              | remaining records                     |
//! +------------------+---------------------------------------+
//! ```
//!
//! Absent fields are never written. A header with no fields at all encodes
//! to zero bytes, without even the total length prefix.

use crate::error::{DecodeError, EncodeError};
use crate::topic::{MessageType, TopicName};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Size of every length prefix in bytes
pub const LEN_PREFIX_SIZE: usize = 4;

/// Header fields in their fixed wire order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    /// Name of the node that opens the connection
    CallerId,
    /// Absolute topic name
    Topic,
    /// Message type name
    Type,
    /// Full message definition text
    MessageDefinition,
    /// Checksum of the message definition
    Md5Sum,
}

impl Field {
    /// All fields in wire order
    pub const ALL: [Field; 5] = [
        Field::CallerId,
        Field::Topic,
        Field::Type,
        Field::MessageDefinition,
        Field::Md5Sum,
    ];

    /// Field name token used on the wire
    pub fn name(self) -> &'static str {
        match self {
            Field::CallerId => "callerid",
            Field::Topic => "topic",
            Field::Type => "type",
            Field::MessageDefinition => "message_definition",
            Field::Md5Sum => "md5sum",
        }
    }

    /// Look up a field by its wire token (case sensitive)
    pub fn from_name(name: &str) -> Option<Field> {
        match name {
            "callerid" => Some(Field::CallerId),
            "topic" => Some(Field::Topic),
            "type" => Some(Field::Type),
            "message_definition" => Some(Field::MessageDefinition),
            "md5sum" => Some(Field::Md5Sum),
            _ => None,
        }
    }
}

/// Connection handshake header.
///
/// Each field is independently present or absent. `Some(String::new())` is a
/// present field with an empty value and is encoded as `name=`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionHeader {
    /// Caller identifier
    pub caller_id: Option<String>,
    /// Topic name
    pub topic: Option<String>,
    /// Message type name
    #[serde(rename = "type")]
    pub type_name: Option<String>,
    /// Message definition text
    pub message_definition: Option<String>,
    /// Message definition checksum
    pub md5sum: Option<String>,
}

impl ConnectionHeader {
    /// Create a header with every field absent
    pub fn new() -> Self {
        Self::default()
    }

    /// Header describing a topic endpoint: caller, topic and full type identity
    pub fn for_topic(
        caller_id: impl Into<String>,
        topic: &TopicName,
        message_type: &MessageType,
    ) -> Self {
        Self {
            caller_id: Some(caller_id.into()),
            topic: Some(topic.to_string()),
            type_name: Some(message_type.name.clone()),
            message_definition: message_type.definition.clone(),
            md5sum: message_type.md5sum.clone(),
        }
    }

    /// Set the caller identifier
    pub fn with_caller_id(mut self, value: impl Into<String>) -> Self {
        self.caller_id = Some(value.into());
        self
    }

    /// Set the topic name
    pub fn with_topic(mut self, value: impl Into<String>) -> Self {
        self.topic = Some(value.into());
        self
    }

    /// Set the message type name
    pub fn with_type(mut self, value: impl Into<String>) -> Self {
        self.type_name = Some(value.into());
        self
    }

    /// Set the message definition text
    pub fn with_message_definition(mut self, value: impl Into<String>) -> Self {
        self.message_definition = Some(value.into());
        self
    }

    /// Set the definition checksum
    pub fn with_md5sum(mut self, value: impl Into<String>) -> Self {
        self.md5sum = Some(value.into());
        self
    }

    /// Value of a field, if present
    pub fn get(&self, field: Field) -> Option<&str> {
        self.slot(field).as_deref()
    }

    /// Set a field to a present value
    pub fn set(&mut self, field: Field, value: impl Into<String>) {
        *self.slot_mut(field) = Some(value.into());
    }

    /// True when no field is present
    pub fn is_empty(&self) -> bool {
        Field::ALL.iter().all(|f| self.slot(*f).is_none())
    }

    fn slot(&self, field: Field) -> &Option<String> {
        match field {
            Field::CallerId => &self.caller_id,
            Field::Topic => &self.topic,
            Field::Type => &self.type_name,
            Field::MessageDefinition => &self.message_definition,
            Field::Md5Sum => &self.md5sum,
        }
    }

    fn slot_mut(&mut self, field: Field) -> &mut Option<String> {
        match field {
            Field::CallerId => &mut self.caller_id,
            Field::Topic => &mut self.topic,
            Field::Type => &mut self.type_name,
            Field::MessageDefinition => &mut self.message_definition,
            Field::Md5Sum => &mut self.md5sum,
        }
    }

    /// Present fields in wire order
    fn present(&self) -> impl Iterator<Item = (Field, &str)> + '_ {
        Field::ALL
            .into_iter()
            .filter_map(move |f| self.get(f).map(|v| (f, v)))
    }

    /// Bytes covered by the total length prefix
    fn fields_len(&self) -> usize {
        self.present()
            .map(|(f, v)| LEN_PREFIX_SIZE + record_len(f, v))
            .sum()
    }

    /// Exact number of bytes `encode` writes
    pub fn encoded_len(&self) -> usize {
        match self.fields_len() {
            0 => 0,
            n => LEN_PREFIX_SIZE + n,
        }
    }

    /// Encode the header (little-endian length prefixes).
    ///
    /// Fails without writing anything if the fields do not fit the 32-bit
    /// length prefixes.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let total = self.fields_len();
        if total == 0 {
            return Ok(());
        }
        let total_prefix = wire_len(total)?;

        buf.reserve(LEN_PREFIX_SIZE + total);
        buf.put_u32_le(total_prefix);

        for (field, value) in self.present() {
            // bounded by the total checked above
            buf.put_u32_le(record_len(field, value) as u32);
            buf.put_slice(field.name().as_bytes());
            buf.put_u8(b'=');
            buf.put_slice(value.as_bytes());
        }
        Ok(())
    }

    /// Encode the header into a new buffer
    pub fn to_bytes(&self) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a header, ignoring any bytes after it
    pub fn decode(input: &[u8]) -> Result<Self, DecodeError> {
        Self::decode_prefix(input).map(|(header, _)| header)
    }

    /// Decode a header from the start of `input`.
    ///
    /// Returns the header and the number of bytes it occupied. Decoding stops
    /// at the declared total length; trailing bytes belong to the caller.
    /// Empty input is an all-absent header.
    pub fn decode_prefix(input: &[u8]) -> Result<(Self, usize), DecodeError> {
        if input.is_empty() {
            return Ok((Self::default(), 0));
        }

        let mut buf = input;
        let declared = read_len(&mut buf, 0)?;
        let mut consumed = 0;
        let mut header = Self::default();

        while consumed < declared {
            let offset = input.len() - buf.remaining();
            let len = read_len(&mut buf, offset)?;
            let body_offset = offset + LEN_PREFIX_SIZE;

            consumed = match LEN_PREFIX_SIZE
                .checked_add(len)
                .and_then(|n| consumed.checked_add(n))
            {
                Some(n) if n <= declared => n,
                Some(n) => return Err(DecodeError::LengthMismatch { declared, consumed: n }),
                None => {
                    return Err(DecodeError::LengthMismatch {
                        declared,
                        consumed: usize::MAX,
                    })
                }
            };
            if buf.remaining() < len {
                return Err(DecodeError::Truncated {
                    offset: body_offset,
                    needed: len,
                    available: buf.remaining(),
                });
            }

            let record = &buf[..len];
            buf.advance(len);

            let text = std::str::from_utf8(record)
                .map_err(|_| DecodeError::InvalidUtf8 { offset: body_offset })?;
            let (name, value) = text
                .split_once('=')
                .ok_or(DecodeError::MissingSeparator { offset: body_offset })?;

            match Field::from_name(name) {
                Some(field) => header.set(field, value),
                None => trace!("Ignoring unknown header field '{}' at offset {}", name, body_offset),
            }
        }

        Ok((header, LEN_PREFIX_SIZE + declared))
    }
}

/// Length of the `name=value` record body
fn record_len(field: Field, value: &str) -> usize {
    field.name().len() + 1 + value.len()
}

/// Length as a 32-bit wire prefix
fn wire_len(len: usize) -> Result<u32, EncodeError> {
    u32::try_from(len).map_err(|_| EncodeError::TooLarge { len })
}

/// Read one little-endian length prefix located at `offset`
fn read_len(buf: &mut &[u8], offset: usize) -> Result<usize, DecodeError> {
    if buf.remaining() < LEN_PREFIX_SIZE {
        return Err(DecodeError::Truncated {
            offset,
            needed: LEN_PREFIX_SIZE,
            available: buf.remaining(),
        });
    }
    Ok(buf.get_u32_le() as usize)
}
