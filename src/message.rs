//! Message framing
//!
//! Static per-message field tables plus typed encode/decode on top of the
//! codec. Each message type declares the service/characteristic it rides
//! on and the fixed byte range of every field, mirroring the flat layouts
//! peripherals expose as characteristic values.
//!
//! Buffers shorter than the declared schema width fail to decode; extra
//! trailing bytes are ignored so a peripheral can grow its schema without
//! breaking older clients.

use serde::Serialize;
use uuid::Uuid;

use crate::codec::{self, CodecError, FieldType, FieldValue};

/// Fixed byte range of one field within a message buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldDescriptor {
    pub ty: FieldType,
    pub from: usize,
    pub to: usize,
}

/// Static layout of one message type: the characteristic it targets and
/// the field table. One schema is declared per request/response type,
/// typically by generated service glue.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MessageSchema {
    pub service_id: Uuid,
    pub characteristic_id: Uuid,
    pub fields: &'static [FieldDescriptor],
}

impl MessageSchema {
    /// Total declared width of the message in bytes.
    pub fn width(&self) -> usize {
        self.fields.iter().map(|f| f.to).max().unwrap_or(0)
    }
}

/// A typed message with a static fixed-offset layout.
pub trait Message: Sized {
    fn schema() -> &'static MessageSchema;

    /// Field values in schema order.
    fn to_fields(&self) -> Vec<FieldValue>;

    /// Rebuild the message from decoded values in schema order.
    fn from_fields(fields: Vec<FieldValue>) -> Result<Self, CodecError>;
}

/// Encode a message into a buffer of its declared total width.
pub fn encode_message<M: Message>(msg: &M) -> Result<Vec<u8>, CodecError> {
    let schema = M::schema();
    let values = msg.to_fields();
    if values.len() != schema.fields.len() {
        return Err(CodecError::WrongData);
    }
    let mut buffer = vec![0u8; schema.width()];
    for (descriptor, value) in schema.fields.iter().zip(&values) {
        let encoded = codec::encode(value, descriptor.from, descriptor.to, descriptor.ty)?;
        buffer[descriptor.from..descriptor.to].copy_from_slice(&encoded);
    }
    Ok(buffer)
}

/// Decode a message from a buffer. The buffer must cover every declared
/// field; trailing bytes beyond the schema width are ignored.
pub fn decode_message<M: Message>(data: &[u8]) -> Result<M, CodecError> {
    let schema = M::schema();
    let mut fields = Vec::with_capacity(schema.fields.len());
    for descriptor in schema.fields {
        fields.push(codec::decode(data, descriptor.from, descriptor.to, descriptor.ty)?);
    }
    M::from_fields(fields)
}
