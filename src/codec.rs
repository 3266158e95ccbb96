//! Fixed-offset field codec
//!
//! Converts between flat byte buffers and typed fields at fixed byte
//! ranges. Peripherals expose characteristic values as flat fixed-layout
//! buffers, so every field's offsets are declared statically in the
//! message schema and never derived from preceding fields. All functions
//! here are pure; a short buffer is always a visible error, never a
//! zero-filled default.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Field width or value inconsistent with the declared schema.
    #[error("field width or value inconsistent with declared schema")]
    WrongData,

    /// The schema carries a field type this codec does not support.
    #[error("unsupported field type")]
    UnsupportedType,
}

/// Wire type of a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    /// Signed integer stored little-endian in 1, 2 or 4 bytes.
    Int32,
    /// Single byte, nonzero means true.
    Bool,
    /// Raw bytes of exactly the declared width.
    Bytes,
    /// Placeholder for schema entries generated from types this codec
    /// does not handle. Always an error at encode/decode time.
    Unknown,
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Int32(i32),
    Bool(bool),
    Bytes(Vec<u8>),
}

/// Decode the field occupying `data[from..to]` as `ty`.
pub fn decode(data: &[u8], from: usize, to: usize, ty: FieldType) -> Result<FieldValue, CodecError> {
    if from > to || to > data.len() {
        return Err(CodecError::WrongData);
    }
    match ty {
        FieldType::Int32 => {
            let value = match to - from {
                1 => i32::from(data[from] as i8),
                2 => i32::from(i16::from_le_bytes([data[from], data[from + 1]])),
                4 => {
                    let mut raw = [0u8; 4];
                    raw.copy_from_slice(&data[from..to]);
                    i32::from_le_bytes(raw)
                }
                _ => return Err(CodecError::WrongData),
            };
            Ok(FieldValue::Int32(value))
        }
        FieldType::Bool => {
            if to - from != 1 {
                return Err(CodecError::WrongData);
            }
            Ok(FieldValue::Bool(data[from] != 0))
        }
        FieldType::Bytes => Ok(FieldValue::Bytes(data[from..to].to_vec())),
        FieldType::Unknown => Err(CodecError::UnsupportedType),
    }
}

/// Encode `value` into the `to - from` bytes it occupies on the wire.
pub fn encode(value: &FieldValue, from: usize, to: usize, ty: FieldType) -> Result<Vec<u8>, CodecError> {
    if from > to {
        return Err(CodecError::WrongData);
    }
    let width = to - from;
    match (ty, value) {
        (FieldType::Int32, FieldValue::Int32(v)) => {
            if width == 0 || width > 4 {
                return Err(CodecError::WrongData);
            }
            Ok(v.to_le_bytes()[..width].to_vec())
        }
        (FieldType::Bool, FieldValue::Bool(v)) => {
            if width != 1 {
                return Err(CodecError::WrongData);
            }
            Ok(vec![u8::from(*v)])
        }
        (FieldType::Bytes, FieldValue::Bytes(v)) => {
            if v.len() != width {
                return Err(CodecError::WrongData);
            }
            Ok(v.clone())
        }
        (FieldType::Unknown, _) => Err(CodecError::UnsupportedType),
        // Value shape does not match the declared field type.
        _ => Err(CodecError::WrongData),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int32_round_trip_all_widths() {
        for &(value, width) in &[(123i32, 1usize), (123, 2), (123, 4), (-2, 2), (-2, 4), (0x1234_5678, 4)] {
            let encoded = encode(&FieldValue::Int32(value), 0, width, FieldType::Int32).unwrap();
            assert_eq!(encoded.len(), width);
            let decoded = decode(&encoded, 0, width, FieldType::Int32).unwrap();
            assert_eq!(decoded, FieldValue::Int32(value), "width {}", width);
        }
    }

    #[test]
    fn test_int32_single_byte_vector() {
        let encoded = encode(&FieldValue::Int32(123), 0, 1, FieldType::Int32).unwrap();
        assert_eq!(encoded, vec![0x7B]);
        assert_eq!(
            decode(&[0x7B], 0, 1, FieldType::Int32).unwrap(),
            FieldValue::Int32(123)
        );
    }

    #[test]
    fn test_int32_little_endian_layout() {
        let encoded = encode(&FieldValue::Int32(0x0102_0304), 0, 4, FieldType::Int32).unwrap();
        assert_eq!(encoded, vec![0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_int32_sign_extension() {
        assert_eq!(
            decode(&[0x85], 0, 1, FieldType::Int32).unwrap(),
            FieldValue::Int32(-123)
        );
        assert_eq!(
            decode(&[0xFE, 0xFF], 0, 2, FieldType::Int32).unwrap(),
            FieldValue::Int32(-2)
        );
    }

    #[test]
    fn test_int32_rejects_bad_widths() {
        assert_eq!(
            decode(&[0x01, 0x02, 0x03], 0, 3, FieldType::Int32),
            Err(CodecError::WrongData)
        );
        assert_eq!(
            encode(&FieldValue::Int32(1), 0, 5, FieldType::Int32),
            Err(CodecError::WrongData)
        );
        assert_eq!(
            encode(&FieldValue::Int32(1), 0, 0, FieldType::Int32),
            Err(CodecError::WrongData)
        );
    }

    #[test]
    fn test_bool_round_trip() {
        for &value in &[true, false] {
            let encoded = encode(&FieldValue::Bool(value), 0, 1, FieldType::Bool).unwrap();
            assert_eq!(
                decode(&encoded, 0, 1, FieldType::Bool).unwrap(),
                FieldValue::Bool(value)
            );
        }
        // Any nonzero byte decodes as true.
        assert_eq!(decode(&[0x42], 0, 1, FieldType::Bool).unwrap(), FieldValue::Bool(true));
    }

    #[test]
    fn test_bool_width_must_be_one() {
        assert_eq!(
            decode(&[0x01, 0x00], 0, 2, FieldType::Bool),
            Err(CodecError::WrongData)
        );
        assert_eq!(
            encode(&FieldValue::Bool(true), 0, 2, FieldType::Bool),
            Err(CodecError::WrongData)
        );
    }

    #[test]
    fn test_bytes_round_trip_at_offset() {
        let payload = vec![0xDE, 0xAD, 0xBE, 0xEF];
        let encoded = encode(&FieldValue::Bytes(payload.clone()), 2, 6, FieldType::Bytes).unwrap();
        assert_eq!(encoded, payload);

        let buffer = [0x00, 0x00, 0xDE, 0xAD, 0xBE, 0xEF];
        assert_eq!(
            decode(&buffer, 2, 6, FieldType::Bytes).unwrap(),
            FieldValue::Bytes(payload)
        );
    }

    #[test]
    fn test_bytes_length_must_match_exactly() {
        assert_eq!(
            encode(&FieldValue::Bytes(vec![0x01]), 0, 2, FieldType::Bytes),
            Err(CodecError::WrongData)
        );
        assert_eq!(
            encode(&FieldValue::Bytes(vec![0x01, 0x02, 0x03]), 0, 2, FieldType::Bytes),
            Err(CodecError::WrongData)
        );
    }

    #[test]
    fn test_short_buffer_is_an_error_for_every_type() {
        let data = [0x01u8, 0x02];
        for ty in [FieldType::Int32, FieldType::Bool, FieldType::Bytes] {
            assert_eq!(decode(&data, 0, 4, ty), Err(CodecError::WrongData), "{:?}", ty);
            assert_eq!(decode(&data, 2, 3, ty), Err(CodecError::WrongData), "{:?}", ty);
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert_eq!(
            decode(&[0x01], 0, 1, FieldType::Unknown),
            Err(CodecError::UnsupportedType)
        );
        assert_eq!(
            encode(&FieldValue::Int32(1), 0, 1, FieldType::Unknown),
            Err(CodecError::UnsupportedType)
        );
    }

    #[test]
    fn test_value_type_mismatch_rejected() {
        assert_eq!(
            encode(&FieldValue::Bool(true), 0, 1, FieldType::Int32),
            Err(CodecError::WrongData)
        );
        assert_eq!(
            encode(&FieldValue::Bytes(vec![0x01]), 0, 1, FieldType::Bool),
            Err(CodecError::WrongData)
        );
    }
}
