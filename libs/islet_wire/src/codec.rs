// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use bytes::Bytes;
use rmpv::Value;

use crate::{error::WireError, refs::Ref, value::WireValue};

/// Serializes a payload tree. Refs become MessagePack extension values with
/// their registered code; everything else maps onto the native model.
pub fn encode_value(value: &WireValue) -> Result<Vec<u8>, WireError> {
    let raw = to_rmpv(value)?;
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &raw).map_err(|err| WireError::Decode(err.to_string()))?;
    Ok(buf)
}

/// Deserializes a payload produced by [`encode_value`]. Trailing bytes after
/// the value are a protocol error.
pub fn decode_value(payload: &[u8]) -> Result<WireValue, WireError> {
    let mut cursor = payload;
    let raw =
        rmpv::decode::read_value(&mut cursor).map_err(|err| WireError::Decode(err.to_string()))?;
    if !cursor.is_empty() {
        return Err(WireError::Decode(format!(
            "{} trailing bytes after payload",
            cursor.len()
        )));
    }
    from_rmpv(raw)
}

fn to_rmpv(value: &WireValue) -> Result<Value, WireError> {
    Ok(match value {
        WireValue::Null => Value::Nil,
        WireValue::Bool(value) => Value::Boolean(*value),
        WireValue::Int(value) => Value::from(*value),
        WireValue::Uint(value) => Value::from(*value),
        WireValue::Float(value) => Value::F64(*value),
        WireValue::Str(value) => Value::from(value.as_str()),
        WireValue::Bin(value) => Value::from(value.to_vec()),
        WireValue::Array(items) => Value::Array(
            items
                .iter()
                .map(to_rmpv)
                .collect::<Result<Vec<_>, WireError>>()?,
        ),
        WireValue::Map(entries) => Value::Map(
            entries
                .iter()
                .map(|(key, entry)| Ok((Value::from(key.as_str()), to_rmpv(entry)?)))
                .collect::<Result<Vec<_>, WireError>>()?,
        ),
        WireValue::Ref(reference) => {
            Value::Ext(reference.ext_code(), reference.encode_payload()?)
        },
    })
}

fn from_rmpv(value: Value) -> Result<WireValue, WireError> {
    Ok(match value {
        Value::Nil => WireValue::Null,
        Value::Boolean(value) => WireValue::Bool(value),
        Value::Integer(value) => {
            if let Some(unsigned) = value.as_u64() {
                WireValue::Uint(unsigned)
            } else if let Some(signed) = value.as_i64() {
                WireValue::Int(signed)
            } else {
                return Err(WireError::Decode("integer out of range".to_string()));
            }
        },
        Value::F32(value) => WireValue::Float(value as f64),
        Value::F64(value) => WireValue::Float(value),
        Value::String(value) => match value.into_str() {
            Some(string) => WireValue::Str(string),
            None => return Err(WireError::Decode("invalid utf-8 in string".to_string())),
        },
        Value::Binary(data) => WireValue::Bin(Bytes::from(data)),
        Value::Array(items) => WireValue::Array(
            items
                .into_iter()
                .map(from_rmpv)
                .collect::<Result<Vec<_>, WireError>>()?,
        ),
        Value::Map(entries) => {
            let mut decoded = Vec::with_capacity(entries.len());
            for (key, entry) in entries {
                let key = match key {
                    Value::String(key) => key
                        .into_str()
                        .ok_or_else(|| WireError::Decode("invalid utf-8 in key".to_string()))?,
                    _ => return Err(WireError::Decode("map key must be a string".to_string())),
                };
                decoded.push((key, from_rmpv(entry)?));
            }
            WireValue::Map(decoded)
        },
        Value::Ext(code, payload) => WireValue::Ref(Ref::decode(code, &payload)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::BlobRef;

    fn round_trip(value: WireValue) {
        let encoded = encode_value(&value).unwrap();
        assert_eq!(decode_value(&encoded).unwrap(), value);
    }

    #[test]
    fn primitives_round_trip() {
        round_trip(WireValue::Null);
        round_trip(WireValue::Bool(true));
        round_trip(WireValue::Uint(18_446_744_073_709_551_615));
        round_trip(WireValue::Int(-42));
        round_trip(WireValue::Float(3.5));
        round_trip(WireValue::Str("hello".to_string()));
        round_trip(WireValue::Bin(Bytes::from_static(&[0, 1, 254, 255])));
    }

    #[test]
    fn nested_structures_round_trip() {
        round_trip(WireValue::Map(vec![
            (
                "items".to_string(),
                WireValue::Array(vec![WireValue::Uint(1), WireValue::Str("two".to_string())]),
            ),
            (
                "blob".to_string(),
                WireValue::Ref(Ref::Blob(BlobRef {
                    data: Bytes::from_static(b"abc"),
                    mime_type: "text/plain".to_string(),
                })),
            ),
        ]));
    }

    #[test]
    fn refs_survive_as_extensions() {
        let encoded = encode_value(&WireValue::Ref(Ref::Undefined)).unwrap();
        let decoded = decode_value(&encoded).unwrap();
        assert_eq!(decoded, WireValue::Ref(Ref::Undefined));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut encoded = encode_value(&WireValue::Bool(false)).unwrap();
        encoded.push(0xC0);
        assert!(matches!(
            decode_value(&encoded),
            Err(WireError::Decode(_))
        ));
    }

    #[test]
    fn non_string_map_keys_are_rejected() {
        let raw = Value::Map(vec![(Value::from(1u64), Value::Nil)]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &raw).unwrap();
        assert!(decode_value(&buf).is_err());
    }
}
