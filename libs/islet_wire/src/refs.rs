// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use bytes::Bytes;
use rmpv::Value;

use crate::error::WireError;

/// MessagePack extension type table. One code per [`Ref`] variant.
pub mod ext_code {
    pub const ISOLATE: i8 = 0x01;
    pub const CALLBACK: i8 = 0x02;
    pub const STREAM: i8 = 0x03;
    pub const PROMISE: i8 = 0x04;
    pub const ASYNC_ITERATOR: i8 = 0x05;
    pub const BLOB: i8 = 0x06;
    pub const DATE: i8 = 0x10;
    pub const REGEXP: i8 = 0x11;
    pub const BIGINT: i8 = 0x12;
    pub const UNDEFINED: i8 = 0x13;
    pub const REQUEST: i8 = 0x14;
    pub const RESPONSE: i8 = 0x15;
    pub const HEADERS: i8 = 0x16;
    pub const FILE: i8 = 0x17;
    pub const FORM_DATA: i8 = 0x18;
    pub const URL: i8 = 0x19;
    pub const UINT8_ARRAY: i8 = 0x1A;
}

#[derive(Clone, Debug, PartialEq)]
pub struct BlobRef {
    pub data: Bytes,
    pub mime_type: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FileRef {
    pub data: Bytes,
    pub mime_type: String,
    pub name: String,
    pub last_modified: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RequestRef {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResponseRef {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FormDataValue {
    Text(String),
    File(FileRef),
}

/// Wire-level stand-in for a value that cannot be transported directly.
/// Identity-bearing variants carry the id needed to proxy the referent;
/// data-bearing variants carry enough to reconstruct it.
#[derive(Clone, Debug, PartialEq)]
pub enum Ref {
    Isolate { isolate_id: u64 },
    Callback { callback_id: u64 },
    Stream { stream_id: u64 },
    Promise { promise_id: u64 },
    AsyncIterator { iterator_id: u64 },
    Blob(BlobRef),
    Date { epoch_ms: f64 },
    RegExp { source: String, flags: String },
    BigInt { value: String },
    Undefined,
    Request(RequestRef),
    Response(ResponseRef),
    Headers { entries: Vec<(String, String)> },
    File(FileRef),
    FormData { entries: Vec<(String, FormDataValue)> },
    Url { href: String },
    Uint8Array { data: Bytes },
}

impl Ref {
    pub fn ext_code(&self) -> i8 {
        match self {
            Self::Isolate { .. } => ext_code::ISOLATE,
            Self::Callback { .. } => ext_code::CALLBACK,
            Self::Stream { .. } => ext_code::STREAM,
            Self::Promise { .. } => ext_code::PROMISE,
            Self::AsyncIterator { .. } => ext_code::ASYNC_ITERATOR,
            Self::Blob(_) => ext_code::BLOB,
            Self::Date { .. } => ext_code::DATE,
            Self::RegExp { .. } => ext_code::REGEXP,
            Self::BigInt { .. } => ext_code::BIGINT,
            Self::Undefined => ext_code::UNDEFINED,
            Self::Request(_) => ext_code::REQUEST,
            Self::Response(_) => ext_code::RESPONSE,
            Self::Headers { .. } => ext_code::HEADERS,
            Self::File(_) => ext_code::FILE,
            Self::FormData { .. } => ext_code::FORM_DATA,
            Self::Url { .. } => ext_code::URL,
            Self::Uint8Array { .. } => ext_code::UINT8_ARRAY,
        }
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>, WireError> {
        let value = match self {
            Self::Isolate { isolate_id } => Value::from(*isolate_id),
            Self::Callback { callback_id } => Value::from(*callback_id),
            Self::Stream { stream_id } => Value::from(*stream_id),
            Self::Promise { promise_id } => Value::from(*promise_id),
            Self::AsyncIterator { iterator_id } => Value::from(*iterator_id),
            Self::Blob(blob) => Value::Map(vec![
                (Value::from("data"), Value::from(blob.data.to_vec())),
                (Value::from("type"), Value::from(blob.mime_type.as_str())),
            ]),
            Self::Date { epoch_ms } => Value::F64(*epoch_ms),
            Self::RegExp { source, flags } => Value::Map(vec![
                (Value::from("source"), Value::from(source.as_str())),
                (Value::from("flags"), Value::from(flags.as_str())),
            ]),
            Self::BigInt { value } => Value::from(value.as_str()),
            Self::Undefined => Value::Nil,
            Self::Request(request) => Value::Map(vec![
                (Value::from("url"), Value::from(request.url.as_str())),
                (Value::from("method"), Value::from(request.method.as_str())),
                (Value::from("headers"), encode_headers(&request.headers)),
                (Value::from("body"), encode_body(&request.body)),
            ]),
            Self::Response(response) => Value::Map(vec![
                (Value::from("status"), Value::from(response.status)),
                (
                    Value::from("statusText"),
                    Value::from(response.status_text.as_str()),
                ),
                (Value::from("headers"), encode_headers(&response.headers)),
                (Value::from("body"), encode_body(&response.body)),
            ]),
            Self::Headers { entries } => encode_headers(entries),
            Self::File(file) => encode_file(file),
            Self::FormData { entries } => Value::Array(
                entries
                    .iter()
                    .map(|(name, value)| {
                        Value::Array(vec![
                            Value::from(name.as_str()),
                            match value {
                                FormDataValue::Text(text) => Value::from(text.as_str()),
                                FormDataValue::File(file) => encode_file(file),
                            },
                        ])
                    })
                    .collect(),
            ),
            Self::Url { href } => Value::from(href.as_str()),
            Self::Uint8Array { data } => Value::from(data.to_vec()),
        };

        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value)
            .map_err(|err| WireError::Decode(err.to_string()))?;
        Ok(buf)
    }

    pub fn decode(code: i8, payload: &[u8]) -> Result<Self, WireError> {
        let mut cursor = payload;
        let value = rmpv::decode::read_value(&mut cursor)
            .map_err(|err| WireError::Decode(err.to_string()))?;

        Ok(match code {
            ext_code::ISOLATE => Self::Isolate {
                isolate_id: expect_u64(&value, "isolateId")?,
            },
            ext_code::CALLBACK => Self::Callback {
                callback_id: expect_u64(&value, "callbackId")?,
            },
            ext_code::STREAM => Self::Stream {
                stream_id: expect_u64(&value, "streamId")?,
            },
            ext_code::PROMISE => Self::Promise {
                promise_id: expect_u64(&value, "promiseId")?,
            },
            ext_code::ASYNC_ITERATOR => Self::AsyncIterator {
                iterator_id: expect_u64(&value, "iteratorId")?,
            },
            ext_code::BLOB => Self::Blob(BlobRef {
                data: expect_bin(field(&value, "data")?, "data")?,
                mime_type: expect_str(field(&value, "type")?, "type")?,
            }),
            ext_code::DATE => Self::Date {
                epoch_ms: value.as_f64().ok_or(WireError::InvalidField("epochMs"))?,
            },
            ext_code::REGEXP => Self::RegExp {
                source: expect_str(field(&value, "source")?, "source")?,
                flags: expect_str(field(&value, "flags")?, "flags")?,
            },
            ext_code::BIGINT => Self::BigInt {
                value: expect_str(&value, "value")?,
            },
            ext_code::UNDEFINED => Self::Undefined,
            ext_code::REQUEST => Self::Request(RequestRef {
                url: expect_str(field(&value, "url")?, "url")?,
                method: expect_str(field(&value, "method")?, "method")?,
                headers: decode_headers(field(&value, "headers")?)?,
                body: decode_body(field(&value, "body")?)?,
            }),
            ext_code::RESPONSE => Self::Response(ResponseRef {
                status: expect_u64(field(&value, "status")?, "status")? as u16,
                status_text: expect_str(field(&value, "statusText")?, "statusText")?,
                headers: decode_headers(field(&value, "headers")?)?,
                body: decode_body(field(&value, "body")?)?,
            }),
            ext_code::HEADERS => Self::Headers {
                entries: decode_headers(&value)?,
            },
            ext_code::FILE => Self::File(decode_file(&value)?),
            ext_code::FORM_DATA => {
                let items = value.as_array().ok_or(WireError::InvalidField("entries"))?;
                let mut entries = Vec::with_capacity(items.len());
                for item in items {
                    let pair = item.as_array().ok_or(WireError::InvalidField("entries"))?;
                    if pair.len() != 2 {
                        return Err(WireError::InvalidField("entries"));
                    }
                    let name = expect_str(&pair[0], "name")?;
                    let entry = if pair[1].is_str() {
                        FormDataValue::Text(expect_str(&pair[1], "value")?)
                    } else {
                        FormDataValue::File(decode_file(&pair[1])?)
                    };
                    entries.push((name, entry));
                }
                Self::FormData { entries }
            },
            ext_code::URL => Self::Url {
                href: expect_str(&value, "href")?,
            },
            ext_code::UINT8_ARRAY => Self::Uint8Array {
                data: expect_bin(&value, "data")?,
            },
            other => return Err(WireError::UnknownExtension(other)),
        })
    }
}

fn encode_headers(entries: &[(String, String)]) -> Value {
    Value::Array(
        entries
            .iter()
            .map(|(key, value)| {
                Value::Array(vec![Value::from(key.as_str()), Value::from(value.as_str())])
            })
            .collect(),
    )
}

fn encode_body(body: &Option<Bytes>) -> Value {
    match body {
        Some(bytes) => Value::from(bytes.to_vec()),
        None => Value::Nil,
    }
}

fn encode_file(file: &FileRef) -> Value {
    Value::Map(vec![
        (Value::from("data"), Value::from(file.data.to_vec())),
        (Value::from("type"), Value::from(file.mime_type.as_str())),
        (Value::from("name"), Value::from(file.name.as_str())),
        (Value::from("lastModified"), Value::from(file.last_modified)),
    ])
}

fn decode_file(value: &Value) -> Result<FileRef, WireError> {
    Ok(FileRef {
        data: expect_bin(field(value, "data")?, "data")?,
        mime_type: expect_str(field(value, "type")?, "type")?,
        name: expect_str(field(value, "name")?, "name")?,
        last_modified: field(value, "lastModified")?
            .as_i64()
            .ok_or(WireError::InvalidField("lastModified"))?,
    })
}

fn decode_headers(value: &Value) -> Result<Vec<(String, String)>, WireError> {
    let items = value.as_array().ok_or(WireError::InvalidField("headers"))?;
    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        let pair = item.as_array().ok_or(WireError::InvalidField("headers"))?;
        if pair.len() != 2 {
            return Err(WireError::InvalidField("headers"));
        }
        entries.push((expect_str(&pair[0], "headers")?, expect_str(&pair[1], "headers")?));
    }
    Ok(entries)
}

fn decode_body(value: &Value) -> Result<Option<Bytes>, WireError> {
    if value.is_nil() {
        return Ok(None);
    }
    Ok(Some(expect_bin(value, "body")?))
}

fn field<'a>(value: &'a Value, key: &'static str) -> Result<&'a Value, WireError> {
    value
        .as_map()
        .and_then(|entries| {
            entries
                .iter()
                .find(|(entry_key, _)| entry_key.as_str() == Some(key))
                .map(|(_, entry_value)| entry_value)
        })
        .ok_or(WireError::InvalidField(key))
}

fn expect_u64(value: &Value, name: &'static str) -> Result<u64, WireError> {
    value.as_u64().ok_or(WireError::InvalidField(name))
}

fn expect_str(value: &Value, name: &'static str) -> Result<String, WireError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or(WireError::InvalidField(name))
}

fn expect_bin(value: &Value, name: &'static str) -> Result<Bytes, WireError> {
    match value {
        Value::Binary(data) => Ok(Bytes::copy_from_slice(data)),
        _ => Err(WireError::InvalidField(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(reference: Ref) {
        let payload = reference.encode_payload().unwrap();
        let decoded = Ref::decode(reference.ext_code(), &payload).unwrap();
        assert_eq!(decoded, reference);
    }

    #[test]
    fn id_refs_round_trip() {
        round_trip(Ref::Isolate { isolate_id: 7 });
        round_trip(Ref::Callback { callback_id: 42 });
        round_trip(Ref::Stream { stream_id: 3 });
        round_trip(Ref::Promise { promise_id: 9 });
        round_trip(Ref::AsyncIterator { iterator_id: 11 });
    }

    #[test]
    fn data_refs_round_trip() {
        round_trip(Ref::Date { epoch_ms: 1714857600000.0 });
        round_trip(Ref::RegExp {
            source: "a+b".to_string(),
            flags: "gi".to_string(),
        });
        round_trip(Ref::BigInt {
            value: "-123456789012345678901234567890".to_string(),
        });
        round_trip(Ref::Undefined);
        round_trip(Ref::Url {
            href: "https://example.com/path?q=1".to_string(),
        });
        round_trip(Ref::Uint8Array {
            data: Bytes::from_static(&[1, 2, 3, 255]),
        });
        round_trip(Ref::Headers {
            entries: vec![("content-type".to_string(), "text/plain".to_string())],
        });
    }

    #[test]
    fn body_bearing_refs_round_trip() {
        round_trip(Ref::Blob(BlobRef {
            data: Bytes::from_static(b"hello world"),
            mime_type: "text/plain".to_string(),
        }));
        round_trip(Ref::File(FileRef {
            data: Bytes::from_static(b"contents"),
            mime_type: "application/octet-stream".to_string(),
            name: "a.bin".to_string(),
            last_modified: 1714857600000,
        }));
        round_trip(Ref::Request(RequestRef {
            url: "https://example.com/api".to_string(),
            method: "POST".to_string(),
            headers: vec![("accept".to_string(), "application/json".to_string())],
            body: Some(Bytes::from_static(b"{}")),
        }));
        round_trip(Ref::Response(ResponseRef {
            status: 204,
            status_text: "No Content".to_string(),
            headers: vec![],
            body: None,
        }));
        round_trip(Ref::FormData {
            entries: vec![
                ("field".to_string(), FormDataValue::Text("v".to_string())),
                (
                    "upload".to_string(),
                    FormDataValue::File(FileRef {
                        data: Bytes::from_static(b"x"),
                        mime_type: "text/plain".to_string(),
                        name: "x.txt".to_string(),
                        last_modified: 0,
                    }),
                ),
            ],
        });
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err = Ref::decode(0x7F, &[0xC0]).unwrap_err();
        assert!(matches!(err, WireError::UnknownExtension(0x7F)));
    }
}
