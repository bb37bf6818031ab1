// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use islet_utils::error::{JsError, JsErrorKind};

use crate::value::WireValue;

/// Closed set of numeric error codes carried by `RESPONSE_ERROR` and
/// `CALLBACK_ERROR` frames. Ranges group the kinds: protocol 1xxx,
/// isolate lifecycle 2xxx, execution 3xxx, stream 4xxx, connection 5xxx.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    MalformedFrame = 1001,
    UnknownMessageType = 1002,
    InvalidField = 1003,
    IsolateNotFound = 2001,
    IsolateDisposed = 2002,
    IsolateTimeout = 2003,
    IsolateMemoryLimit = 2004,
    ScriptException = 3001,
    CallbackFailed = 3002,
    StreamNotFound = 4001,
    StreamClosed = 4002,
    ConnectionLost = 5001,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            1001 => Self::MalformedFrame,
            1002 => Self::UnknownMessageType,
            1003 => Self::InvalidField,
            2001 => Self::IsolateNotFound,
            2002 => Self::IsolateDisposed,
            2003 => Self::IsolateTimeout,
            2004 => Self::IsolateMemoryLimit,
            3001 => Self::ScriptException,
            3002 => Self::CallbackFailed,
            4001 => Self::StreamNotFound,
            4002 => Self::StreamClosed,
            5001 => Self::ConnectionLost,
            _ => return None,
        })
    }
}

/// Errors produced while building or parsing frames and payloads. These are
/// protocol errors: a connection that observes one (other than field-level
/// validation while handling a single request) is unrecoverable.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame of {len} bytes exceeds the maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("unknown message type 0x{0:02x}")]
    UnknownMessageType(u8),
    #[error("unknown extension type {0}")]
    UnknownExtension(i8),
    #[error("missing or invalid field `{0}`")]
    InvalidField(&'static str),
    #[error("malformed payload: {0}")]
    Decode(String),
}

impl WireError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::FrameTooLarge { .. } | Self::Decode(_) => ErrorCode::MalformedFrame,
            Self::UnknownMessageType(_) | Self::UnknownExtension(_) => {
                ErrorCode::UnknownMessageType
            },
            Self::InvalidField(_) => ErrorCode::InvalidField,
        }
    }
}

/// The tagged error record that crosses the wire: numeric code plus the
/// guest-visible `{ name, message, stack? }` triple.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorRecord {
    pub code: ErrorCode,
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl ErrorRecord {
    pub fn new(code: ErrorCode, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn from_js_error(code: ErrorCode, error: &JsError) -> Self {
        Self {
            code,
            name: error.name().to_string(),
            message: error.message.clone(),
            stack: error.stack.clone(),
        }
    }

    pub fn to_js_error(&self) -> JsError {
        let mut error = JsError::new(JsErrorKind::from_name(&self.name), self.message.clone());
        // Names outside the standard constructor set survive as DOMException
        // style records rather than collapsing into plain Error.
        if error.kind == JsErrorKind::Error && self.name != "Error" {
            error.kind = JsErrorKind::DomException(self.name.clone());
        }
        error.stack = self.stack.clone();
        error
    }

    pub fn to_value(&self) -> WireValue {
        let mut entries = vec![
            ("code".to_string(), WireValue::Uint(self.code.as_u16() as u64)),
            ("name".to_string(), WireValue::Str(self.name.clone())),
            ("message".to_string(), WireValue::Str(self.message.clone())),
        ];
        if let Some(stack) = &self.stack {
            entries.push(("stack".to_string(), WireValue::Str(stack.clone())));
        }
        WireValue::Map(entries)
    }

    pub fn from_value(value: &WireValue) -> Result<Self, WireError> {
        let code = value
            .get("code")
            .and_then(WireValue::as_u64)
            .and_then(|code| u16::try_from(code).ok())
            .and_then(ErrorCode::from_u16)
            .ok_or(WireError::InvalidField("code"))?;
        let name = value
            .get("name")
            .and_then(WireValue::as_str)
            .ok_or(WireError::InvalidField("name"))?
            .to_string();
        let message = value
            .get("message")
            .and_then(WireValue::as_str)
            .ok_or(WireError::InvalidField("message"))?
            .to_string();
        let stack = value
            .get("stack")
            .and_then(WireValue::as_str)
            .map(str::to_string);
        Ok(Self {
            code,
            name,
            message,
            stack,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_round_trip() {
        for code in [
            ErrorCode::MalformedFrame,
            ErrorCode::IsolateNotFound,
            ErrorCode::ScriptException,
            ErrorCode::StreamClosed,
            ErrorCode::ConnectionLost,
        ] {
            assert_eq!(ErrorCode::from_u16(code.as_u16()), Some(code));
        }
        assert_eq!(ErrorCode::from_u16(1999), None);
    }

    #[test]
    fn record_round_trips_through_wire_value() {
        let record = ErrorRecord {
            code: ErrorCode::ScriptException,
            name: "TypeError".to_string(),
            message: "x is not a function".to_string(),
            stack: Some("at <anonymous>:1:1".to_string()),
        };
        let decoded = ErrorRecord::from_value(&record.to_value()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn record_reconstructs_error_kind() {
        let record = ErrorRecord::new(ErrorCode::ScriptException, "RangeError", "bad index");
        assert_eq!(record.to_js_error().kind, JsErrorKind::RangeError);

        let abort = ErrorRecord::new(ErrorCode::CallbackFailed, "AbortError", "aborted");
        assert_eq!(
            abort.to_js_error().kind,
            JsErrorKind::DomException("AbortError".to_string())
        );
    }
}
