// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::fmt;

/// Error kinds that survive the host/guest boundary. Standard JavaScript
/// error constructors are modeled as unit variants; everything carrying a
/// `name` outside that closed set travels as a `DomException`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JsErrorKind {
    Error,
    TypeError,
    RangeError,
    SyntaxError,
    ReferenceError,
    UriError,
    EvalError,
    DomException(String),
}

impl JsErrorKind {
    pub fn name(&self) -> &str {
        match self {
            Self::Error => "Error",
            Self::TypeError => "TypeError",
            Self::RangeError => "RangeError",
            Self::SyntaxError => "SyntaxError",
            Self::ReferenceError => "ReferenceError",
            Self::UriError => "URIError",
            Self::EvalError => "EvalError",
            Self::DomException(name) => name,
        }
    }

    /// Maps a constructor name back to its kind. Unknown names fall back to
    /// plain `Error`, matching how the guest shim reconstructs errors.
    pub fn from_name(name: &str) -> Self {
        match name {
            "Error" => Self::Error,
            "TypeError" => Self::TypeError,
            "RangeError" => Self::RangeError,
            "SyntaxError" => Self::SyntaxError,
            "ReferenceError" => Self::ReferenceError,
            "URIError" => Self::UriError,
            "EvalError" => Self::EvalError,
            _ => Self::Error,
        }
    }

    fn is_standard(name: &str) -> bool {
        matches!(
            name,
            "Error"
                | "TypeError"
                | "RangeError"
                | "SyntaxError"
                | "ReferenceError"
                | "URIError"
                | "EvalError"
        )
    }
}

/// A guest-visible error as a tagged record. Dynamic error subclassing does
/// not cross the boundary; the kind + message (+ optional stack) is the
/// entire contract.
#[derive(Clone, Debug, PartialEq)]
pub struct JsError {
    pub kind: JsErrorKind,
    pub message: String,
    pub stack: Option<String>,
}

impl JsError {
    pub fn new(kind: JsErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(JsErrorKind::Error, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(JsErrorKind::TypeError, message)
    }

    pub fn range_error(message: impl Into<String>) -> Self {
        Self::new(JsErrorKind::RangeError, message)
    }

    pub fn syntax_error(message: impl Into<String>) -> Self {
        Self::new(JsErrorKind::SyntaxError, message)
    }

    pub fn reference_error(message: impl Into<String>) -> Self {
        Self::new(JsErrorKind::ReferenceError, message)
    }

    pub fn dom_exception(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(JsErrorKind::DomException(name.into()), message)
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn name(&self) -> &str {
        self.kind.name()
    }

    /// Encodes the error for the in-band prefix convention used by host
    /// callbacks: `"[<Name>]<message>"`. The guest trampoline strips the
    /// prefix and rethrows with the matching constructor.
    pub fn encode_prefixed(&self) -> String {
        ["[", self.name(), "]", &self.message].concat()
    }

    /// Inverse of [`encode_prefixed`]. A message without a recognizable
    /// prefix, or with a name outside the standard set, yields a plain
    /// `Error` carrying the message unchanged.
    ///
    /// [`encode_prefixed`]: JsError::encode_prefixed
    pub fn parse_prefixed(message: &str) -> Self {
        if let Some(rest) = message.strip_prefix('[') {
            if let Some(end) = rest.find(']') {
                let name = &rest[..end];
                if JsErrorKind::is_standard(name) {
                    return Self::new(JsErrorKind::from_name(name), &rest[end + 1..]);
                }
            }
        }
        Self::error(message)
    }
}

impl fmt::Display for JsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(self.name())
        } else {
            write!(f, "{}: {}", self.name(), self.message)
        }
    }
}

impl std::error::Error for JsError {}
