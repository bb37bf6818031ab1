// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::fmt;

use islet_utils::error::{JsError, JsErrorKind};

/// Legacy name → code table from the WebIDL spec. Names outside the table
/// carry code 0.
const LEGACY_CODES: [(&str, u8); 25] = [
    ("IndexSizeError", 1),
    ("DOMStringSizeError", 2),
    ("HierarchyRequestError", 3),
    ("WrongDocumentError", 4),
    ("InvalidCharacterError", 5),
    ("NoDataAllowedError", 6),
    ("NoModificationAllowedError", 7),
    ("NotFoundError", 8),
    ("NotSupportedError", 9),
    ("InUseAttributeError", 10),
    ("InvalidStateError", 11),
    ("SyntaxError", 12),
    ("InvalidModificationError", 13),
    ("NamespaceError", 14),
    ("InvalidAccessError", 15),
    ("ValidationError", 16),
    ("TypeMismatchError", 17),
    ("SecurityError", 18),
    ("NetworkError", 19),
    ("AbortError", 20),
    ("URLMismatchError", 21),
    ("QuotaExceededError", 22),
    ("TimeoutError", 23),
    ("InvalidNodeTypeError", 24),
    ("DataCloneError", 25),
];

/// Constant `NAME_ERR` pairs exposed on both the DOMException constructor
/// and its prototype.
pub const CONSTANTS: [(&str, u8); 25] = [
    ("INDEX_SIZE_ERR", 1),
    ("DOMSTRING_SIZE_ERR", 2),
    ("HIERARCHY_REQUEST_ERR", 3),
    ("WRONG_DOCUMENT_ERR", 4),
    ("INVALID_CHARACTER_ERR", 5),
    ("NO_DATA_ALLOWED_ERR", 6),
    ("NO_MODIFICATION_ALLOWED_ERR", 7),
    ("NOT_FOUND_ERR", 8),
    ("NOT_SUPPORTED_ERR", 9),
    ("INUSE_ATTRIBUTE_ERR", 10),
    ("INVALID_STATE_ERR", 11),
    ("SYNTAX_ERR", 12),
    ("INVALID_MODIFICATION_ERR", 13),
    ("NAMESPACE_ERR", 14),
    ("INVALID_ACCESS_ERR", 15),
    ("VALIDATION_ERR", 16),
    ("TYPE_MISMATCH_ERR", 17),
    ("SECURITY_ERR", 18),
    ("NETWORK_ERR", 19),
    ("ABORT_ERR", 20),
    ("URL_MISMATCH_ERR", 21),
    ("QUOTA_EXCEEDED_ERR", 22),
    ("TIMEOUT_ERR", 23),
    ("INVALID_NODE_TYPE_ERR", 24),
    ("DATA_CLONE_ERR", 25),
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DOMException {
    name: String,
    message: String,
}

impl DOMException {
    pub fn new(message: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn with_default_name(message: impl Into<String>) -> Self {
        Self::new(message, "Error")
    }

    pub fn abort_error(message: impl Into<String>) -> Self {
        Self::new(message, "AbortError")
    }

    pub fn timeout_error(message: impl Into<String>) -> Self {
        Self::new(message, "TimeoutError")
    }

    pub fn data_clone_error(message: impl Into<String>) -> Self {
        Self::new(message, "DataCloneError")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> u8 {
        legacy_code(&self.name)
    }
}

pub fn legacy_code(name: &str) -> u8 {
    LEGACY_CODES
        .iter()
        .find(|(legacy_name, _)| *legacy_name == name)
        .map(|(_, code)| *code)
        .unwrap_or(0)
}

impl fmt::Display for DOMException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

impl From<DOMException> for JsError {
    fn from(exception: DOMException) -> Self {
        JsError::new(JsErrorKind::DomException(exception.name), exception.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_the_legacy_table() {
        assert_eq!(DOMException::abort_error("stop").code(), 20);
        assert_eq!(DOMException::timeout_error("late").code(), 23);
        assert_eq!(DOMException::data_clone_error("nope").code(), 25);
        assert_eq!(DOMException::new("x", "NotFoundError").code(), 8);
        assert_eq!(DOMException::new("x", "SomethingElseError").code(), 0);
    }

    #[test]
    fn converts_into_a_tagged_error() {
        let error: JsError = DOMException::timeout_error("timed out").into();
        assert_eq!(error.name(), "TimeoutError");
        assert_eq!(error.message, "timed out");
    }

    #[test]
    fn display_matches_browser_formatting() {
        assert_eq!(
            DOMException::abort_error("operation aborted").to_string(),
            "AbortError: operation aborted"
        );
        assert_eq!(DOMException::new("", "AbortError").to_string(), "AbortError");
    }
}
