// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use islet_streams::ReadableStream;

use crate::blob::{BlobPart, BlobState, EndingType};

/// Host-side state behind a guest `File`: a blob plus name and
/// modification time.
#[derive(Clone, Debug, PartialEq)]
pub struct FileState {
    blob: BlobState,
    name: String,
    last_modified: i64,
}

impl FileState {
    /// `lastModified` defaults to the current host time at construction.
    pub fn new(
        parts: Vec<BlobPart>,
        name: String,
        mime_type: Option<String>,
        last_modified: Option<i64>,
        endings: EndingType,
    ) -> Self {
        Self {
            blob: BlobState::new(parts, mime_type, endings),
            name,
            last_modified: last_modified.unwrap_or_else(now_millis),
        }
    }

    pub fn from_blob(blob: BlobState, name: String, last_modified: Option<i64>) -> Self {
        Self {
            blob,
            name,
            last_modified: last_modified.unwrap_or_else(now_millis),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn last_modified(&self) -> i64 {
        self.last_modified
    }

    pub fn size(&self) -> u64 {
        self.blob.size()
    }

    pub fn mime_type(&self) -> &str {
        self.blob.mime_type()
    }

    pub fn bytes(&self) -> Bytes {
        self.blob.bytes()
    }

    pub fn text(&self) -> String {
        self.blob.text()
    }

    pub fn slice(&self, start: i64, end: i64, content_type: Option<String>) -> BlobState {
        self.blob.slice(start, end, content_type)
    }

    pub fn stream(&self) -> ReadableStream<Bytes> {
        self.blob.stream()
    }

    pub fn as_blob(&self) -> &BlobState {
        &self.blob
    }
}

fn now_millis() -> i64 {
    UNIX_EPOCH
        .elapsed()
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_wraps_blob_state() {
        let file = FileState::new(
            vec![BlobPart::Text("data".to_string())],
            "a.txt".to_string(),
            Some("text/plain".to_string()),
            Some(1_714_857_600_000),
            EndingType::Transparent,
        );
        assert_eq!(file.name(), "a.txt");
        assert_eq!(file.last_modified(), 1_714_857_600_000);
        assert_eq!(file.size(), 4);
        assert_eq!(file.mime_type(), "text/plain");
        assert_eq!(file.text(), "data");
    }

    #[test]
    fn last_modified_defaults_to_now() {
        let before = super::now_millis();
        let file = FileState::new(
            Vec::new(),
            "empty".to_string(),
            None,
            None,
            EndingType::Transparent,
        );
        let after = super::now_millis();
        assert!(file.last_modified() >= before && file.last_modified() <= after);
    }
}
