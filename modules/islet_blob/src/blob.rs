// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use bytes::Bytes;
use islet_streams::ReadableStream;
use islet_utils::error::JsError;

#[cfg(windows)]
const LINE_ENDING: &str = "\r\n";
#[cfg(not(windows))]
const LINE_ENDING: &str = "\n";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndingType {
    Transparent,
    Native,
}

/// A single constructor part: raw bytes, text, or another blob's content.
pub enum BlobPart {
    Bytes(Bytes),
    Text(String),
    Blob(BlobState),
}

/// Host-side state behind a guest `Blob`. The guest object holds only an
/// instance id; every read dispatches here.
///
/// Invariants: `size` is the sum of the part lengths, and the stored type
/// is lowercased (or empty when it contains characters outside printable
/// ASCII).
#[derive(Clone, Debug, PartialEq)]
pub struct BlobState {
    parts: Vec<Bytes>,
    mime_type: String,
}

impl BlobState {
    pub fn new(parts: Vec<BlobPart>, mime_type: Option<String>, endings: EndingType) -> Self {
        let parts = parts
            .into_iter()
            .map(|part| match part {
                BlobPart::Bytes(bytes) => bytes,
                BlobPart::Text(text) => match endings {
                    EndingType::Transparent => Bytes::from(text.into_bytes()),
                    EndingType::Native => Bytes::from(normalize_endings(&text).into_bytes()),
                },
                BlobPart::Blob(blob) => blob.bytes(),
            })
            .filter(|bytes| !bytes.is_empty())
            .collect();
        Self {
            parts,
            mime_type: mime_type.map(normalize_type).unwrap_or_default(),
        }
    }

    pub fn from_bytes(data: Bytes, content_type: Option<String>) -> Self {
        Self {
            parts: if data.is_empty() { Vec::new() } else { vec![data] },
            mime_type: content_type.map(normalize_type).unwrap_or_default(),
        }
    }

    /// Parses the `endings` constructor option.
    pub fn parse_endings(value: &str) -> Result<EndingType, JsError> {
        match value {
            "transparent" => Ok(EndingType::Transparent),
            "native" => Ok(EndingType::Native),
            _ => Err(JsError::type_error(
                r#"expected 'endings' to be either 'transparent' or 'native'"#,
            )),
        }
    }

    pub fn size(&self) -> u64 {
        self.parts.iter().map(|part| part.len() as u64).sum()
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// The whole content as one buffer. Single-part blobs (slices) hand
    /// back their buffer without copying.
    pub fn bytes(&self) -> Bytes {
        match self.parts.len() {
            0 => Bytes::new(),
            1 => self.parts[0].clone(),
            _ => {
                let mut data = Vec::with_capacity(self.size() as usize);
                for part in &self.parts {
                    data.extend_from_slice(part);
                }
                Bytes::from(data)
            },
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes()).into_owned()
    }

    /// `slice(start, end, contentType?)`: negative indices count from the
    /// end, everything clamps to `0..size`. The result owns a copy of the
    /// selected range as a single part.
    pub fn slice(&self, start: i64, end: i64, content_type: Option<String>) -> BlobState {
        let size = self.size() as i64;
        let start = clamp_index(start, size);
        let end = clamp_index(end, size).max(start);
        let data = self.bytes().slice(start as usize..end as usize);
        BlobState {
            parts: if data.is_empty() {
                Vec::new()
            } else {
                vec![Bytes::copy_from_slice(&data)]
            },
            mime_type: content_type.map(normalize_type).unwrap_or_default(),
        }
    }

    /// `stream()`: one chunk carrying the full content, then close.
    pub fn stream(&self) -> ReadableStream<Bytes> {
        let data = self.bytes();
        if data.is_empty() {
            ReadableStream::from_chunks(Vec::new())
        } else {
            ReadableStream::from_chunks(vec![data])
        }
    }
}

fn clamp_index(index: i64, size: i64) -> i64 {
    if index < 0 {
        (size + index).max(0)
    } else {
        index.min(size)
    }
}

fn normalize_type(mut mime_type: String) -> String {
    for byte in unsafe { mime_type.as_bytes_mut() } {
        if !(0x20..=0x7E).contains(byte) {
            return String::new();
        }
        byte.make_ascii_lowercase();
    }
    mime_type
}

fn normalize_endings(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(current) = chars.next() {
        match current {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                output.push_str(LINE_ENDING);
            },
            '\n' => output.push_str(LINE_ENDING),
            other => output.push(other),
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use islet_streams::ReadResult;

    use super::*;

    fn text_blob(parts: &[&str], mime_type: &str) -> BlobState {
        BlobState::new(
            parts
                .iter()
                .map(|part| BlobPart::Text(part.to_string()))
                .collect(),
            Some(mime_type.to_string()),
            EndingType::Transparent,
        )
    }

    #[test]
    fn assembles_parts_and_normalizes_type() {
        let blob = text_blob(&["hello", " ", "world"], "Text/Plain");
        assert_eq!(blob.size(), 11);
        assert_eq!(blob.mime_type(), "text/plain");
        assert_eq!(blob.text(), "hello world");
    }

    #[test]
    fn non_printable_type_collapses_to_empty() {
        let blob = text_blob(&["x"], "text/\u{0019}plain");
        assert_eq!(blob.mime_type(), "");
    }

    #[test]
    fn nested_blob_parts_are_flattened() {
        let inner = text_blob(&["inner"], "");
        let blob = BlobState::new(
            vec![
                BlobPart::Text("<".to_string()),
                BlobPart::Blob(inner),
                BlobPart::Text(">".to_string()),
            ],
            None,
            EndingType::Transparent,
        );
        assert_eq!(blob.text(), "<inner>");
    }

    #[test]
    fn slice_clamps_and_inherits_nothing_by_default() {
        let blob = text_blob(&["hello world"], "text/plain");

        let full = blob.slice(0, blob.size() as i64, None);
        assert_eq!(full.text(), "hello world");
        assert_eq!(full.mime_type(), "");

        let tail = blob.slice(-5, 1000, Some("text/other".to_string()));
        assert_eq!(tail.text(), "world");
        assert_eq!(tail.mime_type(), "text/other");

        let empty = blob.slice(8, 2, None);
        assert_eq!(empty.size(), 0);
    }

    #[test]
    fn slice_of_slice_is_stable() {
        let blob = text_blob(&["hello world"], "");
        let slice = blob.slice(6, 11, None);
        let again = slice.slice(0, 5, None);
        assert_eq!(slice.text(), again.text());
    }

    #[test]
    fn native_endings_rewrite_line_breaks() {
        let blob = BlobState::new(
            vec![BlobPart::Text("a\r\nb\nc\rd".to_string())],
            None,
            EndingType::Native,
        );
        let expected = ["a", "b", "c", "d"].join(LINE_ENDING);
        assert_eq!(blob.text(), expected);
    }

    #[test]
    fn invalid_endings_option_is_rejected() {
        assert!(BlobState::parse_endings("transparent").is_ok());
        assert!(BlobState::parse_endings("native").is_ok());
        assert!(BlobState::parse_endings("windows").is_err());
    }

    #[tokio::test]
    async fn stream_delivers_one_chunk_then_closes() {
        let blob = text_blob(&["stream me"], "");
        let reader = blob.stream().get_reader().unwrap();
        assert_eq!(
            reader.read().await.unwrap(),
            ReadResult::Chunk(Bytes::from_static(b"stream me"))
        );
        assert_eq!(reader.read().await.unwrap(), ReadResult::Done);
    }

    #[tokio::test]
    async fn empty_blob_stream_closes_immediately() {
        let blob = BlobState::new(Vec::new(), None, EndingType::Transparent);
        let reader = blob.stream().get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), ReadResult::Done);
    }
}
