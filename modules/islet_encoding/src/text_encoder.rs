// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use bytes::Bytes;

/// UTF-8 only TextEncoder.
/// https://encoding.spec.whatwg.org/#interface-textencoder
#[derive(Clone, Copy, Debug, Default)]
pub struct TextEncoder;

impl TextEncoder {
    pub fn new() -> Self {
        Self
    }

    pub fn encoding(&self) -> &'static str {
        "utf-8"
    }

    pub fn encode(&self, input: &str) -> Bytes {
        Bytes::copy_from_slice(input.as_bytes())
    }

    /// Encodes a UTF-16 code unit sequence, replacing unpaired surrogates
    /// with U+FFFD. Streamed input goes through
    /// [`EncodeTransformer`](crate::EncodeTransformer) instead, which
    /// carries a dangling high surrogate across chunk boundaries.
    pub fn encode_utf16(&self, input: &[u16]) -> Bytes {
        let decoded: String = char::decode_utf16(input.iter().copied())
            .map(|result| result.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect();
        Bytes::from(decoded.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_utf8() {
        let encoder = TextEncoder::new();
        assert_eq!(&encoder.encode("hello")[..], b"hello");
        assert_eq!(&encoder.encode("中")[..], &[0xE4, 0xB8, 0xAD]);
        assert_eq!(&encoder.encode("😀")[..], &[0xF0, 0x9F, 0x98, 0x80]);
        assert_eq!(encoder.encoding(), "utf-8");
    }

    #[test]
    fn lone_surrogates_become_replacement_chars() {
        let encoder = TextEncoder::new();
        assert_eq!(
            &encoder.encode_utf16(&[0xD83D])[..],
            "\u{FFFD}".as_bytes()
        );
        assert_eq!(
            &encoder.encode_utf16(&[0xD83D, 0xDE00])[..],
            &[0xF0, 0x9F, 0x98, 0x80]
        );
    }
}
