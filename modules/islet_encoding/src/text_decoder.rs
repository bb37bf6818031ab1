// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use islet_utils::error::JsError;

use crate::is_utf8_label;

const BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

#[derive(Clone, Copy, Debug, Default)]
pub struct TextDecoderOptions {
    pub fatal: bool,
    pub ignore_bom: bool,
}

/// UTF-8 only TextDecoder with streaming support.
/// https://encoding.spec.whatwg.org/#interface-textdecoder
///
/// Streaming decodes keep an incomplete trailing sequence (at most three
/// bytes) as residual state for the next chunk.
#[derive(Debug)]
pub struct TextDecoder {
    fatal: bool,
    ignore_bom: bool,
    residual: Vec<u8>,
    bom_checked: bool,
}

impl TextDecoder {
    /// `label` must name UTF-8; other encodings report a `RangeError`.
    pub fn new(label: Option<&str>, options: TextDecoderOptions) -> Result<Self, JsError> {
        if let Some(label) = label {
            if !label.is_empty() && !is_utf8_label(label) {
                return Err(JsError::range_error(
                    ["The \"", label, "\" encoding is not supported"].concat(),
                ));
            }
        }
        Ok(Self {
            fatal: options.fatal,
            ignore_bom: options.ignore_bom,
            residual: Vec::new(),
            bom_checked: false,
        })
    }

    pub fn utf8(options: TextDecoderOptions) -> Self {
        Self {
            fatal: options.fatal,
            ignore_bom: options.ignore_bom,
            residual: Vec::new(),
            bom_checked: false,
        }
    }

    pub fn encoding(&self) -> &'static str {
        "utf-8"
    }

    pub fn fatal(&self) -> bool {
        self.fatal
    }

    pub fn ignore_bom(&self) -> bool {
        self.ignore_bom
    }

    /// Decodes a chunk. With `stream` set, an incomplete trailing sequence
    /// is carried over instead of being replaced; the final call must pass
    /// `stream = false` to flush it.
    pub fn decode(&mut self, input: &[u8], stream: bool) -> Result<String, JsError> {
        let mut bytes = std::mem::take(&mut self.residual);
        bytes.extend_from_slice(input);

        // The BOM is stripped from the head of the byte stream before any
        // output, unless ignoreBOM asked to keep it.
        if !self.bom_checked {
            if !self.ignore_bom && bytes.starts_with(BOM) {
                bytes.drain(..BOM.len());
                self.bom_checked = true;
            } else if stream && bytes.len() < BOM.len() && BOM.starts_with(&bytes) {
                // Could still become a BOM once more bytes arrive.
                self.residual = bytes;
                return Ok(String::new());
            } else {
                self.bom_checked = true;
            }
        }

        let mut output = String::with_capacity(bytes.len());
        let mut remaining = &bytes[..];
        loop {
            match std::str::from_utf8(remaining) {
                Ok(valid) => {
                    output.push_str(valid);
                    break;
                },
                Err(error) => {
                    let (valid, rest) = remaining.split_at(error.valid_up_to());
                    // Safety of unwrap: split at valid_up_to.
                    output.push_str(std::str::from_utf8(valid).expect("validated prefix"));
                    match error.error_len() {
                        Some(invalid_len) => {
                            if self.fatal {
                                return Err(JsError::type_error(
                                    "The encoded data was not valid utf-8",
                                ));
                            }
                            output.push(char::REPLACEMENT_CHARACTER);
                            remaining = &rest[invalid_len..];
                        },
                        None => {
                            // Incomplete trailing sequence.
                            if stream {
                                self.residual = rest.to_vec();
                            } else if self.fatal {
                                return Err(JsError::type_error(
                                    "The encoded data was not valid utf-8",
                                ));
                            } else {
                                output.push(char::REPLACEMENT_CHARACTER);
                            }
                            break;
                        },
                    }
                },
            }
        }
        Ok(output)
    }

    /// One-shot decode of a whole buffer.
    pub fn decode_all(&mut self, input: &[u8]) -> Result<String, JsError> {
        self.decode(input, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> TextDecoder {
        TextDecoder::utf8(TextDecoderOptions::default())
    }

    #[test]
    fn unsupported_labels_are_range_errors() {
        let err = TextDecoder::new(Some("utf-16le"), TextDecoderOptions::default()).unwrap_err();
        assert_eq!(err.name(), "RangeError");
        assert!(TextDecoder::new(Some("UTF-8"), TextDecoderOptions::default()).is_ok());
        assert!(TextDecoder::new(None, TextDecoderOptions::default()).is_ok());
    }

    #[test]
    fn round_trips_utf8() {
        let mut decoder = decoder();
        assert_eq!(decoder.decode_all("héllo 中 😀".as_bytes()).unwrap(), "héllo 中 😀");
    }

    #[test]
    fn split_multi_byte_sequences_cross_chunks() {
        let mut decoder = decoder();
        // "中" is E4 B8 AD split across two chunks.
        assert_eq!(decoder.decode(&[0xE4], true).unwrap(), "");
        assert_eq!(decoder.decode(&[0xB8, 0xAD], true).unwrap(), "中");
        assert_eq!(decoder.decode(&[], false).unwrap(), "");
    }

    #[test]
    fn dangling_sequence_at_end_is_replaced() {
        let mut decoder = decoder();
        assert_eq!(decoder.decode(&[0xE4], true).unwrap(), "");
        assert_eq!(decoder.decode(&[], false).unwrap(), "\u{FFFD}");
    }

    #[test]
    fn fatal_mode_throws_on_invalid_input() {
        let mut decoder = TextDecoder::utf8(TextDecoderOptions {
            fatal: true,
            ignore_bom: false,
        });
        let err = decoder.decode_all(&[0xFF]).unwrap_err();
        assert_eq!(err.name(), "TypeError");
    }

    #[test]
    fn replacement_mode_substitutes_invalid_bytes() {
        let mut decoder = decoder();
        assert_eq!(decoder.decode_all(&[b'a', 0xFF, b'b']).unwrap(), "a\u{FFFD}b");
    }

    #[test]
    fn bom_is_stripped_unless_ignored() {
        let mut decoder = decoder();
        assert_eq!(decoder.decode_all(&[0xEF, 0xBB, 0xBF, b'h', b'i']).unwrap(), "hi");

        let mut keeping = TextDecoder::utf8(TextDecoderOptions {
            fatal: false,
            ignore_bom: true,
        });
        assert_eq!(
            keeping.decode_all(&[0xEF, 0xBB, 0xBF, b'h', b'i']).unwrap(),
            "\u{FEFF}hi"
        );
    }

    #[test]
    fn bom_split_across_chunks_is_still_stripped() {
        let mut decoder = decoder();
        assert_eq!(decoder.decode(&[0xEF], true).unwrap(), "");
        assert_eq!(decoder.decode(&[0xBB], true).unwrap(), "");
        assert_eq!(decoder.decode(&[0xBF, b'x'], true).unwrap(), "x");
        assert_eq!(decoder.decode(&[], false).unwrap(), "");
    }

    #[test]
    fn bom_only_stripped_once() {
        let mut decoder = decoder();
        let doubled = [0xEF, 0xBB, 0xBF, 0xEF, 0xBB, 0xBF];
        assert_eq!(decoder.decode_all(&doubled).unwrap(), "\u{FEFF}");
    }
}
