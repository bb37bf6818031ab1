// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use bytes::Bytes;
use islet_streams::{StreamResult, TransformStream, TransformStreamDefaultController, Transformer};

/// https://encoding.spec.whatwg.org/#interface-textencoderstream
///
/// Chunks are UTF-16 code unit sequences; a high surrogate dangling at a
/// chunk boundary is carried into the next chunk, so a surrogate pair split
/// across writes still encodes as one code point.
pub struct TextEncoderStream;

impl TextEncoderStream {
    pub fn new() -> TransformStream<Vec<u16>, Bytes> {
        TransformStream::new(EncodeTransformer::new())
    }
}

pub struct EncodeTransformer {
    pending_high_surrogate: Option<u16>,
}

impl EncodeTransformer {
    pub fn new() -> Self {
        Self {
            pending_high_surrogate: None,
        }
    }

    pub fn encode_chunk(&mut self, units: &[u16]) -> Bytes {
        let mut output = String::with_capacity(units.len());
        for &unit in units {
            if let Some(high) = self.pending_high_surrogate.take() {
                if (0xDC00..=0xDFFF).contains(&unit) {
                    let code_point =
                        0x10000 + (((high as u32) - 0xD800) << 10) + ((unit as u32) - 0xDC00);
                    output.push(char::from_u32(code_point).expect("valid surrogate pair"));
                    continue;
                }
                output.push(char::REPLACEMENT_CHARACTER);
            }
            match unit {
                0xD800..=0xDBFF => self.pending_high_surrogate = Some(unit),
                0xDC00..=0xDFFF => output.push(char::REPLACEMENT_CHARACTER),
                _ => output.push(char::from_u32(unit as u32).expect("BMP code unit")),
            }
        }
        Bytes::from(output.into_bytes())
    }

    pub fn flush_pending(&mut self) -> Bytes {
        match self.pending_high_surrogate.take() {
            Some(_) => Bytes::copy_from_slice("\u{FFFD}".as_bytes()),
            None => Bytes::new(),
        }
    }
}

impl Default for EncodeTransformer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transformer<Vec<u16>, Bytes> for EncodeTransformer {
    async fn transform(
        &mut self,
        chunk: Vec<u16>,
        controller: &TransformStreamDefaultController<Bytes>,
    ) -> StreamResult<()> {
        let encoded = self.encode_chunk(&chunk);
        if !encoded.is_empty() {
            controller.enqueue(encoded)?;
        }
        Ok(())
    }

    async fn flush(
        &mut self,
        controller: &TransformStreamDefaultController<Bytes>,
    ) -> StreamResult<()> {
        let tail = self.flush_pending();
        if !tail.is_empty() {
            controller.enqueue(tail)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use islet_streams::ReadableStream;

    use super::*;

    async fn encode_chunks(chunks: Vec<Vec<u16>>) -> Vec<u8> {
        let transform = TextEncoderStream::new();
        let source = ReadableStream::from_chunks(chunks);
        let out = source.pipe_through(&transform, Default::default());
        let mut bytes = Vec::new();
        for chunk in out.iter().unwrap().collect().await.unwrap() {
            bytes.extend_from_slice(&chunk);
        }
        bytes
    }

    #[tokio::test]
    async fn split_surrogate_pair_encodes_as_one_code_point() {
        // '\uD83D' then '\uDE00' in separate chunks is 😀.
        let bytes = encode_chunks(vec![vec![0xD83D], vec![0xDE00]]).await;
        assert_eq!(bytes, vec![0xF0, 0x9F, 0x98, 0x80]);
    }

    #[tokio::test]
    async fn plain_text_passes_through() {
        let units: Vec<u16> = "hello".encode_utf16().collect();
        let bytes = encode_chunks(vec![units]).await;
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn dangling_high_surrogate_flushes_as_replacement() {
        let bytes = encode_chunks(vec![vec![0xD83D]]).await;
        assert_eq!(bytes, "\u{FFFD}".as_bytes());
    }

    #[tokio::test]
    async fn lone_low_surrogate_is_replaced() {
        let bytes = encode_chunks(vec![vec![0xDE00, b'a' as u16]]).await;
        let mut expected = "\u{FFFD}".as_bytes().to_vec();
        expected.push(b'a');
        assert_eq!(bytes, expected);
    }
}
