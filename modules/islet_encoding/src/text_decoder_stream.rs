// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use bytes::Bytes;
use islet_streams::{StreamResult, TransformStream, TransformStreamDefaultController, Transformer};

use crate::text_decoder::{TextDecoder, TextDecoderOptions};

/// https://encoding.spec.whatwg.org/#interface-textdecoderstream
pub struct TextDecoderStream;

impl TextDecoderStream {
    pub fn new(options: TextDecoderOptions) -> TransformStream<Bytes, String> {
        TransformStream::new(DecodeTransformer::new(options))
    }
}

pub struct DecodeTransformer {
    decoder: TextDecoder,
}

impl DecodeTransformer {
    pub fn new(options: TextDecoderOptions) -> Self {
        Self {
            decoder: TextDecoder::utf8(options),
        }
    }
}

#[async_trait]
impl Transformer<Bytes, String> for DecodeTransformer {
    async fn transform(
        &mut self,
        chunk: Bytes,
        controller: &TransformStreamDefaultController<String>,
    ) -> StreamResult<()> {
        let decoded = self.decoder.decode(&chunk, true)?;
        if !decoded.is_empty() {
            controller.enqueue(decoded)?;
        }
        Ok(())
    }

    async fn flush(
        &mut self,
        controller: &TransformStreamDefaultController<String>,
    ) -> StreamResult<()> {
        let tail = self.decoder.decode(&[], false)?;
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

    async fn decode_chunks(chunks: Vec<&'static [u8]>) -> String {
        let transform = TextDecoderStream::new(TextDecoderOptions::default());
        let source =
            ReadableStream::from_chunks(chunks.into_iter().map(Bytes::from_static).collect());
        let out = source.pipe_through(&transform, Default::default());
        out.iter().unwrap().collect().await.unwrap().concat()
    }

    #[tokio::test]
    async fn split_multi_byte_sequence_decodes_across_chunks() {
        // E4 then B8 AD across chunks is 中.
        assert_eq!(decode_chunks(vec![&[0xE4], &[0xB8, 0xAD]]).await, "中");
    }

    #[tokio::test]
    async fn ascii_passes_through() {
        assert_eq!(decode_chunks(vec![b"hel", b"lo"]).await, "hello");
    }

    #[tokio::test]
    async fn incomplete_tail_is_replaced_at_flush() {
        assert_eq!(decode_chunks(vec![&[b'a', 0xE4]]).await, "a\u{FFFD}");
    }

    #[tokio::test]
    async fn fatal_decoder_errors_the_stream() {
        let transform = TextDecoderStream::new(TextDecoderOptions {
            fatal: true,
            ignore_bom: false,
        });
        let writer = transform.writable().get_writer().unwrap();
        let err = writer
            .write(Bytes::from_static(&[0xFF]))
            .await
            .unwrap_err();
        assert_eq!(err.name(), "TypeError");

        let reader = transform.readable().get_reader().unwrap();
        assert!(reader.read().await.is_err());
    }
}
