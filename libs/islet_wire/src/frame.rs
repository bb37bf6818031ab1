// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;

/// Frame layout: `[u32 payload length, big endian | u8 message type | payload]`.
pub const HEADER_SIZE: usize = 5;

/// Upper bound for a single frame payload unless the connection configures
/// its own.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq)]
pub struct RawFrame {
    pub msg_type: u8,
    pub payload: Bytes,
}

/// Stateless builder half.
pub fn build_frame(msg_type: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_u8(msg_type);
    buf.put_slice(payload);
    buf.freeze()
}

/// Incremental parser half. Bytes are buffered across feeds; frames become
/// available as soon as `4 + 1 + len` bytes have arrived, independent of how
/// the input was chunked.
#[derive(Debug)]
pub struct FrameParser {
    buf: BytesMut,
    max_frame_size: usize,
}

impl FrameParser {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_size,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pops the next complete frame, or `None` until more bytes arrive. A
    /// declared length over the maximum fails the connection; the parser is
    /// unusable afterwards.
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>, WireError> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > self.max_frame_size {
            return Err(WireError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }
        if self.buf.len() < HEADER_SIZE + len {
            return Ok(None);
        }
        self.buf.advance(4);
        let msg_type = self.buf.get_u8();
        let payload = self.buf.split_to(len).freeze();
        Ok(Some(RawFrame { msg_type, payload }))
    }

    /// Bytes currently buffered but not yet consumed as frames.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(parser: &mut FrameParser) -> Vec<RawFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = parser.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn builds_and_parses_a_frame() {
        let frame = build_frame(0x03, b"payload");
        assert_eq!(&frame[..4], &7u32.to_be_bytes());
        assert_eq!(frame[4], 0x03);

        let mut parser = FrameParser::default();
        parser.feed(&frame);
        let parsed = parser.next_frame().unwrap().unwrap();
        assert_eq!(parsed.msg_type, 0x03);
        assert_eq!(&parsed.payload[..], b"payload");
        assert_eq!(parser.pending_len(), 0);
    }

    #[test]
    fn empty_payload_frame() {
        let mut parser = FrameParser::default();
        parser.feed(&build_frame(0xF0, b""));
        let parsed = parser.next_frame().unwrap().unwrap();
        assert_eq!(parsed.msg_type, 0xF0);
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn byte_at_a_time_equals_one_shot() {
        let mut concatenated = Vec::new();
        let frames: Vec<Bytes> = (0u8..5)
            .map(|i| build_frame(i, &vec![i; i as usize * 3]))
            .collect();
        for frame in &frames {
            concatenated.extend_from_slice(frame);
        }

        let mut one_shot = FrameParser::default();
        one_shot.feed(&concatenated);
        let expected = collect(&mut one_shot);
        assert_eq!(expected.len(), frames.len());

        // Feed the same bytes one at a time and at a few awkward strides;
        // every chunking must yield the identical frame sequence.
        for stride in [1usize, 2, 3, 7, 11] {
            let mut parser = FrameParser::default();
            let mut parsed = Vec::new();
            for chunk in concatenated.chunks(stride) {
                parser.feed(chunk);
                parsed.extend(collect(&mut parser));
            }
            assert_eq!(parsed, expected, "stride {stride}");
        }
    }

    #[test]
    fn oversize_frame_is_fatal() {
        let mut parser = FrameParser::new(16);
        parser.feed(&build_frame(0x01, &[0u8; 17]));
        assert!(matches!(
            parser.next_frame(),
            Err(WireError::FrameTooLarge { len: 17, max: 16 })
        ));
    }

    #[test]
    fn oversize_is_detected_from_header_alone() {
        let mut parser = FrameParser::new(16);
        // Header only, no payload bytes yet.
        let mut header = Vec::new();
        header.extend_from_slice(&1_000u32.to_be_bytes());
        header.push(0x01);
        parser.feed(&header);
        assert!(matches!(
            parser.next_frame(),
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn partial_input_is_buffered() {
        let frame = build_frame(0x02, b"abcdef");
        let mut parser = FrameParser::default();
        parser.feed(&frame[..6]);
        assert!(parser.next_frame().unwrap().is_none());
        parser.feed(&frame[6..]);
        let parsed = parser.next_frame().unwrap().unwrap();
        assert_eq!(&parsed.payload[..], b"abcdef");
    }
}
