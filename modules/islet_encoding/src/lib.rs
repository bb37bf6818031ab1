// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
mod text_decoder;
mod text_decoder_stream;
mod text_encoder;
mod text_encoder_stream;

pub use text_decoder::{TextDecoder, TextDecoderOptions};
pub use text_decoder_stream::{DecodeTransformer, TextDecoderStream};
pub use text_encoder::TextEncoder;
pub use text_encoder_stream::{EncodeTransformer, TextEncoderStream};

/// Labels accepted for the UTF-8 encoding. Anything else is unsupported.
pub(crate) fn is_utf8_label(label: &str) -> bool {
    matches!(
        label.trim().to_ascii_lowercase().as_str(),
        "unicode-1-1-utf-8" | "unicode11utf8" | "unicode20utf8" | "utf-8" | "utf8" | "x-unicode20utf8"
    )
}
