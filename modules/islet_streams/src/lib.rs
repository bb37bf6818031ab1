// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! WHATWG streams as host-side state machines, generic over the chunk type.
//! The model is single-threaded cooperative: pulls are driven by reads, and
//! everything progresses through awaited promises.

use islet_utils::error::JsError;

pub mod queuing_strategy;
pub mod readable;
pub mod transform;
mod utils;
pub mod writable;

pub use queuing_strategy::{
    ByteLengthQueuingStrategy, ByteSized, CountQueuingStrategy, QueuingStrategy,
};
pub use readable::{
    pipe::PipeOptions, reader::ReadResult, reader::ReadableStreamDefaultReader,
    source::Source, ReadableStream, ReadableStreamDefaultController,
};
pub use transform::{TransformStream, TransformStreamDefaultController, Transformer};
pub use writable::{
    sink::Sink, writer::WritableStreamDefaultWriter, WritableStream,
    WritableStreamDefaultController,
};

pub type StreamResult<T> = Result<T, JsError>;
