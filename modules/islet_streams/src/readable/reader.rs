// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use islet_utils::error::JsError;

use super::ReadableStream;
use crate::StreamResult;

/// Outcome of a single read: a chunk, or end of stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadResult<C> {
    Chunk(C),
    Done,
}

impl<C> ReadResult<C> {
    pub fn into_chunk(self) -> Option<C> {
        match self {
            Self::Chunk(chunk) => Some(chunk),
            Self::Done => None,
        }
    }
}

/// https://streams.spec.whatwg.org/#default-reader-class
pub struct ReadableStreamDefaultReader<C> {
    stream: ReadableStream<C>,
    released: Arc<AtomicBool>,
}

impl<C: Send + 'static> ReadableStreamDefaultReader<C> {
    pub(crate) fn new(stream: ReadableStream<C>) -> Self {
        Self {
            stream,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A second handle onto the same reader, sharing the release flag.
    pub fn clone_handle(&self) -> Self {
        Self {
            stream: self.stream.clone(),
            released: self.released.clone(),
        }
    }

    fn check_released(&self) -> StreamResult<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(JsError::type_error("Reader has been released"));
        }
        Ok(())
    }

    /// Reads the next chunk: drains the queue first, then reports the
    /// terminal state, and otherwise parks until an enqueue or close.
    pub async fn read(&self) -> StreamResult<ReadResult<C>> {
        self.check_released()?;
        self.stream.read_internal().await
    }

    pub async fn cancel(&self, reason: JsError) -> StreamResult<()> {
        self.check_released()?;
        self.stream.cancel_internal(reason).await
    }

    /// The stream's lifecycle promise: resolves on clean close, rejects
    /// with the stored error. Observing it after release still reports an
    /// already-settled outcome.
    pub async fn closed(&self) -> StreamResult<()> {
        let promise = self.stream.closed_promise();
        if self.released.load(Ordering::SeqCst) {
            if let Some(settled) = promise.peek() {
                return settled;
            }
            return Err(JsError::type_error("Reader has been released"));
        }
        promise.wait().await
    }

    /// Detaches the reader. A parked read rejects with a released error;
    /// the stream itself is untouched.
    pub fn release_lock(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stream.release_reader();
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}
