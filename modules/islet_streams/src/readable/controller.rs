// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Mutex, Weak};

use islet_utils::error::JsError;

use super::{ReadableInner, ReadableStream};
use crate::StreamResult;

/// https://streams.spec.whatwg.org/#rs-default-controller-class
///
/// Holds a weak reference so a source owning its controller does not keep
/// the stream alive.
pub struct ReadableStreamDefaultController<C> {
    inner: Weak<Mutex<ReadableInner<C>>>,
}

impl<C> Clone for ReadableStreamDefaultController<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Send + 'static> ReadableStreamDefaultController<C> {
    pub(crate) fn new(inner: Weak<Mutex<ReadableInner<C>>>) -> Self {
        Self { inner }
    }

    fn stream(&self) -> StreamResult<ReadableStream<C>> {
        self.inner
            .upgrade()
            .map(ReadableStream::from_inner)
            .ok_or_else(|| JsError::type_error("ReadableStream was dropped"))
    }

    pub fn enqueue(&self, chunk: C) -> StreamResult<()> {
        self.stream()?.enqueue_internal(chunk)
    }

    pub fn close(&self) -> StreamResult<()> {
        self.stream()?.close_internal()
    }

    pub fn error(&self, error: JsError) {
        if let Ok(stream) = self.stream() {
            stream.error_internal(error);
        }
    }

    pub fn desired_size(&self) -> Option<f64> {
        self.stream().ok()?.desired_size_internal()
    }
}
