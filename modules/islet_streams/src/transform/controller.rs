// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Mutex, Weak};

use islet_utils::error::JsError;

use crate::{
    readable::{ReadableInner, ReadableStream},
    StreamResult,
};

/// https://streams.spec.whatwg.org/#ts-default-controller-class
///
/// Proxies `enqueue`/`error`/`terminate` to the transform's readable side.
pub struct TransformStreamDefaultController<O> {
    readable: Weak<Mutex<ReadableInner<O>>>,
}

impl<O> Clone for TransformStreamDefaultController<O> {
    fn clone(&self) -> Self {
        Self {
            readable: self.readable.clone(),
        }
    }
}

impl<O: Send + 'static> TransformStreamDefaultController<O> {
    pub(crate) fn new(readable: Weak<Mutex<ReadableInner<O>>>) -> Self {
        Self { readable }
    }

    fn readable(&self) -> StreamResult<ReadableStream<O>> {
        self.readable
            .upgrade()
            .map(ReadableStream::from_inner)
            .ok_or_else(|| JsError::type_error("TransformStream was dropped"))
    }

    pub fn enqueue(&self, chunk: O) -> StreamResult<()> {
        self.readable()?.enqueue_internal(chunk)
    }

    pub fn error(&self, error: JsError) {
        if let Ok(readable) = self.readable() {
            readable.error_internal(error);
        }
    }

    /// Closes the readable side; further transforms fail.
    pub fn terminate(&self) {
        if let Ok(readable) = self.readable() {
            let _ = readable.close_internal();
        }
    }

    pub fn desired_size(&self) -> Option<f64> {
        self.readable().ok()?.desired_size_internal()
    }
}
