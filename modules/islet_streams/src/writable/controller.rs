// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Mutex, Weak};

use islet_abort::AbortSignal;
use islet_utils::error::JsError;

use super::WritableInner;
use crate::StreamResult;

/// https://streams.spec.whatwg.org/#ws-default-controller-class
pub struct WritableStreamDefaultController<C> {
    inner: Weak<Mutex<WritableInner<C>>>,
}

impl<C> Clone for WritableStreamDefaultController<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Send + 'static> WritableStreamDefaultController<C> {
    pub(crate) fn new(inner: Weak<Mutex<WritableInner<C>>>) -> Self {
        Self { inner }
    }

    /// Signal that aborts when the stream is aborted; sinks use it to drop
    /// in-progress work.
    pub fn signal(&self) -> StreamResult<AbortSignal> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| JsError::type_error("WritableStream was dropped"))?;
        let signal = inner.lock().unwrap().signal.clone();
        Ok(signal)
    }

    pub fn error(&self, error: JsError) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut inner = inner.lock().unwrap();
        if matches!(
            inner.state,
            super::WritableState::Closed | super::WritableState::Errored
        ) {
            return;
        }
        inner.state = super::WritableState::Errored;
        inner.stored_error = Some(error.clone());
        inner.closed_promise.settle(Err(error));
    }
}
