// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;

use async_trait::async_trait;
use islet_utils::error::JsError;

use super::ReadableStreamDefaultController;
use crate::StreamResult;

/// Underlying source hooks.
/// https://streams.spec.whatwg.org/#underlying-source-api
#[async_trait]
pub trait Source<C>: Send {
    async fn start(&mut self, controller: &ReadableStreamDefaultController<C>) -> StreamResult<()> {
        let _ = controller;
        Ok(())
    }

    async fn pull(&mut self, controller: &ReadableStreamDefaultController<C>) -> StreamResult<()> {
        let _ = controller;
        Ok(())
    }

    async fn cancel(&mut self, reason: JsError) -> StreamResult<()> {
        let _ = reason;
        Ok(())
    }
}

/// Source with no hooks; chunks arrive through the controller from outside.
pub struct NoopSource;

#[async_trait]
impl<C: Send> Source<C> for NoopSource {}

/// Delivers a fixed chunk sequence, one chunk per pull, then closes.
pub struct ChunksSource<C> {
    chunks: VecDeque<C>,
}

impl<C> ChunksSource<C> {
    pub fn new(chunks: Vec<C>) -> Self {
        Self {
            chunks: chunks.into(),
        }
    }
}

#[async_trait]
impl<C: Send + 'static> Source<C> for ChunksSource<C> {
    async fn pull(&mut self, controller: &ReadableStreamDefaultController<C>) -> StreamResult<()> {
        match self.chunks.pop_front() {
            Some(chunk) => controller.enqueue(chunk)?,
            None => {
                let _ = controller.close();
            },
        }
        Ok(())
    }
}
