// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use islet_utils::error::JsError;

use super::WritableStreamDefaultController;
use crate::StreamResult;

/// Underlying sink hooks.
/// https://streams.spec.whatwg.org/#underlying-sink-api
#[async_trait]
pub trait Sink<C>: Send {
    async fn start(&mut self, controller: &WritableStreamDefaultController<C>) -> StreamResult<()> {
        let _ = controller;
        Ok(())
    }

    async fn write(
        &mut self,
        chunk: C,
        controller: &WritableStreamDefaultController<C>,
    ) -> StreamResult<()>;

    async fn close(&mut self) -> StreamResult<()> {
        Ok(())
    }

    async fn abort(&mut self, reason: JsError) -> StreamResult<()> {
        let _ = reason;
        Ok(())
    }
}

/// Sink that drops every chunk.
pub struct NoopSink;

#[async_trait]
impl<C: Send + 'static> Sink<C> for NoopSink {
    async fn write(
        &mut self,
        _chunk: C,
        _controller: &WritableStreamDefaultController<C>,
    ) -> StreamResult<()> {
        Ok(())
    }
}
