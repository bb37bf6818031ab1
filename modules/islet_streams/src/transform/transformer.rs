// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;

use super::TransformStreamDefaultController;
use crate::StreamResult;

/// Transformer hooks.
/// https://streams.spec.whatwg.org/#transformer-api
#[async_trait]
pub trait Transformer<I, O>: Send {
    async fn start(
        &mut self,
        controller: &TransformStreamDefaultController<O>,
    ) -> StreamResult<()> {
        let _ = controller;
        Ok(())
    }

    async fn transform(
        &mut self,
        chunk: I,
        controller: &TransformStreamDefaultController<O>,
    ) -> StreamResult<()>;

    async fn flush(
        &mut self,
        controller: &TransformStreamDefaultController<O>,
    ) -> StreamResult<()> {
        let _ = controller;
        Ok(())
    }
}

/// Identity transform, the default when no transformer is supplied.
pub struct IdentityTransformer;

#[async_trait]
impl<T: Send + 'static> Transformer<T, T> for IdentityTransformer {
    async fn transform(
        &mut self,
        chunk: T,
        controller: &TransformStreamDefaultController<T>,
    ) -> StreamResult<()> {
        controller.enqueue(chunk)
    }
}
