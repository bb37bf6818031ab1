// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use islet_utils::error::JsError;

use crate::{
    queuing_strategy::QueuingStrategy,
    readable::{source::Source, ReadableStream},
    writable::{sink::Sink, WritableStream, WritableStreamDefaultController},
    StreamResult,
};

pub mod controller;
pub mod transformer;

pub use controller::TransformStreamDefaultController;
pub use transformer::{IdentityTransformer, Transformer};

/// https://streams.spec.whatwg.org/#ts-class
///
/// Writes into the writable side run through the transformer, whose
/// controller enqueues onto the readable side; closing the writable side
/// flushes the transformer and then closes the readable side.
pub struct TransformStream<I, O> {
    readable: ReadableStream<O>,
    writable: WritableStream<I>,
}

impl<I: Send + 'static, O: Send + 'static> TransformStream<I, O> {
    pub fn new(transformer: impl Transformer<I, O> + 'static) -> Self {
        Self::with_strategies(
            transformer,
            QueuingStrategy::default(),
            QueuingStrategy::default(),
        )
    }

    pub fn with_strategies(
        transformer: impl Transformer<I, O> + 'static,
        writable_strategy: QueuingStrategy<I>,
        readable_strategy: QueuingStrategy<O>,
    ) -> Self {
        let writable_slot: Arc<Mutex<Option<WritableStream<I>>>> = Arc::new(Mutex::new(None));
        let readable = ReadableStream::new(
            TransformSource {
                writable: writable_slot.clone(),
            },
            readable_strategy,
        );
        let controller = TransformStreamDefaultController::new(readable.downgrade());
        let writable = WritableStream::new(
            TransformSink {
                transformer: Box::new(transformer),
                controller,
            },
            writable_strategy,
        );
        *writable_slot.lock().unwrap() = Some(writable.clone());
        Self { readable, writable }
    }

    pub fn readable(&self) -> ReadableStream<O> {
        self.readable.clone()
    }

    pub fn writable(&self) -> WritableStream<I> {
        self.writable.clone()
    }
}

impl<T: Send + 'static> TransformStream<T, T> {
    /// An identity transform pair.
    pub fn identity() -> Self {
        Self::new(IdentityTransformer)
    }
}

/// Readable-side source: pulls are pure backpressure signals; cancelling
/// the readable side errors the writable side.
struct TransformSource<I> {
    writable: Arc<Mutex<Option<WritableStream<I>>>>,
}

#[async_trait]
impl<I: Send + 'static, O: Send + 'static> Source<O> for TransformSource<I> {
    async fn cancel(&mut self, reason: JsError) -> StreamResult<()> {
        let writable = self.writable.lock().unwrap().clone();
        if let Some(writable) = writable {
            writable.error_internal(reason);
        }
        Ok(())
    }
}

struct TransformSink<I, O> {
    transformer: Box<dyn Transformer<I, O>>,
    controller: TransformStreamDefaultController<O>,
}

#[async_trait]
impl<I: Send + 'static, O: Send + 'static> Sink<I> for TransformSink<I, O> {
    async fn start(&mut self, _controller: &WritableStreamDefaultController<I>) -> StreamResult<()> {
        self.transformer.start(&self.controller).await
    }

    async fn write(
        &mut self,
        chunk: I,
        _controller: &WritableStreamDefaultController<I>,
    ) -> StreamResult<()> {
        match self.transformer.transform(chunk, &self.controller).await {
            Ok(()) => Ok(()),
            Err(error) => {
                // A throwing transform errors both sides.
                self.controller.error(error.clone());
                Err(error)
            },
        }
    }

    async fn close(&mut self) -> StreamResult<()> {
        match self.transformer.flush(&self.controller).await {
            Ok(()) => {
                self.controller.terminate();
                Ok(())
            },
            Err(error) => {
                self.controller.error(error.clone());
                Err(error)
            },
        }
    }

    async fn abort(&mut self, reason: JsError) -> StreamResult<()> {
        self.controller.error(reason);
        Ok(())
    }
}
