// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use islet_abort::AbortSignal;
use islet_utils::error::JsError;

use crate::{
    queuing_strategy::{QueuingStrategy, SizeFn},
    utils::promise::Promise,
    StreamResult,
};

pub mod controller;
pub mod sink;
pub mod writer;

pub use controller::WritableStreamDefaultController;

use sink::Sink;
use writer::WritableStreamDefaultWriter;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WritableState {
    Writable,
    Closing,
    Closed,
    Errored,
}

pub(crate) struct WritableInner<C> {
    pub(crate) state: WritableState,
    pub(crate) stored_error: Option<JsError>,
    pub(crate) locked: bool,
    pub(crate) sink: Option<Box<dyn Sink<C>>>,
    pub(crate) started: bool,
    pub(crate) in_flight_size: f64,
    pub(crate) high_water_mark: f64,
    pub(crate) size_fn: SizeFn<C>,
    pub(crate) closed_promise: Promise<StreamResult<()>>,
    pub(crate) signal: AbortSignal,
}

/// https://streams.spec.whatwg.org/#ws-class
///
/// Writes forward to the sink one at a time; ordering between write, close
/// and start is serialized on an internal gate. `abort` transitions the
/// stream immediately and only then waits for sink access, so an in-flight
/// `sink.write` future is never cancelled.
pub struct WritableStream<C> {
    pub(crate) inner: Arc<Mutex<WritableInner<C>>>,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl<C> Clone for WritableStream<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            gate: self.gate.clone(),
        }
    }
}

impl<C: Send + 'static> WritableStream<C> {
    pub fn new(sink: impl Sink<C> + 'static, strategy: QueuingStrategy<C>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(WritableInner {
                state: WritableState::Writable,
                stored_error: None,
                locked: false,
                sink: Some(Box::new(sink)),
                started: false,
                in_flight_size: 0.0,
                high_water_mark: strategy.high_water_mark,
                size_fn: strategy.size,
                closed_promise: Promise::new(),
                signal: AbortSignal::new(),
            })),
            gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.lock().unwrap().locked
    }

    pub fn state(&self) -> WritableState {
        self.inner.lock().unwrap().state
    }

    pub fn stored_error(&self) -> Option<JsError> {
        self.inner.lock().unwrap().stored_error.clone()
    }

    /// Acquires the single writer.
    pub fn get_writer(&self) -> StreamResult<WritableStreamDefaultWriter<C>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.locked {
            return Err(JsError::type_error("WritableStream is locked to a writer"));
        }
        inner.locked = true;
        Ok(WritableStreamDefaultWriter::new(self.clone()))
    }

    /// Aborts an unlocked stream.
    pub async fn abort(&self, reason: JsError) -> StreamResult<()> {
        if self.is_locked() {
            return Err(JsError::type_error("Cannot abort a locked WritableStream"));
        }
        self.abort_internal(reason).await
    }

    pub(crate) fn controller(&self) -> WritableStreamDefaultController<C> {
        WritableStreamDefaultController::new(Arc::downgrade(&self.inner))
    }

    pub(crate) fn closed_promise(&self) -> Promise<StreamResult<()>> {
        self.inner.lock().unwrap().closed_promise.clone()
    }

    pub(crate) fn desired_size_internal(&self) -> Option<f64> {
        let inner = self.inner.lock().unwrap();
        match inner.state {
            WritableState::Errored => None,
            WritableState::Closed | WritableState::Closing => Some(0.0),
            WritableState::Writable => Some(inner.high_water_mark - inner.in_flight_size),
        }
    }

    async fn ensure_started_gated(&self) -> StreamResult<()> {
        let sink = {
            let mut inner = self.inner.lock().unwrap();
            if inner.started {
                return Ok(());
            }
            inner.started = true;
            inner.sink.take()
        };
        let Some(mut sink) = sink else {
            return Ok(());
        };
        let result = sink.start(&self.controller()).await;
        self.inner.lock().unwrap().sink = Some(sink);
        if let Err(error) = result {
            self.error_internal(error.clone());
            return Err(error);
        }
        Ok(())
    }

    pub(crate) async fn write_internal(&self, chunk: C) -> StreamResult<()> {
        let gate = self.gate.clone();
        let _guard = gate.lock().await;
        self.ensure_started_gated().await?;

        let (size, mut sink) = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                WritableState::Errored => {
                    return Err(stored(&inner.stored_error));
                },
                WritableState::Closing | WritableState::Closed => {
                    return Err(JsError::type_error("Stream is closing or closed"));
                },
                WritableState::Writable => {},
            }
            let size = (inner.size_fn)(&chunk);
            if size.is_nan() || size < 0.0 || size.is_infinite() {
                drop(inner);
                let error =
                    JsError::range_error("Size must be a finite, non-NaN, non-negative number.");
                self.error_internal(error.clone());
                return Err(error);
            }
            inner.in_flight_size += size;
            let sink = inner.sink.take().expect("sink present while gate is held");
            (size, sink)
        };

        let result = sink.write(chunk, &self.controller()).await;
        let mut inner = self.inner.lock().unwrap();
        inner.in_flight_size -= size;
        inner.sink = Some(sink);
        match result {
            Ok(()) => {
                // An abort that landed while the write was in flight wins:
                // the write's promise rejects with the stored reason.
                if inner.state == WritableState::Errored {
                    return Err(stored(&inner.stored_error));
                }
                Ok(())
            },
            Err(error) => {
                drop(inner);
                self.error_internal(error.clone());
                Err(error)
            },
        }
    }

    pub(crate) async fn close_internal(&self) -> StreamResult<()> {
        let gate = self.gate.clone();
        let _guard = gate.lock().await;
        self.ensure_started_gated().await?;

        let mut sink = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                WritableState::Errored => return Err(stored(&inner.stored_error)),
                WritableState::Closing | WritableState::Closed => {
                    return Err(JsError::type_error("Stream is already closing or closed"));
                },
                WritableState::Writable => inner.state = WritableState::Closing,
            }
            inner.sink.take().expect("sink present while gate is held")
        };

        let result = sink.close().await;
        let mut inner = self.inner.lock().unwrap();
        inner.sink = Some(sink);
        match result {
            Ok(()) => {
                if inner.state == WritableState::Closing {
                    inner.state = WritableState::Closed;
                    inner.closed_promise.settle(Ok(()));
                    Ok(())
                } else {
                    // Aborted while the close was in flight.
                    Err(stored(&inner.stored_error))
                }
            },
            Err(error) => {
                drop(inner);
                self.error_internal(error.clone());
                Err(error)
            },
        }
    }

    pub(crate) async fn abort_internal(&self, reason: JsError) -> StreamResult<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                WritableState::Closed | WritableState::Errored => return Ok(()),
                _ => {},
            }
            inner.state = WritableState::Errored;
            inner.stored_error = Some(reason.clone());
            inner.closed_promise.settle(Err(reason.clone()));
            inner.signal.send_aborted(Some(reason.clone()));
        }
        // Wait for sink access so an in-flight write or close finishes
        // undisturbed, then inform the sink.
        let gate = self.gate.clone();
        let _guard = gate.lock().await;
        let sink = self.inner.lock().unwrap().sink.take();
        let result = match sink {
            Some(mut sink) => {
                let result = sink.abort(reason).await;
                self.inner.lock().unwrap().sink = Some(sink);
                result
            },
            None => Ok(()),
        };
        result
    }

    pub(crate) fn error_internal(&self, error: JsError) {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.state, WritableState::Closed | WritableState::Errored) {
            return;
        }
        inner.state = WritableState::Errored;
        inner.stored_error = Some(error.clone());
        inner.closed_promise.settle(Err(error));
    }

    pub(crate) fn release_writer(&self) {
        let should_reject = {
            let mut inner = self.inner.lock().unwrap();
            inner.locked = false;
            !matches!(inner.state, WritableState::Closed | WritableState::Errored)
        };
        if should_reject {
            // Never re-reject a settled lifecycle promise: a stream that
            // already closed or errored keeps its outcome.
            self.closed_promise()
                .settle(Err(JsError::type_error("Writer has been released")));
        }
    }
}

fn stored(error: &Option<JsError>) -> JsError {
    error
        .clone()
        .unwrap_or_else(|| JsError::type_error("Stream is errored"))
}
