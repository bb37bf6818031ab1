// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex, Weak};

use islet_utils::error::JsError;
use tokio::sync::oneshot;

use crate::{
    queuing_strategy::{QueuingStrategy, SizeFn},
    utils::{promise::Promise, queue::QueueWithSizes},
    StreamResult,
};

pub mod controller;
pub mod iterator;
pub mod pipe;
pub mod reader;
pub mod source;
mod tee;

pub use controller::ReadableStreamDefaultController;

use reader::{ReadResult, ReadableStreamDefaultReader};
use source::{ChunksSource, Source};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadableState {
    Readable,
    Closed,
    Errored,
}

pub(crate) struct ReadableInner<C> {
    pub(crate) state: ReadableState,
    pub(crate) stored_error: Option<JsError>,
    pub(crate) queue: QueueWithSizes<C>,
    pub(crate) close_requested: bool,
    pub(crate) locked: bool,
    pub(crate) pending_read: Option<oneshot::Sender<StreamResult<ReadResult<C>>>>,
    pub(crate) source: Option<Box<dyn Source<C>>>,
    pub(crate) started: bool,
    pub(crate) pulling: bool,
    pub(crate) pull_again: bool,
    pub(crate) high_water_mark: f64,
    pub(crate) size_fn: SizeFn<C>,
    pub(crate) closed_promise: Promise<StreamResult<()>>,
}

/// https://streams.spec.whatwg.org/#rs-class
///
/// The handle is cheaply cloneable; all clones view the same stream. The
/// underlying source's `start` hook runs lazily, before the first pull,
/// read or cancel touches the stream.
pub struct ReadableStream<C> {
    pub(crate) inner: Arc<Mutex<ReadableInner<C>>>,
}

impl<C> Clone for ReadableStream<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C> std::fmt::Debug for ReadableStream<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ReadableStream")
    }
}

impl<C> ReadableStream<C> {
    /// Whether two handles view the same stream.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<C: Send + 'static> ReadableStream<C> {
    pub fn new(source: impl Source<C> + 'static, strategy: QueuingStrategy<C>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ReadableInner {
                state: ReadableState::Readable,
                stored_error: None,
                queue: QueueWithSizes::new(),
                close_requested: false,
                locked: false,
                pending_read: None,
                source: Some(Box::new(source)),
                started: false,
                pulling: false,
                pull_again: false,
                high_water_mark: strategy.high_water_mark,
                size_fn: strategy.size,
                closed_promise: Promise::new(),
            })),
        }
    }

    /// A stream that delivers the given chunks in order, then closes.
    pub fn from_chunks(chunks: Vec<C>) -> Self {
        Self::new(ChunksSource::new(chunks), QueuingStrategy::default())
    }

    pub fn is_locked(&self) -> bool {
        self.inner.lock().unwrap().locked
    }

    pub fn state(&self) -> ReadableState {
        self.inner.lock().unwrap().state
    }

    pub fn stored_error(&self) -> Option<JsError> {
        self.inner.lock().unwrap().stored_error.clone()
    }

    /// Acquires the single reader. A second acquisition fails until the
    /// first reader releases its lock.
    pub fn get_reader(&self) -> StreamResult<ReadableStreamDefaultReader<C>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.locked {
            return Err(JsError::type_error("ReadableStream is locked to a reader"));
        }
        inner.locked = true;
        Ok(ReadableStreamDefaultReader::new(self.clone()))
    }

    /// Cancels an unlocked stream: errors it and informs the source.
    pub async fn cancel(&self, reason: JsError) -> StreamResult<()> {
        if self.is_locked() {
            return Err(JsError::type_error("Cannot cancel a locked ReadableStream"));
        }
        self.cancel_internal(reason).await
    }

    pub(crate) fn controller(&self) -> ReadableStreamDefaultController<C> {
        ReadableStreamDefaultController::new(Arc::downgrade(&self.inner))
    }

    pub(crate) fn from_inner(inner: Arc<Mutex<ReadableInner<C>>>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<Mutex<ReadableInner<C>>> {
        Arc::downgrade(&self.inner)
    }

    // Internal state transitions. Everything below holds the lock only for
    // synchronous sections; source hooks run with the source moved out.

    pub(crate) fn enqueue_internal(&self, chunk: C) -> StreamResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.close_requested || inner.state != ReadableState::Readable {
            return Err(JsError::type_error(
                "The stream is not in a state that permits enqueue",
            ));
        }
        // A parked read request consumes the chunk without touching the
        // queue.
        if let Some(pending) = inner.pending_read.take() {
            let _ = pending.send(Ok(ReadResult::Chunk(chunk)));
        } else {
            let size_fn = inner.size_fn.clone();
            inner.queue.enqueue_value_with_size(chunk, &size_fn)?;
        }
        if inner.pulling {
            inner.pull_again = true;
        }
        Ok(())
    }

    pub(crate) fn close_internal(&self) -> StreamResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.close_requested || inner.state != ReadableState::Readable {
            return Err(JsError::type_error(
                "The stream is not in a state that permits close",
            ));
        }
        inner.close_requested = true;
        // Close settles only once every queued chunk has been delivered.
        if inner.queue.is_empty() {
            inner.state = ReadableState::Closed;
            if let Some(pending) = inner.pending_read.take() {
                let _ = pending.send(Ok(ReadResult::Done));
            }
            inner.closed_promise.settle(Ok(()));
        }
        Ok(())
    }

    pub(crate) fn error_internal(&self, error: JsError) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ReadableState::Readable {
            return;
        }
        inner.state = ReadableState::Errored;
        inner.stored_error = Some(error.clone());
        inner.queue.reset_queue();
        if let Some(pending) = inner.pending_read.take() {
            let _ = pending.send(Err(error.clone()));
        }
        inner.closed_promise.settle(Err(error));
    }

    pub(crate) fn desired_size_internal(&self) -> Option<f64> {
        let inner = self.inner.lock().unwrap();
        match inner.state {
            ReadableState::Errored => None,
            ReadableState::Closed => Some(0.0),
            ReadableState::Readable => {
                Some(inner.high_water_mark - inner.queue.queue_total_size)
            },
        }
    }

    pub(crate) fn closed_promise(&self) -> Promise<StreamResult<()>> {
        self.inner.lock().unwrap().closed_promise.clone()
    }

    pub(crate) async fn ensure_started(&self) {
        let source = {
            let mut inner = self.inner.lock().unwrap();
            if inner.started || inner.pulling || inner.state != ReadableState::Readable {
                return;
            }
            inner.started = true;
            inner.pulling = true;
            inner.source.take()
        };
        let Some(mut source) = source else {
            self.inner.lock().unwrap().pulling = false;
            return;
        };
        let result = source.start(&self.controller()).await;
        {
            let mut inner = self.inner.lock().unwrap();
            inner.source = Some(source);
            inner.pulling = false;
        }
        if let Err(error) = result {
            self.error_internal(error);
        }
    }

    /// Calls the source's pull hook while demand exists: a parked read, or
    /// free space under the high water mark. Re-entrant calls fold into the
    /// running loop through `pull_again`.
    pub(crate) async fn drive_pull(&self) {
        self.ensure_started().await;
        let mut source = {
            let mut inner = self.inner.lock().unwrap();
            if inner.pulling {
                inner.pull_again = true;
                return;
            }
            if !should_pull(&inner) {
                return;
            }
            match inner.source.take() {
                Some(source) => {
                    inner.pulling = true;
                    source
                },
                None => return,
            }
        };
        loop {
            let result = source.pull(&self.controller()).await;
            let mut inner = self.inner.lock().unwrap();
            inner.source = Some(source);
            inner.pulling = false;
            if let Err(error) = result {
                drop(inner);
                self.error_internal(error);
                return;
            }
            if inner.pull_again && should_pull(&inner) {
                inner.pull_again = false;
                inner.pulling = true;
                source = inner.source.take().expect("source returned above");
                continue;
            }
            inner.pull_again = false;
            return;
        }
    }

    pub(crate) async fn read_internal(&self) -> StreamResult<ReadResult<C>> {
        self.ensure_started().await;
        let (immediate, receiver) = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(chunk) = inner.queue.dequeue_value() {
                if inner.queue.is_empty()
                    && inner.close_requested
                    && inner.state == ReadableState::Readable
                {
                    inner.state = ReadableState::Closed;
                    inner.closed_promise.settle(Ok(()));
                }
                (Some(Ok(ReadResult::Chunk(chunk))), None)
            } else {
                match inner.state {
                    ReadableState::Closed => (Some(Ok(ReadResult::Done)), None),
                    ReadableState::Errored => (
                        Some(Err(inner
                            .stored_error
                            .clone()
                            .unwrap_or_else(|| JsError::type_error("Stream is errored")))),
                        None,
                    ),
                    ReadableState::Readable => {
                        if inner.pending_read.is_some() {
                            (
                                Some(Err(JsError::type_error("A read is already pending"))),
                                None,
                            )
                        } else {
                            let (tx, rx) = oneshot::channel();
                            inner.pending_read = Some(tx);
                            (None, Some(rx))
                        }
                    },
                }
            }
        };
        if let Some(result) = immediate {
            self.drive_pull().await;
            return result;
        }
        self.drive_pull().await;
        match receiver.expect("parked read has a receiver").await {
            Ok(outcome) => outcome,
            Err(_) => Err(JsError::type_error("Reader has been released")),
        }
    }

    pub(crate) async fn cancel_internal(&self, reason: JsError) -> StreamResult<()> {
        self.ensure_started().await;
        let source = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != ReadableState::Readable {
                return Ok(());
            }
            inner.source.take()
        };
        self.error_internal(reason.clone());
        if let Some(mut source) = source {
            source.cancel(reason).await?;
        }
        Ok(())
    }

    pub(crate) fn release_reader(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pending) = inner.pending_read.take() {
            let _ = pending.send(Err(JsError::type_error("Reader has been released")));
        }
        inner.locked = false;
    }
}

fn should_pull<C>(inner: &ReadableInner<C>) -> bool {
    inner.state == ReadableState::Readable
        && !inner.close_requested
        && (inner.pending_read.is_some()
            || inner.high_water_mark - inner.queue.queue_total_size > 0.0)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;

    struct PushSource {
        chunks: Vec<&'static str>,
        close: bool,
    }

    #[async_trait]
    impl Source<&'static str> for PushSource {
        async fn start(
            &mut self,
            controller: &ReadableStreamDefaultController<&'static str>,
        ) -> StreamResult<()> {
            for chunk in self.chunks.drain(..) {
                controller.enqueue(chunk)?;
            }
            if self.close {
                controller.close()?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn chunks_are_read_in_order_then_done() {
        let stream = ReadableStream::from_chunks(vec!["c1", "c2", "c3"]);
        let reader = stream.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), ReadResult::Chunk("c1"));
        assert_eq!(reader.read().await.unwrap(), ReadResult::Chunk("c2"));
        assert_eq!(reader.read().await.unwrap(), ReadResult::Chunk("c3"));
        assert_eq!(reader.read().await.unwrap(), ReadResult::Done);
        // Done is sticky.
        assert_eq!(reader.read().await.unwrap(), ReadResult::Done);
    }

    #[tokio::test]
    async fn close_waits_for_queue_to_drain() {
        let stream = ReadableStream::new(
            PushSource {
                chunks: vec!["a", "b"],
                close: true,
            },
            QueuingStrategy::default(),
        );
        let reader = stream.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), ReadResult::Chunk("a"));
        assert_eq!(stream.state(), ReadableState::Readable);
        assert_eq!(reader.read().await.unwrap(), ReadResult::Chunk("b"));
        assert_eq!(stream.state(), ReadableState::Closed);
        assert_eq!(reader.read().await.unwrap(), ReadResult::Done);
        reader.closed().await.unwrap();
    }

    #[tokio::test]
    async fn enqueue_fulfils_a_parked_read() {
        let stream: ReadableStream<u32> =
            ReadableStream::new(source::NoopSource, QueuingStrategy::default());
        let reader = stream.get_reader().unwrap();
        let controller = stream.controller();

        let pending = tokio::spawn({
            let reader = reader.clone_handle();
            async move { reader.read().await }
        });
        tokio::task::yield_now().await;

        controller.enqueue(7).unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), ReadResult::Chunk(7));
    }

    #[tokio::test]
    async fn error_is_sticky_for_future_reads() {
        let stream: ReadableStream<u32> =
            ReadableStream::new(source::NoopSource, QueuingStrategy::default());
        let controller = stream.controller();
        controller.enqueue(1).unwrap();
        controller.error(JsError::range_error("boom"));

        let reader = stream.get_reader().unwrap();
        // The queue was cleared by the error.
        let err = reader.read().await.unwrap_err();
        assert_eq!(err.message, "boom");
        let err = reader.read().await.unwrap_err();
        assert_eq!(err.message, "boom");
        assert!(reader.closed().await.is_err());
    }

    #[tokio::test]
    async fn second_reader_acquisition_fails() {
        let stream: ReadableStream<u32> = ReadableStream::from_chunks(vec![]);
        let _reader = stream.get_reader().unwrap();
        let err = stream.get_reader().unwrap_err();
        assert!(err.message.contains("locked"));
    }

    #[tokio::test]
    async fn enqueue_after_close_fails() {
        let stream: ReadableStream<u32> =
            ReadableStream::new(source::NoopSource, QueuingStrategy::default());
        let controller = stream.controller();
        controller.close().unwrap();
        assert!(controller.enqueue(1).is_err());
    }

    #[tokio::test]
    async fn cancel_errors_stream_and_reaches_source() {
        struct CancelRecorder {
            seen: Arc<Mutex<Option<String>>>,
        }

        #[async_trait]
        impl Source<u32> for CancelRecorder {
            async fn cancel(&mut self, reason: JsError) -> StreamResult<()> {
                *self.seen.lock().unwrap() = Some(reason.message);
                Ok(())
            }
        }

        let seen = Arc::new(Mutex::new(None));
        let stream = ReadableStream::new(
            CancelRecorder { seen: seen.clone() },
            QueuingStrategy::default(),
        );
        stream.cancel(JsError::error("no longer needed")).await.unwrap();
        assert_eq!(stream.state(), ReadableState::Errored);
        assert_eq!(seen.lock().unwrap().as_deref(), Some("no longer needed"));
    }

    #[tokio::test]
    async fn desired_size_tracks_queue() {
        let stream: ReadableStream<String> = ReadableStream::new(
            source::NoopSource,
            QueuingStrategy::byte_length(10.0),
        );
        let controller = stream.controller();
        assert_eq!(controller.desired_size(), Some(10.0));
        controller.enqueue("abcd".to_string()).unwrap();
        assert_eq!(controller.desired_size(), Some(6.0));
        controller.error(JsError::error("x"));
        assert_eq!(controller.desired_size(), None);
    }
}
