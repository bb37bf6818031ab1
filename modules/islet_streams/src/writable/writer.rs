// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use islet_utils::error::JsError;

use super::WritableStream;
use crate::StreamResult;

/// https://streams.spec.whatwg.org/#default-writer-class
pub struct WritableStreamDefaultWriter<C> {
    stream: WritableStream<C>,
    released: Arc<AtomicBool>,
}

impl<C: Send + 'static> WritableStreamDefaultWriter<C> {
    pub(crate) fn new(stream: WritableStream<C>) -> Self {
        Self {
            stream,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn clone_handle(&self) -> Self {
        Self {
            stream: self.stream.clone(),
            released: self.released.clone(),
        }
    }

    fn check_released(&self) -> StreamResult<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(JsError::type_error("Writer has been released"));
        }
        Ok(())
    }

    /// Forwards to `sink.write(chunk, controller)` and returns its outcome.
    pub async fn write(&self, chunk: C) -> StreamResult<()> {
        self.check_released()?;
        self.stream.write_internal(chunk).await
    }

    /// Resolves once `sink.close()` resolves and the stream reached
    /// `closed`.
    pub async fn close(&self) -> StreamResult<()> {
        self.check_released()?;
        self.stream.close_internal().await
    }

    pub async fn abort(&self, reason: JsError) -> StreamResult<()> {
        self.check_released()?;
        self.stream.abort_internal(reason).await
    }

    pub fn desired_size(&self) -> Option<f64> {
        self.stream.desired_size_internal()
    }

    /// Lifecycle promise; see `release_lock` for the interplay with
    /// release.
    pub async fn closed(&self) -> StreamResult<()> {
        let promise = self.stream.closed_promise();
        if self.released.load(Ordering::SeqCst) {
            if let Some(settled) = promise.peek() {
                return settled;
            }
            return Err(JsError::type_error("Writer has been released"));
        }
        promise.wait().await
    }

    /// Detaches the writer. The `closed` promise is rejected with a
    /// released error only when the stream has not reached a terminal
    /// state; a promise settled by a clean close (or an abort) keeps its
    /// outcome.
    pub fn release_lock(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stream.release_writer();
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        writable::{sink::Sink, WritableStreamDefaultController},
        QueuingStrategy,
    };

    struct CountingCloseSink;

    #[async_trait]
    impl Sink<u32> for CountingCloseSink {
        async fn write(
            &mut self,
            _chunk: u32,
            _controller: &WritableStreamDefaultController<u32>,
        ) -> StreamResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn release_after_clean_close_keeps_closed_fulfilled() {
        let stream = WritableStream::new(CountingCloseSink, QueuingStrategy::default());
        let writer = stream.get_writer().unwrap();

        writer.write(1).await.unwrap();
        writer.close().await.unwrap();
        writer.release_lock();

        // The regression this guards: a release following a clean close
        // must not reject the settled promise.
        writer.closed().await.unwrap();
        let writer2 = stream.get_writer().unwrap();
        writer2.closed().await.unwrap();
    }

    #[tokio::test]
    async fn release_before_terminal_state_rejects_closed() {
        let stream = WritableStream::new(CountingCloseSink, QueuingStrategy::default());
        let writer = stream.get_writer().unwrap();
        writer.release_lock();

        let err = writer.closed().await.unwrap_err();
        assert_eq!(err.message, "Writer has been released");
    }

    #[tokio::test]
    async fn released_writer_rejects_operations() {
        let stream = WritableStream::new(CountingCloseSink, QueuingStrategy::default());
        let writer = stream.get_writer().unwrap();
        writer.release_lock();

        assert!(writer.write(1).await.is_err());
        assert!(writer.close().await.is_err());
        assert!(writer.abort(JsError::error("x")).await.is_err());

        // The lock is free again.
        assert!(stream.get_writer().is_ok());
    }

    #[tokio::test]
    async fn release_after_abort_keeps_the_abort_rejection() {
        let stream = WritableStream::new(CountingCloseSink, QueuingStrategy::default());
        let writer = stream.get_writer().unwrap();
        writer.abort(JsError::error("aborted")).await.unwrap();
        writer.release_lock();

        let err = writer.closed().await.unwrap_err();
        assert_eq!(err.message, "aborted");
    }
}
