// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use islet_abort::AbortSignal;
use islet_utils::error::JsError;

use super::{reader::ReadResult, ReadableStream};
use crate::{transform::TransformStream, writable::WritableStream, StreamResult};

/// https://streams.spec.whatwg.org/#rs-pipe-to
#[derive(Clone, Default)]
pub struct PipeOptions {
    pub prevent_close: bool,
    pub prevent_abort: bool,
    pub prevent_cancel: bool,
    pub signal: Option<AbortSignal>,
}

impl<C: Send + 'static> ReadableStream<C> {
    /// Pumps this stream into `dest`: read → write until done, then closes
    /// the destination. Errors propagate according to the options. Both
    /// locks are released whatever the outcome.
    pub async fn pipe_to(
        &self,
        dest: &WritableStream<C>,
        options: PipeOptions,
    ) -> StreamResult<()> {
        let reader = self.get_reader()?;
        let writer = match dest.get_writer() {
            Ok(writer) => writer,
            Err(error) => {
                reader.release_lock();
                return Err(error);
            },
        };

        let result = pipe_loop(&reader, &writer, &options).await;

        reader.release_lock();
        writer.release_lock();
        result
    }

    /// `pipe_through(transform)` is `pipe_to(transform.writable)` running
    /// in the background; the transform's readable side is returned
    /// immediately.
    pub fn pipe_through<O: Send + 'static>(
        &self,
        transform: &TransformStream<C, O>,
        options: PipeOptions,
    ) -> ReadableStream<O> {
        let source = self.clone();
        let writable = transform.writable();
        tokio::spawn(async move {
            let _ = source.pipe_to(&writable, options).await;
        });
        transform.readable()
    }
}

async fn pipe_loop<C: Send + 'static>(
    reader: &super::reader::ReadableStreamDefaultReader<C>,
    writer: &crate::writable::writer::WritableStreamDefaultWriter<C>,
    options: &PipeOptions,
) -> StreamResult<()> {
    loop {
        let outcome = match &options.signal {
            Some(signal) => {
                if signal.aborted() {
                    return abort_both(reader, writer, options, signal_reason(signal)).await;
                }
                tokio::select! {
                    outcome = reader.read() => outcome,
                    reason = signal.wait_aborted() => {
                        return abort_both(reader, writer, options, reason).await;
                    },
                }
            },
            None => reader.read().await,
        };

        match outcome {
            Ok(ReadResult::Chunk(chunk)) => {
                if let Err(error) = writer.write(chunk).await {
                    if !options.prevent_cancel {
                        let _ = reader.cancel(error.clone()).await;
                    }
                    return Err(error);
                }
            },
            Ok(ReadResult::Done) => {
                if !options.prevent_close {
                    writer.close().await?;
                }
                return Ok(());
            },
            Err(error) => {
                if !options.prevent_abort {
                    let _ = writer.abort(error.clone()).await;
                }
                return Err(error);
            },
        }
    }
}

async fn abort_both<C: Send + 'static>(
    reader: &super::reader::ReadableStreamDefaultReader<C>,
    writer: &crate::writable::writer::WritableStreamDefaultWriter<C>,
    options: &PipeOptions,
    reason: JsError,
) -> StreamResult<()> {
    if !options.prevent_abort {
        let _ = writer.abort(reason.clone()).await;
    }
    if !options.prevent_cancel {
        let _ = reader.cancel(reason.clone()).await;
    }
    Err(reason)
}

fn signal_reason(signal: &AbortSignal) -> JsError {
    signal
        .reason()
        .unwrap_or_else(|| JsError::dom_exception("AbortError", "This operation was aborted"))
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use async_trait::async_trait;
    use islet_abort::AbortController;

    use super::*;
    use crate::{
        writable::{sink::Sink, WritableStreamDefaultController},
        QueuingStrategy,
    };

    struct RecordingSink {
        written: Arc<Mutex<Vec<&'static str>>>,
        close_count: Arc<AtomicUsize>,
        abort_reason: Arc<Mutex<Option<String>>>,
    }

    #[async_trait]
    impl Sink<&'static str> for RecordingSink {
        async fn write(
            &mut self,
            chunk: &'static str,
            _controller: &WritableStreamDefaultController<&'static str>,
        ) -> StreamResult<()> {
            self.written.lock().unwrap().push(chunk);
            Ok(())
        }

        async fn close(&mut self) -> StreamResult<()> {
            self.close_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn abort(&mut self, reason: JsError) -> StreamResult<()> {
            *self.abort_reason.lock().unwrap() = Some(reason.message);
            Ok(())
        }
    }

    fn recording_sink() -> (
        RecordingSink,
        Arc<Mutex<Vec<&'static str>>>,
        Arc<AtomicUsize>,
        Arc<Mutex<Option<String>>>,
    ) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let close_count = Arc::new(AtomicUsize::new(0));
        let abort_reason = Arc::new(Mutex::new(None));
        (
            RecordingSink {
                written: written.clone(),
                close_count: close_count.clone(),
                abort_reason: abort_reason.clone(),
            },
            written,
            close_count,
            abort_reason,
        )
    }

    #[tokio::test]
    async fn pipes_chunks_and_closes_cleanly() {
        let (sink, written, close_count, _) = recording_sink();
        let source = ReadableStream::from_chunks(vec!["chunk1", "chunk2"]);
        let dest = WritableStream::new(sink, QueuingStrategy::default());

        source.pipe_to(&dest, PipeOptions::default()).await.unwrap();

        assert_eq!(*written.lock().unwrap(), vec!["chunk1", "chunk2"]);
        assert_eq!(close_count.load(Ordering::SeqCst), 1);
        // Both locks released.
        assert!(!source.is_locked());
        assert!(!dest.is_locked());
        // The destination's closed promise is fulfilled, exactly once, and
        // the release in the pipe's cleanup did not re-reject it.
        dest.get_writer().unwrap().closed().await.unwrap();
    }

    #[tokio::test]
    async fn source_error_aborts_the_destination() {
        let (sink, _, _, abort_reason) = recording_sink();
        let source: ReadableStream<&'static str> = ReadableStream::new(
            crate::readable::source::NoopSource,
            QueuingStrategy::default(),
        );
        let controller = source.controller();
        let dest = WritableStream::new(sink, QueuingStrategy::default());

        controller.enqueue("one").unwrap();
        controller.error(JsError::error("source broke"));

        let err = source
            .pipe_to(&dest, PipeOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.message, "source broke");
        assert_eq!(
            abort_reason.lock().unwrap().as_deref(),
            Some("source broke")
        );
    }

    #[tokio::test]
    async fn write_error_cancels_the_source() {
        struct FailingSink;

        #[async_trait]
        impl Sink<&'static str> for FailingSink {
            async fn write(
                &mut self,
                _chunk: &'static str,
                _controller: &WritableStreamDefaultController<&'static str>,
            ) -> StreamResult<()> {
                Err(JsError::error("sink broke"))
            }
        }

        let source = ReadableStream::from_chunks(vec!["a", "b"]);
        let dest = WritableStream::new(FailingSink, QueuingStrategy::default());

        let err = source
            .pipe_to(&dest, PipeOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.message, "sink broke");
        assert_eq!(source.state(), super::super::ReadableState::Errored);
    }

    #[tokio::test]
    async fn abort_signal_stops_the_pipe() {
        let (sink, _, _, abort_reason) = recording_sink();
        let source: ReadableStream<&'static str> = ReadableStream::new(
            crate::readable::source::NoopSource,
            QueuingStrategy::default(),
        );
        let dest = WritableStream::new(sink, QueuingStrategy::default());

        let controller = AbortController::new();
        let options = PipeOptions {
            signal: Some(controller.signal()),
            ..PipeOptions::default()
        };

        let pipe = tokio::spawn({
            let source = source.clone();
            let dest = dest.clone();
            async move { source.pipe_to(&dest, options).await }
        });
        tokio::task::yield_now().await;

        controller.abort(Some(JsError::error("user aborted")));
        let err = pipe.await.unwrap().unwrap_err();
        assert_eq!(err.message, "user aborted");
        assert_eq!(
            abort_reason.lock().unwrap().as_deref(),
            Some("user aborted")
        );
    }

    #[tokio::test]
    async fn prevent_close_leaves_destination_open() {
        let (sink, written, close_count, _) = recording_sink();
        let source = ReadableStream::from_chunks(vec!["only"]);
        let dest = WritableStream::new(sink, QueuingStrategy::default());

        source
            .pipe_to(
                &dest,
                PipeOptions {
                    prevent_close: true,
                    ..PipeOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(*written.lock().unwrap(), vec!["only"]);
        assert_eq!(close_count.load(Ordering::SeqCst), 0);
        assert_eq!(dest.state(), crate::writable::WritableState::Writable);
    }
}
