// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use islet_utils::error::JsError;

use super::{
    reader::{ReadResult, ReadableStreamDefaultReader},
    source::Source,
    ReadableStream, ReadableStreamDefaultController,
};
use crate::{queuing_strategy::QueuingStrategy, StreamResult};

struct TeeShared<C: Send + 'static> {
    reader: ReadableStreamDefaultReader<C>,
    reading: Mutex<bool>,
    branches: Mutex<TeeBranches<C>>,
}

struct TeeBranches<C> {
    controllers: Vec<ReadableStreamDefaultController<C>>,
    canceled: [bool; 2],
    reasons: [Option<JsError>; 2],
}

impl<C: Clone + Send + 'static> TeeShared<C> {
    /// One pull services both branches: a single read from the shared
    /// reader fans out to every branch that has not canceled.
    async fn pull(&self) -> StreamResult<()> {
        {
            let mut reading = self.reading.lock().unwrap();
            if *reading {
                return Ok(());
            }
            *reading = true;
        }
        let outcome = self.reader.read().await;
        *self.reading.lock().unwrap() = false;

        let branches = self.branches.lock().unwrap();
        match outcome {
            Ok(ReadResult::Chunk(chunk)) => {
                for (index, controller) in branches.controllers.iter().enumerate() {
                    if !branches.canceled[index] {
                        controller.enqueue(chunk.clone())?;
                    }
                }
            },
            Ok(ReadResult::Done) => {
                for (index, controller) in branches.controllers.iter().enumerate() {
                    if !branches.canceled[index] {
                        let _ = controller.close();
                    }
                }
            },
            Err(error) => {
                for controller in &branches.controllers {
                    controller.error(error.clone());
                }
            },
        }
        Ok(())
    }

    async fn cancel(&self, index: usize, reason: JsError) -> StreamResult<()> {
        let both_canceled = {
            let mut branches = self.branches.lock().unwrap();
            branches.canceled[index] = true;
            branches.reasons[index] = Some(reason);
            branches.canceled[0] && branches.canceled[1]
        };
        if both_canceled {
            // Cancellation of both branches cascades into the source with
            // both reasons.
            let combined = {
                let branches = self.branches.lock().unwrap();
                let describe = |reason: &Option<JsError>| {
                    reason
                        .as_ref()
                        .map(|reason| reason.message.clone())
                        .unwrap_or_default()
                };
                JsError::error(format!(
                    "[{}, {}]",
                    describe(&branches.reasons[0]),
                    describe(&branches.reasons[1])
                ))
            };
            return self.reader.cancel(combined).await;
        }
        Ok(())
    }
}

struct TeeSource<C: Send + 'static> {
    shared: Arc<TeeShared<C>>,
    index: usize,
}

#[async_trait]
impl<C: Clone + Send + 'static> Source<C> for TeeSource<C> {
    async fn pull(&mut self, _controller: &ReadableStreamDefaultController<C>) -> StreamResult<()> {
        self.shared.pull().await
    }

    async fn cancel(&mut self, reason: JsError) -> StreamResult<()> {
        self.shared.cancel(self.index, reason).await
    }
}

impl<C: Clone + Send + 'static> ReadableStream<C> {
    /// https://streams.spec.whatwg.org/#rs-tee
    ///
    /// Locks this stream and returns two branches with independent queues
    /// and cancellation. Reads from the source start only when a branch
    /// demands data.
    pub fn tee(&self) -> StreamResult<(ReadableStream<C>, ReadableStream<C>)> {
        let reader = self.get_reader()?;
        let shared = Arc::new(TeeShared {
            reader,
            reading: Mutex::new(false),
            branches: Mutex::new(TeeBranches {
                controllers: Vec::with_capacity(2),
                canceled: [false, false],
                reasons: [None, None],
            }),
        });

        let first = ReadableStream::new(
            TeeSource {
                shared: shared.clone(),
                index: 0,
            },
            QueuingStrategy::default(),
        );
        let second = ReadableStream::new(
            TeeSource {
                shared: shared.clone(),
                index: 1,
            },
            QueuingStrategy::default(),
        );
        {
            let mut branches = shared.branches.lock().unwrap();
            branches.controllers.push(first.controller());
            branches.controllers.push(second.controller());
        }
        Ok((first, second))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::readable::ReadableState;

    #[tokio::test]
    async fn both_branches_see_every_chunk() {
        let stream = ReadableStream::from_chunks(vec![1u32, 2, 3]);
        let (first, second) = stream.tee().unwrap();
        assert!(stream.is_locked());

        let left = first.iter().unwrap().collect().await.unwrap();
        let right = second.iter().unwrap().collect().await.unwrap();
        assert_eq!(left, vec![1, 2, 3]);
        assert_eq!(right, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn branches_read_independently() {
        let stream = ReadableStream::from_chunks(vec!["a", "b"]);
        let (first, second) = stream.tee().unwrap();

        // Drain one branch completely before touching the other.
        assert_eq!(first.iter().unwrap().collect().await.unwrap(), vec!["a", "b"]);
        assert_eq!(second.iter().unwrap().collect().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn reads_start_only_on_demand() {
        struct CountingSource {
            pulls: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl Source<u32> for CountingSource {
            async fn pull(
                &mut self,
                controller: &ReadableStreamDefaultController<u32>,
            ) -> StreamResult<()> {
                self.pulls.fetch_add(1, Ordering::SeqCst);
                controller.enqueue(1)?;
                Ok(())
            }
        }

        let pulls = Arc::new(AtomicUsize::new(0));
        let stream = ReadableStream::new(
            CountingSource {
                pulls: pulls.clone(),
            },
            QueuingStrategy::count(0.0),
        );
        let (first, _second) = stream.tee().unwrap();
        assert_eq!(pulls.load(Ordering::SeqCst), 0);

        let reader = first.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), ReadResult::Chunk(1));
        assert!(pulls.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn cancelling_both_branches_cancels_the_source() {
        let stream = ReadableStream::from_chunks(vec![1u32]);
        let (first, second) = stream.tee().unwrap();

        first.cancel(JsError::error("left")).await.unwrap();
        assert_eq!(stream.state(), ReadableState::Readable);

        second.cancel(JsError::error("right")).await.unwrap();
        assert_eq!(stream.state(), ReadableState::Errored);
        let combined = stream.stored_error().unwrap();
        assert!(combined.message.contains("left"));
        assert!(combined.message.contains("right"));
    }

    #[tokio::test]
    async fn source_error_reaches_both_branches() {
        let stream: ReadableStream<u32> = ReadableStream::new(
            crate::readable::source::NoopSource,
            QueuingStrategy::default(),
        );
        let controller = stream.controller();
        let (first, second) = stream.tee().unwrap();

        controller.error(JsError::error("upstream failed"));

        let first_reader = first.get_reader().unwrap();
        let err = first_reader.read().await.unwrap_err();
        assert_eq!(err.message, "upstream failed");

        let second_reader = second.get_reader().unwrap();
        let err = second_reader.read().await.unwrap_err();
        assert_eq!(err.message, "upstream failed");
    }
}
