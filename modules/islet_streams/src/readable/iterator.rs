// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use islet_utils::error::JsError;

use super::{
    reader::{ReadResult, ReadableStreamDefaultReader},
    ReadableStream,
};
use crate::StreamResult;

/// Async iteration over a stream. Acquires the reader up front and releases
/// the lock when iteration finishes, errors, or the iterator is dropped.
pub struct StreamIterator<C: Send + 'static> {
    reader: Option<ReadableStreamDefaultReader<C>>,
}

impl<C: Send + 'static> StreamIterator<C> {
    pub(crate) fn new(reader: ReadableStreamDefaultReader<C>) -> Self {
        Self {
            reader: Some(reader),
        }
    }

    pub async fn next(&mut self) -> Option<StreamResult<C>> {
        let reader = self.reader.as_ref()?;
        match reader.read().await {
            Ok(ReadResult::Chunk(chunk)) => Some(Ok(chunk)),
            Ok(ReadResult::Done) => {
                self.finish();
                None
            },
            Err(error) => {
                self.finish();
                Some(Err(error))
            },
        }
    }

    /// Early termination: cancels the stream, then releases the lock.
    pub async fn r#return(&mut self, reason: JsError) -> StreamResult<()> {
        if let Some(reader) = self.reader.take() {
            let result = reader.cancel(reason).await;
            reader.release_lock();
            return result;
        }
        Ok(())
    }

    /// Drains every remaining chunk.
    pub async fn collect(mut self) -> StreamResult<Vec<C>> {
        let mut chunks = Vec::new();
        while let Some(next) = self.next().await {
            chunks.push(next?);
        }
        Ok(chunks)
    }

    fn finish(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.release_lock();
        }
    }
}

impl<C: Send + 'static> Drop for StreamIterator<C> {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.release_lock();
        }
    }
}

impl<C: Send + 'static> ReadableStream<C> {
    /// Locks the stream for async iteration.
    pub fn iter(&self) -> StreamResult<StreamIterator<C>> {
        Ok(StreamIterator::new(self.get_reader()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn iterates_and_releases_the_lock() {
        let stream = ReadableStream::from_chunks(vec![1u32, 2, 3]);
        let mut iterator = stream.iter().unwrap();
        assert!(stream.is_locked());

        let mut seen = Vec::new();
        while let Some(chunk) = iterator.next().await {
            seen.push(chunk.unwrap());
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(!stream.is_locked());
    }

    #[tokio::test]
    async fn collect_gathers_all_chunks() {
        let stream = ReadableStream::from_chunks(vec!["a", "b"]);
        assert_eq!(stream.iter().unwrap().collect().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn return_cancels_the_stream() {
        let stream = ReadableStream::from_chunks(vec![1u32, 2, 3]);
        let mut iterator = stream.iter().unwrap();
        assert_eq!(iterator.next().await.unwrap().unwrap(), 1);
        iterator.r#return(JsError::error("enough")).await.unwrap();
        assert!(!stream.is_locked());
    }
}
