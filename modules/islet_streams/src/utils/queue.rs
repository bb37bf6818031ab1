// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;

use islet_utils::error::JsError;

use crate::{queuing_strategy::SizeFn, StreamResult};

/// Queue-with-sizes shared by readable and writable streams.
/// https://streams.spec.whatwg.org/#queue-with-sizes
pub struct QueueWithSizes<C> {
    queue: VecDeque<ChunkWithSize<C>>,
    pub queue_total_size: f64,
}

struct ChunkWithSize<C> {
    chunk: C,
    size: f64,
}

impl<C> QueueWithSizes<C> {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            queue_total_size: 0.0,
        }
    }

    pub fn enqueue_value_with_size(&mut self, chunk: C, size_fn: &SizeFn<C>) -> StreamResult<()> {
        let size = size_fn(&chunk);
        // If ! IsNonNegativeNumber(size) is false, or size is +∞, throw a
        // RangeError exception.
        if size.is_nan() || size < 0.0 || size.is_infinite() {
            return Err(JsError::range_error(
                "Size must be a finite, non-NaN, non-negative number.",
            ));
        }
        self.queue.push_back(ChunkWithSize { chunk, size });
        self.queue_total_size += size;
        Ok(())
    }

    pub fn dequeue_value(&mut self) -> Option<C> {
        let entry = self.queue.pop_front()?;
        self.queue_total_size -= entry.size;
        // Rounding errors can push the total below zero.
        if self.queue_total_size < 0.0 {
            self.queue_total_size = 0.0;
        }
        Some(entry.chunk)
    }

    pub fn reset_queue(&mut self) {
        self.queue.clear();
        self.queue_total_size = 0.0;
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

impl<C> Default for QueueWithSizes<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn tracks_total_size_in_fifo_order() {
        let size: SizeFn<&str> = Arc::new(|chunk| chunk.len() as f64);
        let mut queue = QueueWithSizes::new();
        queue.enqueue_value_with_size("ab", &size).unwrap();
        queue.enqueue_value_with_size("cde", &size).unwrap();
        assert_eq!(queue.queue_total_size, 5.0);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.dequeue_value(), Some("ab"));
        assert_eq!(queue.queue_total_size, 3.0);
        assert_eq!(queue.dequeue_value(), Some("cde"));
        assert_eq!(queue.dequeue_value(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn rejects_invalid_sizes() {
        let nan: SizeFn<u8> = Arc::new(|_| f64::NAN);
        let negative: SizeFn<u8> = Arc::new(|_| -1.0);
        let infinite: SizeFn<u8> = Arc::new(|_| f64::INFINITY);
        let mut queue = QueueWithSizes::new();
        assert!(queue.enqueue_value_with_size(0, &nan).is_err());
        assert!(queue.enqueue_value_with_size(0, &negative).is_err());
        assert!(queue.enqueue_value_with_size(0, &infinite).is_err());
        assert!(queue.is_empty());
    }
}
