// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use bytes::Bytes;

/// Chunk size measure used by a stream's queue.
pub type SizeFn<C> = Arc<dyn Fn(&C) -> f64 + Send + Sync>;

/// Chunk types measurable by [`ByteLengthQueuingStrategy`].
pub trait ByteSized {
    fn byte_length(&self) -> usize;
}

impl ByteSized for Bytes {
    fn byte_length(&self) -> usize {
        self.len()
    }
}

impl ByteSized for Vec<u8> {
    fn byte_length(&self) -> usize {
        self.len()
    }
}

impl ByteSized for String {
    fn byte_length(&self) -> usize {
        self.len()
    }
}

/// High water mark plus size function, the shape both stream constructors
/// accept.
#[derive(Clone)]
pub struct QueuingStrategy<C> {
    pub high_water_mark: f64,
    pub size: SizeFn<C>,
}

impl<C> QueuingStrategy<C> {
    pub fn count(high_water_mark: f64) -> Self {
        Self {
            high_water_mark,
            size: Arc::new(|_| 1.0),
        }
    }

    pub fn byte_length(high_water_mark: f64) -> Self
    where
        C: ByteSized,
    {
        Self {
            high_water_mark,
            size: Arc::new(|chunk: &C| chunk.byte_length() as f64),
        }
    }
}

impl<C> Default for QueuingStrategy<C> {
    fn default() -> Self {
        Self::count(1.0)
    }
}

/// https://streams.spec.whatwg.org/#blqs-class
#[derive(Clone, Copy, Debug)]
pub struct ByteLengthQueuingStrategy {
    pub high_water_mark: f64,
}

impl ByteLengthQueuingStrategy {
    pub fn new(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }

    pub fn size(&self, chunk: &impl ByteSized) -> f64 {
        chunk.byte_length() as f64
    }
}

/// https://streams.spec.whatwg.org/#cqs-class
#[derive(Clone, Copy, Debug)]
pub struct CountQueuingStrategy {
    pub high_water_mark: f64,
}

impl CountQueuingStrategy {
    pub fn new(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }

    pub fn size<C>(&self, _chunk: &C) -> f64 {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_length_reports_chunk_bytes() {
        let strategy = ByteLengthQueuingStrategy::new(16.0);
        assert_eq!(strategy.high_water_mark, 16.0);
        assert_eq!(strategy.size(&Bytes::from_static(b"abcd")), 4.0);
        assert_eq!(strategy.size(&String::from("hé")), 3.0);
    }

    #[test]
    fn count_reports_one_per_chunk() {
        let strategy = CountQueuingStrategy::new(4.0);
        assert_eq!(strategy.size(&"anything"), 1.0);
        assert_eq!(strategy.size(&42u32), 1.0);
    }
}
