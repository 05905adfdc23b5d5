// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Size-classed recycling of rectangle content buffers.
//!
//! Every update tick allocates one byte buffer per outgoing rectangle. At a
//! steady 15 updates per second over a full-screen framebuffer that adds up,
//! so drained buffers are returned here and handed back out by size class
//! instead of going through the allocator each time.

use std::sync::Mutex;

// Class k holds buffers with capacity of at least MIN_CLASS << k.
const MIN_CLASS: usize = 4096;
const NUM_CLASSES: usize = 11; // 4 KiB .. 4 MiB
const MAX_PER_CLASS: usize = 8;

/// A pool of reusable byte buffers grouped into power-of-two size classes.
///
/// Requests are served from the smallest class that covers them, so a
/// returned buffer always has at least the requested capacity. Buffers
/// smaller than the smallest class are dropped rather than stored.
pub struct BufferPool {
    classes: Mutex<Vec<Vec<Vec<u8>>>>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            classes: Mutex::new(vec![Vec::new(); NUM_CLASSES]),
        }
    }

    /// Smallest class whose guaranteed capacity covers `len`.
    fn class_covering(len: usize) -> Option<usize> {
        (0..NUM_CLASSES).find(|&class| len <= MIN_CLASS << class)
    }

    /// Largest class whose guaranteed capacity `capacity` satisfies.
    fn class_fitting(capacity: usize) -> Option<usize> {
        (0..NUM_CLASSES).rev().find(|&class| MIN_CLASS << class <= capacity)
    }

    /// Takes a zero-length buffer with capacity for at least `len` bytes.
    #[must_use]
    pub fn take(&self, len: usize) -> Vec<u8> {
        if let Some(class) = Self::class_covering(len) {
            let mut classes = self.classes.lock().expect("buffer pool lock poisoned");
            if let Some(mut buf) = classes[class].pop() {
                buf.clear();
                return buf;
            }
            return Vec::with_capacity(MIN_CLASS << class);
        }
        Vec::with_capacity(len)
    }

    /// Returns a drained buffer to the pool.
    pub fn recycle(&self, buf: Vec<u8>) {
        if let Some(class) = Self::class_fitting(buf.capacity()) {
            let mut classes = self.classes.lock().expect("buffer pool lock poisoned");
            if classes[class].len() < MAX_PER_CLASS {
                classes[class].push(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycled_capacity_is_reused() {
        let pool = BufferPool::new();
        let mut buf = pool.take(100);
        buf.extend_from_slice(&[1, 2, 3]);
        let cap = buf.capacity();
        assert!(cap >= MIN_CLASS);
        pool.recycle(buf);

        let again = pool.take(100);
        assert_eq!(again.capacity(), cap);
        assert!(again.is_empty());
    }

    #[test]
    fn taken_buffers_always_cover_the_request() {
        let pool = BufferPool::new();
        // A buffer recycled into a class never shrinks a later request
        pool.recycle(Vec::with_capacity(6000));
        let buf = pool.take(5000);
        assert!(buf.capacity() >= 5000);
    }

    #[test]
    fn tiny_buffers_are_dropped() {
        let pool = BufferPool::new();
        pool.recycle(Vec::with_capacity(16));
        let buf = pool.take(16);
        assert!(buf.capacity() >= 16);
    }

    #[test]
    fn oversized_requests_bypass_the_classes() {
        let pool = BufferPool::new();
        let huge = pool.take(8 * 1024 * 1024);
        assert!(huge.capacity() >= 8 * 1024 * 1024);
    }
}
