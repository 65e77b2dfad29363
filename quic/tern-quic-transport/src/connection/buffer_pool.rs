// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::sync::atomic::{AtomicUsize, Ordering};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Send buffers each connection may have queued at the endpoint
pub const DEFAULT_BUFFERS: usize = 3;

/// Notified whenever a buffer returns to an exhausted pool
pub trait BufferListener: Send + Sync {
    fn on_buffer_available(&self);
}

struct Inner {
    available: AtomicUsize,
    listener: Mutex<Option<Weak<dyn BufferListener>>>,
}

/// A bounded pool of send permits.
///
/// A datagram holds a [`BufferPermit`] until the endpoint sent, discarded or dropped it.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

impl core::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BufferPool")
            .field("available", &self.available())
            .finish()
    }
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                available: AtomicUsize::new(capacity),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn set_listener(&self, listener: Weak<dyn BufferListener>) {
        *self.inner.listener.lock() = Some(listener);
    }

    /// Takes a permit, or returns `None` while every buffer is in use
    pub fn acquire(&self) -> Option<BufferPermit> {
        self.inner
            .available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |available| {
                available.checked_sub(1)
            })
            .ok()?;
        Some(BufferPermit {
            pool: Arc::downgrade(&self.inner),
        })
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.inner.available.load(Ordering::Acquire)
    }
}

/// Returns its buffer to the pool on drop
#[must_use]
pub struct BufferPermit {
    pool: Weak<Inner>,
}

impl core::fmt::Debug for BufferPermit {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BufferPermit").finish_non_exhaustive()
    }
}

impl Drop for BufferPermit {
    fn drop(&mut self) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        pool.available.fetch_add(1, Ordering::AcqRel);
        let listener = pool.listener.lock().as_ref().and_then(Weak::upgrade);
        if let Some(listener) = listener {
            listener.on_buffer_available();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl BufferListener for Counter {
        fn on_buffer_available(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn permits_are_bounded_and_returned() {
        let pool = BufferPool::new(DEFAULT_BUFFERS);
        let listener = Arc::new(Counter::default());
        let weak: Weak<dyn BufferListener> = Arc::downgrade(&listener) as _;
        pool.set_listener(weak);

        let permits: Vec<_> = core::iter::from_fn(|| pool.acquire()).collect();
        assert_eq!(permits.len(), 3);
        assert!(pool.acquire().is_none());

        drop(permits);
        assert_eq!(pool.available(), 3);
        assert_eq!(listener.0.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn permits_outlive_the_pool() {
        let pool = BufferPool::new(1);
        let permit = pool.acquire().unwrap();
        drop(pool);
        drop(permit);
    }
}
