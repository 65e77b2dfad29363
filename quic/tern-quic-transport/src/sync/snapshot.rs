// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use parking_lot::Mutex;
use std::sync::Arc;

/// A slot holding an immutable value that is replaced as a whole.
///
/// Readers take a cheap `Arc` clone; writers build a new value from what they read and
/// install it with [`compare_and_set`](Self::compare_and_set), retrying if another writer
/// got there first. The lock is only held for the pointer swap.
#[derive(Debug)]
pub struct AtomicSnapshot<T> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T> Default for AtomicSnapshot<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<T> AtomicSnapshot<T> {
    pub fn new(value: Option<Arc<T>>) -> Self {
        Self {
            slot: Mutex::new(value),
        }
    }

    #[inline]
    pub fn load(&self) -> Option<Arc<T>> {
        self.slot.lock().clone()
    }

    #[inline]
    pub fn store(&self, value: Option<Arc<T>>) {
        *self.slot.lock() = value;
    }

    #[inline]
    pub fn take(&self) -> Option<Arc<T>> {
        self.slot.lock().take()
    }

    /// Installs `new` only if the slot still holds `current` (compared by pointer)
    pub fn compare_and_set(&self, current: &Option<Arc<T>>, new: Option<Arc<T>>) -> bool {
        let mut slot = self.slot.lock();
        let matches = match (&*slot, current) {
            (Some(actual), Some(expected)) => Arc::ptr_eq(actual, expected),
            (None, None) => true,
            _ => false,
        };
        if matches {
            *slot = new;
        }
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_compares_identity() {
        let snapshot = AtomicSnapshot::default();
        assert!(snapshot.compare_and_set(&None, Some(Arc::new(1))));

        let stale = Some(Arc::new(1));
        assert!(!snapshot.compare_and_set(&stale, Some(Arc::new(2))));

        let current = snapshot.load();
        assert!(snapshot.compare_and_set(&current, Some(Arc::new(3))));
        assert_eq!(snapshot.load().as_deref(), Some(&3));
        assert_eq!(snapshot.take().as_deref(), Some(&3));
        assert!(snapshot.load().is_none());
    }
}
