// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// A unit of work handed to an [`Executor`]
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs drain loops somewhere other than the caller's stack.
///
/// The endpoint hands its read and write loops to an executor so the network thread is
/// never blocked by connection processing. The platform crate provides a tokio-backed
/// implementation.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, task: Task);
}

/// Runs every task on the calling thread
#[derive(Clone, Copy, Debug, Default)]
pub struct Inline;

impl Executor for Inline {
    #[inline]
    fn execute(&self, task: Task) {
        task()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn inline_runs_immediately() {
        let count = Arc::new(AtomicUsize::new(0));
        let task_count = count.clone();
        Inline.execute(Box::new(move || {
            task_count.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
