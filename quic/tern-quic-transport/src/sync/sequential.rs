// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::Executor;
use core::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const RERUN: u8 = 2;
const STOPPED: u8 = 3;

/// Guarantees a drain loop has at most one active run.
///
/// A request that arrives while a run is in progress is either observed by that run or
/// causes exactly one more run once it finishes. After [`stop`](Self::stop) no new runs
/// start.
#[derive(Debug, Default)]
pub struct SequentialScheduler {
    state: AtomicU8,
}

impl SequentialScheduler {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
        }
    }

    /// Runs `task` on the calling thread unless another thread is already running it, in
    /// which case that thread runs it again after its current pass.
    pub fn run<F: FnMut()>(&self, mut task: F) {
        if !self.acquire() {
            return;
        }

        loop {
            task();
            if !self.release() {
                return;
            }
        }
    }

    /// Like [`run`](Self::run), but the passes happen on `executor`
    pub fn run_on<E, F>(self: &Arc<Self>, executor: &E, task: F)
    where
        E: Executor + ?Sized,
        F: FnMut() + Send + 'static,
    {
        if !self.acquire() {
            return;
        }

        let scheduler = self.clone();
        executor.execute(Box::new(move || {
            let mut task = task;
            loop {
                task();
                if !scheduler.release() {
                    return;
                }
            }
        }));
    }

    /// Prevents any further runs. A run in progress completes its current pass.
    pub fn stop(&self) {
        self.state.store(STOPPED, Ordering::Release);
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.state.load(Ordering::Acquire) == STOPPED
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), RUNNING | RERUN)
    }

    /// Returns true if the caller now owns the run
    fn acquire(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = match current {
                IDLE => RUNNING,
                RUNNING => RERUN,
                _ => return false,
            };
            match self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return current == IDLE,
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns true if another pass was requested while running
    fn release(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = match current {
                RUNNING => IDLE,
                RERUN => RUNNING,
                _ => return false,
            };
            match self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return current == RERUN,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Inline;
    use core::sync::atomic::AtomicUsize;

    #[test]
    fn reentrant_request_runs_once_more() {
        let scheduler = SequentialScheduler::new();
        let runs = AtomicUsize::new(0);

        scheduler.run(|| {
            let run = runs.fetch_add(1, Ordering::SeqCst);
            if run == 0 {
                // both requests collapse into a single extra pass
                scheduler.run(|| unreachable!());
                scheduler.run(|| unreachable!());
            }
        });

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(!scheduler.is_running());
    }

    #[test]
    fn stopped_scheduler_never_runs() {
        let scheduler = SequentialScheduler::new();
        scheduler.stop();
        scheduler.run(|| unreachable!());
        assert!(scheduler.is_stopped());
    }

    #[test]
    fn stop_during_run_ends_loop() {
        let scheduler = SequentialScheduler::new();
        let runs = AtomicUsize::new(0);
        scheduler.run(|| {
            runs.fetch_add(1, Ordering::SeqCst);
            scheduler.run(|| {});
            scheduler.stop();
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_on_executor() {
        let scheduler = Arc::new(SequentialScheduler::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let task_runs = runs.clone();
        scheduler.run_on(&Inline, move || {
            task_runs.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_running());
    }

    #[test]
    fn concurrent_requests_are_serialized() {
        let scheduler = Arc::new(SequentialScheduler::new());
        let active = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let scheduler = scheduler.clone();
                let active = active.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        scheduler.run(|| {
                            assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                            active.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
    }
}
