// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-memory sockets and executors for driving endpoints in tests

use crate::sync::{self, Task};
use bytes::Bytes;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use parking_lot::Mutex;
use std::{collections::VecDeque, io, net::SocketAddr};

/// Records every datagram an endpoint sends
#[derive(Debug)]
pub struct Socket {
    address: SocketAddr,
    pub sent: Mutex<VecDeque<(SocketAddr, Bytes)>>,
    /// Sends fail with `WouldBlock` while set
    pub blocked: AtomicBool,
    /// The next send fails with this error kind
    pub fail_next: Mutex<Option<io::ErrorKind>>,
    pub paused: AtomicBool,
    pub writable_requests: AtomicUsize,
    open: AtomicBool,
}

impl Socket {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            sent: Mutex::new(VecDeque::new()),
            blocked: AtomicBool::new(false),
            fail_next: Mutex::new(None),
            paused: AtomicBool::new(false),
            writable_requests: AtomicUsize::new(0),
            open: AtomicBool::new(true),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Takes the payloads sent so far
    pub fn take_sent(&self) -> Vec<(SocketAddr, Bytes)> {
        self.sent.lock().drain(..).collect()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

impl super::Socket for Socket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.address)
    }

    fn try_send_to(&self, payload: &[u8], peer: SocketAddr) -> io::Result<usize> {
        if !self.is_open() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        if let Some(kind) = self.fail_next.lock().take() {
            return Err(kind.into());
        }
        if self.blocked.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.sent
            .lock()
            .push_back((peer, Bytes::copy_from_slice(payload)));
        Ok(payload.len())
    }

    fn notify_writable(&self) {
        self.writable_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn pause_reading(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume_reading(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Holds tasks until the test runs them
#[derive(Default)]
pub struct Executor {
    tasks: Mutex<VecDeque<Task>>,
}

impl core::fmt::Debug for Executor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Executor")
            .field("pending", &self.pending())
            .finish()
    }
}

impl Executor {
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Runs queued tasks, including the ones they queue, until none are left
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        loop {
            let Some(task) = self.tasks.lock().pop_front() else {
                return ran;
            };
            task();
            ran += 1;
        }
    }
}

impl sync::Executor for Executor {
    fn execute(&self, task: Task) {
        self.tasks.lock().push_back(task);
    }
}
