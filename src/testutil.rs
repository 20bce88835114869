/*
 * Copyright (C) 2026 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::dispatch::Dispatch;
use crate::error::Error;
use crate::event::{EventMask, Socket, SocketKey, WaitQueue};
use crate::herder::WorkItem;
use std::mem;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub struct TestState {
    events: Mutex<EventMask>,
    wait: Arc<WaitQueue>,
    released: AtomicUsize,
}

impl TestState {
    /// Changes the socket's conditions and fires its wait queue, the way a
    /// network stack would on packet arrival.
    pub fn set_events(&self, events: EventMask) {
        *self.events.lock().unwrap() = events;

        self.wait.wake(events);
    }

    /// Changes the socket's conditions without notifying anyone.
    pub fn set_events_quiet(&self, events: EventMask) {
        *self.events.lock().unwrap() = events;
    }

    /// Fires the wait queue again with the current conditions.
    pub fn signal(&self) {
        let events = *self.events.lock().unwrap();

        self.wait.wake(events);
    }

    pub fn hooks(&self) -> usize {
        self.wait.len()
    }

    /// How many times the socket was dropped.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

/// A scriptable socket. Keep the returned state to drive readiness and to
/// observe when the socket gets released.
pub struct TestSocket {
    key: SocketKey,
    state: Arc<TestState>,
}

impl TestSocket {
    pub fn new(port: u16) -> (Self, Arc<TestState>) {
        Self::with_addr(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port)
    }

    pub fn with_addr(addr: IpAddr, port: u16) -> (Self, Arc<TestState>) {
        let state = Arc::new(TestState {
            events: Mutex::new(EventMask::NONE),
            wait: Arc::new(WaitQueue::new()),
            released: AtomicUsize::new(0),
        });

        let sock = Self {
            key: SocketKey::new(addr, port),
            state: Arc::clone(&state),
        };

        (sock, state)
    }
}

impl Drop for TestSocket {
    fn drop(&mut self) {
        self.state.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl Socket for TestSocket {
    fn key(&self) -> SocketKey {
        self.key
    }

    fn poll(&self) -> EventMask {
        *self.state.events.lock().unwrap()
    }

    fn wait_queue(&self) -> &Arc<WaitQueue> {
        &self.state.wait
    }
}

/// Collects submitted work items instead of processing them.
pub struct RecordingDispatch<S: Socket> {
    items: Mutex<Vec<WorkItem<S>>>,
    cond: Condvar,
    failing: AtomicBool,
}

impl<S: Socket> RecordingDispatch<S> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            cond: Condvar::new(),
            failing: AtomicBool::new(false),
        }
    }

    /// While set, every submission is rejected as if the queue were full.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn take(&self) -> Vec<WorkItem<S>> {
        mem::take(&mut *self.items.lock().unwrap())
    }

    /// Waits until at least `count` items were collected.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        let mut items = self.items.lock().unwrap();

        while items.len() < count {
            let now = Instant::now();

            if now >= deadline {
                return false;
            }

            items = self.cond.wait_timeout(items, deadline - now).unwrap().0;
        }

        true
    }
}

impl<S: Socket> Dispatch<S> for RecordingDispatch<S> {
    fn submit(&self, item: WorkItem<S>) -> Result<(), Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::QueueFull);
        }

        self.items.lock().unwrap().push(item);
        self.cond.notify_all();

        Ok(())
    }
}
