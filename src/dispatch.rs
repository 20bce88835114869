/*
 * Copyright (C) 2020-2023 Fanout, Inc.
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

use crate::error::Error;
use crate::event::Socket;
use crate::herder::WorkItem;
use log::{debug, error};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Where herders send ready connections.
///
/// Implementations must not block. A herder calls `submit` from its poll
/// loop, and an error only costs the one event.
pub trait Dispatch<S: Socket>: Send + Sync {
    fn submit(&self, item: WorkItem<S>) -> Result<(), Error>;
}

/// Bounded queue between the herders and a [`Processor`].
pub struct DispatchQueue<S: Socket> {
    sender: Mutex<Option<mpsc::SyncSender<WorkItem<S>>>>,
}

impl<S: Socket> DispatchQueue<S> {
    pub fn new(size: usize) -> (Self, mpsc::Receiver<WorkItem<S>>) {
        let (s, r) = mpsc::sync_channel(size);

        let queue = Self {
            sender: Mutex::new(Some(s)),
        };

        (queue, r)
    }

    /// Refuses any further submissions.
    pub fn close(&self) {
        self.sender.lock().unwrap().take();
    }
}

impl<S: Socket> Dispatch<S> for DispatchQueue<S> {
    fn submit(&self, item: WorkItem<S>) -> Result<(), Error> {
        let sender = self.sender.lock().unwrap();

        let sender = match &*sender {
            Some(sender) => sender,
            None => return Err(Error::QueueClosed),
        };

        match sender.try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::TrySendError::Full(_)) => Err(Error::QueueFull),
            Err(mpsc::TrySendError::Disconnected(_)) => Err(Error::QueueClosed),
        }
    }
}

pub type Handler<S> = dyn Fn(WorkItem<S>) + Send + Sync;

struct Worker {
    id: usize,
    thread: Option<thread::JoinHandle<()>>,
}

/// A fixed set of threads taking work items off a queue and running a
/// handler on each. Stops and joins its threads when dropped. Items still
/// queued at that point are discarded.
pub struct Processor {
    workers: Vec<Worker>,
    stop: Arc<AtomicBool>,
}

impl Processor {
    pub fn new<S: Socket>(
        receiver: mpsc::Receiver<WorkItem<S>>,
        workers: usize,
        handler: Arc<Handler<S>>,
    ) -> Result<Self, Error> {
        let receiver = Arc::new(Mutex::new(receiver));

        let mut p = Self {
            workers: Vec::with_capacity(workers),
            stop: Arc::new(AtomicBool::new(false)),
        };

        for id in 0..workers {
            let receiver = Arc::clone(&receiver);
            let handler = Arc::clone(&handler);
            let stop = Arc::clone(&p.stop);

            // on error, the workers started so far are stopped by drop
            let thread = thread::Builder::new()
                .name(format!("dispatch-{}", id))
                .spawn(move || Self::run(id, &receiver, &*handler, &stop))
                .map_err(Error::Spawn)?;

            p.workers.push(Worker {
                id,
                thread: Some(thread),
            });
        }

        Ok(p)
    }

    fn run<S: Socket>(
        id: usize,
        receiver: &Mutex<mpsc::Receiver<WorkItem<S>>>,
        handler: &Handler<S>,
        stop: &AtomicBool,
    ) {
        debug!("dispatch worker {}: starting", id);

        while !stop.load(Ordering::Acquire) {
            let item = {
                let receiver = receiver.lock().unwrap();

                receiver.recv_timeout(WORKER_POLL_INTERVAL)
            };

            match item {
                Ok(item) => handler(item),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        debug!("dispatch worker {}: stopped", id);
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);

        for w in self.workers.iter_mut() {
            if let Some(thread) = w.thread.take() {
                if thread.join().is_err() {
                    error!("dispatch worker {}: panicked", w.id);
                }
            }
        }
    }
}
