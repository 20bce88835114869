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

//! Per-unit connection pools.
//!
//! A [`Herder`] owns the connections admitted to one processing unit, along
//! with the multiplexer watching them. Its poll loop runs on a dedicated
//! thread pinned to the unit, and turns readiness into [`WorkItem`]s for the
//! dispatch layer.

use crate::arena::Handle;
use crate::connection::{Connection, ConnectionArena, ConnectionRef, Holder};
use crate::dispatch::Dispatch;
use crate::error::Error;
use crate::event::{EventMask, Socket};
use crate::poll::{ItemArena, Multiplexer, ReadyItem};
use log::{debug, error, info, trace, warn};
use mio::Token;
use slab::Slab;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, RwLock};
use std::thread;
use std::time::Duration;

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[cfg(target_os = "linux")]
pub const UNITS_MAX: usize = libc::CPU_SETSIZE as usize;

#[cfg(not(target_os = "linux"))]
pub const UNITS_MAX: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Polling,
    Dispatching,
    Stopping,
    Terminated,
}

impl RunState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Polling,
            1 => Self::Dispatching,
            2 => Self::Stopping,
            _ => Self::Terminated,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Polling => 0,
            Self::Dispatching => 1,
            Self::Stopping => 2,
            Self::Terminated => 3,
        }
    }
}

/// A ready connection, on its way to the processing layer.
pub struct WorkItem<S: Socket> {
    conn: ConnectionRef<S>,
    events: EventMask,
    herder: Arc<Herder<S>>,
}

impl<S: Socket> WorkItem<S> {
    pub fn new(conn: ConnectionRef<S>, events: EventMask, herder: Arc<Herder<S>>) -> Self {
        Self {
            conn,
            events,
            herder,
        }
    }

    pub fn conn(&self) -> &ConnectionRef<S> {
        &self.conn
    }

    pub fn events(&self) -> EventMask {
        self.events
    }

    pub fn herder(&self) -> &Arc<Herder<S>> {
        &self.herder
    }

    pub fn into_parts(self) -> (ConnectionRef<S>, EventMask, Arc<Herder<S>>) {
        (self.conn, self.events, self.herder)
    }
}

#[cfg(target_os = "linux")]
fn pin_to_unit(unit: usize) -> Result<(), io::Error> {
    // SAFETY: cpu_set_t is plain data, all zeros is an empty set, and unit
    //   was checked against UNITS_MAX at creation
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(unit, &mut set);

        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn pin_to_unit(_unit: usize) -> Result<(), io::Error> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "thread affinity not supported",
    ))
}

pub struct Herder<S: Socket> {
    id: usize,
    unit: usize,
    pool: RwLock<Slab<ConnectionRef<S>>>,
    pool_size: AtomicUsize,
    mux: Multiplexer,
    conns: Arc<ConnectionArena<S>>,
    dispatch: Arc<dyn Dispatch<S>>,
    poll_interval: Duration,
    stop: AtomicBool,
    state: AtomicU8,
}

impl<S: Socket> Herder<S> {
    pub fn new(
        id: usize,
        unit: usize,
        items: &Arc<ItemArena>,
        conns: &Arc<ConnectionArena<S>>,
        dispatch: Arc<dyn Dispatch<S>>,
        poll_interval: Duration,
    ) -> Result<Arc<Self>, Error> {
        if unit >= UNITS_MAX {
            return Err(Error::InvalidUnit(unit));
        }

        Ok(Arc::new(Self {
            id,
            unit,
            pool: RwLock::new(Slab::new()),
            pool_size: AtomicUsize::new(0),
            mux: Multiplexer::new(items),
            conns: Arc::clone(conns),
            dispatch,
            poll_interval,
            stop: AtomicBool::new(false),
            state: AtomicU8::new(RunState::Polling.as_u8()),
        }))
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn unit(&self) -> usize {
        self.unit
    }

    /// Approximate number of pooled connections. Doesn't take any locks.
    pub fn pool_size(&self) -> usize {
        self.pool_size.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    pub fn contains(&self, conn: &ConnectionRef<S>) -> bool {
        let pool = self.pool.read().unwrap();

        match pool.get(conn.token().0) {
            Some(c) => Handle::ptr_eq(c, conn),
            None => false,
        }
    }

    fn set_state(&self, state: RunState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Asks the poll loop to exit and wakes it up.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.mux.interrupt();
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Takes ownership of `socket`, adding it to the pool and watching it
    /// for readability.
    ///
    /// On failure the socket is dropped and the pool is left as it was.
    pub fn admit(&self, socket: S) -> Result<ConnectionRef<S>, Error> {
        let key = socket.key();

        let mut pool = self.pool.write().unwrap();

        let entry = pool.vacant_entry();
        let token = Token(entry.key());

        let conn = match ConnectionRef::new(Connection::new(socket, self.id, token), &self.conns)
        {
            Ok(conn) => conn,
            Err(_) => return Err(Error::Alloc(self.conns.name())),
        };

        // pool first, then multiplexer
        entry.insert(conn.clone());
        self.pool_size.fetch_add(1, Ordering::Relaxed);

        let ret = conn
            .with_socket(|s| self.mux.insert(s, EventMask::READABLE, token))
            .unwrap_or(Err(Error::NotFound(key)));

        if let Err(e) = ret {
            pool.remove(token.0);
            self.pool_size.fetch_sub(1, Ordering::Relaxed);

            conn.mark_destroyed();
            let socket = conn.release_resources();

            drop(pool);
            drop(socket);

            return Err(e);
        }

        debug!("herder {}: admitted {}", self.id, key);

        Ok(conn)
    }

    /// Tears a connection down: stops watching it, takes it out of the
    /// pool, and releases its request buffer and socket. Fails if the
    /// connection was already torn down or belongs to another herder.
    pub fn destroy_connection(&self, conn: &ConnectionRef<S>) -> Result<(), Error> {
        self.check_owner(conn)?;

        if !conn.mark_destroyed() {
            return Err(Error::AlreadyDestroyed(conn.key()));
        }

        let (pooled, socket) = {
            let mut pool = self.pool.write().unwrap();

            // multiplexer first, then pool
            if let Some(Err(e)) = conn.with_socket(|s| self.mux.remove(s)) {
                debug!("herder {}: {}", self.id, e);
            }

            let token = conn.token().0;

            let pooled = match pool.get(token) {
                Some(c) if Handle::ptr_eq(c, conn) => {
                    self.pool_size.fetch_sub(1, Ordering::Relaxed);

                    Some(pool.remove(token))
                }
                // already drained by a herder teardown
                _ => None,
            };

            (pooled, conn.release_resources())
        };

        drop(socket);
        drop(pooled);

        debug!("herder {}: destroyed {}", self.id, conn.key());

        Ok(())
    }

    /// Drops `holder`'s hold on `conn`, tearing the connection down if no
    /// other holds remain. Returns true if the connection is gone. A
    /// connection belonging to another herder is left untouched.
    pub fn release(&self, conn: &ConnectionRef<S>, holder: Holder) -> Result<bool, Error> {
        self.check_owner(conn)?;

        if !conn.release(holder)? {
            return Ok(false);
        }

        match self.destroy_connection(conn) {
            Ok(()) | Err(Error::AlreadyDestroyed(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }

    fn check_owner(&self, conn: &ConnectionRef<S>) -> Result<(), Error> {
        if conn.herder() != self.id {
            return Err(Error::WrongHerder {
                expected: conn.herder(),
                actual: self.id,
            });
        }

        Ok(())
    }

    /// Waits for readiness once and dispatches whatever was found. Returns
    /// the number of work items submitted.
    pub fn poll_once(self: &Arc<Self>, timeout: Option<Duration>) -> usize {
        let mut ready = Vec::new();

        self.mux.wait_into(&mut ready, timeout);

        self.dispatch_ready(&mut ready)
    }

    fn dispatch_ready(self: &Arc<Self>, ready: &mut Vec<ReadyItem>) -> usize {
        let mut submitted = 0;

        for item in ready.drain(..) {
            let conn = {
                let pool = self.pool.read().unwrap();

                match pool.get(item.token().0) {
                    Some(c) if c.key() == item.key() => c.clone(),
                    _ => {
                        trace!("herder {}: stale readiness for {}", self.id, item.key());
                        continue;
                    }
                }
            };

            let events = conn.take_events(item.events());

            drop(item);

            trace!("herder {}: dispatching {} {:?}", self.id, conn.key(), events);

            let key = conn.key();

            match self
                .dispatch
                .submit(WorkItem::new(conn, events, Arc::clone(self)))
            {
                Ok(()) => submitted += 1,
                Err(e) => warn!("herder {}: dropping {:?} for {}: {}", self.id, events, key, e),
            }
        }

        submitted
    }

    fn run(self: &Arc<Self>) {
        debug!("herder {}: polling on unit {}", self.id, self.unit);

        let mut ready = Vec::new();

        while !self.stopping() {
            self.set_state(RunState::Polling);

            self.mux.wait_into(&mut ready, Some(self.poll_interval));

            if self.stopping() {
                break;
            }

            if !ready.is_empty() {
                self.set_state(RunState::Dispatching);

                self.dispatch_ready(&mut ready);
            }
        }

        self.set_state(RunState::Stopping);

        ready.clear();

        debug!("herder {}: stopped", self.id);

        self.set_state(RunState::Terminated);
    }

    /// Destroys every pooled connection. Only call this once the poll loop
    /// has stopped. Returns the number of connections destroyed.
    pub fn destroy(&self) -> usize {
        let mut sockets = Vec::new();

        {
            let mut pool = self.pool.write().unwrap();

            let tokens: Vec<usize> = pool.iter().map(|(token, _)| token).collect();

            for token in tokens {
                // someone else is already tearing this one down. it still
                //   leaves the pool here, and its owner finds it gone
                let owned = pool[token].mark_destroyed();

                if owned {
                    if let Some(Err(e)) = pool[token].with_socket(|s| self.mux.remove(s)) {
                        warn!("herder {}: {}", self.id, e);
                    }
                }

                let conn = pool.remove(token);
                self.pool_size.fetch_sub(1, Ordering::Relaxed);

                if owned {
                    sockets.push(conn.release_resources());
                }
            }
        }

        let count = sockets.len();

        drop(sockets);

        info!("herder {}: destroyed, {} connections closed", self.id, count);

        count
    }
}

/// The thread running a herder's poll loop. Stops and joins the thread when
/// dropped.
pub struct HerderThread<S: Socket> {
    herder: Arc<Herder<S>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl<S: Socket> HerderThread<S> {
    pub fn spawn(herder: Arc<Herder<S>>) -> Result<Self, Error> {
        let (s, r) = mpsc::channel();

        let thread = thread::Builder::new()
            .name(format!("herder-{}", herder.unit))
            .spawn({
                let herder = Arc::clone(&herder);

                move || {
                    if let Err(e) = pin_to_unit(herder.unit) {
                        warn!(
                            "herder {}: failed to pin to unit {}, running unpinned: {}",
                            herder.id, herder.unit, e
                        );
                    }

                    // signal ready
                    let _ = s.send(());

                    herder.run();
                }
            })
            .map_err(Error::Spawn)?;

        // if the thread died early, the join will tell
        let _ = r.recv();

        Ok(Self {
            herder,
            thread: Some(thread),
        })
    }

    pub fn herder(&self) -> &Arc<Herder<S>> {
        &self.herder
    }

    pub fn request_stop(&self) {
        self.herder.request_stop();
    }

    /// Stops the poll loop and waits for the thread to exit. Calling this
    /// again after the thread has exited does nothing.
    pub fn join(&mut self) -> Result<(), Error> {
        let thread = match self.thread.take() {
            Some(thread) => thread,
            None => return Ok(()),
        };

        self.herder.request_stop();

        if thread.join().is_err() {
            error!("herder {}: poll thread panicked", self.herder.id);

            return Err(Error::AbnormalShutdown(vec![self.herder.id]));
        }

        Ok(())
    }
}

impl<S: Socket> Drop for HerderThread<S> {
    fn drop(&mut self) {
        // logged by join
        let _ = self.join();
    }
}
