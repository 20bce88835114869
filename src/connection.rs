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

use crate::arena::{Arena, Handle};
use crate::error::Error;
use crate::event::{EventMask, Socket, SocketKey};
use mio::Token;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;

/// A party keeping a connection alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Holder {
    /// The frontend that accepted the socket.
    Frontend,

    /// The path handing the connection off to a backend.
    Handoff,
}

impl Holder {
    fn bit(self) -> u8 {
        match self {
            Self::Frontend => 0x01,
            Self::Handoff => 0x02,
        }
    }
}

const ALL_HOLDERS: u8 = 0x03;

struct Inner<S> {
    socket: Option<S>,
    events: EventMask,
    request: Option<Vec<u8>>,
}

/// One accepted client socket, plus the state of the request in flight on
/// it.
///
/// A connection starts out held by both [`Holder`]s. It belongs to exactly
/// one herder, identified by [`herder`](Self::herder), and sits in that
/// herder's pool at slot [`token`](Self::token).
pub struct Connection<S> {
    key: SocketKey,
    token: Token,
    herder: usize,
    alive: AtomicU8,
    destroyed: AtomicBool,
    inner: Mutex<Inner<S>>,
}

pub type ConnectionRef<S> = Handle<Connection<S>>;

pub type ConnectionArena<S> = Arena<Connection<S>>;

impl<S: Socket> Connection<S> {
    pub fn new(socket: S, herder: usize, token: Token) -> Self {
        Self {
            key: socket.key(),
            token,
            herder,
            alive: AtomicU8::new(ALL_HOLDERS),
            destroyed: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                socket: Some(socket),
                events: EventMask::NONE,
                request: None,
            }),
        }
    }

    pub fn key(&self) -> SocketKey {
        self.key
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn herder(&self) -> usize {
        self.herder
    }

    /// Number of holders that haven't released yet.
    pub fn alive(&self) -> usize {
        self.alive.load(Ordering::Acquire).count_ones() as usize
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Drops `holder`'s hold on the connection. Returns true if this was
    /// the last hold, in which case the caller is responsible for tearing
    /// the connection down.
    pub fn release(&self, holder: Holder) -> Result<bool, Error> {
        let bit = holder.bit();

        let prev = self.alive.fetch_and(!bit, Ordering::AcqRel);

        if prev & bit == 0 {
            return Err(Error::AlreadyReleased(self.key, holder));
        }

        Ok(prev == bit)
    }

    /// Calls `f` with the socket, unless the connection has already been
    /// torn down.
    ///
    /// The connection's lock is held during the call. `f` must not call
    /// back into the connection or tear it down.
    pub fn with_socket<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&S) -> R,
    {
        let inner = self.inner.lock().unwrap();

        inner.socket.as_ref().map(f)
    }

    /// Calls `f` with the request buffer, if there is one. Same locking
    /// rules as [`with_socket`](Self::with_socket).
    pub fn with_request<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Option<Vec<u8>>) -> R,
    {
        let mut inner = self.inner.lock().unwrap();

        f(&mut inner.request)
    }

    /// Accumulates `events`, then returns everything accumulated so far
    /// and resets it.
    pub fn take_events(&self, events: EventMask) -> EventMask {
        let mut inner = self.inner.lock().unwrap();

        inner.events |= events;

        mem::take(&mut inner.events)
    }

    /// Accumulates `events` without consuming them.
    pub fn add_events(&self, events: EventMask) {
        self.inner.lock().unwrap().events |= events;
    }

    pub fn events(&self) -> EventMask {
        self.inner.lock().unwrap().events
    }

    // returns true the first time only
    pub(crate) fn mark_destroyed(&self) -> bool {
        !self.destroyed.swap(true, Ordering::AcqRel)
    }

    // clears the request and hands back the socket, so the caller can drop
    //   it outside of any locks
    pub(crate) fn release_resources(&self) -> Option<S> {
        let mut inner = self.inner.lock().unwrap();

        inner.request = None;
        inner.events = EventMask::NONE;

        inner.socket.take()
    }
}
