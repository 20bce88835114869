/*
 * Copyright (C) 2021 Fanout, Inc.
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

use slab::Slab;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::{Arc, Mutex};

/// Set of socket conditions, using the `poll(2)` bit values.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EventMask(u32);

impl EventMask {
    pub const NONE: Self = Self(0);
    pub const READABLE: Self = Self(libc::POLLIN as u32);
    pub const WRITABLE: Self = Self(libc::POLLOUT as u32);
    pub const ERROR: Self = Self(libc::POLLERR as u32);
    pub const HANGUP: Self = Self(libc::POLLHUP as u32);

    const ALL: Self = Self(Self::READABLE.0 | Self::WRITABLE.0 | Self::ERROR.0 | Self::HANGUP.0);

    /// Conditions that are always of interest, whatever a caller asks for.
    pub const ALWAYS: Self = Self(Self::ERROR.0 | Self::HANGUP.0);

    /// Builds a mask from raw `poll(2)` revents. Unknown bits are dropped.
    pub fn from_bits(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_readable(self) -> bool {
        self.intersects(Self::READABLE)
    }

    pub fn is_writable(self) -> bool {
        self.intersects(Self::WRITABLE)
    }

    pub fn is_error(self) -> bool {
        self.intersects(Self::ERROR)
    }

    pub fn is_hangup(self) -> bool {
        self.intersects(Self::HANGUP)
    }
}

impl BitOr for EventMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EventMask {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const NAMES: [(EventMask, &str); 4] = [
            (EventMask::READABLE, "READABLE"),
            (EventMask::WRITABLE, "WRITABLE"),
            (EventMask::ERROR, "ERROR"),
            (EventMask::HANGUP, "HANGUP"),
        ];

        if self.is_empty() {
            return write!(f, "NONE");
        }

        let mut first = true;

        for (mask, name) in NAMES.iter() {
            if self.contains(*mask) {
                if !first {
                    write!(f, " | ")?;
                }

                write!(f, "{}", name)?;
                first = false;
            }
        }

        Ok(())
    }
}

/// Identity of a connected socket: its destination address and port.
///
/// Ordered by address first, then port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketKey {
    addr: IpAddr,
    port: u16,
}

impl SocketKey {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl From<SocketAddr> for SocketKey {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for SocketKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&SocketAddr::new(self.addr, self.port), f)
    }
}

pub type WakeFn = dyn Fn(EventMask) + Send + Sync;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HookId(usize);

/// Callbacks to run whenever a socket sees activity.
///
/// Hooks are invoked outside of the queue's lock, so a hook may still be
/// running on another thread after [`WaitQueue::remove`] returns. Anything a
/// hook captures stays alive until that invocation finishes.
#[derive(Default)]
pub struct WaitQueue {
    hooks: Mutex<Slab<Arc<WakeFn>>>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, hook: Arc<WakeFn>) -> HookId {
        let mut hooks = self.hooks.lock().unwrap();

        HookId(hooks.insert(hook))
    }

    pub fn remove(&self, id: HookId) -> bool {
        let mut hooks = self.hooks.lock().unwrap();

        hooks.try_remove(id.0).is_some()
    }

    pub fn len(&self) -> usize {
        self.hooks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every installed hook with the socket's current events.
    pub fn wake(&self, events: EventMask) {
        let hooks: Vec<Arc<WakeFn>> = {
            let hooks = self.hooks.lock().unwrap();

            hooks.iter().map(|(_, h)| Arc::clone(h)).collect()
        };

        for hook in hooks {
            hook(events);
        }
    }
}

/// A connected socket, as seen by the multiplexer.
pub trait Socket: Send + Sync + 'static {
    fn key(&self) -> SocketKey;

    /// Returns the conditions currently present on the socket, without
    /// blocking.
    fn poll(&self) -> EventMask;

    /// Where readiness hooks get attached. The socket is expected to call
    /// [`WaitQueue::wake`] whenever its state changes. Registrations keep a
    /// weak reference to the queue, to detach from it later.
    fn wait_queue(&self) -> &Arc<WaitQueue>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn mask_ops() {
        let m = EventMask::READABLE | EventMask::HANGUP;

        assert!(m.is_readable());
        assert!(m.is_hangup());
        assert!(!m.is_writable());
        assert!(!m.is_error());
        assert!(m.contains(EventMask::READABLE));
        assert!(!m.contains(EventMask::READABLE | EventMask::WRITABLE));
        assert_eq!(m & EventMask::WRITABLE, EventMask::NONE);
        assert_eq!(format!("{:?}", m), "READABLE | HANGUP");
        assert_eq!(format!("{:?}", EventMask::NONE), "NONE");

        // unknown bits are dropped
        let raw = EventMask::WRITABLE.bits() | 0x8000;
        assert_eq!(EventMask::from_bits(raw), EventMask::WRITABLE);
    }

    #[test]
    fn key_order() {
        let a: SocketKey = "10.0.0.1:80".parse::<SocketAddr>().unwrap().into();
        let b: SocketKey = "10.0.0.1:81".parse::<SocketAddr>().unwrap().into();
        let c: SocketKey = "10.0.0.2:1".parse::<SocketAddr>().unwrap().into();

        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, SocketKey::new("10.0.0.1".parse().unwrap(), 80));
        assert_eq!(a.to_string(), "10.0.0.1:80");
    }

    #[test]
    fn wait_queue_hooks() {
        let wq = WaitQueue::new();
        let count = Arc::new(AtomicUsize::new(0));

        let id = {
            let count = Arc::clone(&count);

            wq.add(Arc::new(move |events: EventMask| {
                if events.is_readable() {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            }))
        };

        assert_eq!(wq.len(), 1);

        wq.wake(EventMask::READABLE);
        wq.wake(EventMask::WRITABLE);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(wq.remove(id));
        assert!(!wq.remove(id));
        assert!(wq.is_empty());

        wq.wake(EventMask::READABLE);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
