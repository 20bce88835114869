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

//! Socket readiness multiplexer.
//!
//! A [`Multiplexer`] tracks interest in a set of sockets and reports which of
//! them are ready. Registration installs a hook on the socket's
//! [`WaitQueue`](crate::event::WaitQueue). When the socket signals activity,
//! the hook matches the socket's events against the registered interest and
//! links the registration into a FIFO ready list, which [`Multiplexer::wait`]
//! drains.
//!
//! Readiness is retained until drained: any number of signals before a drain
//! produce a single entry, carrying the union of the matched events.
//!
//! Lock order is index, then item state, then the ready list. The item arena
//! lock is a leaf.

use crate::arena::{Arena, Handle};
use crate::error::Error;
use crate::event::{EventMask, HookId, Socket, SocketKey, WaitQueue, WakeFn};
use log::{trace, warn};
use mio::Token;
use slab::Slab;
use std::collections::BTreeMap;
use std::mem;
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

pub type ItemArena = Arena<ReadinessItem>;

type ItemHandle = Handle<ReadinessItem>;

struct ItemState {
    interest: EventMask,

    // matched events not yet handed out by a drain
    pending: EventMask,

    registered: bool,

    // installed hook, and the queue it was installed on
    hook: Option<(HookId, Weak<WaitQueue>)>,
}

/// Registration record tying one socket to one multiplexer.
pub struct ReadinessItem {
    key: SocketKey,
    token: Token,
    state: Mutex<ItemState>,
}

impl ReadinessItem {
    pub fn key(&self) -> SocketKey {
        self.key
    }

    pub fn token(&self) -> Token {
        self.token
    }
}

struct Node {
    prev: Option<usize>,
    next: Option<usize>,
    queued: bool,
    item: ItemHandle,
}

impl Node {
    fn new(item: ItemHandle) -> Self {
        Self {
            prev: None,
            next: None,
            queued: false,
            item,
        }
    }
}

// FIFO of node keys, threaded through the nodes themselves
#[derive(Default)]
struct ReadyList {
    head: Option<usize>,
    tail: Option<usize>,
}

impl ReadyList {
    fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    fn push_back(&mut self, nodes: &mut Slab<Node>, key: usize) {
        let prev = self.tail;

        {
            let n = &mut nodes[key];
            n.prev = prev;
            n.next = None;
        }

        match prev {
            Some(pkey) => nodes[pkey].next = Some(key),
            None => self.head = Some(key),
        }

        self.tail = Some(key);
    }

    fn remove(&mut self, nodes: &mut Slab<Node>, key: usize) {
        let (prev, next) = {
            let n = &mut nodes[key];

            (n.prev.take(), n.next.take())
        };

        match prev {
            Some(pkey) => nodes[pkey].next = next,
            None if self.head == Some(key) => self.head = next,
            None => {}
        }

        match next {
            Some(nkey) => nodes[nkey].prev = prev,
            None if self.tail == Some(key) => self.tail = prev,
            None => {}
        }
    }

    fn pop_front(&mut self, nodes: &mut Slab<Node>) -> Option<usize> {
        let key = self.head?;

        self.remove(nodes, key);

        Some(key)
    }
}

struct Sources {
    nodes: Slab<Node>,
    ready: ReadyList,
    interrupted: bool,
}

struct Shared {
    index: RwLock<BTreeMap<SocketKey, usize>>,
    sources: Mutex<Sources>,
    cond: Condvar,
}

impl Shared {
    // must be called with the item's state locked. returns true if the item
    //   was newly linked into the ready list
    fn check(&self, nkey: usize, item: &ItemHandle, state: &mut ItemState, events: EventMask) -> bool {
        if !state.registered {
            return false;
        }

        let matched = state.interest & events;

        if matched.is_empty() {
            return false;
        }

        state.pending |= matched;

        {
            let sources = &mut *self.sources.lock().unwrap();

            match sources.nodes.get_mut(nkey) {
                Some(node) if Handle::ptr_eq(&node.item, item) => {
                    if node.queued {
                        // already linked. the new events ride along
                        return false;
                    }

                    node.queued = true;
                }
                _ => return false,
            }

            sources.ready.push_back(&mut sources.nodes, nkey);
        }

        trace!("socket {} ready: {:?}", item.key, matched);

        self.cond.notify_one();

        true
    }

    fn wakeup(&self, nkey: usize, item: &ItemHandle, events: EventMask) {
        let mut state = item.state.lock().unwrap();

        self.check(nkey, item, &mut state, events);
    }

    fn lookup(&self, index: &BTreeMap<SocketKey, usize>, key: SocketKey) -> Result<(usize, ItemHandle), Error> {
        let nkey = match index.get(&key) {
            Some(nkey) => *nkey,
            None => return Err(Error::NotFound(key)),
        };

        let sources = self.sources.lock().unwrap();

        Ok((nkey, sources.nodes[nkey].item.clone()))
    }
}

/// A socket that was found ready by [`Multiplexer::wait`].
///
/// Holds a reference to the registration, released on drop.
pub struct ReadyItem {
    item: ItemHandle,
    events: EventMask,
}

impl ReadyItem {
    pub fn key(&self) -> SocketKey {
        self.item.key
    }

    pub fn token(&self) -> Token {
        self.item.token
    }

    pub fn events(&self) -> EventMask {
        self.events
    }

    /// References currently held on the underlying registration.
    pub fn refs(&self) -> usize {
        self.item.refs()
    }
}

pub struct Multiplexer {
    items: Arc<ItemArena>,
    shared: Arc<Shared>,
}

impl Multiplexer {
    /// Creates an empty multiplexer. Registrations are allocated from
    /// `items`, which may be shared with other multiplexers.
    pub fn new(items: &Arc<ItemArena>) -> Self {
        Self {
            items: Arc::clone(items),
            shared: Arc::new(Shared {
                index: RwLock::new(BTreeMap::new()),
                sources: Mutex::new(Sources {
                    nodes: Slab::new(),
                    ready: ReadyList::default(),
                    interrupted: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Registers `socket` with the given interest. Error and hangup
    /// conditions are always watched for. `token` is reported back with
    /// each readiness event.
    ///
    /// If the socket is already ready, it is immediately placed on the ready
    /// list.
    pub fn insert<S: Socket>(&self, socket: &S, interest: EventMask, token: Token) -> Result<(), Error> {
        let key = socket.key();

        let item = ReadinessItem {
            key,
            token,
            state: Mutex::new(ItemState {
                interest: interest | EventMask::ALWAYS,
                pending: EventMask::NONE,
                registered: true,
                hook: None,
            }),
        };

        let item = match Handle::new(item, &self.items) {
            Ok(item) => item,
            Err(_) => return Err(Error::Alloc(self.items.name())),
        };

        let nkey = {
            let mut index = self.shared.index.write().unwrap();

            if index.contains_key(&key) {
                // item is released on return
                return Err(Error::Duplicate(key));
            }

            let nkey = {
                let mut sources = self.shared.sources.lock().unwrap();

                sources.nodes.insert(Node::new(item.clone()))
            };

            index.insert(key, nkey);

            nkey
        };

        let mut state = item.state.lock().unwrap();

        if !state.registered {
            // removed by someone else in the meantime
            return Ok(());
        }

        let hook: Arc<WakeFn> = {
            let shared = Arc::downgrade(&self.shared);
            let item = item.clone();

            Arc::new(move |events: EventMask| {
                if let Some(shared) = shared.upgrade() {
                    // hold our own reference for the duration of the call
                    let item = item.clone();

                    shared.wakeup(nkey, &item, events);
                }
            })
        };

        let wait = socket.wait_queue();

        state.hook = Some((wait.add(hook), Arc::downgrade(wait)));

        // the socket may have become ready before the hook was installed
        self.shared.check(nkey, &item, &mut state, socket.poll());

        Ok(())
    }

    /// Unregisters the socket with the same key as `socket`. The readiness
    /// hook is detached from the queue it was installed on. Calling this for
    /// a socket that isn't registered returns `Error::NotFound` and has no
    /// other effect.
    pub fn remove<S: Socket>(&self, socket: &S) -> Result<(), Error> {
        let key = socket.key();

        let hook = {
            let mut index = self.shared.index.write().unwrap();

            let nkey = match index.remove(&key) {
                Some(nkey) => nkey,
                None => return Err(Error::NotFound(key)),
            };

            let item = self.shared.sources.lock().unwrap().nodes[nkey].item.clone();

            let mut state = item.state.lock().unwrap();

            // any hook still in flight will see this and back off
            state.registered = false;
            state.pending = EventMask::NONE;

            let node = {
                let sources = &mut *self.shared.sources.lock().unwrap();

                if sources.nodes[nkey].queued {
                    sources.ready.remove(&mut sources.nodes, nkey);
                }

                sources.nodes.remove(nkey)
            };

            drop(node);

            state.hook.take()
        };

        // a queue that is gone took the hook with it
        if let Some((id, wait)) = hook {
            if let Some(wait) = wait.upgrade() {
                wait.remove(id);
            }
        }

        Ok(())
    }

    /// Replaces the interest of a registered socket. Error and hangup
    /// conditions stay watched. Readiness is not re-evaluated.
    pub fn set_interest<S: Socket>(&self, socket: &S, interest: EventMask) -> Result<(), Error> {
        let index = self.shared.index.read().unwrap();

        let (_, item) = self.shared.lookup(&index, socket.key())?;

        item.state.lock().unwrap().interest = interest | EventMask::ALWAYS;

        Ok(())
    }

    /// Evaluates the socket's current events against its interest, exactly
    /// as the readiness hook would. Returns true if the socket was newly
    /// placed on the ready list.
    pub fn recheck<S: Socket>(&self, socket: &S) -> Result<bool, Error> {
        let index = self.shared.index.read().unwrap();

        let (nkey, item) = self.shared.lookup(&index, socket.key())?;

        let mut state = item.state.lock().unwrap();

        Ok(self.shared.check(nkey, &item, &mut state, socket.poll()))
    }

    /// Blocks until at least one socket is ready, the timeout elapses, or
    /// [`interrupt`](Self::interrupt) is called. Returns every ready socket,
    /// in the order they became ready.
    pub fn wait(&self, timeout: Option<Duration>) -> Vec<ReadyItem> {
        let mut out = Vec::new();

        self.wait_into(&mut out, timeout);

        out
    }

    /// Like [`wait`](Self::wait), but appends to `out`. Returns the number
    /// of items appended.
    pub fn wait_into(&self, out: &mut Vec<ReadyItem>, timeout: Option<Duration>) -> usize {
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut batch = Vec::new();

        {
            let mut sources = self.shared.sources.lock().unwrap();

            loop {
                if sources.interrupted {
                    sources.interrupted = false;
                    break;
                }

                if !sources.ready.is_empty() {
                    break;
                }

                match deadline {
                    Some(deadline) => {
                        let now = Instant::now();

                        if now >= deadline {
                            break;
                        }

                        sources = self
                            .shared
                            .cond
                            .wait_timeout(sources, deadline - now)
                            .unwrap()
                            .0;
                    }
                    None => sources = self.shared.cond.wait(sources).unwrap(),
                }
            }

            // detach the entire list
            let sources = &mut *sources;

            while let Some(nkey) = sources.ready.pop_front(&mut sources.nodes) {
                let node = &mut sources.nodes[nkey];
                node.queued = false;

                batch.push(node.item.clone());
            }
        }

        let start = out.len();

        for item in batch {
            let events = {
                let mut state = item.state.lock().unwrap();

                if !state.registered {
                    continue;
                }

                mem::take(&mut state.pending)
            };

            // a hook may have relinked the item between the detach and the
            //   state lock above, and we just consumed its events. it will
            //   come up empty on the next drain
            if events.is_empty() {
                continue;
            }

            out.push(ReadyItem { item, events });
        }

        out.len() - start
    }

    /// Wakes a caller blocked in [`wait`](Self::wait), even if nothing is
    /// ready. If nobody is waiting, the next call to `wait` returns
    /// immediately.
    pub fn interrupt(&self) {
        self.shared.sources.lock().unwrap().interrupted = true;

        self.shared.cond.notify_all();
    }

    pub fn contains(&self, key: SocketKey) -> bool {
        self.shared.index.read().unwrap().contains_key(&key)
    }

    /// Number of registered sockets.
    pub fn len(&self) -> usize {
        self.shared.index.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of sockets currently on the ready list.
    pub fn ready_len(&self) -> usize {
        let sources = self.shared.sources.lock().unwrap();

        sources.nodes.iter().filter(|(_, n)| n.queued).count()
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        let registered = self.len();

        if registered > 0 {
            warn!("multiplexer dropped with {} sockets registered", registered);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestSocket;
    use std::thread;

    fn setup(capacity: usize) -> (Arc<ItemArena>, Multiplexer) {
        let items = Arc::new(ItemArena::new("item", capacity));
        let mux = Multiplexer::new(&items);

        (items, mux)
    }

    fn no_wait() -> Option<Duration> {
        Some(Duration::from_millis(0))
    }

    #[test]
    fn insert_signal_wait() {
        let (items, mux) = setup(4);

        let (sock, state) = TestSocket::new(1000);

        mux.insert(&sock, EventMask::READABLE, Token(7)).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(state.hooks(), 1);
        assert!(mux.contains(sock.key()));

        assert!(mux.wait(no_wait()).is_empty());

        state.set_events(EventMask::READABLE);
        assert_eq!(mux.ready_len(), 1);

        let ready = mux.wait(no_wait());
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].key(), sock.key());
        assert_eq!(ready[0].token(), Token(7));
        assert_eq!(ready[0].events(), EventMask::READABLE);

        assert_eq!(mux.ready_len(), 0);
        assert!(mux.wait(no_wait()).is_empty());

        mux.remove(&sock).unwrap();
    }

    #[test]
    fn initially_ready() {
        let (_items, mux) = setup(4);

        let (sock, state) = TestSocket::new(1000);
        state.set_events_quiet(EventMask::READABLE | EventMask::WRITABLE);

        mux.insert(&sock, EventMask::READABLE, Token(1)).unwrap();

        // no signal needed
        let ready = mux.wait(no_wait());
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].events(), EventMask::READABLE);

        mux.remove(&sock).unwrap();
    }

    #[test]
    fn duplicate() {
        let (items, mux) = setup(4);

        let (a, _a_state) = TestSocket::new(1000);
        let (b, b_state) = TestSocket::new(1000);

        mux.insert(&a, EventMask::READABLE, Token(1)).unwrap();

        match mux.insert(&b, EventMask::READABLE, Token(2)) {
            Err(Error::Duplicate(key)) => assert_eq!(key, b.key()),
            _ => panic!("expected duplicate"),
        }

        // partially built item was freed, and no hook left behind
        assert_eq!(items.len(), 1);
        assert_eq!(b_state.hooks(), 0);
        assert_eq!(mux.len(), 1);

        mux.remove(&a).unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn alloc_failure() {
        let (items, mux) = setup(1);

        let (a, _a_state) = TestSocket::new(1000);
        let (b, b_state) = TestSocket::new(1001);

        mux.insert(&a, EventMask::READABLE, Token(1)).unwrap();

        assert!(matches!(
            mux.insert(&b, EventMask::READABLE, Token(2)),
            Err(Error::Alloc("item"))
        ));
        assert!(!mux.contains(b.key()));
        assert_eq!(b_state.hooks(), 0);

        mux.remove(&a).unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn remove_idempotent() {
        let (items, mux) = setup(4);

        let (a, a_state) = TestSocket::new(1000);
        let (b, _b_state) = TestSocket::new(1001);
        let (never, _never_state) = TestSocket::new(1002);

        mux.insert(&a, EventMask::READABLE, Token(1)).unwrap();
        mux.insert(&b, EventMask::READABLE, Token(2)).unwrap();

        mux.remove(&a).unwrap();
        assert_eq!(a_state.hooks(), 0);
        assert!(matches!(mux.remove(&a), Err(Error::NotFound(_))));
        assert!(matches!(mux.remove(&never), Err(Error::NotFound(_))));
        assert!(matches!(mux.remove(&never), Err(Error::NotFound(_))));

        // the other registration is untouched
        assert_eq!(mux.len(), 1);
        assert!(mux.contains(b.key()));
        assert_eq!(items.len(), 1);

        // a signal on a removed socket goes nowhere
        a_state.set_events(EventMask::READABLE);
        assert!(mux.wait(no_wait()).is_empty());

        mux.remove(&b).unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn remove_detaches_installed_hook() {
        let (items, mux) = setup(4);

        // two handles with the same identity, each with its own queue
        let (a, a_state) = TestSocket::new(1000);
        let (b, b_state) = TestSocket::new(1000);

        b.wait_queue().add(Arc::new(|_: EventMask| {}));

        mux.insert(&a, EventMask::READABLE, Token(1)).unwrap();
        assert_eq!(a_state.hooks(), 1);

        mux.remove(&b).unwrap();

        // the hook came off the queue it was installed on
        assert_eq!(a_state.hooks(), 0);
        assert_eq!(b_state.hooks(), 1);
        assert!(items.is_empty());

        a_state.set_events_quiet(EventMask::READABLE);
        a_state.signal();
        assert!(mux.wait(no_wait()).is_empty());
    }

    #[test]
    fn remove_after_queue_dropped() {
        let (items, mux) = setup(4);

        let (a, a_state) = TestSocket::new(1000);

        mux.insert(&a, EventMask::READABLE, Token(1)).unwrap();

        // a stand-in whose queue never saw the hook
        let (b, _b_state) = TestSocket::new(1000);
        drop(a);
        drop(a_state);

        mux.remove(&b).unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn coalesce() {
        let (_items, mux) = setup(4);

        let (sock, state) = TestSocket::new(1000);

        mux.insert(&sock, EventMask::READABLE | EventMask::WRITABLE, Token(1))
            .unwrap();

        state.set_events(EventMask::READABLE);
        state.set_events(EventMask::READABLE);
        state.set_events(EventMask::WRITABLE);
        assert_eq!(mux.ready_len(), 1);

        let ready = mux.wait(no_wait());
        assert_eq!(ready.len(), 1);
        assert_eq!(
            ready[0].events(),
            EventMask::READABLE | EventMask::WRITABLE
        );

        assert!(mux.wait(no_wait()).is_empty());

        mux.remove(&sock).unwrap();
    }

    #[test]
    fn error_hangup_always_watched() {
        let (_items, mux) = setup(4);

        let (sock, state) = TestSocket::new(1000);

        mux.insert(&sock, EventMask::READABLE, Token(1)).unwrap();

        // not of interest
        state.set_events(EventMask::WRITABLE);
        assert!(mux.wait(no_wait()).is_empty());

        state.set_events(EventMask::HANGUP | EventMask::WRITABLE);

        let ready = mux.wait(no_wait());
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].events(), EventMask::HANGUP);

        mux.set_interest(&sock, EventMask::WRITABLE).unwrap();
        state.set_events(EventMask::ERROR);

        let ready = mux.wait(no_wait());
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].events(), EventMask::ERROR);

        mux.remove(&sock).unwrap();
    }

    #[test]
    fn set_interest_and_recheck() {
        let (_items, mux) = setup(4);

        let (sock, state) = TestSocket::new(1000);

        mux.insert(&sock, EventMask::READABLE, Token(1)).unwrap();

        state.set_events(EventMask::WRITABLE);
        assert!(mux.wait(no_wait()).is_empty());

        // changing interest alone doesn't re-evaluate
        mux.set_interest(&sock, EventMask::WRITABLE).unwrap();
        assert!(mux.wait(no_wait()).is_empty());

        assert_eq!(mux.recheck(&sock).unwrap(), true);
        assert_eq!(mux.recheck(&sock).unwrap(), false);

        let ready = mux.wait(no_wait());
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].events(), EventMask::WRITABLE);

        let (other, _other_state) = TestSocket::new(2000);
        assert!(matches!(
            mux.set_interest(&other, EventMask::READABLE),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(mux.recheck(&other), Err(Error::NotFound(_))));

        mux.remove(&sock).unwrap();
    }

    #[test]
    fn remove_while_ready() {
        let (items, mux) = setup(4);

        let (sock, state) = TestSocket::new(1000);

        mux.insert(&sock, EventMask::READABLE, Token(1)).unwrap();
        state.set_events(EventMask::READABLE);
        assert_eq!(mux.ready_len(), 1);

        mux.remove(&sock).unwrap();
        assert_eq!(mux.ready_len(), 0);
        assert!(mux.wait(no_wait()).is_empty());
        assert!(items.is_empty());
    }

    #[test]
    fn fifo_order() {
        let (_items, mux) = setup(8);

        let mut socks = Vec::new();

        for i in 0..3 {
            let (sock, state) = TestSocket::new(1000 + i as u16);
            mux.insert(&sock, EventMask::READABLE, Token(i)).unwrap();
            socks.push((sock, state));
        }

        socks[2].1.set_events(EventMask::READABLE);
        socks[0].1.set_events(EventMask::READABLE);
        socks[1].1.set_events(EventMask::READABLE);

        // a repeat signal keeps the original position
        socks[2].1.set_events(EventMask::READABLE);

        let ready = mux.wait(no_wait());
        let tokens: Vec<Token> = ready.iter().map(|r| r.token()).collect();
        assert_eq!(tokens, vec![Token(2), Token(0), Token(1)]);

        for (sock, _) in socks.iter() {
            mux.remove(sock).unwrap();
        }
    }

    #[test]
    fn ready_item_refs() {
        let (items, mux) = setup(4);

        let (sock, state) = TestSocket::new(1000);

        mux.insert(&sock, EventMask::READABLE, Token(1)).unwrap();
        state.set_events(EventMask::READABLE);

        let mut ready = mux.wait(no_wait());
        assert_eq!(ready.len(), 1);

        // index node, hook, and the drained item
        assert_eq!(ready[0].refs(), 3);

        mux.remove(&sock).unwrap();

        // storage outlives the registration while the drained item is held
        assert_eq!(ready[0].refs(), 1);
        assert_eq!(items.len(), 1);

        ready.clear();
        assert!(items.is_empty());
    }

    #[test]
    fn wait_timeout() {
        let (_items, mux) = setup(4);

        let start = Instant::now();
        let ready = mux.wait(Some(Duration::from_millis(20)));

        assert!(ready.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn wait_blocking() {
        let (_items, mux) = setup(4);
        let mux = Arc::new(mux);

        let (sock, state) = TestSocket::new(1000);

        mux.insert(&sock, EventMask::READABLE, Token(1)).unwrap();

        let waiter = {
            let mux = Arc::clone(&mux);

            thread::spawn(move || {
                let mut out = Vec::new();

                while out.is_empty() {
                    mux.wait_into(&mut out, None);
                }

                out.into_iter().map(|r| r.token()).collect::<Vec<Token>>()
            })
        };

        thread::sleep(Duration::from_millis(10));
        state.set_events(EventMask::READABLE);

        assert_eq!(waiter.join().unwrap(), vec![Token(1)]);

        mux.remove(&sock).unwrap();
    }

    #[test]
    fn interrupt() {
        let (_items, mux) = setup(4);
        let mux = Arc::new(mux);

        let waiter = {
            let mux = Arc::clone(&mux);

            thread::spawn(move || mux.wait(None).len())
        };

        thread::sleep(Duration::from_millis(10));
        mux.interrupt();

        assert_eq!(waiter.join().unwrap(), 0);

        // one-shot: consumed by the wait above
        assert!(mux.wait(no_wait()).is_empty());

        // sticks until the next wait if nobody is waiting
        mux.interrupt();
        assert!(mux.wait(None).is_empty());
    }

    #[test]
    fn concurrent_churn() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 200;

        // drains on one thread may briefly hold another thread's items
        let items = Arc::new(ItemArena::new("item", THREADS * (THREADS + 1)));
        let mux = Arc::new(Multiplexer::new(&items));

        let mut threads = Vec::new();

        for t in 0..THREADS {
            let mux = Arc::clone(&mux);

            threads.push(thread::spawn(move || {
                for round in 0..ROUNDS {
                    let (sock, state) = TestSocket::new(t as u16);

                    mux.insert(&sock, EventMask::READABLE, Token(t)).unwrap();

                    // signal from another thread while we drain and remove
                    let signaler = {
                        let state = Arc::clone(&state);

                        thread::spawn(move || {
                            for _ in 0..10 {
                                state.set_events(EventMask::READABLE);
                            }
                        })
                    };

                    if round % 2 == 0 {
                        drop(mux.wait(Some(Duration::from_millis(0))));
                    }

                    mux.remove(&sock).unwrap();
                    signaler.join().unwrap();

                    assert_eq!(state.hooks(), 0);
                }
            }));
        }

        for t in threads {
            t.join().unwrap();
        }

        // whatever is left on the ready list belongs to nobody
        drop(mux.wait(Some(Duration::from_millis(0))));

        assert!(mux.is_empty());
        assert!(items.is_empty());
    }
}
