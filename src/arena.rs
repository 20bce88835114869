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

//! Fixed-capacity shared object pools.
//!
//! An [`Arena`] plays the role of a slab cache: it hands out objects from a
//! preallocated region and refuses to grow past its capacity. Objects are
//! reached through counted [`Handle`]s. The object is dropped and its slot
//! returned to the arena when the last handle goes away.

use slab::Slab;
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct Entry<T> {
    value: T,
    refs: AtomicUsize,
}

// a thread-safe slab with fixed capacity. the slab lock is only taken to
//   insert or remove an entry. entries are otherwise reached through handles
//   that point directly at them
pub struct Arena<T> {
    name: &'static str,
    entries: Mutex<Slab<Entry<T>>>,
}

impl<T> Arena<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            entries: Mutex::new(Slab::with_capacity(capacity)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        let entries = self.entries.lock().unwrap();

        entries.capacity()
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap();

        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, value: T) -> Result<(usize, NonNull<Entry<T>>), T> {
        let mut entries = self.entries.lock().unwrap();

        // out of capacity. by preventing inserts beyond the capacity, we
        //   ensure the underlying memory won't get moved due to a realloc
        if entries.len() == entries.capacity() {
            return Err(value);
        }

        let key = entries.insert(Entry {
            value,
            refs: AtomicUsize::new(1),
        });

        let entry = NonNull::from(&entries[key]);

        Ok((key, entry))
    }

    fn remove(&self, key: usize) {
        let entry = {
            let mut entries = self.entries.lock().unwrap();

            entries.remove(key)
        };

        // drop the value outside of the lock, in case dropping it ends up
        //   touching the arena again
        drop(entry);
    }
}

/// A counted reference to an object living in an [`Arena`].
pub struct Handle<T> {
    arena: Arc<Arena<T>>,
    key: usize,
    entry: NonNull<Entry<T>>,
}

// SAFETY: a handle only gives out shared references to the value, and the
//   refcount is atomic, so handles may move between threads as long as the
//   value itself can be shared between threads
unsafe impl<T: Send + Sync> Send for Handle<T> {}
unsafe impl<T: Send + Sync> Sync for Handle<T> {}

impl<T> Handle<T> {
    /// Moves `value` into the arena. If the arena is full, the value is
    /// handed back.
    pub fn new(value: T, arena: &Arc<Arena<T>>) -> Result<Self, T> {
        let (key, entry) = arena.insert(value)?;

        Ok(Self {
            arena: Arc::clone(arena),
            key,
            entry,
        })
    }

    fn entry(&self) -> &Entry<T> {
        // SAFETY: slab element addresses are stable once created since the
        //   slab never grows past its initial capacity, and the entry is
        //   only removed when the last handle drops. this handle keeps the
        //   entry alive, so the pointer is valid for as long as self is
        unsafe { self.entry.as_ref() }
    }

    pub fn get(&self) -> &T {
        &self.entry().value
    }

    /// Current number of handles to the object.
    pub fn refs(&self) -> usize {
        self.entry().refs.load(Ordering::Acquire)
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.entry == b.entry
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        // a new reference can only be made from an existing one, so relaxed
        //   is enough here, same as std::sync::Arc
        self.entry().refs.fetch_add(1, Ordering::Relaxed);

        Self {
            arena: Arc::clone(&self.arena),
            key: self.key,
            entry: self.entry,
        }
    }
}

impl<T> Drop for Handle<T> {
    fn drop(&mut self) {
        if self.entry().refs.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }

        // synchronize with all prior releases before tearing down the value
        atomic::fence(Ordering::Acquire);

        self.arena.remove(self.key);
    }
}

impl<T> Deref for Handle<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.get()
    }
}

impl<T: fmt::Debug> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Handle")
            .field("key", &self.key)
            .field("refs", &self.refs())
            .field("value", self.get())
            .finish()
    }
}
