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
use crate::event::{EventMask, Socket, SocketKey, WaitQueue};
use log::{debug, error};
use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io::{self, Read, Write};
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

const EVENTS_MAX: usize = 1024;

const WAKER_TOKEN: Token = Token(0);

pub fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener, io::Error> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        None,
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(TcpListener::from_std(socket.into()))
}

fn poll_fd(fd: i32) -> EventMask {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN | libc::POLLOUT,
        revents: 0,
    };

    // SAFETY: pfd is a valid pollfd, and a zero timeout never blocks
    let ret = unsafe { libc::poll(&mut pfd, 1, 0) };

    if ret < 0 {
        return EventMask::ERROR;
    }

    EventMask::from_bits(pfd.revents as u16 as u32)
}

// sockets dropped by their owners, waiting for the watcher to forget them
struct Reaper {
    released: Mutex<Vec<Token>>,
    waker: Waker,
}

struct SocketInner {
    stream: TcpStream,
    peer: SocketAddr,
    wait: Arc<WaitQueue>,
}

/// An accepted TCP connection.
///
/// Readiness changes reported by the OS are forwarded to the socket's wait
/// queue by the [`Watcher`] that accepted it.
pub struct TcpSocket {
    inner: Arc<SocketInner>,
    token: Token,
    reaper: Arc<Reaper>,
}

impl TcpSocket {
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, io::Error> {
        (&self.inner.stream).read(buf)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize, io::Error> {
        (&self.inner.stream).write(buf)
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.reaper.released.lock().unwrap().push(self.token);

        // the watcher may already be gone
        let _ = self.reaper.waker.wake();
    }
}

impl Socket for TcpSocket {
    fn key(&self) -> SocketKey {
        self.inner.peer.into()
    }

    fn poll(&self) -> EventMask {
        poll_fd(self.inner.stream.as_raw_fd())
    }

    fn wait_queue(&self) -> &Arc<WaitQueue> {
        &self.inner.wait
    }
}

pub type AdmitFn = dyn Fn(TcpSocket) + Send;

/// Accepts connections and drives socket readiness.
///
/// Runs a thread that accepts on the given listeners and hands each new
/// socket to a callback. For as long as a socket is alive, the thread fires
/// its wait queue whenever the OS reports activity on it.
pub struct Watcher {
    thread: Option<thread::JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    reaper: Arc<Reaper>,
    local_addrs: Vec<SocketAddr>,
}

impl Watcher {
    pub fn new(listeners: Vec<TcpListener>, admit: Box<AdmitFn>) -> Result<Self, Error> {
        let mut local_addrs = Vec::with_capacity(listeners.len());

        for l in listeners.iter() {
            local_addrs.push(l.local_addr()?);
        }

        let poll = Poll::new()?;

        let reaper = Arc::new(Reaper {
            released: Mutex::new(Vec::new()),
            waker: Waker::new(poll.registry(), WAKER_TOKEN)?,
        });

        let stop = Arc::new(AtomicBool::new(false));

        let (s, r) = mpsc::channel();

        let thread = thread::Builder::new()
            .name("watcher".to_string())
            .spawn({
                let reaper = Arc::clone(&reaper);
                let stop = Arc::clone(&stop);

                move || {
                    let ret = Self::run(poll, listeners, admit, &reaper, &stop, s);

                    if let Err(e) = ret {
                        error!("watcher: {}", e);
                    }
                }
            })
            .map_err(Error::Spawn)?;

        // wait for listeners to be registered
        match r.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();

                return Err(e.into());
            }
            Err(_) => {
                let _ = thread.join();

                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "watcher thread exited",
                )));
            }
        }

        Ok(Self {
            thread: Some(thread),
            stop,
            reaper,
            local_addrs,
        })
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    fn run(
        mut poll: Poll,
        mut listeners: Vec<TcpListener>,
        admit: Box<AdmitFn>,
        reaper: &Arc<Reaper>,
        stop: &AtomicBool,
        ready: mpsc::Sender<Result<(), io::Error>>,
    ) -> Result<(), io::Error> {
        // listeners take the tokens right after the waker
        let base = listeners.len() + 1;

        for (i, l) in listeners.iter_mut().enumerate() {
            if let Err(e) = poll.registry().register(l, Token(i + 1), Interest::READABLE) {
                let _ = ready.send(Err(e));

                return Ok(());
            }
        }

        let _ = ready.send(Ok(()));

        let mut events = Events::with_capacity(EVENTS_MAX);
        let mut sockets: Slab<Arc<SocketInner>> = Slab::new();

        loop {
            if let Err(e) = poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }

                return Err(e);
            }

            if stop.load(Ordering::Acquire) {
                break;
            }

            for event in events.iter() {
                let token = event.token();

                if token == WAKER_TOKEN {
                    continue;
                }

                if token.0 < base {
                    let l = &listeners[token.0 - 1];

                    Self::accept(&poll, l, base, &mut sockets, &*admit, reaper);

                    continue;
                }

                if let Some(s) = sockets.get(token.0 - base) {
                    let s = Arc::clone(s);

                    s.wait.wake(poll_fd(s.stream.as_raw_fd()));
                }
            }

            let released = mem::take(&mut *reaper.released.lock().unwrap());

            for token in released {
                let key = token.0 - base;

                if let Some(s) = sockets.try_remove(key) {
                    let fd = s.stream.as_raw_fd();

                    if let Err(e) = poll.registry().deregister(&mut SourceFd(&fd)) {
                        debug!("watcher: deregister {}: {}", s.peer, e);
                    }
                }
            }
        }

        debug!("watcher: stopped, {} sockets still open", sockets.len());

        Ok(())
    }

    fn accept(
        poll: &Poll,
        listener: &TcpListener,
        base: usize,
        sockets: &mut Slab<Arc<SocketInner>>,
        admit: &AdmitFn,
        reaper: &Arc<Reaper>,
    ) {
        loop {
            let (stream, peer) = match listener.accept() {
                Ok(ret) => ret,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("watcher: accept error: {}", e);
                    break;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                error!("watcher: set nodelay failed: {}", e);
            }

            let entry = sockets.vacant_entry();
            let token = Token(base + entry.key());

            let fd = stream.as_raw_fd();

            if let Err(e) = poll
                .registry()
                .register(&mut SourceFd(&fd), token, Interest::READABLE)
            {
                error!("watcher: register {} failed: {}", peer, e);
                continue;
            }

            let inner = Arc::new(SocketInner {
                stream,
                peer,
                wait: Arc::new(WaitQueue::new()),
            });

            entry.insert(Arc::clone(&inner));

            debug!("watcher: accepted {}", peer);

            admit(TcpSocket {
                inner,
                token,
                reaper: Arc::clone(reaper),
            });
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);

        if let Err(e) = self.reaper.waker.wake() {
            error!("watcher: wake failed: {}", e);
        }

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("watcher: thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::{ItemArena, Multiplexer};
    use std::io::ErrorKind;
    use std::net::TcpStream as StdTcpStream;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn watcher() -> (Watcher, mpsc::Receiver<TcpSocket>) {
        let (s, r) = mpsc::channel();
        let s = Mutex::new(s);

        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();

        let w = Watcher::new(
            vec![listener],
            Box::new(move |sock: TcpSocket| {
                s.lock().unwrap().send(sock).unwrap();
            }),
        )
        .unwrap();

        (w, r)
    }

    #[test]
    fn accept_and_signal() {
        let (w, r) = watcher();
        let addr = w.local_addrs()[0];

        let mut client = StdTcpStream::connect(addr).unwrap();

        let sock = r.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(sock.key(), SocketKey::from(client.local_addr().unwrap()));
        assert_eq!(sock.peer_addr(), client.local_addr().unwrap());
        assert!(!sock.poll().is_readable());

        let fired = Arc::new(AtomicUsize::new(0));

        sock.wait_queue().add({
            let fired = Arc::clone(&fired);

            Arc::new(move |events: EventMask| {
                if events.is_readable() {
                    fired.fetch_add(1, Ordering::SeqCst);
                }
            })
        });

        client.write_all(b"hello").unwrap();

        for _ in 0..500 {
            if fired.load(Ordering::SeqCst) > 0 {
                break;
            }

            thread::sleep(Duration::from_millis(10));
        }

        assert!(fired.load(Ordering::SeqCst) > 0);
        assert!(sock.poll().is_readable());

        let mut buf = [0; 16];
        let size = sock.read(&mut buf).unwrap();
        assert_eq!(&buf[..size], b"hello");

        match sock.read(&mut buf) {
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            ret => panic!("unexpected read result: {:?}", ret),
        }

        // dropping our end closes the connection
        drop(sock);

        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(client.read(&mut buf).unwrap(), 0);

        drop(w);
    }

    #[test]
    fn multiplexed() {
        let (w, r) = watcher();
        let addr = w.local_addrs()[0];

        let items = Arc::new(ItemArena::new("item", 4));
        let mux = Multiplexer::new(&items);

        let mut client = StdTcpStream::connect(addr).unwrap();
        let sock = r.recv_timeout(Duration::from_secs(5)).unwrap();

        mux.insert(&sock, EventMask::READABLE, Token(1)).unwrap();
        assert!(mux.wait(Some(Duration::from_millis(0))).is_empty());

        client.write_all(b"x").unwrap();

        let ready = mux.wait(Some(Duration::from_secs(5)));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].key(), sock.key());
        assert!(ready[0].events().is_readable());
        drop(ready);

        // the new interest applies from the next signal on
        mux.set_interest(&sock, EventMask::WRITABLE).unwrap();

        let mut buf = [0; 4];
        assert_eq!(sock.read(&mut buf).unwrap(), 1);

        drop(client);

        let ready = mux.wait(Some(Duration::from_secs(5)));
        assert_eq!(ready.len(), 1);
        assert!(ready[0].events().is_writable());
        assert!(!ready[0].events().is_readable());
        drop(ready);

        mux.remove(&sock).unwrap();
        drop(sock);
        assert!(items.is_empty());

        drop(w);
    }
}
