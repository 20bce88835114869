/*
 * Copyright (C) 2020-2022 Fanout, Inc.
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

use crate::connection::{ConnectionRef, Holder};
use crate::dispatch::{DispatchQueue, Processor};
use crate::error::Error;
use crate::event::Socket;
use crate::herder::WorkItem;
use crate::net::{bind_listener, TcpSocket, Watcher};
use crate::registry::{Context, Registry};
use log::{debug, error, info, warn};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::iterator::Signals;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

const READ_SIZE: usize = 4096;

pub struct Config {
    pub listen: Vec<SocketAddr>,
    pub backlog: i32,
    pub max_connections: usize,
    pub units: Vec<usize>,
    pub poll_interval: Duration,
    pub queue_size: usize,
    pub workers: usize,
    pub request_max: usize,
}

// returns true if the connection is finished
fn read_request(conn: &ConnectionRef<TcpSocket>, request_max: usize) -> bool {
    let mut buf = [0; READ_SIZE];

    loop {
        let size = match conn.with_socket(|s| s.read(&mut buf)) {
            Some(Ok(0)) => {
                debug!("{}: peer closed", conn.key());
                return true;
            }
            Some(Ok(size)) => size,
            Some(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Some(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Some(Err(e)) => {
                debug!("{}: read error: {}", conn.key(), e);
                return true;
            }
            // already torn down
            None => return false,
        };

        let total = conn.with_request(|req| {
            let req = req.get_or_insert_with(Vec::new);
            req.extend_from_slice(&buf[..size]);

            req.len()
        });

        if total > request_max {
            warn!("{}: request exceeds {} bytes", conn.key(), request_max);
            return true;
        }
    }
}

/// Default processing: buffer whatever the client sends, and tear the
/// connection down once it goes away or sends too much.
pub fn process(item: WorkItem<TcpSocket>, request_max: usize) {
    let (conn, events, herder) = item.into_parts();

    let done = if events.is_error() || events.is_hangup() {
        debug!("{}: {:?}", conn.key(), events);

        true
    } else if events.is_readable() {
        read_request(&conn, request_max)
    } else {
        false
    };

    if !done {
        return;
    }

    // nothing hands this connection off, so both holds end here
    for holder in [Holder::Handoff, Holder::Frontend].iter() {
        if let Err(e) = herder.release(&conn, *holder) {
            debug!("{}", e);
        }
    }
}

pub struct App {
    watcher: Option<Watcher>,
    registry: Arc<Registry<TcpSocket>>,
    _processor: Processor,
}

impl App {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let ctx = Context::new(config.max_connections);

        let (queue, receiver) = DispatchQueue::<TcpSocket>::new(config.queue_size);

        let request_max = config.request_max;

        let processor = Processor::new(
            receiver,
            config.workers,
            Arc::new(move |item: WorkItem<TcpSocket>| process(item, request_max)),
        )?;

        let registry = Arc::new(Registry::initialize(
            &ctx,
            &config.units,
            Arc::new(queue),
            config.poll_interval,
        )?);

        let mut listeners = Vec::with_capacity(config.listen.len());

        for addr in config.listen.iter() {
            listeners.push(bind_listener(*addr, config.backlog)?);

            info!("listening on {}", addr);
        }

        let watcher = Watcher::new(
            listeners,
            Box::new({
                let registry = Arc::clone(&registry);

                move |sock: TcpSocket| {
                    let peer = sock.key();

                    if let Err(e) = registry.admit(sock) {
                        warn!("failed to admit {}: {}", peer, e);
                    }
                }
            }),
        )?;

        Ok(Self {
            watcher: Some(watcher),
            registry,
            _processor: processor,
        })
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        match &self.watcher {
            Some(w) => w.local_addrs(),
            None => &[],
        }
    }

    pub fn registry(&self) -> &Arc<Registry<TcpSocket>> {
        &self.registry
    }

    pub fn wait_for_term(&self) -> Result<(), io::Error> {
        let mut signals = Signals::new(TERM_SIGNALS)?;

        let term_now = Arc::new(AtomicBool::new(false));

        // ensure two term signals in a row causes the app to immediately exit
        for signal_type in TERM_SIGNALS {
            signal_hook::flag::register_conditional_shutdown(
                *signal_type,
                1, // exit code
                Arc::clone(&term_now),
            )?;

            signal_hook::flag::register(*signal_type, Arc::clone(&term_now))?;
        }

        // wait for termination
        if let Some(signal) = signals.forever().next() {
            debug!("received signal {}", signal);
        }

        Ok(())
    }
}

impl Drop for App {
    fn drop(&mut self) {
        // stop accepting, then stop the herders. processing stops last,
        //   when the remaining fields drop
        self.watcher = None;

        if let Err(e) = self.registry.shutdown() {
            error!("{}", e);
        }
    }
}
