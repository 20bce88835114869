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

use crate::connection::{ConnectionArena, ConnectionRef};
use crate::dispatch::Dispatch;
use crate::error::Error;
use crate::event::Socket;
use crate::herder::{Herder, HerderThread};
use crate::poll::ItemArena;
use log::{error, info};
use std::mem;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Object pools shared by every herder of a registry. Each herder keeps its
/// own reference, so the pools are freed along with their last user.
pub struct Context<S: Socket> {
    items: Arc<ItemArena>,
    conns: Arc<ConnectionArena<S>>,
}

impl<S: Socket> Context<S> {
    pub fn new(max_connections: usize) -> Self {
        Self {
            items: Arc::new(ItemArena::new("readiness item", max_connections)),
            conns: Arc::new(ConnectionArena::new("connection", max_connections)),
        }
    }

    pub fn items(&self) -> &Arc<ItemArena> {
        &self.items
    }

    pub fn connections(&self) -> &Arc<ConnectionArena<S>> {
        &self.conns
    }
}

/// Lists the processing units this process is allowed to run on.
#[cfg(target_os = "linux")]
pub fn online_units() -> Vec<usize> {
    // SAFETY: cpu_set_t is plain data and the size passed matches it
    let units: Vec<usize> = unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();

        if libc::sched_getaffinity(0, mem::size_of::<libc::cpu_set_t>(), &mut set) == 0 {
            (0..libc::CPU_SETSIZE as usize)
                .filter(|u| libc::CPU_ISSET(*u, &set))
                .collect()
        } else {
            Vec::new()
        }
    };

    if units.is_empty() {
        return (0..num_cpus::get()).collect();
    }

    units
}

#[cfg(not(target_os = "linux"))]
pub fn online_units() -> Vec<usize> {
    (0..num_cpus::get()).collect()
}

fn stop_all<S: Socket>(threads: Vec<HerderThread<S>>) -> Result<(), Error> {
    for t in threads.iter() {
        t.request_stop();
    }

    let mut failed = Vec::new();

    for mut t in threads {
        let id = t.herder().id();

        if t.join().is_err() {
            failed.push(id);
        }

        // destroy even if the loop went down abnormally
        t.herder().destroy();
    }

    if !failed.is_empty() {
        return Err(Error::AbnormalShutdown(failed));
    }

    Ok(())
}

/// The set of herders, one per processing unit.
pub struct Registry<S: Socket> {
    herders: RwLock<Vec<HerderThread<S>>>,
}

impl<S: Socket> Registry<S> {
    /// Creates and starts one herder per unit. If any of them can't be
    /// created, the ones created so far are torn down.
    pub fn initialize(
        ctx: &Context<S>,
        units: &[usize],
        dispatch: Arc<dyn Dispatch<S>>,
        poll_interval: Duration,
    ) -> Result<Self, Error> {
        if units.is_empty() {
            return Err(Error::NoHerders);
        }

        let mut threads = Vec::with_capacity(units.len());

        for (id, unit) in units.iter().enumerate() {
            let ret = Herder::new(
                id,
                *unit,
                &ctx.items,
                &ctx.conns,
                Arc::clone(&dispatch),
                poll_interval,
            )
            .and_then(HerderThread::spawn);

            match ret {
                Ok(t) => threads.push(t),
                Err(e) => {
                    error!("failed to create herder on unit {}: {}", unit, e);

                    if let Err(e) = stop_all(threads) {
                        error!("{}", e);
                    }

                    return Err(e);
                }
            }
        }

        info!("started {} herders", threads.len());

        Ok(Self {
            herders: RwLock::new(threads),
        })
    }

    pub fn len(&self) -> usize {
        self.herders.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn herder(&self, id: usize) -> Option<Arc<Herder<S>>> {
        let herders = self.herders.read().unwrap();

        herders
            .iter()
            .map(|t| t.herder())
            .find(|h| h.id() == id)
            .map(Arc::clone)
    }

    /// Observed pool size of each herder, in order.
    pub fn pool_sizes(&self) -> Vec<usize> {
        let herders = self.herders.read().unwrap();

        herders.iter().map(|t| t.herder().pool_size()).collect()
    }

    /// Hands `socket` to the herder with the fewest connections. Ties go
    /// to the earliest herder.
    pub fn admit(&self, socket: S) -> Result<ConnectionRef<S>, Error> {
        let herders = self.herders.read().unwrap();

        let mut best: Option<(&Arc<Herder<S>>, usize)> = None;

        for t in herders.iter() {
            let size = t.herder().pool_size();

            match best {
                Some((_, min)) if size >= min => {}
                _ => best = Some((t.herder(), size)),
            }
        }

        match best {
            Some((herder, _)) => herder.admit(socket),
            None => Err(Error::NoHerders),
        }
    }

    /// Stops every poll loop, then destroys every herder along with its
    /// connections. Herders whose loop didn't exit cleanly are reported,
    /// after the rest of the teardown is done.
    pub fn shutdown(&self) -> Result<(), Error> {
        let threads = mem::take(&mut *self.herders.write().unwrap());

        if threads.is_empty() {
            return Ok(());
        }

        let count = threads.len();

        stop_all(threads)?;

        info!("stopped {} herders", count);

        Ok(())
    }
}

impl<S: Socket> Drop for Registry<S> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("{}", e);
        }
    }
}
