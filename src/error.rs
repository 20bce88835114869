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

use crate::connection::Holder;
use crate::event::SocketKey;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} pool exhausted")]
    Alloc(&'static str),

    #[error("socket {0} already registered")]
    Duplicate(SocketKey),

    #[error("socket {0} not registered")]
    NotFound(SocketKey),

    #[error("connection {0} already destroyed")]
    AlreadyDestroyed(SocketKey),

    #[error("connection {0}: {1:?} hold already released")]
    AlreadyReleased(SocketKey, Holder),

    #[error("connection belongs to herder {expected}, not herder {actual}")]
    WrongHerder { expected: usize, actual: usize },

    #[error("no herders available")]
    NoHerders,

    #[error("dispatch queue full")]
    QueueFull,

    #[error("dispatch queue closed")]
    QueueClosed,

    #[error("invalid processing unit {0}")]
    InvalidUnit(usize),

    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("abnormal shutdown of herders {0:?}")]
    AbnormalShutdown(Vec<usize>),

    #[error(transparent)]
    Io(#[from] io::Error),
}
