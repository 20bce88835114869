/*
 * Copyright (C) 2023-2026 Fastly, Inc.
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

use crate::app;
use crate::registry::online_units;
use config::builder::{ConfigBuilder, DefaultState};
use config::{Config, ConfigError, File, FileFormat};
use log::LevelFilter;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

// safety values
const WORKERS_MAX: usize = 1024;
const CONNS_MAX: usize = 10_000_000;
const QUEUE_SIZE_MAX: usize = 10_000_000;

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Frontend {
    pub listen: Vec<String>,
    pub backlog: i32,
    pub max_connections: usize,

    // comma separated ids and ranges, e.g. "0,2-3". empty means all
    pub units: String,

    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Dispatch {
    pub queue_size: usize,
    pub workers: usize,
    pub request_max: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Log {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub frontend: Frontend,
    pub dispatch: Dispatch,
    pub log: Log,
}

fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("frontend.listen", vec!["0.0.0.0:8000"])?
        .set_default("frontend.backlog", 1024)?
        .set_default("frontend.max_connections", 100_000)?
        .set_default("frontend.units", "")?
        .set_default("frontend.poll_interval_ms", 100)?
        .set_default("dispatch.queue_size", 10_000)?
        .set_default("dispatch.workers", 2)?
        .set_default("dispatch.request_max", 65_536)?
        .set_default("log.level", "info")
}

impl Settings {
    /// Loads settings from a TOML file, if given. Anything the file leaves
    /// out keeps its default.
    pub fn new(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = defaults()?;

        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }

        builder.build()?.try_deserialize()
    }

    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        defaults()?
            .add_source(File::from_str(s, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    pub fn log_level(&self) -> Result<LevelFilter, ConfigError> {
        LevelFilter::from_str(&self.log.level)
            .map_err(|_| ConfigError::Message(format!("invalid log level: {}", self.log.level)))
    }

    /// Checks the settings and resolves them into what the app needs.
    pub fn app_config(&self) -> Result<app::Config, ConfigError> {
        let mut listen = Vec::with_capacity(self.frontend.listen.len());

        for s in self.frontend.listen.iter() {
            let addr = SocketAddr::from_str(s)
                .map_err(|e| ConfigError::Message(format!("invalid listen address {}: {}", s, e)))?;

            listen.push(addr);
        }

        if listen.is_empty() {
            return Err(message("at least one listen address is required"));
        }

        if self.frontend.backlog < 1 {
            return Err(message("backlog must be at least 1"));
        }

        if self.frontend.max_connections < 1 || self.frontend.max_connections > CONNS_MAX {
            return Err(ConfigError::Message(format!(
                "max_connections must be between 1 and {}",
                CONNS_MAX
            )));
        }

        if self.frontend.poll_interval_ms < 1 {
            return Err(message("poll_interval_ms must be at least 1"));
        }

        if self.dispatch.queue_size < 1 || self.dispatch.queue_size > QUEUE_SIZE_MAX {
            return Err(ConfigError::Message(format!(
                "queue_size must be between 1 and {}",
                QUEUE_SIZE_MAX
            )));
        }

        if self.dispatch.workers < 1 || self.dispatch.workers > WORKERS_MAX {
            return Err(ConfigError::Message(format!(
                "workers must be between 1 and {}",
                WORKERS_MAX
            )));
        }

        if self.dispatch.request_max < 1 {
            return Err(message("request_max must be at least 1"));
        }

        let units = if self.frontend.units.trim().is_empty() {
            online_units()
        } else {
            parse_units(&self.frontend.units)?
        };

        Ok(app::Config {
            listen,
            backlog: self.frontend.backlog,
            max_connections: self.frontend.max_connections,
            units,
            poll_interval: Duration::from_millis(self.frontend.poll_interval_ms),
            queue_size: self.dispatch.queue_size,
            workers: self.dispatch.workers,
            request_max: self.dispatch.request_max,
        })
    }
}

fn message(s: &str) -> ConfigError {
    ConfigError::Message(s.to_string())
}

/// Parses a list of processing unit ids such as `"0,2-3"`. Duplicates are
/// dropped, order of first appearance is kept.
pub fn parse_units(s: &str) -> Result<Vec<usize>, ConfigError> {
    let invalid = || ConfigError::Message(format!("invalid unit list: {}", s));

    let mut out = Vec::new();

    for part in s.split(',') {
        let part = part.trim();

        let (start, end) = match part.find('-') {
            Some(pos) => {
                let start = part[..pos].trim().parse::<usize>().map_err(|_| invalid())?;
                let end = part[(pos + 1)..].trim().parse::<usize>().map_err(|_| invalid())?;

                (start, end)
            }
            None => {
                let u = part.parse::<usize>().map_err(|_| invalid())?;

                (u, u)
            }
        };

        if end < start {
            return Err(invalid());
        }

        for u in start..=end {
            if !out.contains(&u) {
                out.push(u);
            }
        }
    }

    Ok(out)
}
