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

use clap::Parser;
use log::info;
use sockherd::config::Settings;
use sockherd::log::{init, local_offset_check};
use std::error::Error;
use std::path::PathBuf;
use std::process;

#[derive(Parser, Debug)]
#[command(
    name = "sockherd",
    version,
    about = "Accept TCP connections and herd them across per-CPU pools"
)]
struct Args {
    /// Config file to load (TOML)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on. May be repeated
    #[arg(long, value_name = "ADDR")]
    listen: Vec<String>,

    /// Processing units to run herders on, e.g. "0,2-3"
    #[arg(long, value_name = "LIST")]
    units: Option<String>,

    /// Number of dispatch workers
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn process_args_and_run(args: Args) -> Result<(), Box<dyn Error>> {
    let mut settings = Settings::new(args.config.as_deref())?;

    if !args.listen.is_empty() {
        settings.frontend.listen = args.listen;
    }

    if let Some(units) = args.units {
        settings.frontend.units = units;
    }

    if let Some(workers) = args.workers {
        settings.dispatch.workers = workers;
    }

    if let Some(level) = args.log_level {
        settings.log.level = level;
    }

    init(settings.log_level()?)?;

    local_offset_check();

    if let Some(path) = &args.config {
        info!("using config: {}", path.display());
    }

    let config = settings.app_config()?;

    info!(
        "herding on units {:?} with {} dispatch workers",
        config.units, config.workers
    );

    sockherd::run(&config)
}

fn main() {
    let args = Args::parse();

    if let Err(e) = process_args_and_run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
