//  Copyright 2024 The NsKeeper Authors.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::{
    io::prelude::*,
    io::stderr,
    env,
};
use log::{Record, Metadata};
pub use log::LevelFilter;
use chrono::prelude::*;
use crate::consts::*;


pub struct Logger {
    cmd_name: &'static str,
}

impl log::Log for Logger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let msg = format!("[nskeeper.{}] ({:.3}s) {}\n",
            self.cmd_name, START_TIME.elapsed().as_secs_f64(), record.args());

        // When writing our log output fails, we dismiss the error.
        // stderr is all we have to report with.
        let _ = stderr().write_all(msg.as_bytes());
    }

    fn flush(&self) {
        let _ = stderr().flush();
    }
}

/// Maps the debug environment variable to a log level.
pub fn level_from_env() -> LevelFilter {
    match env::var(DEBUG_ENV_VAR) {
        Err(_) => LevelFilter::Info,
        Ok(ref v) if v.is_empty() || v == "0" => LevelFilter::Info,
        Ok(ref v) if v == "trace" => LevelFilter::Trace,
        Ok(_) => LevelFilter::Debug,
    }
}

pub fn init(level: LevelFilter, cmd_name: &'static str) {
    let logger = Logger { cmd_name };

    // An error is returned when the logger has already been initialized.
    // Initializing the logger twice would be a logic error, so it's safe to unwrap().
    log::set_boxed_logger(Box::new(logger)).unwrap();
    log::set_max_level(level);

    if level >= LevelFilter::Debug {
        let host = hostname::get().map_or_else(
            |err| format!("<{}>", err),
            |h| h.to_string_lossy().to_string());

        debug!("Time is {}", Utc::now().to_rfc2822());
        debug!("Host is {}", host);
        debug!("Invocation ID is {}", &*INVOCATION_ID);
    }
}
