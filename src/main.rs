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

pub mod logger;
pub mod util;
pub mod cli;
pub mod consts;
pub mod lock;
pub mod signal;
pub mod mountinfo;
pub mod nsdir;
pub mod group;
mod capture;

#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

use anyhow::Result;
use structopt::StructOpt;

use crate::{
    consts::*,
    cli::CLI,
    signal::trap_sigterm_and_friends,
};

fn main() {
    fn do_main() -> Result<()> {
        // START_TIME is used for logging purposes
        lazy_static::initialize(&START_TIME);

        logger::init(logger::level_from_env(), "discard");

        // Trapping signals lets a blocked lock acquisition fail cleanly
        // instead of dying mid-sequence
        trap_sigterm_and_friends()?;

        let opts = cli::Discard::from_args();
        opts.run()
    }

    if let Err(e) = do_main() {
        log::error!("{:#}", e);
        std::process::exit(EXIT_CODE_FAILURE as i32);
    }
}
