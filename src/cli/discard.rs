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

use anyhow::Result;
use structopt::StructOpt;
use crate::{
    consts::*,
    group::NsGroup,
};

/// Discard the preserved mount namespace of a package instance.
///
/// Verbose step-by-step logging is enabled with the NSKEEPER_DEBUG
/// environment variable rather than a flag.
#[derive(StructOpt, Debug)]
#[structopt(name = "nskeeper-discard")]
pub struct Discard {
    /// Name of the namespace group to discard: the package instance name,
    /// optionally suffixed with `.<uid>` for a per-user namespace
    group_name: String,
}

impl super::CLI for Discard {
    fn run(self) -> Result<()> {
        let Self { group_name } = self;

        if !NS_DIR.exists() {
            // Nothing was ever preserved on this boot
            debug!("The group directory {} does not exist, nothing to discard",
                   NS_DIR.display());
            return Ok(());
        }

        let group = NsGroup::open(&group_name)?;
        let lock_guard = group.lock()?;
        lock_guard.discard()
    }
}
