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
    time::Instant,
    path::PathBuf,
};
use crate::util::gen_random_alphanum_string;

// This file gathers all nskeeper hard-coded settings

// We compute the paths at runtime. It improves readability compared to using
// macros at compile time.
lazy_static! {
    /// Runtime directory. Cleared on reboot, which matches the lifetime of a
    /// preserved mount namespace: a bind mount of a namespace file cannot
    /// survive a reboot anyway.
    pub static ref RUN_DIR: PathBuf = PathBuf::from("/run/nskeeper");

    /// The shared namespace-group directory. Holds one `<group>.lock` and one
    /// `<group>.mnt` file per group. Must be a private mount point once
    /// initialized, see `nsdir::initialize()`.
    pub static ref NS_DIR: PathBuf = RUN_DIR.join("ns");
}

/// Suffix of the per-group lock files inside `NS_DIR`.
pub const GROUP_LOCK_SUFFIX: &str = ".lock";

/// Suffix of the preserved-namespace files inside `NS_DIR`. A plain file
/// means "nothing captured"; a file bind-mounted onto a live namespace
/// means "joinable".
pub const NS_FILE_SUFFIX: &str = ".mnt";

/// Environment variable enabling verbose step-by-step logging on stderr.
/// Unset or "0" selects info, "trace" selects trace, anything else debug.
pub const DEBUG_ENV_VAR: &str = "NSKEEPER_DEBUG";

/// Exit code we return when encountering a fatal error.
pub const EXIT_CODE_FAILURE: u8 = 1;

lazy_static! {
    /// The invocation ID is a random 6 digit alphanum string, used to
    /// correlate log lines of concurrent launches in debug output.
    pub static ref INVOCATION_ID: String = gen_random_alphanum_string(6);

    pub static ref START_TIME: Instant = Instant::now();
}
