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

//! Initialization of the shared namespace-group directory.
//!
//! Preserved namespace files are bind mounts placed inside this directory.
//! If the directory sat on a shared mount, those bind mounts would
//! propagate to peer mount namespaces. The directory must therefore be a
//! private mount point before any group operation touches it.

use anyhow::{Result, Context};
use std::{
    os::unix::io::FromRawFd,
    path::Path,
    fs,
};
use nix::{
    fcntl::{open, OFlag},
    mount::{mount, MsFlags},
    sys::stat::Mode,
};
use crate::{
    consts::*,
    lock::file_lock,
    mountinfo,
    util::create_dir_all,
};

/// Ensures the namespace-group directory exists and is a private mount
/// point. Idempotent and safe under concurrent callers; runs once per boot
/// in practice. Any failure is fatal to the caller: per-group operations
/// are not safe without this precondition.
pub fn initialize() -> Result<()> {
    initialize_at(&NS_DIR)
}

pub(crate) fn initialize_at(dir: &Path) -> Result<()> {
    create_dir_all(dir)?;

    // Holding the directory descriptor across the sequence pins the object
    // we checked and guarantees it is a directory.
    let fd = open(dir, OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC, Mode::empty())
        .with_context(|| format!("Failed to open {}", dir.display()))?;
    let _dir_file = unsafe { fs::File::from_raw_fd(fd) };

    // Initialization has its own lock so that it never contends with
    // per-group locks once the directory is set up.
    let _lock_guard = file_lock(&dir.join(".lock"), true)?;

    if mountinfo::is_private_mount_point(dir)? {
        trace!("Group directory {} is already a private mount point", dir.display());
        return Ok(());
    }

    debug!("Making the group directory {} a private mount point", dir.display());

    // A fresh bind mount inherits the propagation of its parent, so the
    // remount below is what actually severs the peer group.
    mount(Some(dir), dir, None as Option<&str>, MsFlags::MS_BIND, None as Option<&str>)
        .with_context(|| format!("Failed to bind mount {} onto itself", dir.display()))?;

    mount(None as Option<&str>, dir, None as Option<&str>,
          MsFlags::MS_REC | MsFlags::MS_PRIVATE, None as Option<&str>)
        .with_context(|| format!("Failed to remount {} as private", dir.display()))?;

    Ok(())
}
