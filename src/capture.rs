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

//! The capture-helper side of the join-or-create protocol.
//!
//! The helper observes `/proc/<parent>/ns/mnt` from outside the namespace
//! being captured. It performs exactly one bind-mount attempt once
//! signalled, and exits. See `group::create_or_join()` for the parent side.

use anyhow::{Result, Context};
use nix::{
    mount::{mount, MsFlags},
    sys::signal::Signal,
    unistd::{fchdir, getppid, Pid},
};
use std::os::unix::io::AsRawFd;
use caps::{CapSet, Capability, CapsHashSet};
use crate::{
    group::NsGroup,
    util::{self, EventFd},
};

/// Entered by the forked child of `create_or_join()`. Never returns.
/// Exit code 0 signals a successful capture (or a parent that died before
/// we could serve it); anything else is a capture failure that
/// `CapturePending::preserve()` reports to the launch.
pub(crate) fn helper_main(group: &NsGroup, event_fd: &EventFd, parent: Pid) -> ! {
    let code = match run(group, event_fd, parent) {
        Ok(()) => 0,
        Err(e) => {
            error!("{:#}", e.context(format!(
                "Failed to capture the mount namespace of group {}", group.name())));
            1
        }
    };
    // _exit(2): the exit handlers and stdio buffers belong to the parent
    unsafe { libc::_exit(code) }
}

fn run(group: &NsGroup, event_fd: &EventFd, parent: Pid) -> Result<()> {
    fchdir(group.dir_file().as_raw_fd())
        .context("Failed to enter the group directory")?;

    // The helper must never outlive the parent it serves.
    util::set_parent_death_signal(Signal::SIGINT)?;

    // The parent may have died before the prctl above took effect. Its
    // namespace is gone, there is nothing left to capture.
    if getppid() != parent {
        debug!("Parent died before the capture, exiting");
        return Ok(());
    }

    reduce_capabilities()?;

    event_fd.wait().context("Failed to wait for the capture signal")?;

    let ns_path = format!("/proc/{}/ns/mnt", parent);
    mount(Some(ns_path.as_str()), group.ns_file_name().as_str(),
          None as Option<&str>, MsFlags::MS_BIND, None as Option<&str>)
        .with_context(|| format!("Failed to bind mount {} onto {}",
                                 ns_path, group.ns_file_name()))?;

    debug!("Captured the mount namespace of group {}", group.name());
    Ok(())
}

/// The only privilege the helper still needs is the final bind mount, so
/// everything but CAP_SYS_ADMIN is shed while it sits on the eventfd.
fn reduce_capabilities() -> Result<()> {
    let has_sys_admin = caps::has_cap(None, CapSet::Permitted, Capability::CAP_SYS_ADMIN)
        .map_err(|e| anyhow!("Failed to read process capabilities: {}", e))?;
    if !has_sys_admin {
        // Running unprivileged (e.g. in tests): nothing to shed, and the
        // mount attempt will report its own failure.
        return Ok(());
    }

    let mut keep = CapsHashSet::new();
    keep.insert(Capability::CAP_SYS_ADMIN);

    caps::set(None, CapSet::Effective, &keep)
        .map_err(|e| anyhow!("Failed to reduce effective capabilities: {}", e))?;
    caps::set(None, CapSet::Permitted, &keep)
        .map_err(|e| anyhow!("Failed to reduce permitted capabilities: {}", e))?;
    caps::clear(None, CapSet::Inheritable)
        .map_err(|e| anyhow!("Failed to clear inheritable capabilities: {}", e))?;

    Ok(())
}
