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

use anyhow::{Result, Context};
use std::{
    os::unix::io::AsRawFd,
    path::Path,
    fs,
};
use nix::{
    Error,
    errno::Errno,
    fcntl::{flock, FlockArg}
};
use crate::signal::check_for_pending_sigterm;

#[must_use = "if unused, the lock will immediately unlock"]
/// When `FileLockGuard` is dropped, the corresponding `fs::File` is closed,
/// unlocking the file.
pub struct FileLockGuard(fs::File);

/// Takes an advisory lock on `path`, creating the file if needed. Blocks
/// until the lock is available: there is no timeout at this layer. The lock
/// is released by the kernel if the holder dies, so a crashed holder never
/// wedges future callers.
pub fn file_lock(path: &Path, exclusive: bool) -> Result<FileLockGuard> {
    let flag = if exclusive { FlockArg::LockExclusive } else { FlockArg::LockShared };

    let file = fs::File::create(path)
        .with_context(|| format!("Failed to create lock file {}", path.display()))?;

    trace!("Waiting to acquire file lock at {}", path.display());

    loop {
        check_for_pending_sigterm()?;

        match flock(file.as_raw_fd(), flag) {
            Err(Error::Sys(Errno::EINTR)) => {},
            Err(e) => return Err(e)
                .with_context(|| format!("Failed to lock {}", path.display())),
            Ok(_) => break,
        }
    }

    Ok(FileLockGuard(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_released_on_guard_drop() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("test.lock");

        let guard = file_lock(&path, true)?;

        // A second open file description must not be able to grab the lock
        let probe = fs::File::create(&path)?;
        match flock(probe.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Err(Error::Sys(Errno::EAGAIN)) => {},
            other => panic!("Expected the lock to be held: {:?}", other),
        }

        drop(guard);
        flock(probe.as_raw_fd(), FlockArg::LockExclusiveNonblock)?;
        Ok(())
    }
}
