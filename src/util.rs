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
    os::unix::io::{AsRawFd, FromRawFd},
    os::unix::ffi::OsStrExt,
    path::Path,
    ffi::CString,
    fs,
};
use nix::{
    errno::Errno,
    fcntl::{self, OFlag},
    sched::CloneFlags,
    sys::eventfd::{eventfd, EfdFlags},
    sys::signal::Signal,
    sys::stat::Mode,
    unistd::{read, write, fchdir},
};
use crate::signal::retry_on_interrupt;
use rand::{thread_rng, Rng, distributions::Alphanumeric};


pub fn gen_random_alphanum_string(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .collect()
}

pub fn create_dir_all(path: impl AsRef<Path>) -> Result<()> {
    fs::create_dir_all(path.as_ref())
        .with_context(|| format!("Failed to create directory {}", path.as_ref().display()))
}

/// Opens `path` relative to the passed directory, wrapping the new descriptor
/// in an `fs::File` so that it is closed on all exit paths.
pub fn openat(dir: &fs::File, path: impl AsRef<Path>, oflag: OFlag, mode: Mode) -> Result<fs::File> {
    let path = path.as_ref();
    let fd = fcntl::openat(dir.as_raw_fd(), path, oflag, mode)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(unsafe { fs::File::from_raw_fd(fd) })
}

/// Attaches the calling process to the namespace referred to by `file`.
/// Returns the raw nix error: `create_or_join()` needs to tell the EINVAL
/// "nothing preserved here" branch apart from real failures.
pub fn setns(file: &fs::File, nstype: CloneFlags) -> nix::Result<()> {
    // nix 0.17 doesn't wrap setns(2)
    match unsafe { libc::setns(file.as_raw_fd(), nstype.bits()) } {
        -1 => Err(nix::Error::Sys(Errno::last())),
        _ => Ok(()),
    }
}

/// `umount2(path, UMOUNT_NOFOLLOW)`. Raw nix error for the same reason as
/// `setns()`: EINVAL ("not a mount point") is a normal branch for Discard.
pub fn umount_nofollow(path: &Path) -> nix::Result<()> {
    // nix 0.17's MntFlags doesn't carry UMOUNT_NOFOLLOW
    let path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| nix::Error::Sys(Errno::EINVAL))?;
    match unsafe { libc::umount2(path.as_ptr(), libc::UMOUNT_NOFOLLOW) } {
        -1 => Err(nix::Error::Sys(Errno::last())),
        _ => Ok(()),
    }
}

/// Delivers `sig` to the calling process when its parent dies.
pub fn set_parent_death_signal(sig: Signal) -> Result<()> {
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, sig as libc::c_ulong) };
    if rc == -1 {
        return Err(nix::Error::Sys(Errno::last()))
            .context("Failed to set the parent death signal");
    }
    Ok(())
}

/// A one-shot semaphore between the launch process and its capture helper.
/// Single-threaded cooperative suspension: the helper blocks in `wait()`
/// until the launch process calls `signal()`.
pub struct EventFd(fs::File);

impl EventFd {
    pub fn new() -> Result<Self> {
        let fd = eventfd(0, EfdFlags::EFD_CLOEXEC)
            .context("Failed to create an eventfd")?;
        Ok(Self(unsafe { fs::File::from_raw_fd(fd) }))
    }

    pub fn signal(&self) -> Result<()> {
        let buf = 1u64.to_ne_bytes();
        let written = retry_on_interrupt(|| write(self.0.as_raw_fd(), &buf))
            .context("Failed to write to the eventfd")?;
        ensure!(written == buf.len(), "Short write on the eventfd");
        Ok(())
    }

    pub fn wait(&self) -> Result<()> {
        let mut buf = [0u8; 8];
        let nread = retry_on_interrupt(|| read(self.0.as_raw_fd(), &mut buf))
            .context("Failed to read from the eventfd")?;
        ensure!(nread == buf.len(), "Short read on the eventfd");
        Ok(())
    }
}

/// Changes the working directory to `dir`, restoring the previous one when
/// dropped. Discard needs this: umount2(2) has no *at() variant, so we
/// operate on names relative to the group directory.
pub struct WorkingDirGuard(fs::File);

impl WorkingDirGuard {
    pub fn enter(dir: &fs::File) -> Result<Self> {
        let fd = fcntl::open(".", OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
                             Mode::empty())
            .context("Failed to open the current working directory")?;
        let previous = unsafe { fs::File::from_raw_fd(fd) };
        fchdir(dir.as_raw_fd()).context("Failed to enter the group directory")?;
        Ok(Self(previous))
    }
}

impl Drop for WorkingDirGuard {
    fn drop(&mut self) {
        if let Err(e) = fchdir(self.0.as_raw_fd()) {
            warn!("Failed to restore the working directory: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eventfd_signal_then_wait() -> Result<()> {
        let efd = EventFd::new()?;
        efd.signal()?;
        efd.wait()?; // the token is pending, so this must not block
        Ok(())
    }

    #[test]
    fn working_dir_guard_restores_cwd() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = fs::File::open(tmp.path())?;
        let before = std::env::current_dir()?;
        {
            let _guard = WorkingDirGuard::enter(&dir)?;
            assert_eq!(std::env::current_dir()?.canonicalize()?,
                       tmp.path().canonicalize()?);
        }
        assert_eq!(std::env::current_dir()?, before);
        Ok(())
    }
}
