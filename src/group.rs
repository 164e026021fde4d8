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

//! Namespace groups: the per-package unit of mount-namespace sharing.
//!
//! A group owns three files inside the shared group directory: a lock file,
//! a preserved-namespace file, and (at a separate runtime path) a mount
//! profile written by the populating launcher. The exclusive group lock is
//! held across the entire create-or-join-or-preserve-or-discard sequence;
//! launches of the same group are fully serialized while distinct groups
//! proceed in parallel.

use anyhow::{Result, Context};
use std::{
    os::unix::io::{AsRawFd, FromRawFd},
    path::{Path, PathBuf},
    io::ErrorKind,
    fs,
};
use nix::{
    Error,
    errno::Errno,
    fcntl::{open, flock, OFlag, FlockArg},
    sched::{unshare, CloneFlags},
    sys::signal::{kill, Signal},
    sys::stat::Mode,
    sys::wait::{waitpid, WaitStatus},
    unistd::{fork, getpid, ForkResult, Pid, Uid},
};
use crate::{
    capture,
    consts::*,
    nsdir,
    signal::{check_for_pending_sigterm, retry_on_interrupt},
    util::{self, EventFd, WorkingDirGuard},
};

/// Group names become file names inside the shared directory, so anything
/// that could traverse out of it is rejected up front.
fn validate_group_name(name: &str) -> Result<()> {
    ensure!(!name.is_empty(), "Group names cannot be empty");
    ensure!(name.len() <= 200, "Group name `{}` is too long", name);
    ensure!(!name.starts_with('.'), "Group name `{}` cannot start with a dot", name);
    ensure!(!name.ends_with('.'), "Group name `{}` cannot end with a dot", name);
    ensure!(!name.contains(".."), "Group name `{}` cannot contain `..`", name);
    for c in name.chars() {
        ensure!(c.is_ascii_lowercase() || c.is_ascii_digit()
                || c == '-' || c == '_' || c == '.',
                "Group name `{}` contains the invalid character `{}`", name, c);
    }
    Ok(())
}

/// Name of the per-user variant of a group: same protocol, distinct files.
pub fn user_group_name(name: &str, uid: Uid) -> String {
    format!("{}.{}", name, uid)
}

/// A handle on one namespace group. Opening the handle creates the group's
/// lock file if needed but takes no lock; multiple handles for the same
/// group are expected, one per racing process. All descriptors are closed
/// on drop.
pub struct NsGroup {
    name: String,
    dir: fs::File,
    lock_file: fs::File,
    profile_path: PathBuf,
}

impl NsGroup {
    pub fn open(name: &str) -> Result<Self> {
        Self::open_dirs(&*NS_DIR, &*RUN_DIR, name)
    }

    fn open_dirs(ns_dir: &Path, runtime_dir: &Path, name: &str) -> Result<Self> {
        validate_group_name(name)?;

        let fd = open(ns_dir, OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
                      Mode::empty())
            .with_context(|| format!("Failed to open the group directory {}",
                                     ns_dir.display()))?;
        let dir = unsafe { fs::File::from_raw_fd(fd) };

        let lock_file = util::openat(&dir, format!("{}{}", name, GROUP_LOCK_SUFFIX),
            OFlag::O_CREAT | OFlag::O_RDWR | OFlag::O_CLOEXEC | OFlag::O_NOFOLLOW,
            Mode::from_bits_truncate(0o600))?;

        let profile_path = runtime_dir.join(format!("snap.{}.fstab", name));

        Ok(Self { name: name.to_string(), dir, lock_file, profile_path })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn dir_file(&self) -> &fs::File {
        &self.dir
    }

    pub(crate) fn ns_file_name(&self) -> String {
        format!("{}{}", self.name, NS_FILE_SUFFIX)
    }

    /// Takes the group mutex. Blocks without timeout: critical sections are
    /// short and never blocked on external I/O, and the kernel drops the
    /// lock of a killed holder. Callers serialize their own call sites;
    /// locking twice on one handle without an intervening unlock is a
    /// caller error this type does not guard against.
    pub fn lock(&self) -> Result<GroupLock> {
        trace!("Waiting to lock group {}", self.name);

        loop {
            check_for_pending_sigterm()?;

            match flock(self.lock_file.as_raw_fd(), FlockArg::LockExclusive) {
                Err(Error::Sys(Errno::EINTR)) => {},
                Err(e) => return Err(e)
                    .with_context(|| format!("Failed to lock group {}", self.name)),
                Ok(_) => break,
            }
        }

        trace!("Locked group {}", self.name);
        Ok(GroupLock { group: self })
    }
}

/// Proof that the group mutex is held. The per-group operations live here:
/// they are only safe under the lock, and the borrow keeps the handle (and
/// its descriptors) alive for as long as the guard exists.
#[must_use = "if unused, the group unlocks immediately"]
pub struct GroupLock<'a> {
    group: &'a NsGroup,
}

impl Drop for GroupLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = flock(self.group.lock_file.as_raw_fd(), FlockArg::Unlock) {
            warn!("Failed to unlock group {}: {}", self.group.name, e);
        }
    }
}

/// What `create_or_join()` did. `Created` carries the pending capture: the
/// caller performs its package-specific mount work inside the fresh
/// namespace and then calls `preserve()`; a `Joined` namespace was already
/// populated by a previous launch.
#[must_use = "Created carries the pending capture that preserve() consumes"]
pub enum JoinOutcome {
    Joined,
    Created(CapturePending),
}

impl<'a> GroupLock<'a> {
    pub fn group(&self) -> &'a NsGroup {
        self.group
    }

    /// Joins the group's preserved mount namespace, or unshares a fresh one
    /// and arms a capture helper for it. Either way, on return the calling
    /// process runs inside the group's namespace.
    pub fn create_or_join(&self) -> Result<JoinOutcome> {
        let g = self.group;

        let ns_file = util::openat(&g.dir, g.ns_file_name(),
            OFlag::O_CREAT | OFlag::O_RDONLY | OFlag::O_CLOEXEC | OFlag::O_NOFOLLOW,
            Mode::from_bits_truncate(0o600))?;

        match util::setns(&ns_file, CloneFlags::CLONE_NEWNS) {
            Ok(()) => {
                debug!("Joined the preserved mount namespace of group {}", g.name);
                return Ok(JoinOutcome::Joined);
            }
            // The normal "nothing usable yet" branch: an unpopulated file,
            // a crashed prior populate, or a concurrently discarded
            // namespace.
            Err(Error::Sys(Errno::EINVAL)) =>
                debug!("Group {} has no preserved mount namespace", g.name),
            Err(e) => return Err(e).with_context(||
                format!("Failed to join the preserved namespace of group {}", g.name)),
        }

        let event_fd = EventFd::new()?;
        let parent_pid = getpid();

        // The helper observes /proc/<parent>/ns/mnt from outside the
        // namespace being captured: the parent cannot bind mount its own
        // namespace file from within without racing its own exit. Forking
        // before unshare() also decouples "namespace ready to use" (the
        // parent can proceed immediately) from "namespace durably captured"
        // (the helper's background job).
        match fork().context("Failed to fork the capture helper")? {
            ForkResult::Child => capture::helper_main(g, &event_fd, parent_pid),
            ForkResult::Parent { child } => {
                let pending = CapturePending {
                    helper: Some(child),
                    event_fd,
                    group_name: g.name.clone(),
                };
                // If unshare fails, dropping `pending` reaps the helper.
                unshare(CloneFlags::CLONE_NEWNS)
                    .context("Failed to create a new mount namespace")?;
                debug!("Created a new mount namespace for group {}", g.name);
                Ok(JoinOutcome::Created(pending))
            }
        }
    }

    /// Releases the group's preserved namespace, if any. Idempotent: "not
    /// currently mounted" and "profile already absent" are both success.
    /// Used standalone by the discard tool and inline before re-populating
    /// a stale namespace.
    pub fn discard(&self) -> Result<()> {
        let g = self.group;
        debug!("Discarding the preserved mount namespace of group {}", g.name);

        {
            // umount2(2) has no *at() variant; operate relative to the
            // group directory, restoring the working directory after.
            let _cwd_guard = WorkingDirGuard::enter(&g.dir)?;
            let ns_file_name = g.ns_file_name();

            match util::umount_nofollow(Path::new(&ns_file_name)) {
                Ok(()) => debug!("Unmounted {}", ns_file_name),
                Err(Error::Sys(Errno::EINVAL)) | Err(Error::Sys(Errno::ENOENT)) =>
                    debug!("Group {} has nothing to unmount", g.name),
                Err(e) => return Err(e)
                    .with_context(|| format!("Failed to unmount {}", ns_file_name)),
            }
        }

        match fs::remove_file(&g.profile_path) {
            Ok(()) => debug!("Removed the mount profile {}", g.profile_path.display()),
            Err(ref e) if e.kind() == ErrorKind::NotFound => {},
            Err(e) => return Err(e)
                .with_context(|| format!("Failed to remove {}", g.profile_path.display())),
        }

        Ok(())
    }
}

/// The transient capture state of a freshly created namespace: the forked
/// helper parked on its eventfd. Consumed by `preserve()`. If the launch
/// fails before preserving, dropping this kills and reaps the helper so no
/// exit path leaks the child.
pub struct CapturePending {
    helper: Option<Pid>,
    event_fd: EventFd,
    group_name: String,
}

impl CapturePending {
    /// Turns the freshly created namespace into a durably joinable one:
    /// wakes the helper and waits for it to bind mount the namespace file.
    /// Called exactly once, after population. Any helper failure is fatal
    /// to the in-progress launch; a later invocation re-attempts
    /// join-or-create from scratch.
    pub fn preserve(mut self) -> Result<()> {
        debug!("Signaling the capture helper of group {}", self.group_name);
        self.event_fd.signal().context("Failed to wake the capture helper")?;

        // Past this point the helper finishes on its own; Drop must not
        // shoot it down.
        let helper = match self.helper.take() {
            Some(pid) => pid,
            None => bail!("The capture helper was already reaped"),
        };

        let status = retry_on_interrupt(|| waitpid(helper, None))
            .with_context(|| format!("Failed to wait for the capture helper pid={}", helper))?;

        match status {
            WaitStatus::Exited(_, 0) => {
                debug!("Preserved the mount namespace of group {}", self.group_name);
                Ok(())
            }
            WaitStatus::Exited(_, code) =>
                bail!("The capture helper failed with exit_code={}", code),
            status =>
                bail!("The capture helper terminated abnormally: {:?}", status),
        }
    }
}

impl Drop for CapturePending {
    fn drop(&mut self) {
        if let Some(helper) = self.helper.take() {
            // Abandoned before preserve(): the helper is still parked on
            // the eventfd and must not be left behind.
            debug!("Reaping the unused capture helper of group {}", self.group_name);
            let _ = kill(helper, Signal::SIGKILL);
            let _ = retry_on_interrupt(|| waitpid(helper, None));
        }
    }
}

/// The launcher-facing entry point: ensures the shared directory is ready,
/// serializes on the group, joins or creates its namespace, and runs the
/// caller's population work before preserving a newly created namespace.
/// On return the calling process runs inside the group's namespace; this
/// crate never execs the confined program itself.
pub fn with_group_namespace<F>(name: &str, populate: F) -> Result<()>
    where F: FnOnce() -> Result<()>
{
    nsdir::initialize()?;

    let group = NsGroup::open(name)?;
    let lock_guard = group.lock()?;

    match lock_guard.create_or_join()? {
        JoinOutcome::Joined => Ok(()),
        JoinOutcome::Created(pending) => {
            populate()?;
            pending.preserve()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::mount::{mount, MsFlags};
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    fn have_sys_admin() -> bool {
        caps::has_cap(None, caps::CapSet::Effective, caps::Capability::CAP_SYS_ADMIN)
            .unwrap_or(false)
    }

    /// Namespace manipulation needs a single-threaded process, which the
    /// test harness is not: run `f` in a forked child and propagate its
    /// verdict through the exit code.
    fn run_in_child<F: FnOnce() -> Result<()>>(f: F) {
        match fork().expect("fork failed") {
            ForkResult::Child => {
                let code = match f() {
                    Ok(()) => 0,
                    Err(e) => {
                        eprintln!("test child failed: {:#}", e);
                        1
                    }
                };
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                match retry_on_interrupt(|| waitpid(child, None)).expect("waitpid failed") {
                    WaitStatus::Exited(_, 0) => {},
                    status => panic!("test child failed: {:?}", status),
                }
            }
        }
    }

    #[test]
    fn group_names_are_validated() {
        for name in &["myapp", "my-app", "myapp_instance", "myapp.1000", "c0re2"] {
            assert!(validate_group_name(name).is_ok(), "{} should be valid", name);
        }
        for name in &["", ".", "..", "../oops", "a/b", "My App", ".hidden",
                      "app..1", "app.", "APP"] {
            assert!(validate_group_name(name).is_err(), "{} should be invalid", name);
        }
    }

    #[test]
    fn per_user_groups_get_their_own_name() {
        let name = user_group_name("myapp", Uid::from_raw(1000));
        assert_eq!(name, "myapp.1000");
        assert!(validate_group_name(&name).is_ok());
    }

    #[test]
    fn group_lock_is_exclusive_per_group() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let ns_dir = tmp.path().join("ns");
        fs::create_dir(&ns_dir)?;

        let g1 = NsGroup::open_dirs(&ns_dir, tmp.path(), "myapp")?;
        let g2 = NsGroup::open_dirs(&ns_dir, tmp.path(), "myapp")?;
        let other = NsGroup::open_dirs(&ns_dir, tmp.path(), "otherapp")?;

        let guard = g1.lock()?;

        // The same group seen through another handle is locked out
        match flock(g2.lock_file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Err(Error::Sys(Errno::EAGAIN)) => {},
            status => panic!("Expected the group lock to be held: {:?}", status),
        }

        // An unrelated group is not
        drop(other.lock()?);

        drop(guard);
        flock(g2.lock_file.as_raw_fd(), FlockArg::LockExclusiveNonblock)?;
        Ok(())
    }

    #[test]
    fn discard_is_idempotent() {
        if !have_sys_admin() {
            eprintln!("skipping: requires CAP_SYS_ADMIN");
            return;
        }

        let tmp = tempfile::tempdir().expect("tempdir");
        let ns_dir = tmp.path().join("ns");
        fs::create_dir(&ns_dir).expect("create ns dir");
        let profile = tmp.path().join("snap.myapp.fstab");
        fs::write(&profile, "/snap/myapp/1 /app none bind 0 0\n").expect("write profile");
        fs::write(ns_dir.join("myapp.mnt"), "").expect("touch ns file");

        // In a child: discard changes the working directory of the process
        run_in_child(|| {
            let group = NsGroup::open_dirs(&ns_dir, tmp.path(), "myapp")?;
            let lock_guard = group.lock()?;

            lock_guard.discard()?;
            ensure!(!profile.exists(), "The mount profile must be removed");
            ensure!(ns_dir.join("myapp.mnt").exists(),
                    "The namespace file is unmounted, not unlinked");

            // Twice yields the same state as once
            lock_guard.discard()?;
            ensure!(!profile.exists());
            Ok(())
        });
    }

    #[test]
    fn preserve_join_discard_round_trip() {
        if !have_sys_admin() {
            eprintln!("skipping: requires CAP_SYS_ADMIN");
            return;
        }

        let tmp = tempfile::tempdir().expect("tempdir");
        let base = tmp.path().canonicalize().expect("canonicalize");
        let ns_dir = base.join("ns");
        fs::create_dir(&ns_dir).expect("create ns dir");
        let probe_dir = base.join("probe");
        fs::create_dir(&probe_dir).expect("create probe dir");
        let marker = probe_dir.join("marker");
        let profile = base.join("snap.myapp.fstab");
        fs::write(&profile, "tmpfs /probe tmpfs defaults 0 0\n").expect("write profile");

        // 0) A launch that dies before preserve() leaves no trace: the
        // next launch must land on the create path again, not on a
        // corrupted namespace
        run_in_child(|| {
            nsdir::initialize_at(&ns_dir)?;
            let group = NsGroup::open_dirs(&ns_dir, &base, "myapp")?;
            let lock_guard = group.lock()?;
            match lock_guard.create_or_join()? {
                JoinOutcome::Created(_pending) => Ok(()), // dropped unpreserved
                JoinOutcome::Joined => bail!("Expected to create a fresh namespace"),
            }
        });

        // 1) A first launch creates, populates and preserves the namespace
        run_in_child(|| {
            nsdir::initialize_at(&ns_dir)?;
            let group = NsGroup::open_dirs(&ns_dir, &base, "myapp")?;
            let lock_guard = group.lock()?;
            let pending = match lock_guard.create_or_join()? {
                JoinOutcome::Created(pending) => pending,
                JoinOutcome::Joined => bail!("Expected to create a fresh namespace"),
            };
            // Population stand-in. A recursively private view first, so
            // these mounts cannot leak back out of the new namespace.
            mount(None as Option<&str>, "/", None as Option<&str>,
                  MsFlags::MS_REC | MsFlags::MS_PRIVATE, None as Option<&str>)?;
            mount(Some("tmpfs"), &probe_dir, Some("tmpfs"),
                  MsFlags::empty(), None as Option<&str>)?;
            fs::write(&marker, "populated")?;
            pending.preserve()
        });

        // The populated view must not have leaked into this namespace
        assert!(!marker.exists());

        // 2) An independent process joins and observes the populated state
        run_in_child(|| {
            let group = NsGroup::open_dirs(&ns_dir, &base, "myapp")?;
            let lock_guard = group.lock()?;
            match lock_guard.create_or_join()? {
                JoinOutcome::Joined => {},
                JoinOutcome::Created(_) => bail!("Expected to join the preserved namespace"),
            }
            ensure!(marker.exists(), "The populated state is missing after the join");
            Ok(())
        });

        // 3) Discard removes joinability and the mount profile
        run_in_child(|| {
            let group = NsGroup::open_dirs(&ns_dir, &base, "myapp")?;
            let lock_guard = group.lock()?;
            lock_guard.discard()
        });
        assert!(!profile.exists());

        // 4) The next launch is back on the create path, without the marker
        run_in_child(|| {
            let group = NsGroup::open_dirs(&ns_dir, &base, "myapp")?;
            let lock_guard = group.lock()?;
            match lock_guard.create_or_join()? {
                JoinOutcome::Created(pending) => {
                    ensure!(!marker.exists(), "Stale state visible in a fresh namespace");
                    // Abandoning before preserve() must reap the helper
                    drop(pending);
                    Ok(())
                }
                JoinOutcome::Joined => bail!("Expected a fresh namespace after the discard"),
            }
        });

        // Detach the directory self-bind so the tempdir can be removed
        let cpath = CString::new(ns_dir.as_os_str().as_bytes()).unwrap();
        unsafe { libc::umount2(cpath.as_ptr(), libc::MNT_DETACH) };
    }
}
