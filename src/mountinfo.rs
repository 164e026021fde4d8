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

//! Minimal /proc/self/mountinfo parser. We only need enough of the format
//! to answer one question: is a given directory mounted, and if so, does
//! its entry carry propagation fields (shared:N, master:N, ...)?

use anyhow::{Result, Context};
use std::{
    path::{Path, PathBuf},
    fs,
};

#[derive(Debug)]
pub struct MountInfoEntry {
    pub mount_id: u32,
    pub parent_id: u32,
    /// Pathname of the directory in the filesystem forming the root of
    /// this mount.
    pub root: PathBuf,
    pub mount_point: PathBuf,
    pub mount_options: String,
    /// Zero or more "tag:value" propagation fields. Empty means the mount
    /// is private.
    pub optional_fields: Vec<String>,
    pub fs_type: String,
    pub mount_source: String,
    pub super_options: String,
}

// The kernel escapes space, tab, newline and backslash as \040, \011, \012
// and \134 in path fields.
fn unescape_octal(field: &str) -> PathBuf {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits: String = chars.clone().take(3).collect();
        match (digits.len() == 3, u8::from_str_radix(&digits, 8)) {
            (true, Ok(byte)) => {
                out.push(byte as char);
                for _ in 0..3 { chars.next(); }
            }
            // Not an escape sequence, keep the backslash
            _ => out.push(c),
        }
    }

    PathBuf::from(out)
}

impl MountInfoEntry {
    fn parse(line: &str) -> Result<Self> {
        let mut fields = line.split_whitespace();
        let mut next = |what: &str| fields.next()
            .ok_or_else(|| anyhow!("Truncated mountinfo line (missing {}): {}", what, line));

        let mount_id = next("mount id")?.parse()
            .with_context(|| format!("Bad mount id in mountinfo line: {}", line))?;
        let parent_id = next("parent id")?.parse()
            .with_context(|| format!("Bad parent id in mountinfo line: {}", line))?;
        let _major_minor = next("device")?;
        let root = unescape_octal(next("root")?);
        let mount_point = unescape_octal(next("mount point")?);
        let mount_options = next("mount options")?.to_string();

        let mut optional_fields = Vec::new();
        loop {
            let field = next("optional fields separator")?;
            if field == "-" {
                break;
            }
            optional_fields.push(field.to_string());
        }

        let fs_type = next("filesystem type")?.to_string();
        let mount_source = unescape_octal(next("mount source")?)
            .to_string_lossy().into_owned();
        let super_options = next("super options")?.to_string();

        Ok(Self {
            mount_id, parent_id, root, mount_point, mount_options,
            optional_fields, fs_type, mount_source, super_options,
        })
    }
}

pub fn parse(content: &str) -> Result<Vec<MountInfoEntry>> {
    content.lines()
        .filter(|line| !line.trim().is_empty())
        .map(MountInfoEntry::parse)
        .collect()
}

fn has_private_entry(entries: &[MountInfoEntry], path: &Path) -> bool {
    entries.iter().any(|e| e.mount_point == path && e.optional_fields.is_empty())
}

/// Returns true when `path` is a mount point whose entry carries no
/// propagation fields, i.e. a mount that cannot propagate to or receive
/// mounts from unrelated mount namespaces.
pub fn is_private_mount_point(path: &Path) -> Result<bool> {
    let content = fs::read_to_string("/proc/self/mountinfo")
        .context("Failed to read /proc/self/mountinfo")?;
    Ok(has_private_entry(&parse(&content)?, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
25 30 0:23 / /sys rw,nosuid,nodev,noexec,relatime shared:7 - sysfs sysfs rw
30 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw,errors=remount-ro
47 30 8:1 /var/lib /mnt/with\\040space rw,relatime master:1 - ext4 /dev/sda1 rw
52 30 0:46 / /run/nskeeper/ns rw,nosuid,nodev - tmpfs tmpfs rw,mode=755
";

    #[test]
    fn parses_all_fields() -> Result<()> {
        let entries = parse(SAMPLE)?;
        assert_eq!(entries.len(), 4);

        let sys = &entries[0];
        assert_eq!(sys.mount_id, 25);
        assert_eq!(sys.parent_id, 30);
        assert_eq!(sys.root, Path::new("/"));
        assert_eq!(sys.mount_point, Path::new("/sys"));
        assert_eq!(sys.optional_fields, vec!["shared:7".to_string()]);
        assert_eq!(sys.fs_type, "sysfs");
        assert_eq!(sys.mount_source, "sysfs");
        assert_eq!(sys.super_options, "rw");
        Ok(())
    }

    #[test]
    fn unescapes_octal_sequences() -> Result<()> {
        let entries = parse(SAMPLE)?;
        assert_eq!(entries[2].mount_point, Path::new("/mnt/with space"));
        Ok(())
    }

    #[test]
    fn detects_propagation_fields() -> Result<()> {
        let entries = parse(SAMPLE)?;
        // Peer-grouped mounts are not private
        assert!(!has_private_entry(&entries, Path::new("/")));
        assert!(!has_private_entry(&entries, Path::new("/mnt/with space")));
        // No entry at all is not private either
        assert!(!has_private_entry(&entries, Path::new("/tmp")));
        // An entry without optional fields is
        assert!(has_private_entry(&entries, Path::new("/run/nskeeper/ns")));
        Ok(())
    }

    #[test]
    fn rejects_truncated_lines() {
        assert!(parse("25 30 0:23 / /sys rw shared:7 - sysfs").is_err());
        assert!(parse("25 30").is_err());
        assert!(parse("x 30 0:23 / /sys rw - sysfs sysfs rw").is_err());
    }
}
