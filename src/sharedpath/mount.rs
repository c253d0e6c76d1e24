/*
 * Copyright (C) 2026 The Sharedpath Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use nix::errno::Errno;
use nix::mount::{mount as sys_mount, umount2, MntFlags, MsFlags};

use crate::sharedpath::util::error::{new_error, with_context, DynResult};

/// One row of /proc/self/mountinfo that the driver cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub source: String,
}

/// Decodes the octal escapes mountinfo uses for whitespace in paths.
fn unescape_mount_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        let digits: String = chars.clone().take(3).collect();
        if digits.len() == 3 {
            if let Ok(code) = u8::from_str_radix(&digits, 8) {
                out.push(code as char);
                chars.nth(2);
                continue;
            }
        }
        out.push(ch);
    }
    out
}

pub fn parse_mountinfo(content: &str) -> Vec<MountEntry> {
    let mut entries = Vec::new();
    for line in content.lines() {
        let (head, tail) = match line.split_once(" - ") {
            Some(parts) => parts,
            None => continue,
        };
        let head_fields: Vec<&str> = head.split(' ').collect();
        if head_fields.len() < 5 {
            continue;
        }
        let tail_fields: Vec<&str> = tail.split(' ').collect();
        if tail_fields.len() < 2 {
            continue;
        }
        entries.push(MountEntry {
            mount_point: PathBuf::from(unescape_mount_field(head_fields[4])),
            fs_type: tail_fields[0].to_string(),
            source: unescape_mount_field(tail_fields[1]),
        });
    }
    entries
}

/// Finds the mountinfo entry whose mount point is `path`, if any.
pub fn find_mount(path: &Path) -> DynResult<Option<MountEntry>> {
    let content = fs::read_to_string("/proc/self/mountinfo")
        .map_err(|e| with_context(e, "Failed to read /proc/self/mountinfo"))?;
    let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    Ok(parse_mountinfo(&content)
        .into_iter()
        .find(|entry| entry.mount_point == path || entry.mount_point == canonical))
}

pub fn is_mount_point(path: &Path) -> DynResult<bool> {
    Ok(find_mount(path)?.is_some())
}

/// Bind-mounts `source` onto `target`. Read-only binds need a second
/// remount because the kernel ignores MS_RDONLY on the initial bind.
pub fn bind_mount(source: &Path, target: &Path, read_only: bool) -> DynResult<()> {
    sys_mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| {
        with_context(
            e,
            format!(
                "Failed to bind mount {} on {}",
                source.display(),
                target.display()
            ),
        )
    })?;
    if read_only {
        sys_mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| {
            with_context(
                e,
                format!("Failed to remount {} read-only", target.display()),
            )
        })?;
    }
    Ok(())
}

fn mount_device(
    device: &Path,
    target: &Path,
    fs_type: &str,
    read_only: bool,
    data: Option<&str>,
) -> nix::Result<()> {
    let mut flags = MsFlags::MS_RELATIME;
    if read_only {
        flags |= MsFlags::MS_RDONLY;
    }
    sys_mount(Some(device), target, Some(fs_type), flags, data)
}

/// Formats `device` with `fs_type` and mounts it at `target`. Devices that
/// already carry a filesystem mount on the first attempt and are never
/// reformatted; only a fresh device (EINVAL from the kernel) gets mkfs.
pub fn format_and_mount(
    device: &Path,
    target: &Path,
    fs_type: &str,
    read_only: bool,
    data: Option<&str>,
) -> DynResult<()> {
    match mount_device(device, target, fs_type, read_only, data) {
        Ok(()) => Ok(()),
        Err(Errno::EINVAL) => {
            mkfs_device(device, fs_type)?;
            mount_device(device, target, fs_type, read_only, data).map_err(|e| {
                with_context(
                    e,
                    format!(
                        "Failed to mount {} on {} after formatting",
                        device.display(),
                        target.display()
                    ),
                )
            })
        }
        Err(err) => Err(with_context(
            err,
            format!(
                "Failed to mount {} on {} as {}",
                device.display(),
                target.display(),
                fs_type
            ),
        )),
    }
}

/// The force flag differs per mkfs family.
fn mkfs_force_flag(fs_type: &str) -> &'static str {
    if fs_type.starts_with("xfs") {
        "-f"
    } else {
        "-F"
    }
}

pub fn mkfs_device(device: &Path, fs_type: &str) -> DynResult<()> {
    let output = Command::new("mkfs")
        .args(["-t", fs_type, mkfs_force_flag(fs_type)])
        .arg(device)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| {
            with_context(e, format!("Failed to invoke mkfs for {}", device.display()))
        })?;
    if output.status.success() {
        Ok(())
    } else {
        Err(new_error(format!(
            "mkfs failed for {}: {}",
            device.display(),
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

/// Unmounts `path`; an unmounted or missing path is not an error.
pub fn unmount(path: &Path) -> DynResult<()> {
    match umount2(path, MntFlags::MNT_DETACH) {
        Ok(()) => Ok(()),
        Err(Errno::EINVAL) | Err(Errno::ENOENT) => Ok(()),
        Err(err) => Err(with_context(
            err,
            format!("Failed to unmount {}", path.display()),
        )),
    }
}
