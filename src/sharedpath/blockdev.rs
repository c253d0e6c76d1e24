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

use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use nix::sys::statfs::statfs;

use crate::sharedpath::mount::find_mount;

/// Outcome classes the mediator reports. It never retries; callers decide.
#[derive(Debug)]
pub enum BlockDeviceError {
    Busy(String),
    NotFound(String),
    Io(String),
}

impl fmt::Display for BlockDeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockDeviceError::Busy(msg) => write!(f, "device busy: {msg}"),
            BlockDeviceError::NotFound(msg) => write!(f, "not found: {msg}"),
            BlockDeviceError::Io(msg) => write!(f, "{msg}"),
        }
    }
}

impl Error for BlockDeviceError {}

pub type BlockDeviceResult<T> = Result<T, BlockDeviceError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilesystemStats {
    pub available_bytes: i64,
    pub total_bytes: i64,
    pub used_bytes: i64,
    pub available_inodes: i64,
    pub total_inodes: i64,
    pub used_inodes: i64,
}

/// Bridge between a regular file on the shared filesystem and a kernel block
/// device. The node service is the only caller; tests substitute a fake.
pub trait BlockDevices: Send + Sync {
    /// Finds or creates a loop device bound to `file`. Re-attaching an
    /// already-bound file returns the existing device.
    fn attach(&self, file: &Path) -> BlockDeviceResult<PathBuf>;

    /// The device currently backing `file`; NotFound when unbound.
    fn loop_device(&self, file: &Path) -> BlockDeviceResult<PathBuf>;

    /// Unbinds whatever loop device backs `file`; no binding is fine.
    fn detach(&self, file: &Path) -> BlockDeviceResult<()>;

    /// Tells the kernel the backing file size changed so the loop device
    /// surfaces the new length.
    fn reread_file_size(&self, file: &Path) -> BlockDeviceResult<()>;

    /// On-line resize of the filesystem mounted at `mount_point`.
    fn resize_filesystem(&self, device: &Path, mount_point: &Path) -> BlockDeviceResult<()>;

    fn block_device_size(&self, device: &Path) -> BlockDeviceResult<i64>;

    fn filesystem_stats(&self, path: &Path) -> BlockDeviceResult<FilesystemStats>;
}

/// Production implementation backed by losetup/blockdev and the resize
/// binaries, in the style of the other host-tool wrappers in this tree.
pub struct LoopDevices;

fn run_tool(tool: &str, args: &[&str]) -> BlockDeviceResult<String> {
    let output = Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| BlockDeviceError::Io(format!("failed to invoke {tool}: {e}")))?;
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let lowered = stderr.to_ascii_lowercase();
    if lowered.contains("busy") {
        Err(BlockDeviceError::Busy(format!("{tool}: {stderr}")))
    } else if lowered.contains("no such") || lowered.contains("not found") {
        Err(BlockDeviceError::NotFound(format!("{tool}: {stderr}")))
    } else {
        Err(BlockDeviceError::Io(format!("{tool} failed: {stderr}")))
    }
}

/// Parses `losetup -j <file>` output; each line starts with the device path
/// followed by a colon.
fn parse_losetup_bindings(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .filter_map(|line| line.split(':').next())
        .map(str::trim)
        .filter(|device| !device.is_empty())
        .map(PathBuf::from)
        .collect()
}

fn parse_device_size(output: &str) -> BlockDeviceResult<i64> {
    output
        .trim()
        .parse::<i64>()
        .map_err(|e| BlockDeviceError::Io(format!("unparsable blockdev output: {e}")))
}

impl LoopDevices {
    fn bindings(&self, file: &Path) -> BlockDeviceResult<Vec<PathBuf>> {
        let file = file.to_string_lossy();
        let output = run_tool("losetup", &["-j", file.as_ref()])?;
        Ok(parse_losetup_bindings(&output))
    }
}

impl BlockDevices for LoopDevices {
    fn attach(&self, file: &Path) -> BlockDeviceResult<PathBuf> {
        if let Some(device) = self.bindings(file)?.into_iter().next() {
            return Ok(device);
        }
        let file = file.to_string_lossy();
        let output = run_tool("losetup", &["--find", "--show", file.as_ref()])?;
        let device = output.trim();
        if device.is_empty() {
            return Err(BlockDeviceError::Io(format!(
                "losetup returned no device for {file}"
            )));
        }
        Ok(PathBuf::from(device))
    }

    fn loop_device(&self, file: &Path) -> BlockDeviceResult<PathBuf> {
        self.bindings(file)?.into_iter().next().ok_or_else(|| {
            BlockDeviceError::NotFound(format!("no loop device backs {}", file.display()))
        })
    }

    fn detach(&self, file: &Path) -> BlockDeviceResult<()> {
        for device in self.bindings(file)? {
            let device = device.to_string_lossy();
            run_tool("losetup", &["-d", device.as_ref()])?;
        }
        Ok(())
    }

    fn reread_file_size(&self, file: &Path) -> BlockDeviceResult<()> {
        let device = self.loop_device(file)?;
        let device = device.to_string_lossy();
        run_tool("losetup", &["--set-capacity", device.as_ref()])?;
        Ok(())
    }

    fn resize_filesystem(&self, device: &Path, mount_point: &Path) -> BlockDeviceResult<()> {
        let entry = find_mount(mount_point)
            .map_err(|e| BlockDeviceError::Io(e.to_string()))?
            .ok_or_else(|| {
                BlockDeviceError::NotFound(format!(
                    "no filesystem mounted at {}",
                    mount_point.display()
                ))
            })?;
        match entry.fs_type.as_str() {
            "ext2" | "ext3" | "ext4" => {
                let device = device.to_string_lossy();
                run_tool("resize2fs", &[device.as_ref()])?;
                Ok(())
            }
            "xfs" => {
                let mount_point = mount_point.to_string_lossy();
                run_tool("xfs_growfs", &[mount_point.as_ref()])?;
                Ok(())
            }
            other => Err(BlockDeviceError::Io(format!(
                "cannot resize unsupported filesystem '{other}'"
            ))),
        }
    }

    fn block_device_size(&self, device: &Path) -> BlockDeviceResult<i64> {
        let device = device.to_string_lossy();
        let output = run_tool("blockdev", &["--getsize64", device.as_ref()])?;
        parse_device_size(&output)
    }

    fn filesystem_stats(&self, path: &Path) -> BlockDeviceResult<FilesystemStats> {
        let stats = statfs(path).map_err(|e| {
            BlockDeviceError::Io(format!("statfs failed for {}: {e}", path.display()))
        })?;
        let block_size = stats.block_size() as i64;
        let blocks = stats.blocks() as i64;
        let blocks_free = stats.blocks_free() as i64;
        let blocks_available = stats.blocks_available() as i64;
        let files = stats.files() as i64;
        let files_free = stats.files_free() as i64;
        Ok(FilesystemStats {
            available_bytes: blocks_available * block_size,
            total_bytes: blocks * block_size,
            used_bytes: (blocks - blocks_free) * block_size,
            available_inodes: files_free,
            total_inodes: files,
            used_inodes: files - files_free,
        })
    }
}
