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

use std::fs::{self, OpenOptions, Permissions};
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::time::{interval, Duration};

use crate::sharedpath::blockdev::BlockDevices;
use crate::sharedpath::controller::{TYPE_DISK, TYPE_FOLDER};
use crate::sharedpath::error::RpcError;
use crate::sharedpath::logger::{log_debug, log_info, log_warn};
use crate::sharedpath::mount;
use crate::sharedpath::store::{Catalog, VolumeRow};
use crate::sharedpath::types::*;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

const COMPONENT: &str = "node";

/// Node-side CSI service. RPCs serialize only on the kernel resources they
/// touch; the publish idempotence check keeps concurrent requests for one
/// target path from double-mounting.
pub struct NodeService {
    node_id: String,
    max_volumes_per_node: i64,
    catalog: Catalog,
    blockdev: Arc<dyn BlockDevices>,
    type_parameter: String,
    fstype_parameter: String,
}

impl NodeService {
    pub fn new(
        node_id: String,
        max_volumes_per_node: i64,
        catalog: Catalog,
        blockdev: Arc<dyn BlockDevices>,
        type_parameter: String,
        fstype_parameter: String,
    ) -> Self {
        spawn_heartbeat(node_id.clone(), catalog.clone());
        Self {
            node_id,
            max_volumes_per_node,
            catalog,
            blockdev,
            type_parameter,
            fstype_parameter,
        }
    }

    pub fn capabilities() -> Vec<NodeServiceCapability> {
        vec![
            NodeServiceCapability::ExpandVolume,
            NodeServiceCapability::GetVolumeStats,
            NodeServiceCapability::VolumeCondition,
        ]
    }

    pub fn node_get_info(&self) -> NodeGetInfoResponse {
        NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: self.max_volumes_per_node,
        }
    }

    async fn get_volume(&self, volume_id: &str) -> Result<VolumeRow, RpcError> {
        self.catalog
            .get_volume(volume_id)
            .await
            .map_err(RpcError::internal_error)?
            .ok_or_else(|| RpcError::not_found(format!("volume {volume_id} not found")))
    }

    pub async fn node_publish_volume(
        &self,
        request: NodePublishVolumeRequest,
    ) -> Result<NodePublishVolumeResponse, RpcError> {
        let capability = request.volume_capability.as_ref().ok_or_else(|| {
            RpcError::invalid_argument("NodePublishVolume volume capability missing in request")
        })?;
        if request.volume_id.is_empty() {
            return Err(RpcError::invalid_argument(
                "NodePublishVolume volume ID missing in request",
            ));
        }
        if request.target_path.is_empty() {
            return Err(RpcError::invalid_argument(
                "NodePublishVolume target path missing in request",
            ));
        }

        let vol = self.get_volume(&request.volume_id).await?;
        let target_path = Path::new(&request.target_path);

        log_debug(
            COMPONENT,
            "NodePublishVolume mounting",
            &[
                ("volume_id", &request.volume_id),
                ("target_path", &request.target_path),
            ],
        );

        let raw_mount = if capability.is_block() {
            self.publish_block(&vol, target_path, request.readonly)?;
            true
        } else if capability.is_mount() {
            self.publish_mount(&vol, target_path, &request.volume_context, request.readonly)?;
            false
        } else {
            return Err(RpcError::invalid_argument(
                "NodePublishVolume capability must request block or mount access",
            ));
        };

        if let Err(err) = fs::set_permissions(target_path, Permissions::from_mode(0o777)) {
            self.unwind_publish(&vol, target_path);
            return Err(RpcError::internal(format!(
                "failed to chmod target path {}: {err}",
                request.target_path
            )));
        }

        if let Err(err) = self
            .catalog
            .create_node_publication(
                &request.volume_id,
                &self.node_id,
                &request.target_path,
                raw_mount,
                request.readonly,
            )
            .await
        {
            self.unwind_publish(&vol, target_path);
            return Err(RpcError::internal(format!(
                "failed to record publication of volume {} at {}: {err}",
                request.volume_id, request.target_path
            )));
        }

        log_info(
            COMPONENT,
            "NodePublishVolume succeeded",
            &[
                ("volume_id", &request.volume_id),
                ("target_path", &request.target_path),
            ],
        );
        Ok(NodePublishVolumeResponse {})
    }

    /// Raw block publish: surface the loop device at a file target.
    fn publish_block(
        &self,
        vol: &VolumeRow,
        target_path: &Path,
        read_only: bool,
    ) -> Result<(), RpcError> {
        if !vol.is_block {
            return Err(RpcError::invalid_argument(
                "cannot publish a non-block volume as a block volume",
            ));
        }

        let device = self
            .blockdev
            .attach(Path::new(&vol.vol_path))
            .map_err(|e| RpcError::internal(format!("failed to attach loop device: {e}")))?;
        log_debug(
            COMPONENT,
            "Backing file attached",
            &[
                ("volume_id", &vol.vol_id),
                ("device", &device.display().to_string()),
            ],
        );

        match fs::symlink_metadata(target_path) {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                OpenOptions::new()
                    .create_new(true)
                    .write(true)
                    .mode(0o777)
                    .open(target_path)
                    .map_err(|e| {
                        RpcError::internal(format!(
                            "failed to create target path {}: {e}",
                            target_path.display()
                        ))
                    })?;
            }
            Err(err) => {
                return Err(RpcError::internal(format!(
                    "failed to check target path {}: {err}",
                    target_path.display()
                )))
            }
        }

        let mounted = mount::is_mount_point(target_path)
            .map_err(|e| RpcError::internal(e.to_string()))?;
        if !mounted {
            mount::bind_mount(&device, target_path, read_only).map_err(|e| {
                RpcError::internal(format!(
                    "failed to mount block device {} at {}: {e}",
                    device.display(),
                    target_path.display()
                ))
            })?;
        }
        Ok(())
    }

    /// Filesystem publish: bind a folder volume or format-and-mount a disk
    /// volume's loop device.
    fn publish_mount(
        &self,
        vol: &VolumeRow,
        target_path: &Path,
        volume_context: &std::collections::HashMap<String, String>,
        read_only: bool,
    ) -> Result<(), RpcError> {
        let vtype = volume_context.get(&self.type_parameter).ok_or_else(|| {
            RpcError::invalid_argument(format!(
                "required parameter not found: {}",
                self.type_parameter
            ))
        })?;
        match vtype.as_str() {
            TYPE_DISK if !vol.is_block => {
                return Err(RpcError::invalid_argument(
                    "cannot mount a non-block volume as a disk volume",
                ))
            }
            TYPE_FOLDER if vol.is_block => {
                return Err(RpcError::invalid_argument(
                    "cannot mount a block volume as a folder volume",
                ))
            }
            TYPE_DISK | TYPE_FOLDER => {}
            other => {
                return Err(RpcError::invalid_argument(format!(
                    "invalid volume type: {other}"
                )))
            }
        }

        if let Err(err) = fs::symlink_metadata(target_path) {
            if err.kind() != ErrorKind::NotFound {
                return Err(RpcError::internal(err.to_string()));
            }
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o750)
                .create(target_path)
                .map_err(|e| RpcError::internal(e.to_string()))?;
        }
        let mounted = mount::is_mount_point(target_path)
            .map_err(|e| RpcError::internal(e.to_string()))?;
        if mounted {
            return Ok(());
        }

        if vtype == TYPE_FOLDER {
            mount::bind_mount(Path::new(&vol.vol_path), target_path, read_only).map_err(|e| {
                RpcError::internal(format!(
                    "failed to mount {} at {}: {e}",
                    vol.vol_path,
                    target_path.display()
                ))
            })?;
        } else {
            let fs_type = volume_context.get(&self.fstype_parameter).ok_or_else(|| {
                RpcError::invalid_argument(format!(
                    "required parameter not found: {}",
                    self.fstype_parameter
                ))
            })?;
            // XFS refuses a second mount of the same UUID; loop copies of a
            // shared backing file need nouuid.
            let data = if fs_type == "xfs" { Some("nouuid") } else { None };
            let device = self
                .blockdev
                .attach(Path::new(&vol.vol_path))
                .map_err(|e| RpcError::internal(format!("cannot create loop device: {e}")))?;
            mount::format_and_mount(&device, target_path, fs_type, read_only, data).map_err(
                |e| {
                    RpcError::internal(format!(
                        "failed to mount device {} at {}: {e}",
                        device.display(),
                        target_path.display()
                    ))
                },
            )?;
        }
        Ok(())
    }

    /// Best-effort reversal after a failed publish: unmount, drop any loop
    /// binding, and remove the target path.
    fn unwind_publish(&self, vol: &VolumeRow, target_path: &Path) {
        if let Err(err) = mount::unmount(target_path) {
            log_warn(
                COMPONENT,
                "Cleanup unmount failed",
                &[
                    ("target_path", &target_path.display().to_string()),
                    ("error", &err.to_string()),
                ],
            );
        }
        if vol.is_block {
            if let Err(err) = self.blockdev.detach(Path::new(&vol.vol_path)) {
                log_warn(
                    COMPONENT,
                    "Cleanup detach failed",
                    &[("volume_id", &vol.vol_id), ("error", &err.to_string())],
                );
            }
        }
        remove_target_path(target_path);
    }

    pub async fn node_unpublish_volume(
        &self,
        request: NodeUnpublishVolumeRequest,
    ) -> Result<NodeUnpublishVolumeResponse, RpcError> {
        if request.volume_id.is_empty() {
            return Err(RpcError::invalid_argument("Volume ID missing in request"));
        }
        if request.target_path.is_empty() {
            return Err(RpcError::invalid_argument("Target path missing in request"));
        }

        let vol = self.get_volume(&request.volume_id).await?;
        let target_path = Path::new(&request.target_path);

        let mounted = mount::is_mount_point(target_path)
            .map_err(|e| RpcError::internal(e.to_string()))?;
        if mounted {
            mount::unmount(target_path).map_err(|e| RpcError::internal(e.to_string()))?;
            if vol.is_block {
                self.blockdev
                    .detach(Path::new(&vol.vol_path))
                    .map_err(|e| RpcError::internal(e.to_string()))?;
                log_debug(
                    COMPONENT,
                    "Loop device detached",
                    &[("volume_id", &vol.vol_id)],
                );
            }
        }

        remove_target_path(target_path);

        self.catalog
            .delete_node_publication(&request.volume_id, &self.node_id, &request.target_path)
            .await
            .map_err(RpcError::internal_error)?;

        log_info(
            COMPONENT,
            "NodeUnpublishVolume succeeded",
            &[
                ("volume_id", &request.volume_id),
                ("target_path", &request.target_path),
            ],
        );
        Ok(NodeUnpublishVolumeResponse {})
    }

    pub async fn node_expand_volume(
        &self,
        request: NodeExpandVolumeRequest,
    ) -> Result<NodeExpandVolumeResponse, RpcError> {
        if request.volume_id.is_empty() {
            return Err(RpcError::invalid_argument(
                "NodeExpandVolume volume ID not provided",
            ));
        }
        if request.volume_path.is_empty() {
            return Err(RpcError::invalid_argument(
                "NodeExpandVolume volume path not provided",
            ));
        }

        let vol = self.get_volume(&request.volume_id).await?;
        if !vol.is_block {
            // Folder volumes grow with the shared filesystem.
            return Ok(NodeExpandVolumeResponse {});
        }

        let resize_fs = request
            .volume_capability
            .as_ref()
            .map(|capability| !capability.is_block())
            .unwrap_or(true);

        let backing_file = Path::new(&vol.vol_path);
        let device = self.blockdev.loop_device(backing_file).map_err(|e| {
            RpcError::internal(format!("failed to get the loop device: {e}"))
        })?;
        self.blockdev.reread_file_size(backing_file).map_err(|e| {
            RpcError::internal(format!("cannot resize backing device: {e}"))
        })?;

        if resize_fs {
            let volume_path = Path::new(&request.volume_path);
            let mounted = mount::is_mount_point(volume_path)
                .map_err(|e| RpcError::internal(e.to_string()))?;
            if !mounted {
                return Err(RpcError::not_found(format!(
                    "NodeExpandVolume volume path {} is not mounted",
                    request.volume_path
                )));
            }
            self.blockdev
                .resize_filesystem(&device, volume_path)
                .map_err(|e| {
                    RpcError::internal(format!(
                        "could not resize volume {} at {}: {e}",
                        request.volume_id, request.volume_path
                    ))
                })?;
        }

        log_info(
            COMPONENT,
            "NodeExpandVolume succeeded",
            &[
                ("volume_id", &request.volume_id),
                ("volume_path", &request.volume_path),
            ],
        );
        Ok(NodeExpandVolumeResponse {})
    }

    pub async fn node_get_volume_stats(
        &self,
        request: NodeGetVolumeStatsRequest,
    ) -> Result<NodeGetVolumeStatsResponse, RpcError> {
        if request.volume_id.is_empty() {
            return Err(RpcError::invalid_argument(
                "NodeGetVolumeStats volume ID not provided",
            ));
        }
        if request.volume_path.is_empty() {
            return Err(RpcError::invalid_argument(
                "NodeGetVolumeStats volume path not provided",
            ));
        }

        self.get_volume(&request.volume_id).await?;

        let publication = self
            .catalog
            .get_node_publication(&request.volume_id, &self.node_id, &request.volume_path)
            .await
            .map_err(RpcError::internal_error)?;
        if publication.is_none() {
            return Err(RpcError::not_found(format!(
                "volume path {} is not the volume's published mount",
                request.volume_path
            )));
        }

        let volume_path = Path::new(&request.volume_path);
        let metadata = fs::metadata(volume_path).map_err(|e| {
            RpcError::internal(format!(
                "cannot stat volume path {}: {e}",
                request.volume_path
            ))
        })?;

        let usage = if metadata.is_dir() {
            let stats = self.blockdev.filesystem_stats(volume_path).map_err(|e| {
                RpcError::internal(format!(
                    "failed to retrieve statistics for {}: {e}",
                    request.volume_path
                ))
            })?;
            vec![
                VolumeUsage {
                    available: Some(stats.available_bytes),
                    total: Some(stats.total_bytes),
                    used: Some(stats.used_bytes),
                    unit: UsageUnit::Bytes,
                },
                VolumeUsage {
                    available: Some(stats.available_inodes),
                    total: Some(stats.total_inodes),
                    used: Some(stats.used_inodes),
                    unit: UsageUnit::Inodes,
                },
            ]
        } else {
            let total = self.blockdev.block_device_size(volume_path).map_err(|e| {
                RpcError::internal(format!("cannot get device size: {e}"))
            })?;
            vec![VolumeUsage {
                available: None,
                total: Some(total),
                used: None,
                unit: UsageUnit::Bytes,
            }]
        };

        Ok(NodeGetVolumeStatsResponse {
            usage,
            volume_condition: VolumeCondition::ok(),
        })
    }
}

/// Removes the publish target, whatever shape the publish left behind.
fn remove_target_path(target_path: &Path) {
    let result = match fs::symlink_metadata(target_path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(target_path),
        Ok(_) => fs::remove_file(target_path),
        Err(err) if err.kind() == ErrorKind::NotFound => return,
        Err(err) => Err(err),
    };
    if let Err(err) = result {
        if err.kind() != ErrorKind::NotFound {
            log_warn(
                COMPONENT,
                "Failed to remove target path",
                &[
                    ("target_path", &target_path.display().to_string()),
                    ("error", &err.to_string()),
                ],
            );
        }
    }
}

/// Emits the liveness heartbeat the controller's freshness check reads.
/// Runs for the life of the node process.
fn spawn_heartbeat(node_id: String, catalog: Catalog) {
    tokio::spawn(async move {
        let mut ticker = interval(HEARTBEAT_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(err) = catalog.upsert_node_last_seen(&node_id, Utc::now()).await {
                log_warn(
                    COMPONENT,
                    "Failed to update node heartbeat",
                    &[("node_id", &node_id), ("error", &err.to_string())],
                );
            }
        }
    });
}
