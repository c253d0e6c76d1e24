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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CapacityRange {
    #[serde(rename = "requiredBytes", skip_serializing_if = "Option::is_none")]
    pub required_bytes: Option<i64>,
    #[serde(rename = "limitBytes", skip_serializing_if = "Option::is_none")]
    pub limit_bytes: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum AccessMode {
    #[serde(rename = "SINGLE_NODE_WRITER")]
    #[default]
    SingleNodeWriter,
    #[serde(rename = "SINGLE_NODE_READER_ONLY")]
    SingleNodeReaderOnly,
    #[serde(rename = "MULTI_NODE_READER_ONLY")]
    MultiNodeReaderOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MountVolumeCapability {
    #[serde(rename = "fsType", skip_serializing_if = "Option::is_none")]
    pub fs_type: Option<String>,
    #[serde(
        rename = "mountFlags",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub mount_flags: Vec<String>,
}

/// Marker for raw block access; the block capability carries no options.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BlockVolumeCapability {}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VolumeCapability {
    #[serde(rename = "accessMode", skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<AccessMode>,
    #[serde(rename = "mount", skip_serializing_if = "Option::is_none")]
    pub mount: Option<MountVolumeCapability>,
    #[serde(rename = "block", skip_serializing_if = "Option::is_none")]
    pub block: Option<BlockVolumeCapability>,
}

impl VolumeCapability {
    pub fn is_block(&self) -> bool {
        self.block.is_some()
    }

    pub fn is_mount(&self) -> bool {
        self.mount.is_some()
    }

    pub fn access_mode(&self) -> AccessMode {
        self.access_mode.unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Volume {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(rename = "capacityBytes")]
    pub capacity_bytes: i64,
    #[serde(
        default,
        rename = "volumeContext",
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub volume_context: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VolumeCondition {
    pub abnormal: bool,
    pub message: String,
}

impl VolumeCondition {
    pub fn ok() -> Self {
        Self {
            abnormal: false,
            message: "ok".to_string(),
        }
    }

    pub fn abnormal(message: impl Into<String>) -> Self {
        Self {
            abnormal: true,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum UsageUnit {
    #[serde(rename = "BYTES")]
    #[default]
    Bytes,
    #[serde(rename = "INODES")]
    Inodes,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VolumeUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used: Option<i64>,
    pub unit: UsageUnit,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VolumeStatus {
    #[serde(rename = "publishedNodeIds", default)]
    pub published_node_ids: Vec<String>,
    #[serde(rename = "volumeCondition")]
    pub volume_condition: VolumeCondition,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CreateVolumeRequest {
    pub name: String,
    #[serde(rename = "capacityRange", skip_serializing_if = "Option::is_none")]
    pub capacity_range: Option<CapacityRange>,
    #[serde(
        rename = "volumeCapabilities",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVolumeResponse {
    pub volume: Volume,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeleteVolumeRequest {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeleteVolumeResponse {}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ControllerPublishVolumeRequest {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(rename = "nodeId")]
    pub node_id: String,
    #[serde(rename = "volumeCapability", skip_serializing_if = "Option::is_none")]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ControllerPublishVolumeResponse {
    #[serde(
        rename = "publishContext",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub publish_context: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ControllerUnpublishVolumeRequest {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(rename = "nodeId")]
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ControllerUnpublishVolumeResponse {}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ControllerExpandVolumeRequest {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(rename = "capacityRange", skip_serializing_if = "Option::is_none")]
    pub capacity_range: Option<CapacityRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ControllerExpandVolumeResponse {
    #[serde(rename = "capacityBytes")]
    pub capacity_bytes: i64,
    #[serde(rename = "nodeExpansionRequired")]
    pub node_expansion_required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ListVolumesRequest {
    #[serde(rename = "maxEntries", default)]
    pub max_entries: i64,
    #[serde(rename = "startingToken", default)]
    pub starting_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListVolumesEntry {
    pub volume: Volume,
    pub status: VolumeStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ListVolumesResponse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<ListVolumesEntry>,
    #[serde(rename = "nextToken", skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ControllerGetVolumeRequest {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerGetVolumeResponse {
    pub volume: Volume,
    pub status: VolumeStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ValidateVolumeCapabilitiesRequest {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(
        rename = "volumeContext",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub volume_context: HashMap<String, String>,
    #[serde(
        rename = "volumeCapabilities",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfirmedCapabilities {
    #[serde(
        rename = "volumeContext",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub volume_context: HashMap<String, String>,
    #[serde(
        rename = "volumeCapabilities",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ValidateVolumeCapabilitiesResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<ConfirmedCapabilities>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodePublishVolumeRequest {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(rename = "targetPath")]
    pub target_path: String,
    #[serde(rename = "volumeCapability", skip_serializing_if = "Option::is_none")]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(
        rename = "volumeContext",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub volume_context: HashMap<String, String>,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodePublishVolumeResponse {}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeUnpublishVolumeRequest {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(rename = "targetPath")]
    pub target_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeUnpublishVolumeResponse {}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeExpandVolumeRequest {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(rename = "volumePath")]
    pub volume_path: String,
    #[serde(rename = "capacityRange", skip_serializing_if = "Option::is_none")]
    pub capacity_range: Option<CapacityRange>,
    #[serde(rename = "volumeCapability", skip_serializing_if = "Option::is_none")]
    pub volume_capability: Option<VolumeCapability>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeExpandVolumeResponse {}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeGetVolumeStatsRequest {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(rename = "volumePath")]
    pub volume_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeGetVolumeStatsResponse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usage: Vec<VolumeUsage>,
    #[serde(rename = "volumeCondition")]
    pub volume_condition: VolumeCondition,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeGetInfoResponse {
    #[serde(rename = "nodeId")]
    pub node_id: String,
    #[serde(rename = "maxVolumesPerNode")]
    pub max_volumes_per_node: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfoResponse {
    pub name: String,
    #[serde(rename = "vendorVersion")]
    pub vendor_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProbeResponse {
    pub ready: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerServiceCapability {
    CreateDeleteVolume,
    PublishUnpublishVolume,
    PublishReadonly,
    ExpandVolume,
    ListVolumes,
    ListVolumesPublishedNodes,
    GetVolume,
    VolumeCondition,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeServiceCapability {
    ExpandVolume,
    GetVolumeStats,
    VolumeCondition,
}
