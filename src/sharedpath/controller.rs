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

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::sharedpath::error::RpcError;
use crate::sharedpath::logger::{log_debug, log_info};
use crate::sharedpath::store::{Catalog, VolumeRow};
use crate::sharedpath::types::*;
use crate::sharedpath::volumes::{fix_capacity, volume_condition, VolumeManager};

pub const PV_NAME_KEY: &str = "csi.storage.k8s.io/pv/name";
pub const PVC_NAME_KEY: &str = "csi.storage.k8s.io/pvc/name";
pub const PVC_NAMESPACE_KEY: &str = "csi.storage.k8s.io/pvc/namespace";

pub const TYPE_FOLDER: &str = "folder";
pub const TYPE_DISK: &str = "disk";

const MAX_STORAGE_CAPACITY: i64 = 1 << 40;

const COMPONENT: &str = "controller";

/// Which access types a capability list asks for.
fn access_types(capabilities: &[VolumeCapability]) -> (bool, bool) {
    let block = capabilities.iter().any(VolumeCapability::is_block);
    let mount = capabilities.iter().any(VolumeCapability::is_mount);
    (block, mount)
}

/// The list token is a decimal row offset; anything else aborts the listing.
fn parse_starting_token(token: &str) -> Result<i64, RpcError> {
    if token.is_empty() {
        return Ok(0);
    }
    token.parse::<i64>().map_err(|e| {
        RpcError::aborted(format!("ListVolumes starting token '{token}' is not valid: {e}"))
    })
}

fn next_starting_token(offset: i64, max_entries: i64, total: i64) -> Option<String> {
    if max_entries == 0 {
        return None;
    }
    let next = offset + max_entries;
    if next < total {
        Some(next.to_string())
    } else {
        None
    }
}

/// Controller-side CSI service. A single process-wide mutex serializes every
/// mutating RPC so catalog and filesystem mutations never interleave; reads
/// go through unguarded.
pub struct ControllerService {
    catalog: Catalog,
    volumes: VolumeManager,
    type_parameter: String,
    node_freshness: Duration,
    serialize: Mutex<()>,
}

impl ControllerService {
    pub fn new(volumes: VolumeManager, type_parameter: String, node_freshness: Duration) -> Self {
        Self {
            catalog: volumes.catalog().clone(),
            volumes,
            type_parameter,
            node_freshness,
            serialize: Mutex::new(()),
        }
    }

    pub fn capabilities() -> Vec<ControllerServiceCapability> {
        vec![
            ControllerServiceCapability::CreateDeleteVolume,
            ControllerServiceCapability::PublishUnpublishVolume,
            ControllerServiceCapability::PublishReadonly,
            ControllerServiceCapability::ExpandVolume,
            ControllerServiceCapability::ListVolumes,
            ControllerServiceCapability::ListVolumesPublishedNodes,
            ControllerServiceCapability::GetVolume,
            ControllerServiceCapability::VolumeCondition,
        ]
    }

    /// Reconstructs the StorageClass-style parameters for list/get replies.
    fn volume_parameters(&self, vol: &VolumeRow) -> HashMap<String, String> {
        let mut parameters = HashMap::new();
        parameters.insert(PV_NAME_KEY.to_string(), vol.pv_name.clone());
        parameters.insert(PVC_NAME_KEY.to_string(), vol.pvc_name.clone());
        parameters.insert(PVC_NAMESPACE_KEY.to_string(), vol.ns_name.clone());
        parameters.insert(
            self.type_parameter.clone(),
            if vol.is_block { TYPE_DISK } else { TYPE_FOLDER }.to_string(),
        );
        parameters
    }

    async fn volume_entry(&self, vol: &VolumeRow) -> Result<ListVolumesEntry, RpcError> {
        let published_node_ids = self
            .catalog
            .published_node_ids(&vol.vol_id)
            .await
            .map_err(RpcError::internal_error)?;
        Ok(ListVolumesEntry {
            volume: Volume {
                volume_id: vol.vol_id.clone(),
                capacity_bytes: vol.capacity,
                volume_context: self.volume_parameters(vol),
            },
            status: VolumeStatus {
                published_node_ids,
                volume_condition: volume_condition(vol),
            },
        })
    }

    pub async fn create_volume(
        &self,
        request: CreateVolumeRequest,
    ) -> Result<CreateVolumeResponse, RpcError> {
        let _serial = self.serialize.lock().await;

        if request.name.is_empty() {
            return Err(RpcError::invalid_argument("Name missing in request"));
        }
        if request.volume_capabilities.is_empty() {
            return Err(RpcError::invalid_argument(
                "Volume capabilities missing in request",
            ));
        }

        let (access_block, access_mount) = access_types(&request.volume_capabilities);
        if access_block && access_mount {
            return Err(RpcError::invalid_argument(
                "cannot have both block and mount access type",
            ));
        }

        let vtype = request.parameters.get(&self.type_parameter).ok_or_else(|| {
            RpcError::invalid_argument(format!(
                "storage class parameter required: {}",
                self.type_parameter
            ))
        })?;
        let mut is_block = access_block;
        match vtype.as_str() {
            TYPE_DISK => is_block = true,
            TYPE_FOLDER => {
                if access_block {
                    return Err(RpcError::invalid_argument(
                        "cannot have both folder type and block access type",
                    ));
                }
            }
            other => {
                return Err(RpcError::invalid_argument(format!(
                    "invalid volume type: {other}"
                )))
            }
        }

        let requested = request
            .capacity_range
            .as_ref()
            .and_then(|range| range.required_bytes)
            .unwrap_or(0);
        let capacity = fix_capacity(requested);
        if capacity >= MAX_STORAGE_CAPACITY {
            return Err(RpcError::out_of_range(format!(
                "Requested capacity {capacity} exceeds maximum allowed {MAX_STORAGE_CAPACITY}"
            )));
        }

        if is_block {
            for capability in &request.volume_capabilities {
                if capability.access_mode() != AccessMode::SingleNodeWriter {
                    return Err(RpcError::invalid_argument(
                        "block backend can only be accessed as SINGLE_NODE_WRITER",
                    ));
                }
            }
        }

        // Same name twice is the orchestrator retrying: repair the artifact
        // if needed and confirm, unless the request now disagrees with the
        // recorded shape.
        if let Some(existing_id) = self
            .catalog
            .get_volume_id_by_name(&request.name)
            .await
            .map_err(RpcError::internal_error)?
        {
            let vol = self
                .catalog
                .get_volume(&existing_id)
                .await
                .map_err(RpcError::internal_error)?
                .ok_or_else(|| {
                    RpcError::internal(format!("volume '{existing_id}' vanished during create"))
                })?;
            let repopulated = self.volumes.populate_if_required(&vol).map_err(|e| {
                RpcError::internal(format!("cannot check volume status: {e}"))
            })?;
            if repopulated || (vol.capacity == capacity && vol.is_block == is_block) {
                log_debug(
                    COMPONENT,
                    "CreateVolume matched existing volume",
                    &[("name", &request.name), ("volume_id", &vol.vol_id)],
                );
                return Ok(CreateVolumeResponse {
                    volume: Volume {
                        volume_id: vol.vol_id,
                        capacity_bytes: vol.capacity,
                        volume_context: request.parameters,
                    },
                });
            }
            return Err(RpcError::already_exists("Volume already exists"));
        }

        let ns_name = request.parameters.get(PVC_NAMESPACE_KEY).ok_or_else(|| {
            RpcError::invalid_argument("Namespace name parameter missing in request")
        })?;
        let pv_name = request
            .parameters
            .get(PV_NAME_KEY)
            .ok_or_else(|| RpcError::invalid_argument("PV name parameter missing in request"))?;
        let pvc_name = request
            .parameters
            .get(PVC_NAME_KEY)
            .ok_or_else(|| RpcError::invalid_argument("PVC name parameter missing in request"))?;

        let volume_id = Uuid::new_v4().to_string();
        let vol = self
            .volumes
            .create_volume(
                &volume_id,
                &request.name,
                pv_name,
                pvc_name,
                ns_name,
                capacity,
                is_block,
            )
            .await
            .map_err(|e| {
                RpcError::internal(format!("failed to create volume {volume_id}: {e}"))
            })?;

        log_info(
            COMPONENT,
            "CreateVolume succeeded",
            &[("volume_id", &vol.vol_id), ("path", &vol.vol_path)],
        );
        Ok(CreateVolumeResponse {
            volume: Volume {
                volume_id: vol.vol_id,
                capacity_bytes: vol.capacity,
                volume_context: request.parameters,
            },
        })
    }

    pub async fn delete_volume(
        &self,
        request: DeleteVolumeRequest,
    ) -> Result<DeleteVolumeResponse, RpcError> {
        let _serial = self.serialize.lock().await;

        if request.volume_id.is_empty() {
            return Err(RpcError::invalid_argument("Volume ID missing in request"));
        }

        let vol = self
            .catalog
            .get_volume(&request.volume_id)
            .await
            .map_err(|e| {
                RpcError::internal(format!(
                    "failed to get volume {}: {e}",
                    request.volume_id
                ))
            })?;
        let vol = match vol {
            Some(vol) => vol,
            // Deleting an unknown volume is the retry path; succeed.
            None => return Ok(DeleteVolumeResponse {}),
        };

        self.volumes.delete_volume(&vol).await.map_err(|e| {
            RpcError::internal(format!("failed to delete volume {}: {e}", vol.vol_id))
        })?;

        log_info(
            COMPONENT,
            "DeleteVolume succeeded",
            &[("volume_id", &request.volume_id)],
        );
        Ok(DeleteVolumeResponse {})
    }

    pub async fn controller_publish_volume(
        &self,
        request: ControllerPublishVolumeRequest,
    ) -> Result<ControllerPublishVolumeResponse, RpcError> {
        let _serial = self.serialize.lock().await;

        if request.volume_id.is_empty() {
            return Err(RpcError::invalid_argument(
                "ControllerPublishVolume volume ID must be provided",
            ));
        }
        if request.node_id.is_empty() {
            return Err(RpcError::invalid_argument(
                "ControllerPublishVolume node ID must be provided",
            ));
        }
        if request.volume_capability.is_none() {
            return Err(RpcError::invalid_argument(
                "ControllerPublishVolume volume capability must be provided",
            ));
        }

        self.catalog
            .get_volume(&request.volume_id)
            .await
            .map_err(RpcError::internal_error)?
            .ok_or_else(|| {
                RpcError::not_found(format!("volume {} not found", request.volume_id))
            })?;

        let node = self
            .catalog
            .get_node_if_fresh(&request.node_id, self.node_freshness)
            .await
            .map_err(|e| {
                RpcError::internal(format!(
                    "error checking node {}: {e}",
                    request.node_id
                ))
            })?;
        if node.is_none() {
            return Err(RpcError::not_found(format!(
                "node {} not found",
                request.node_id
            )));
        }

        if let Some(existing) = self
            .catalog
            .get_controller_publication(&request.volume_id, &request.node_id)
            .await
            .map_err(RpcError::internal_error)?
        {
            if existing.read_only != request.readonly {
                return Err(RpcError::already_exists(
                    "cannot publish: readonly status mismatch",
                ));
            }
            return Ok(ControllerPublishVolumeResponse::default());
        }

        self.catalog
            .create_controller_publication(&request.volume_id, &request.node_id, request.readonly)
            .await
            .map_err(RpcError::internal_error)?;

        log_info(
            COMPONENT,
            "ControllerPublishVolume succeeded",
            &[
                ("volume_id", &request.volume_id),
                ("node_id", &request.node_id),
            ],
        );
        Ok(ControllerPublishVolumeResponse::default())
    }

    pub async fn controller_unpublish_volume(
        &self,
        request: ControllerUnpublishVolumeRequest,
    ) -> Result<ControllerUnpublishVolumeResponse, RpcError> {
        let _serial = self.serialize.lock().await;

        if request.volume_id.is_empty() {
            return Err(RpcError::invalid_argument(
                "ControllerUnpublishVolume volume ID must be provided",
            ));
        }

        self.catalog
            .get_volume(&request.volume_id)
            .await
            .map_err(RpcError::internal_error)?
            .ok_or_else(|| {
                RpcError::not_found(format!("volume {} not found", request.volume_id))
            })?;

        let existing = self
            .catalog
            .get_controller_publication(&request.volume_id, &request.node_id)
            .await
            .map_err(RpcError::internal_error)?;
        if existing.is_some() {
            self.catalog
                .delete_controller_publication(&request.volume_id, &request.node_id)
                .await
                .map_err(RpcError::internal_error)?;
            log_info(
                COMPONENT,
                "ControllerUnpublishVolume succeeded",
                &[
                    ("volume_id", &request.volume_id),
                    ("node_id", &request.node_id),
                ],
            );
        }
        Ok(ControllerUnpublishVolumeResponse {})
    }

    pub async fn controller_expand_volume(
        &self,
        request: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse, RpcError> {
        let _serial = self.serialize.lock().await;

        if request.volume_id.is_empty() {
            return Err(RpcError::invalid_argument(
                "ControllerExpandVolume volume ID missing in request",
            ));
        }
        let range = request.capacity_range.as_ref().ok_or_else(|| {
            RpcError::invalid_argument("ControllerExpandVolume capacity range missing in request")
        })?;

        let new_capacity = fix_capacity(range.required_bytes.unwrap_or(0));
        if new_capacity >= MAX_STORAGE_CAPACITY {
            return Err(RpcError::out_of_range(format!(
                "Requested capacity {new_capacity} exceeds maximum allowed {MAX_STORAGE_CAPACITY}"
            )));
        }

        let vol = self
            .catalog
            .get_volume(&request.volume_id)
            .await
            .map_err(RpcError::internal_error)?
            .ok_or_else(|| {
                RpcError::not_found(format!("volume {} not found", request.volume_id))
            })?;

        if new_capacity <= vol.capacity {
            return Ok(ControllerExpandVolumeResponse {
                capacity_bytes: vol.capacity,
                node_expansion_required: false,
            });
        }

        let capacity = self
            .volumes
            .expand_volume(&vol, new_capacity)
            .await
            .map_err(|e| {
                RpcError::internal(format!(
                    "ControllerExpandVolume cannot update volume capacity: {e}"
                ))
            })?;

        Ok(ControllerExpandVolumeResponse {
            capacity_bytes: capacity,
            // Only loop-backed volumes carry node-side state to refresh.
            node_expansion_required: vol.is_block,
        })
    }

    pub async fn list_volumes(
        &self,
        request: ListVolumesRequest,
    ) -> Result<ListVolumesResponse, RpcError> {
        let offset = parse_starting_token(&request.starting_token)?;
        if request.max_entries < 0 {
            return Err(RpcError::invalid_argument(
                "ListVolumes max entries cannot be negative",
            ));
        }
        let limit = if request.max_entries == 0 {
            None
        } else {
            Some(request.max_entries)
        };

        let vols = self
            .catalog
            .list_volumes(offset, limit)
            .await
            .map_err(|e| {
                RpcError::internal(format!("ListVolumes cannot get volume list: {e}"))
            })?;

        let mut entries = Vec::with_capacity(vols.len());
        for vol in &vols {
            entries.push(self.volume_entry(vol).await?);
        }

        let total = self.catalog.count_volumes().await.map_err(|e| {
            RpcError::internal(format!("ListVolumes cannot count volumes: {e}"))
        })?;

        Ok(ListVolumesResponse {
            entries,
            next_token: next_starting_token(offset, request.max_entries, total),
        })
    }

    pub async fn controller_get_volume(
        &self,
        request: ControllerGetVolumeRequest,
    ) -> Result<ControllerGetVolumeResponse, RpcError> {
        if request.volume_id.is_empty() {
            return Err(RpcError::invalid_argument(
                "ControllerGetVolume volume ID missing in request",
            ));
        }

        let vol = self
            .catalog
            .get_volume(&request.volume_id)
            .await
            .map_err(RpcError::internal_error)?
            .ok_or_else(|| {
                RpcError::not_found(format!(
                    "ControllerGetVolume volume {} not found",
                    request.volume_id
                ))
            })?;

        let entry = self.volume_entry(&vol).await?;
        Ok(ControllerGetVolumeResponse {
            volume: entry.volume,
            status: entry.status,
        })
    }

    pub async fn validate_volume_capabilities(
        &self,
        request: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse, RpcError> {
        if request.volume_id.is_empty() {
            return Err(RpcError::invalid_argument("Volume ID cannot be empty"));
        }
        if request.volume_capabilities.is_empty() {
            return Err(RpcError::invalid_argument(
                "volume capabilities missing in request",
            ));
        }

        let vol = self
            .catalog
            .get_volume(&request.volume_id)
            .await
            .map_err(RpcError::internal_error)?
            .ok_or_else(|| RpcError::not_found(request.volume_id.clone()))?;

        for capability in &request.volume_capabilities {
            if !capability.is_block() && !capability.is_mount() {
                return Err(RpcError::invalid_argument(
                    "cannot have both mount and block access type be undefined",
                ));
            }
            if vol.is_block && capability.access_mode() != AccessMode::SingleNodeWriter {
                return Err(RpcError::invalid_argument(
                    "block backend can only be accessed as SINGLE_NODE_WRITER",
                ));
            }
        }

        Ok(ValidateVolumeCapabilitiesResponse {
            confirmed: Some(ConfirmedCapabilities {
                volume_context: request.volume_context,
                volume_capabilities: request.volume_capabilities,
                parameters: request.parameters,
            }),
        })
    }
}
