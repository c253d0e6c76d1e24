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

//! Controller RPC scenarios against a real catalog; skipped without
//! `SHAREDPATH_TEST_DSN`.

use crate::support;

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;

use csi_sharedpath::sharedpath::controller::{
    ControllerService, PVC_NAMESPACE_KEY, PVC_NAME_KEY, PV_NAME_KEY,
};
use csi_sharedpath::sharedpath::error::Code;
use csi_sharedpath::sharedpath::plugin::type_parameter;
use csi_sharedpath::sharedpath::store::Catalog;
use csi_sharedpath::sharedpath::types::*;
use csi_sharedpath::sharedpath::volumes::{VolumeManager, GIB};

const DRIVER_NAME: &str = "sharedpath.csi.k8s.io";

async fn controller_fixture(dsn: &str, data_root: &Path) -> ControllerService {
    let catalog = Catalog::connect(dsn).await.expect("connect catalog");
    let volumes = VolumeManager::new(data_root, catalog).expect("create volume manager");
    ControllerService::new(
        volumes,
        type_parameter(DRIVER_NAME),
        Duration::from_secs(30),
    )
}

fn mount_capability() -> VolumeCapability {
    VolumeCapability {
        access_mode: Some(AccessMode::SingleNodeWriter),
        mount: Some(MountVolumeCapability::default()),
        block: None,
    }
}

fn folder_parameters(pv: &str, pvc: &str, ns: &str) -> HashMap<String, String> {
    let mut parameters = HashMap::new();
    parameters.insert(type_parameter(DRIVER_NAME), "folder".to_string());
    parameters.insert(PV_NAME_KEY.to_string(), pv.to_string());
    parameters.insert(PVC_NAME_KEY.to_string(), pvc.to_string());
    parameters.insert(PVC_NAMESPACE_KEY.to_string(), ns.to_string());
    parameters
}

fn create_request(
    name: &str,
    required_bytes: i64,
    parameters: HashMap<String, String>,
) -> CreateVolumeRequest {
    CreateVolumeRequest {
        name: name.to_string(),
        capacity_range: Some(CapacityRange {
            required_bytes: Some(required_bytes),
            limit_bytes: None,
        }),
        volume_capabilities: vec![mount_capability()],
        parameters,
    }
}

async fn remove_volume(controller: &ControllerService, volume_id: &str) {
    controller
        .delete_volume(DeleteVolumeRequest {
            volume_id: volume_id.to_string(),
        })
        .await
        .expect("delete volume");
}

#[tokio::test]
async fn create_volume_validates_request_shape() {
    let dsn = match support::test_dsn() {
        Some(dsn) => dsn,
        None => return,
    };
    let _serial = support::serial_lock().lock().await;
    let data_root = TempDir::new().unwrap();
    let controller = controller_fixture(&dsn, data_root.path()).await;

    let err = controller
        .create_volume(create_request("", GIB, folder_parameters("pv", "pvc", "ns")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let mut no_caps = create_request(
        &support::unique_name("v"),
        GIB,
        folder_parameters("pv", "pvc", "ns"),
    );
    no_caps.volume_capabilities.clear();
    let err = controller.create_volume(no_caps).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    // Missing the <driver>/type parameter.
    let mut parameters = folder_parameters("pv", "pvc", "ns");
    parameters.remove(&type_parameter(DRIVER_NAME));
    let err = controller
        .create_volume(create_request(&support::unique_name("v"), GIB, parameters))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    // Block and mount capabilities together contradict each other.
    let mut both = create_request(
        &support::unique_name("v"),
        GIB,
        folder_parameters("pv", "pvc", "ns"),
    );
    both.volume_capabilities.push(VolumeCapability {
        access_mode: Some(AccessMode::SingleNodeWriter),
        mount: None,
        block: Some(BlockVolumeCapability {}),
    });
    let err = controller.create_volume(both).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn capacity_rules_floor_and_ceiling() {
    let dsn = match support::test_dsn() {
        Some(dsn) => dsn,
        None => return,
    };
    let _serial = support::serial_lock().lock().await;
    let data_root = TempDir::new().unwrap();
    let controller = controller_fixture(&dsn, data_root.path()).await;

    let err = controller
        .create_volume(create_request(
            &support::unique_name("big"),
            1 << 40,
            folder_parameters("pv", "pvc", "ns"),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::OutOfRange);

    // Tiny requests are floored at 1 GiB.
    let response = controller
        .create_volume(create_request(
            &support::unique_name("small"),
            1500,
            folder_parameters("pv-small", "pvc-small", "ns-small"),
        ))
        .await
        .expect("create small volume");
    assert_eq!(response.volume.capacity_bytes, GIB);

    remove_volume(&controller, &response.volume.volume_id).await;
}

#[tokio::test]
async fn create_volume_is_idempotent_by_name() {
    let dsn = match support::test_dsn() {
        Some(dsn) => dsn,
        None => return,
    };
    let _serial = support::serial_lock().lock().await;
    let data_root = TempDir::new().unwrap();
    let controller = controller_fixture(&dsn, data_root.path()).await;

    let name = support::unique_name("v1");
    let parameters = folder_parameters("pv1", "pvc1", "ns1");

    let first = controller
        .create_volume(create_request(&name, GIB, parameters.clone()))
        .await
        .expect("first create");
    let second = controller
        .create_volume(create_request(&name, GIB, parameters.clone()))
        .await
        .expect("second create");
    assert_eq!(first.volume.volume_id, second.volume.volume_id);

    let err = controller
        .create_volume(create_request(&name, 2 * GIB, parameters))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::AlreadyExists);

    remove_volume(&controller, &first.volume.volume_id).await;
}

#[tokio::test]
async fn delete_volume_is_idempotent() {
    let dsn = match support::test_dsn() {
        Some(dsn) => dsn,
        None => return,
    };
    let _serial = support::serial_lock().lock().await;
    let data_root = TempDir::new().unwrap();
    let controller = controller_fixture(&dsn, data_root.path()).await;

    let err = controller
        .delete_volume(DeleteVolumeRequest {
            volume_id: String::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    // Unknown ids succeed: the orchestrator retries deletes.
    controller
        .delete_volume(DeleteVolumeRequest {
            volume_id: uuid::Uuid::new_v4().to_string(),
        })
        .await
        .expect("delete unknown volume");
}

#[tokio::test]
async fn publish_requires_a_fresh_node() {
    let dsn = match support::test_dsn() {
        Some(dsn) => dsn,
        None => return,
    };
    let _serial = support::serial_lock().lock().await;
    let data_root = TempDir::new().unwrap();
    let controller = controller_fixture(&dsn, data_root.path()).await;
    let catalog = Catalog::connect(&dsn).await.unwrap();

    let created = controller
        .create_volume(create_request(
            &support::unique_name("pub"),
            GIB,
            folder_parameters("pv-pub", "pvc-pub", "ns-pub"),
        ))
        .await
        .expect("create volume");
    let volume_id = created.volume.volume_id.clone();

    let stale_node = support::unique_name("node-stale");
    catalog
        .upsert_node_last_seen(&stale_node, chrono::Utc::now() - chrono::Duration::seconds(60))
        .await
        .unwrap();
    let err = controller
        .controller_publish_volume(ControllerPublishVolumeRequest {
            volume_id: volume_id.clone(),
            node_id: stale_node,
            volume_capability: Some(mount_capability()),
            readonly: false,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    let fresh_node = support::unique_name("node-fresh");
    catalog
        .upsert_node_last_seen(&fresh_node, chrono::Utc::now())
        .await
        .unwrap();
    controller
        .controller_publish_volume(ControllerPublishVolumeRequest {
            volume_id: volume_id.clone(),
            node_id: fresh_node.clone(),
            volume_capability: Some(mount_capability()),
            readonly: false,
        })
        .await
        .expect("publish to fresh node");

    // Re-publishing with the same readonly flag is idempotent; flipping the
    // flag conflicts.
    controller
        .controller_publish_volume(ControllerPublishVolumeRequest {
            volume_id: volume_id.clone(),
            node_id: fresh_node.clone(),
            volume_capability: Some(mount_capability()),
            readonly: false,
        })
        .await
        .expect("republish with same flag");
    let err = controller
        .controller_publish_volume(ControllerPublishVolumeRequest {
            volume_id: volume_id.clone(),
            node_id: fresh_node.clone(),
            volume_capability: Some(mount_capability()),
            readonly: true,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::AlreadyExists);

    let listed = controller
        .controller_get_volume(ControllerGetVolumeRequest {
            volume_id: volume_id.clone(),
        })
        .await
        .expect("get volume");
    assert!(listed.status.published_node_ids.contains(&fresh_node));

    controller
        .controller_unpublish_volume(ControllerUnpublishVolumeRequest {
            volume_id: volume_id.clone(),
            node_id: fresh_node.clone(),
        })
        .await
        .expect("unpublish");
    // Unpublish is idempotent.
    controller
        .controller_unpublish_volume(ControllerUnpublishVolumeRequest {
            volume_id: volume_id.clone(),
            node_id: fresh_node,
        })
        .await
        .expect("unpublish again");

    remove_volume(&controller, &volume_id).await;
    catalog.close().await;
}

#[tokio::test]
async fn expand_volume_grows_disk_volumes() {
    let dsn = match support::test_dsn() {
        Some(dsn) => dsn,
        None => return,
    };
    let _serial = support::serial_lock().lock().await;
    let data_root = TempDir::new().unwrap();
    let controller = controller_fixture(&dsn, data_root.path()).await;
    let catalog = Catalog::connect(&dsn).await.unwrap();

    let mut parameters = folder_parameters("pv-disk", "pvc-disk", "ns-disk");
    parameters.insert(type_parameter(DRIVER_NAME), "disk".to_string());
    parameters.insert(
        format!("{DRIVER_NAME}/fsType"),
        "xfs".to_string(),
    );

    let created = controller
        .create_volume(create_request(
            &support::unique_name("disk"),
            GIB,
            parameters,
        ))
        .await
        .expect("create disk volume");
    let volume_id = created.volume.volume_id.clone();

    let row = catalog.get_volume(&volume_id).await.unwrap().unwrap();
    assert!(row.is_block);
    assert_eq!(fs::metadata(&row.vol_path).unwrap().len(), GIB as u64);

    let expanded = controller
        .controller_expand_volume(ControllerExpandVolumeRequest {
            volume_id: volume_id.clone(),
            capacity_range: Some(CapacityRange {
                required_bytes: Some(2 * GIB),
                limit_bytes: None,
            }),
        })
        .await
        .expect("expand volume");
    assert_eq!(expanded.capacity_bytes, 2 * GIB);
    assert!(expanded.node_expansion_required);
    assert_eq!(fs::metadata(&row.vol_path).unwrap().len(), 2 * GIB as u64);

    // A request at or below the current capacity returns it unchanged.
    let unchanged = controller
        .controller_expand_volume(ControllerExpandVolumeRequest {
            volume_id: volume_id.clone(),
            capacity_range: Some(CapacityRange {
                required_bytes: Some(GIB),
                limit_bytes: None,
            }),
        })
        .await
        .expect("no-op expand");
    assert_eq!(unchanged.capacity_bytes, 2 * GIB);
    assert!(!unchanged.node_expansion_required);

    let err = controller
        .controller_expand_volume(ControllerExpandVolumeRequest {
            volume_id: volume_id.clone(),
            capacity_range: Some(CapacityRange {
                required_bytes: Some(1 << 40),
                limit_bytes: None,
            }),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::OutOfRange);

    remove_volume(&controller, &volume_id).await;
    catalog.close().await;
}

#[tokio::test]
async fn list_volumes_paginates_with_integer_tokens() {
    let dsn = match support::test_dsn() {
        Some(dsn) => dsn,
        None => return,
    };
    let _serial = support::serial_lock().lock().await;
    let data_root = TempDir::new().unwrap();
    let controller = controller_fixture(&dsn, data_root.path()).await;

    let err = controller
        .list_volumes(ListVolumesRequest {
            max_entries: 0,
            starting_token: "not-a-number".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Aborted);

    let mut ids = Vec::new();
    for index in 0..3 {
        let response = controller
            .create_volume(create_request(
                &support::unique_name("list"),
                GIB,
                folder_parameters(
                    &format!("pv-list-{index}"),
                    &format!("pvc-list-{index}"),
                    "ns-list",
                ),
            ))
            .await
            .expect("create volume");
        ids.push(response.volume.volume_id);
    }

    let bounded = controller
        .list_volumes(ListVolumesRequest {
            max_entries: 2,
            starting_token: String::new(),
        })
        .await
        .expect("bounded listing");
    assert!(bounded.entries.len() <= 2);
    assert!(bounded.next_token.is_some());

    let unbounded = controller
        .list_volumes(ListVolumesRequest {
            max_entries: 0,
            starting_token: String::new(),
        })
        .await
        .expect("unbounded listing");
    assert!(unbounded.next_token.is_none());
    for id in &ids {
        let entry = unbounded
            .entries
            .iter()
            .find(|entry| &entry.volume.volume_id == id)
            .expect("created volume listed");
        assert!(!entry.status.volume_condition.abnormal);
    }

    for id in &ids {
        remove_volume(&controller, id).await;
    }
}

#[tokio::test]
async fn validate_volume_capabilities_checks_access_modes() {
    let dsn = match support::test_dsn() {
        Some(dsn) => dsn,
        None => return,
    };
    let _serial = support::serial_lock().lock().await;
    let data_root = TempDir::new().unwrap();
    let controller = controller_fixture(&dsn, data_root.path()).await;

    let err = controller
        .validate_volume_capabilities(ValidateVolumeCapabilitiesRequest {
            volume_id: uuid::Uuid::new_v4().to_string(),
            volume_capabilities: vec![mount_capability()],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    let created = controller
        .create_volume(create_request(
            &support::unique_name("val"),
            GIB,
            folder_parameters("pv-val", "pvc-val", "ns-val"),
        ))
        .await
        .expect("create volume");

    // Empty capability lists carry a descriptive message, not the volume id.
    let err = controller
        .validate_volume_capabilities(ValidateVolumeCapabilitiesRequest {
            volume_id: created.volume.volume_id.clone(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(err.message().contains("capabilities"));

    let confirmed = controller
        .validate_volume_capabilities(ValidateVolumeCapabilitiesRequest {
            volume_id: created.volume.volume_id.clone(),
            volume_capabilities: vec![mount_capability()],
            ..Default::default()
        })
        .await
        .expect("validate capabilities");
    assert!(confirmed.confirmed.is_some());

    remove_volume(&controller, &created.volume.volume_id).await;
}
