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

//! Node RPC tests against a real catalog and an in-memory block device
//! mediator; mount-requiring paths stay with the e2e environment. Skipped
//! without `SHAREDPATH_TEST_DSN`.

use crate::support;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::TempDir;
use uuid::Uuid;

use csi_sharedpath::sharedpath::blockdev::{
    BlockDeviceError, BlockDeviceResult, BlockDevices, FilesystemStats,
};
use csi_sharedpath::sharedpath::error::Code;
use csi_sharedpath::sharedpath::node::NodeService;
use csi_sharedpath::sharedpath::plugin::{fstype_parameter, type_parameter};
use csi_sharedpath::sharedpath::store::Catalog;
use csi_sharedpath::sharedpath::types::*;
use csi_sharedpath::sharedpath::volumes::{VolumeManager, GIB};

const DRIVER_NAME: &str = "sharedpath.csi.k8s.io";

/// In-memory stand-in for the loop-device mediator.
#[derive(Default)]
struct FakeBlockDevices {
    rereads: AtomicUsize,
    resizes: AtomicUsize,
}

impl BlockDevices for FakeBlockDevices {
    fn attach(&self, _file: &Path) -> BlockDeviceResult<PathBuf> {
        Ok(PathBuf::from("/dev/loop9"))
    }

    fn loop_device(&self, _file: &Path) -> BlockDeviceResult<PathBuf> {
        Ok(PathBuf::from("/dev/loop9"))
    }

    fn detach(&self, _file: &Path) -> BlockDeviceResult<()> {
        Ok(())
    }

    fn reread_file_size(&self, _file: &Path) -> BlockDeviceResult<()> {
        self.rereads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn resize_filesystem(&self, _device: &Path, _mount_point: &Path) -> BlockDeviceResult<()> {
        self.resizes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn block_device_size(&self, _device: &Path) -> BlockDeviceResult<i64> {
        Ok(2 * GIB)
    }

    fn filesystem_stats(&self, _path: &Path) -> BlockDeviceResult<FilesystemStats> {
        Ok(FilesystemStats {
            available_bytes: GIB,
            total_bytes: 2 * GIB,
            used_bytes: GIB,
            available_inodes: 900,
            total_inodes: 1000,
            used_inodes: 100,
        })
    }
}

/// Mediator whose backing file lost its loop binding.
struct UnboundBlockDevices;

impl BlockDevices for UnboundBlockDevices {
    fn attach(&self, file: &Path) -> BlockDeviceResult<PathBuf> {
        Err(BlockDeviceError::Io(format!(
            "no free loop device for {}",
            file.display()
        )))
    }

    fn loop_device(&self, file: &Path) -> BlockDeviceResult<PathBuf> {
        Err(BlockDeviceError::NotFound(format!(
            "no loop device backs {}",
            file.display()
        )))
    }

    fn detach(&self, _file: &Path) -> BlockDeviceResult<()> {
        Ok(())
    }

    fn reread_file_size(&self, _file: &Path) -> BlockDeviceResult<()> {
        Ok(())
    }

    fn resize_filesystem(&self, _device: &Path, _mount_point: &Path) -> BlockDeviceResult<()> {
        Ok(())
    }

    fn block_device_size(&self, _device: &Path) -> BlockDeviceResult<i64> {
        Ok(0)
    }

    fn filesystem_stats(&self, _path: &Path) -> BlockDeviceResult<FilesystemStats> {
        Ok(FilesystemStats::default())
    }
}

struct Fixture {
    catalog: Catalog,
    volumes: VolumeManager,
    node: NodeService,
    node_id: String,
}

async fn node_fixture(dsn: &str, data_root: &Path, blockdev: Arc<dyn BlockDevices>) -> Fixture {
    let catalog = Catalog::connect(dsn).await.expect("connect catalog");
    let volumes = VolumeManager::new(data_root, catalog.clone()).expect("volume manager");
    let node_id = support::unique_name("node");
    let node = NodeService::new(
        node_id.clone(),
        0,
        catalog.clone(),
        blockdev,
        type_parameter(DRIVER_NAME),
        fstype_parameter(DRIVER_NAME),
    );
    Fixture {
        catalog,
        volumes,
        node,
        node_id,
    }
}

fn block_capability() -> VolumeCapability {
    VolumeCapability {
        access_mode: Some(AccessMode::SingleNodeWriter),
        mount: None,
        block: Some(BlockVolumeCapability {}),
    }
}

fn mount_capability() -> VolumeCapability {
    VolumeCapability {
        access_mode: Some(AccessMode::SingleNodeWriter),
        mount: Some(MountVolumeCapability::default()),
        block: None,
    }
}

#[tokio::test]
async fn publish_validates_request_and_volume_shape() {
    let dsn = match support::test_dsn() {
        Some(dsn) => dsn,
        None => return,
    };
    let _serial = support::serial_lock().lock().await;
    let data_root = TempDir::new().unwrap();
    let fixture = node_fixture(&dsn, data_root.path(), Arc::new(FakeBlockDevices::default())).await;

    // Required fields.
    let err = fixture
        .node
        .node_publish_volume(NodePublishVolumeRequest {
            volume_id: "v".into(),
            target_path: "/t".into(),
            volume_capability: None,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let err = fixture
        .node
        .node_publish_volume(NodePublishVolumeRequest {
            volume_id: String::new(),
            target_path: "/t".into(),
            volume_capability: Some(mount_capability()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    // Unknown volume.
    let err = fixture
        .node
        .node_publish_volume(NodePublishVolumeRequest {
            volume_id: Uuid::new_v4().to_string(),
            target_path: "/t".into(),
            volume_capability: Some(mount_capability()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    // A folder volume cannot be published as a raw block device, and a
    // disk-typed mount of it contradicts the catalog.
    let vol = fixture
        .volumes
        .create_volume(
            &Uuid::new_v4().to_string(),
            &support::unique_name("folder"),
            "pv",
            "pvc-node",
            "ns-node",
            GIB,
            false,
        )
        .await
        .expect("create folder volume");

    let target = data_root.path().join("target");
    let err = fixture
        .node
        .node_publish_volume(NodePublishVolumeRequest {
            volume_id: vol.vol_id.clone(),
            target_path: target.display().to_string(),
            volume_capability: Some(block_capability()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let mut context = HashMap::new();
    context.insert(type_parameter(DRIVER_NAME), "disk".to_string());
    let err = fixture
        .node
        .node_publish_volume(NodePublishVolumeRequest {
            volume_id: vol.vol_id.clone(),
            target_path: target.display().to_string(),
            volume_capability: Some(mount_capability()),
            volume_context: context,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    // Unknown and missing <driver>/type values.
    let mut context = HashMap::new();
    context.insert(type_parameter(DRIVER_NAME), "tape".to_string());
    let err = fixture
        .node
        .node_publish_volume(NodePublishVolumeRequest {
            volume_id: vol.vol_id.clone(),
            target_path: target.display().to_string(),
            volume_capability: Some(mount_capability()),
            volume_context: context,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let err = fixture
        .node
        .node_publish_volume(NodePublishVolumeRequest {
            volume_id: vol.vol_id.clone(),
            target_path: target.display().to_string(),
            volume_capability: Some(mount_capability()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    fixture.volumes.delete_volume(&vol).await.unwrap();
    fixture.volumes.cleanup_dangling_volumes().await.unwrap();
    fixture.catalog.close().await;
}

#[tokio::test]
async fn expand_is_a_noop_for_folder_volumes() {
    let dsn = match support::test_dsn() {
        Some(dsn) => dsn,
        None => return,
    };
    let _serial = support::serial_lock().lock().await;
    let data_root = TempDir::new().unwrap();
    let fake = Arc::new(FakeBlockDevices::default());
    let fixture = node_fixture(&dsn, data_root.path(), fake.clone()).await;

    let vol = fixture
        .volumes
        .create_volume(
            &Uuid::new_v4().to_string(),
            &support::unique_name("folder"),
            "pv",
            "pvc-exp",
            "ns-exp",
            GIB,
            false,
        )
        .await
        .unwrap();

    fixture
        .node
        .node_expand_volume(NodeExpandVolumeRequest {
            volume_id: vol.vol_id.clone(),
            volume_path: "/ignored".into(),
            ..Default::default()
        })
        .await
        .expect("folder expand no-op");
    assert_eq!(fake.rereads.load(Ordering::SeqCst), 0);

    fixture.volumes.delete_volume(&vol).await.unwrap();
    fixture.volumes.cleanup_dangling_volumes().await.unwrap();
    fixture.catalog.close().await;
}

#[tokio::test]
async fn expand_rereads_capacity_for_raw_block_publications() {
    let dsn = match support::test_dsn() {
        Some(dsn) => dsn,
        None => return,
    };
    let _serial = support::serial_lock().lock().await;
    let data_root = TempDir::new().unwrap();
    let fake = Arc::new(FakeBlockDevices::default());
    let fixture = node_fixture(&dsn, data_root.path(), fake.clone()).await;

    let vol = fixture
        .volumes
        .create_volume(
            &Uuid::new_v4().to_string(),
            &support::unique_name("disk"),
            "pv",
            "pvc-raw",
            "ns-raw",
            GIB,
            true,
        )
        .await
        .unwrap();

    // Raw block publications have no filesystem to resize, so the reread is
    // the whole job.
    fixture
        .node
        .node_expand_volume(NodeExpandVolumeRequest {
            volume_id: vol.vol_id.clone(),
            volume_path: "/unmounted".into(),
            volume_capability: Some(block_capability()),
            ..Default::default()
        })
        .await
        .expect("raw block expand");
    assert_eq!(fake.rereads.load(Ordering::SeqCst), 1);
    assert_eq!(fake.resizes.load(Ordering::SeqCst), 0);

    // The filesystem path demands a mounted target.
    let err = fixture
        .node
        .node_expand_volume(NodeExpandVolumeRequest {
            volume_id: vol.vol_id.clone(),
            volume_path: "/definitely-not-mounted".into(),
            volume_capability: Some(mount_capability()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    fixture.volumes.delete_volume(&vol).await.unwrap();
    fixture.volumes.cleanup_dangling_volumes().await.unwrap();
    fixture.catalog.close().await;
}

#[tokio::test]
async fn expand_surfaces_missing_loop_bindings() {
    let dsn = match support::test_dsn() {
        Some(dsn) => dsn,
        None => return,
    };
    let _serial = support::serial_lock().lock().await;
    let data_root = TempDir::new().unwrap();
    let fixture = node_fixture(&dsn, data_root.path(), Arc::new(UnboundBlockDevices)).await;

    let vol = fixture
        .volumes
        .create_volume(
            &Uuid::new_v4().to_string(),
            &support::unique_name("disk"),
            "pv",
            "pvc-unbound",
            "ns-unbound",
            GIB,
            true,
        )
        .await
        .unwrap();

    let err = fixture
        .node
        .node_expand_volume(NodeExpandVolumeRequest {
            volume_id: vol.vol_id.clone(),
            volume_path: "/t".into(),
            volume_capability: Some(block_capability()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert!(err.message().contains("loop device"));

    fixture.volumes.delete_volume(&vol).await.unwrap();
    fixture.volumes.cleanup_dangling_volumes().await.unwrap();
    fixture.catalog.close().await;
}

#[tokio::test]
async fn volume_stats_require_a_recorded_publication() {
    let dsn = match support::test_dsn() {
        Some(dsn) => dsn,
        None => return,
    };
    let _serial = support::serial_lock().lock().await;
    let data_root = TempDir::new().unwrap();
    let fixture = node_fixture(&dsn, data_root.path(), Arc::new(FakeBlockDevices::default())).await;

    let vol = fixture
        .volumes
        .create_volume(
            &Uuid::new_v4().to_string(),
            &support::unique_name("stats"),
            "pv",
            "pvc-stats",
            "ns-stats",
            GIB,
            false,
        )
        .await
        .unwrap();

    let err = fixture
        .node
        .node_get_volume_stats(NodeGetVolumeStatsRequest {
            volume_id: vol.vol_id.clone(),
            volume_path: vol.vol_path.clone(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    fixture
        .catalog
        .create_node_publication(&vol.vol_id, &fixture.node_id, &vol.vol_path, false, false)
        .await
        .unwrap();

    let stats = fixture
        .node
        .node_get_volume_stats(NodeGetVolumeStatsRequest {
            volume_id: vol.vol_id.clone(),
            volume_path: vol.vol_path.clone(),
        })
        .await
        .expect("volume stats");
    assert!(!stats.volume_condition.abnormal);
    assert_eq!(stats.usage.len(), 2);
    assert_eq!(stats.usage[0].unit, UsageUnit::Bytes);
    assert_eq!(stats.usage[0].total, Some(2 * GIB));
    assert_eq!(stats.usage[1].unit, UsageUnit::Inodes);
    assert_eq!(stats.usage[1].total, Some(1000));

    fixture
        .catalog
        .delete_node_publication(&vol.vol_id, &fixture.node_id, &vol.vol_path)
        .await
        .unwrap();
    fixture.volumes.delete_volume(&vol).await.unwrap();
    fixture.volumes.cleanup_dangling_volumes().await.unwrap();
    fixture.catalog.close().await;
}
