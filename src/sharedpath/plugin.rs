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
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::sharedpath::blockdev::LoopDevices;
use crate::sharedpath::controller::ControllerService;
use crate::sharedpath::identity::IdentityService;
use crate::sharedpath::logger::log_info;
use crate::sharedpath::node::NodeService;
use crate::sharedpath::server::{self, ServerState};
use crate::sharedpath::store::Catalog;
use crate::sharedpath::util::error::{new_error, with_context, DynResult};
use crate::sharedpath::volumes::VolumeManager;

const COMPONENT: &str = "plugin";

/// StorageClass parameter key selecting the backing artifact kind.
pub fn type_parameter(driver_name: &str) -> String {
    format!("{driver_name}/type")
}

/// StorageClass parameter key selecting the filesystem for disk volumes.
pub fn fstype_parameter(driver_name: &str) -> String {
    format!("{driver_name}/fsType")
}

/// Everything the process needs to assume a role.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub driver_name: String,
    pub node_id: String,
    pub endpoint: String,
    pub data_root: String,
    pub dsn: String,
    pub max_volumes_per_node: i64,
    pub node_freshness: Duration,
    pub version: String,
}

/// Assembled driver: the shared catalog and volume engine plus the config
/// the role-specific services are built from.
pub struct SharedPathDriver {
    config: DriverConfig,
    catalog: Catalog,
    volumes: VolumeManager,
}

impl SharedPathDriver {
    pub async fn new(config: DriverConfig) -> DynResult<Self> {
        if config.driver_name.is_empty() {
            return Err(new_error("no driver name provided"));
        }
        if config.node_id.is_empty() {
            return Err(new_error("no node id provided"));
        }
        if config.endpoint.is_empty() {
            return Err(new_error("no driver endpoint provided"));
        }
        if config.data_root.is_empty() {
            return Err(new_error("no data root provided"));
        }
        if config.dsn.is_empty() {
            return Err(new_error("no dsn (connstring) provided"));
        }

        let data_root = PathBuf::from(&config.data_root);
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o750)
            .create(&data_root)
            .map_err(|e| {
                with_context(e, format!("failed to create data root {}", config.data_root))
            })?;

        let catalog = Catalog::connect(&config.dsn).await?;
        let volumes = VolumeManager::new(&data_root, catalog.clone())?;

        log_info(
            COMPONENT,
            "Driver initialized",
            &[
                ("driver", &config.driver_name),
                ("version", &config.version),
            ],
        );

        Ok(Self {
            config,
            catalog,
            volumes,
        })
    }

    fn identity(&self) -> IdentityService {
        IdentityService::new(
            self.config.driver_name.clone(),
            self.config.version.clone(),
        )
    }

    pub async fn run_controller(self) -> DynResult<()> {
        let controller = ControllerService::new(
            self.volumes.clone(),
            type_parameter(&self.config.driver_name),
            self.config.node_freshness,
        );
        let state = ServerState::for_controller(self.identity(), controller);
        server::serve(&self.config.endpoint, state).await
    }

    pub async fn run_node(self) -> DynResult<()> {
        let node = NodeService::new(
            self.config.node_id.clone(),
            self.config.max_volumes_per_node,
            self.catalog.clone(),
            Arc::new(LoopDevices),
            type_parameter(&self.config.driver_name),
            fstype_parameter(&self.config.driver_name),
        );
        let state = ServerState::for_node(self.identity(), node);
        server::serve(&self.config.endpoint, state).await
    }
}

/// The reconciler jobs open the catalog, run to convergence, and exit; they
/// skip the endpoint and identity validation the long-running roles need.
pub struct ReconcilerJob {
    catalog: Catalog,
    volumes: VolumeManager,
}

impl ReconcilerJob {
    pub async fn new(data_root: &str, dsn: &str) -> DynResult<Self> {
        if data_root.is_empty() {
            return Err(new_error("no data root provided"));
        }
        if dsn.is_empty() {
            return Err(new_error("no dsn (connstring) provided"));
        }
        let catalog = Catalog::connect(dsn).await?;
        let volumes = VolumeManager::new(&PathBuf::from(data_root), catalog.clone())?;
        Ok(Self { catalog, volumes })
    }

    pub async fn rebuild_symlinks(self) -> DynResult<()> {
        let result = self.volumes.rebuild_symlinks().await;
        self.catalog.close().await;
        result
    }

    pub async fn cleanup_dangling_volumes(self) -> DynResult<()> {
        let result = self.volumes.cleanup_dangling_volumes().await;
        self.catalog.close().await;
        result
    }
}
