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

use std::time::Duration;

use clap::Parser;

use csi_sharedpath::sharedpath::cli::{DriverArgs, Role};
use csi_sharedpath::sharedpath::logger::{log_error, set_log_format};
use csi_sharedpath::sharedpath::plugin::{DriverConfig, ReconcilerJob, SharedPathDriver};
use csi_sharedpath::sharedpath::util::error::DynResult;

#[tokio::main]
async fn main() {
    let args = DriverArgs::parse();
    set_log_format(args.log_format.into());

    if let Err(err) = run(args).await {
        log_error("main", "Driver failed", &[("error", &err.to_string())]);
        std::process::exit(1);
    }
}

async fn run(args: DriverArgs) -> DynResult<()> {
    match args.role() {
        Role::Controller | Role::Node => {
            let config = DriverConfig {
                driver_name: args.drivername.clone(),
                node_id: args.nodeid.clone(),
                endpoint: args.endpoint.clone(),
                data_root: args.dataroot.clone(),
                dsn: args.dsn.clone(),
                max_volumes_per_node: args.maxvolumespernode,
                node_freshness: Duration::from_secs(args.node_freshness_seconds),
                version: env!("CARGO_PKG_VERSION").to_string(),
            };
            let driver = SharedPathDriver::new(config).await?;
            if args.role() == Role::Controller {
                driver.run_controller().await
            } else {
                driver.run_node().await
            }
        }
        Role::RebuildSymlinks => {
            ReconcilerJob::new(&args.dataroot, &args.dsn)
                .await?
                .rebuild_symlinks()
                .await
        }
        Role::CleanupDangling => {
            ReconcilerJob::new(&args.dataroot, &args.dsn)
                .await?
                .cleanup_dangling_volumes()
                .await
        }
    }
}
