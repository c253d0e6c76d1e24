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

use clap::{ArgGroup, Parser, ValueEnum};

use crate::sharedpath::logger::LogFormat;

/// Shared-hostpath CSI driver: controller and node agents plus the
/// reconciler jobs, selected by exactly one role flag.
#[derive(Parser, Debug)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
#[command(group(
    ArgGroup::new("role")
        .required(true)
        .args(["controller", "node", "job_rebuildsymlinks", "job_cleanupdangling"]),
))]
pub struct DriverArgs {
    /// Run the controller service
    #[arg(long)]
    pub controller: bool,

    /// Run the node service
    #[arg(long)]
    pub node: bool,

    /// Rebuild the symlink tree, then exit
    #[arg(long = "job-rebuildsymlinks")]
    pub job_rebuildsymlinks: bool,

    /// Reclaim dangling volumes, then exit
    #[arg(long = "job-cleanupdangling")]
    pub job_cleanupdangling: bool,

    /// CSI endpoint
    #[arg(long, default_value = "unix:///tmp/csi.sock")]
    pub endpoint: String,

    /// Name of the driver
    #[arg(long, default_value = "sharedpath.csi.k8s.io")]
    pub drivername: String,

    /// Node id
    #[arg(long, default_value = "")]
    pub nodeid: String,

    /// Root of the shared host directory
    #[arg(long, default_value = "/csi-data-dir")]
    pub dataroot: String,

    /// Volume catalog connection string
    #[arg(long, default_value = "")]
    pub dsn: String,

    /// Limit of volumes per node (0 means unlimited)
    #[arg(long, default_value_t = 0)]
    pub maxvolumespernode: i64,

    /// How recent a node heartbeat must be for ControllerPublishVolume
    #[arg(long = "node-freshness-seconds", default_value_t = 30)]
    pub node_freshness_seconds: u64,

    /// Log line format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormatArg::Text)]
    pub log_format: LogFormatArg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

/// The process role the flags select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Controller,
    Node,
    RebuildSymlinks,
    CleanupDangling,
}

impl DriverArgs {
    pub fn role(&self) -> Role {
        if self.controller {
            Role::Controller
        } else if self.node {
            Role::Node
        } else if self.job_rebuildsymlinks {
            Role::RebuildSymlinks
        } else {
            Role::CleanupDangling
        }
    }
}
