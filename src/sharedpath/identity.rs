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

use crate::sharedpath::error::RpcError;
use crate::sharedpath::types::{PluginInfoResponse, ProbeResponse};

/// Reports the driver's identity to the orchestrator.
#[derive(Clone)]
pub struct IdentityService {
    name: String,
    version: String,
}

impl IdentityService {
    pub fn new(name: String, version: String) -> Self {
        Self { name, version }
    }

    pub fn plugin_info(&self) -> Result<PluginInfoResponse, RpcError> {
        if self.name.is_empty() {
            return Err(RpcError::unavailable("Driver name not configured"));
        }
        if self.version.is_empty() {
            return Err(RpcError::unavailable("Driver is missing version"));
        }
        Ok(PluginInfoResponse {
            name: self.name.clone(),
            vendor_version: self.version.clone(),
        })
    }

    pub fn probe(&self) -> ProbeResponse {
        ProbeResponse { ready: true }
    }
}
