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
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HyperAcceptor;
use hyper_util::service::TowerToHyperService;
use tokio::net::UnixListener;

use crate::sharedpath::controller::ControllerService;
use crate::sharedpath::error::RpcError;
use crate::sharedpath::identity::IdentityService;
use crate::sharedpath::logger::{log_error, log_info};
use crate::sharedpath::node::NodeService;
use crate::sharedpath::types::*;
use crate::sharedpath::util::error::{new_error, with_context, DynResult};

const COMPONENT: &str = "server";

/// Services exposed over the CSI endpoint. Exactly one of controller and
/// node is present, depending on the process role.
pub struct ServerState {
    identity: IdentityService,
    controller: Option<ControllerService>,
    node: Option<NodeService>,
}

impl ServerState {
    pub fn for_controller(identity: IdentityService, controller: ControllerService) -> Self {
        Self {
            identity,
            controller: Some(controller),
            node: None,
        }
    }

    pub fn for_node(identity: IdentityService, node: NodeService) -> Self {
        Self {
            identity,
            controller: None,
            node: Some(node),
        }
    }

    fn controller(&self) -> Result<&ControllerService, RpcError> {
        self.controller
            .as_ref()
            .ok_or_else(|| RpcError::unimplemented("controller service not running"))
    }

    fn node(&self) -> Result<&NodeService, RpcError> {
        self.node
            .as_ref()
            .ok_or_else(|| RpcError::unimplemented("node service not running"))
    }
}

type SharedState = Arc<ServerState>;

async fn plugin_info(State(state): State<SharedState>) -> Result<Json<PluginInfoResponse>, RpcError> {
    state.identity.plugin_info().map(Json)
}

async fn probe(State(state): State<SharedState>) -> Json<ProbeResponse> {
    Json(state.identity.probe())
}

async fn controller_capabilities(
    State(state): State<SharedState>,
) -> Result<Json<Vec<ControllerServiceCapability>>, RpcError> {
    state.controller()?;
    Ok(Json(ControllerService::capabilities()))
}

async fn create_volume(
    State(state): State<SharedState>,
    Json(request): Json<CreateVolumeRequest>,
) -> Result<Json<CreateVolumeResponse>, RpcError> {
    state.controller()?.create_volume(request).await.map(Json)
}

async fn delete_volume(
    State(state): State<SharedState>,
    Json(request): Json<DeleteVolumeRequest>,
) -> Result<Json<DeleteVolumeResponse>, RpcError> {
    state.controller()?.delete_volume(request).await.map(Json)
}

async fn controller_publish_volume(
    State(state): State<SharedState>,
    Json(request): Json<ControllerPublishVolumeRequest>,
) -> Result<Json<ControllerPublishVolumeResponse>, RpcError> {
    state
        .controller()?
        .controller_publish_volume(request)
        .await
        .map(Json)
}

async fn controller_unpublish_volume(
    State(state): State<SharedState>,
    Json(request): Json<ControllerUnpublishVolumeRequest>,
) -> Result<Json<ControllerUnpublishVolumeResponse>, RpcError> {
    state
        .controller()?
        .controller_unpublish_volume(request)
        .await
        .map(Json)
}

async fn controller_expand_volume(
    State(state): State<SharedState>,
    Json(request): Json<ControllerExpandVolumeRequest>,
) -> Result<Json<ControllerExpandVolumeResponse>, RpcError> {
    state
        .controller()?
        .controller_expand_volume(request)
        .await
        .map(Json)
}

async fn list_volumes(
    State(state): State<SharedState>,
    Json(request): Json<ListVolumesRequest>,
) -> Result<Json<ListVolumesResponse>, RpcError> {
    state.controller()?.list_volumes(request).await.map(Json)
}

async fn controller_get_volume(
    State(state): State<SharedState>,
    Json(request): Json<ControllerGetVolumeRequest>,
) -> Result<Json<ControllerGetVolumeResponse>, RpcError> {
    state
        .controller()?
        .controller_get_volume(request)
        .await
        .map(Json)
}

async fn validate_volume_capabilities(
    State(state): State<SharedState>,
    Json(request): Json<ValidateVolumeCapabilitiesRequest>,
) -> Result<Json<ValidateVolumeCapabilitiesResponse>, RpcError> {
    state
        .controller()?
        .validate_volume_capabilities(request)
        .await
        .map(Json)
}

async fn unimplemented_rpc() -> RpcError {
    RpcError::unimplemented("")
}

async fn node_capabilities(
    State(state): State<SharedState>,
) -> Result<Json<Vec<NodeServiceCapability>>, RpcError> {
    state.node()?;
    Ok(Json(NodeService::capabilities()))
}

async fn node_get_info(
    State(state): State<SharedState>,
) -> Result<Json<NodeGetInfoResponse>, RpcError> {
    Ok(Json(state.node()?.node_get_info()))
}

async fn node_publish_volume(
    State(state): State<SharedState>,
    Json(request): Json<NodePublishVolumeRequest>,
) -> Result<Json<NodePublishVolumeResponse>, RpcError> {
    state.node()?.node_publish_volume(request).await.map(Json)
}

async fn node_unpublish_volume(
    State(state): State<SharedState>,
    Json(request): Json<NodeUnpublishVolumeRequest>,
) -> Result<Json<NodeUnpublishVolumeResponse>, RpcError> {
    state.node()?.node_unpublish_volume(request).await.map(Json)
}

async fn node_expand_volume(
    State(state): State<SharedState>,
    Json(request): Json<NodeExpandVolumeRequest>,
) -> Result<Json<NodeExpandVolumeResponse>, RpcError> {
    state.node()?.node_expand_volume(request).await.map(Json)
}

async fn node_get_volume_stats(
    State(state): State<SharedState>,
    Json(request): Json<NodeGetVolumeStatsRequest>,
) -> Result<Json<NodeGetVolumeStatsResponse>, RpcError> {
    state.node()?.node_get_volume_stats(request).await.map(Json)
}

fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/v1/identity/info", get(plugin_info))
        .route("/v1/identity/probe", get(probe))
        .route("/v1/controller/capabilities", get(controller_capabilities))
        .route("/v1/controller/create-volume", post(create_volume))
        .route("/v1/controller/delete-volume", post(delete_volume))
        .route(
            "/v1/controller/publish-volume",
            post(controller_publish_volume),
        )
        .route(
            "/v1/controller/unpublish-volume",
            post(controller_unpublish_volume),
        )
        .route(
            "/v1/controller/expand-volume",
            post(controller_expand_volume),
        )
        .route("/v1/controller/list-volumes", post(list_volumes))
        .route("/v1/controller/get-volume", post(controller_get_volume))
        .route(
            "/v1/controller/validate-volume-capabilities",
            post(validate_volume_capabilities),
        )
        .route("/v1/controller/create-snapshot", post(unimplemented_rpc))
        .route("/v1/controller/delete-snapshot", post(unimplemented_rpc))
        .route("/v1/controller/get-capacity", post(unimplemented_rpc))
        .route("/v1/node/capabilities", get(node_capabilities))
        .route("/v1/node/info", get(node_get_info))
        .route("/v1/node/publish-volume", post(node_publish_volume))
        .route("/v1/node/unpublish-volume", post(node_unpublish_volume))
        .route("/v1/node/expand-volume", post(node_expand_volume))
        .route("/v1/node/volume-stats", post(node_get_volume_stats))
        .with_state(state)
}

/// `unix://` endpoint notation to a socket path.
fn endpoint_socket_path(endpoint: &str) -> DynResult<PathBuf> {
    let path = match endpoint.split_once("://") {
        Some(("unix", rest)) => rest,
        Some((scheme, _)) => {
            return Err(new_error(format!("unsupported endpoint scheme '{scheme}'")))
        }
        None => endpoint,
    };
    if path.is_empty() {
        return Err(new_error("endpoint socket path is empty"));
    }
    Ok(PathBuf::from(path))
}

/// Serves the CSI surface on the configured UNIX socket until the process
/// exits.
pub async fn serve(endpoint: &str, state: ServerState) -> DynResult<()> {
    let socket_path = endpoint_socket_path(endpoint)?;
    if let Some(parent) = socket_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                with_context(
                    e,
                    format!("Failed to create socket directory {}", parent.display()),
                )
            })?;
        }
    }
    match fs::remove_file(&socket_path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(with_context(
                err,
                format!("Failed to remove stale socket {}", socket_path.display()),
            ))
        }
    }

    let listener = UnixListener::bind(&socket_path).map_err(|e| {
        with_context(
            e,
            format!("Failed to bind CSI endpoint {}", socket_path.display()),
        )
    })?;

    let app = build_router(Arc::new(state));
    let socket_text = socket_path.display().to_string();
    log_info(
        COMPONENT,
        "CSI endpoint listening",
        &[("socket", socket_text.as_str())],
    );

    loop {
        let (stream, _addr) = listener
            .accept()
            .await
            .map_err(|e| with_context(e, "Failed to accept incoming connection"))?;
        let service = TowerToHyperService::new(app.clone());
        let socket_text = socket_text.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            if let Err(err) = HyperAcceptor::new(TokioExecutor::new())
                .serve_connection_with_upgrades(io, service)
                .await
            {
                let should_log = err
                    .downcast_ref::<hyper::Error>()
                    .map(|hyper_err| !(hyper_err.is_closed() || hyper_err.is_incomplete_message()))
                    .unwrap_or(true);
                if should_log {
                    let error_text = err.to_string();
                    log_error(
                        COMPONENT,
                        "Serving error",
                        &[
                            ("socket", socket_text.as_str()),
                            ("error", error_text.as_str()),
                        ],
                    );
                }
            }
        });
    }
}
