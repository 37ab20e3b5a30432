//! Volume Plugin Protocol Handlers
//!
//! Implements the container runtime's volume plugin HTTP/JSON protocol on
//! top of the [`VolumeBridge`]. Every endpoint is a POST; failures are
//! reported in the `Err` field of an otherwise normal response.

use crate::bridge::lifecycle::{PluginCapabilities, VolumeBridge, VolumeInfo};
use crate::error::{Error, Result};
use axum::{
    body::Bytes,
    extract::State,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Body of every per-volume request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub opts: Option<HashMap<String, String>>,
    /// Caller id, sent with mount and unmount
    #[serde(rename = "ID", default)]
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PluginVolume {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<String>,
}

impl From<VolumeInfo> for PluginVolume {
    fn from(info: VolumeInfo) -> Self {
        Self {
            name: info.name,
            mountpoint: info.mountpoint,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PluginResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<PluginVolume>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<PluginVolume>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<PluginCapabilities>,
    #[serde(default)]
    pub err: String,
}

impl PluginResponse {
    fn failed(op: &str, name: &str, err: &Error) -> Self {
        let message = match err {
            // already name the operation and volume
            Error::UnknownVolume { .. } | Error::NotMounted { .. } => err.to_string(),
            _ if name.is_empty() => format!("{}: {}", op, err),
            _ => format!("{} {}: {}", op, name, err),
        };
        warn!(
            op,
            volume_name = name,
            error = %err,
            action = ?err.action(),
            "plugin request failed"
        );
        Self {
            err: message,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActivateResponse {
    pub implements: Vec<String>,
}

// =============================================================================
// Router
// =============================================================================

/// Plugin protocol router builder
pub struct PluginRouter {
    bridge: Arc<VolumeBridge>,
}

impl PluginRouter {
    pub fn new(bridge: Arc<VolumeBridge>) -> Self {
        Self { bridge }
    }

    pub fn build(self) -> Router {
        Router::new()
            .route("/Plugin.Activate", post(activate))
            .route("/VolumeDriver.Create", post(create_volume))
            .route("/VolumeDriver.Remove", post(remove_volume))
            .route("/VolumeDriver.Mount", post(mount_volume))
            .route("/VolumeDriver.Unmount", post(unmount_volume))
            .route("/VolumeDriver.Path", post(volume_path))
            .route("/VolumeDriver.Get", post(get_volume))
            .route("/VolumeDriver.List", post(list_volumes))
            .route("/VolumeDriver.Capabilities", post(capabilities))
            .layer(TraceLayer::new_for_http())
            .with_state(self.bridge)
    }
}

type AppState = Arc<VolumeBridge>;

/// The runtime sends a vendor content type, so bodies are parsed by hand
fn parse_body<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(body)?)
}

fn bad_request(op: &str, err: Error) -> Response {
    Json(PluginResponse::failed(op, "", &err)).into_response()
}

// =============================================================================
// Handlers
// =============================================================================

async fn activate() -> Json<ActivateResponse> {
    debug!("plugin activated");
    Json(ActivateResponse {
        implements: vec!["VolumeDriver".to_string()],
    })
}

async fn create_volume(State(bridge): State<AppState>, body: Bytes) -> Response {
    let request: VolumeRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(e) => return bad_request("create", e),
    };
    let options = request.opts.unwrap_or_default();

    let response = match bridge.create(&request.name, &options).await {
        Ok(()) => PluginResponse::default(),
        Err(e) => PluginResponse::failed("create", &request.name, &e),
    };
    Json(response).into_response()
}

async fn remove_volume(State(bridge): State<AppState>, body: Bytes) -> Response {
    let request: VolumeRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(e) => return bad_request("remove", e),
    };

    let response = match bridge.remove(&request.name).await {
        Ok(()) => PluginResponse::default(),
        Err(e) => PluginResponse::failed("remove", &request.name, &e),
    };
    Json(response).into_response()
}

async fn mount_volume(State(bridge): State<AppState>, body: Bytes) -> Response {
    let request: VolumeRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(e) => return bad_request("mount", e),
    };

    let response = match bridge.mount(&request.name).await {
        Ok(mountpoint) => PluginResponse {
            mountpoint: Some(mountpoint),
            ..Default::default()
        },
        Err(e) => PluginResponse::failed("mount", &request.name, &e),
    };
    Json(response).into_response()
}

async fn unmount_volume(State(bridge): State<AppState>, body: Bytes) -> Response {
    let request: VolumeRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(e) => return bad_request("unmount", e),
    };

    let response = match bridge.unmount(&request.name).await {
        Ok(()) => PluginResponse::default(),
        Err(e) => PluginResponse::failed("unmount", &request.name, &e),
    };
    Json(response).into_response()
}

async fn volume_path(State(bridge): State<AppState>, body: Bytes) -> Response {
    let request: VolumeRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(e) => return bad_request("path", e),
    };

    let response = match bridge.path(&request.name) {
        Ok(mountpoint) => PluginResponse {
            mountpoint: Some(mountpoint),
            ..Default::default()
        },
        Err(e) => PluginResponse::failed("path", &request.name, &e),
    };
    Json(response).into_response()
}

async fn get_volume(State(bridge): State<AppState>, body: Bytes) -> Response {
    let request: VolumeRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(e) => return bad_request("get", e),
    };

    let response = match bridge.get(&request.name) {
        Ok(info) => PluginResponse {
            volume: Some(info.into()),
            ..Default::default()
        },
        Err(e) => PluginResponse::failed("get", &request.name, &e),
    };
    Json(response).into_response()
}

async fn list_volumes(State(bridge): State<AppState>) -> Response {
    let response = match bridge.list().await {
        Ok(volumes) => PluginResponse {
            volumes: Some(volumes.into_iter().map(PluginVolume::from).collect()),
            ..Default::default()
        },
        Err(e) => PluginResponse::failed("list", "", &e),
    };
    Json(response).into_response()
}

async fn capabilities(State(bridge): State<AppState>) -> Json<PluginResponse> {
    Json(PluginResponse {
        capabilities: Some(bridge.capabilities()),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::loopback::{LoopbackConfig, LoopbackVolumeService};
    use crate::config::BridgeConfig;
    use crate::metrics::BridgeMetrics;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn router(root: &std::path::Path) -> Router {
        let service = Arc::new(LoopbackVolumeService::new(LoopbackConfig::default()));
        let config = BridgeConfig {
            mount_root: root.to_path_buf(),
            ..Default::default()
        };
        let bridge = VolumeBridge::new(service, config, BridgeMetrics::new().unwrap());
        PluginRouter::new(Arc::new(bridge)).build()
    }

    async fn call(app: &Router, path: &str, body: &str) -> serde_json::Value {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(path)
                    .header("content-type", "application/vnd.docker.plugins.v1.2+json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_activate() {
        let root = tempfile::tempdir().unwrap();
        let app = router(root.path());
        let body = call(&app, "/Plugin.Activate", "").await;
        assert_eq!(body["Implements"][0], "VolumeDriver");
    }

    #[tokio::test]
    async fn test_volume_lifecycle_over_http() {
        let root = tempfile::tempdir().unwrap();
        let app = router(root.path());

        let create = r#"{"Name":"data","Opts":{"size":"1"}}"#;
        let body = call(&app, "/VolumeDriver.Create", create).await;
        assert_eq!(body["Err"], "");

        let body = call(&app, "/VolumeDriver.Mount", r#"{"Name":"data","ID":"c1"}"#).await;
        let mountpoint = root.path().join("data").to_string_lossy().to_string();
        assert_eq!(body["Mountpoint"], mountpoint.as_str());

        let body = call(&app, "/VolumeDriver.Get", r#"{"Name":"data"}"#).await;
        assert_eq!(body["Volume"]["Name"], "data");
        assert_eq!(body["Volume"]["Mountpoint"], mountpoint.as_str());

        let body = call(&app, "/VolumeDriver.List", "{}").await;
        assert_eq!(body["Volumes"][0]["Name"], "data");

        let body = call(&app, "/VolumeDriver.Unmount", r#"{"Name":"data","ID":"c1"}"#).await;
        assert_eq!(body["Err"], "");

        let body = call(&app, "/VolumeDriver.Path", r#"{"Name":"data"}"#).await;
        assert_eq!(body["Err"], "volume not mounted: data");

        let body = call(&app, "/VolumeDriver.Remove", r#"{"Name":"data"}"#).await;
        assert_eq!(body["Err"], "");
    }

    #[tokio::test]
    async fn test_errors_name_operation_and_volume() {
        let root = tempfile::tempdir().unwrap();
        let app = router(root.path());

        let body = call(&app, "/VolumeDriver.Get", r#"{"Name":"ghost"}"#).await;
        assert_eq!(body["Err"], "get: unknown volume: ghost");

        let create = r#"{"Name":"data","Opts":{"size":"-1"}}"#;
        let body = call(&app, "/VolumeDriver.Create", create).await;
        assert_eq!(body["Err"], "create data: invalid option size=-1");

        let body = call(&app, "/VolumeDriver.Mount", "{not json").await;
        assert!(body["Err"].as_str().unwrap().starts_with("mount: JSON parse error"));
    }

    #[tokio::test]
    async fn test_capabilities_are_empty() {
        let root = tempfile::tempdir().unwrap();
        let app = router(root.path());
        let body = call(&app, "/VolumeDriver.Capabilities", "").await;
        assert_eq!(body["Capabilities"], serde_json::json!({}));
        assert_eq!(body["Err"], "");
    }
}
