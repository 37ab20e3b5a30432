//! Domain Ports - Core trait definitions for the volume bridge
//!
//! These traits define the boundaries between the bridge logic and external
//! systems: the remote volume service and the host operating system.
//! Adapters implement these traits to provide concrete functionality.

use crate::domain::volume::{
    CreateVolumeRequest, DeviceMap, DeviceScan, InspectOptions, MountRecord, PublishInfo,
    VolumeCapability, VolumeDescriptor, VolumeId, VolumePage,
};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// RPC Methods & Codes
// =============================================================================

/// Remote volume service methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RpcMethod {
    CreateVolume,
    DeleteVolume,
    ControllerPublishVolume,
    ControllerUnpublishVolume,
    NodePublishVolume,
    NodeUnpublishVolume,
    GetNodeId,
    ListVolumes,
    InspectVolume,
    InspectVolumeByName,
}

impl fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RpcMethod::CreateVolume => "CreateVolume",
            RpcMethod::DeleteVolume => "DeleteVolume",
            RpcMethod::ControllerPublishVolume => "ControllerPublishVolume",
            RpcMethod::ControllerUnpublishVolume => "ControllerUnpublishVolume",
            RpcMethod::NodePublishVolume => "NodePublishVolume",
            RpcMethod::NodeUnpublishVolume => "NodeUnpublishVolume",
            RpcMethod::GetNodeId => "GetNodeID",
            RpcMethod::ListVolumes => "ListVolumes",
            RpcMethod::InspectVolume => "InspectVolume",
            RpcMethod::InspectVolumeByName => "InspectVolumeByName",
        };
        f.write_str(name)
    }
}

/// Structured error codes reported by the remote volume service.
///
/// Which codes a method may return is method-specific; the same code means
/// different things depending on the method that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unknown,
    CallNotImplemented,
    OperationPending,
    InvalidVolumeId,
    InvalidVolumeName,
    UnsupportedCapacityRange,
    VolumeAlreadyExists,
    VolumeDoesNotExist,
    VolumeAlreadyPublished,
    VolumeNotAttachedToNode,
    NodeDoesNotExist,
    MountError,
    UnmountError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            ErrorCode::Unknown => "UNKNOWN",
            ErrorCode::CallNotImplemented => "CALL_NOT_IMPLEMENTED",
            ErrorCode::OperationPending => "OPERATION_PENDING_FOR_VOLUME",
            ErrorCode::InvalidVolumeId => "INVALID_VOLUME_ID",
            ErrorCode::InvalidVolumeName => "INVALID_VOLUME_NAME",
            ErrorCode::UnsupportedCapacityRange => "UNSUPPORTED_CAPACITY_RANGE",
            ErrorCode::VolumeAlreadyExists => "VOLUME_ALREADY_EXISTS",
            ErrorCode::VolumeDoesNotExist => "VOLUME_DOES_NOT_EXIST",
            ErrorCode::VolumeAlreadyPublished => "VOLUME_ALREADY_PUBLISHED",
            ErrorCode::VolumeNotAttachedToNode => "VOLUME_NOT_ATTACHED_TO_SPECIFIED_NODE",
            ErrorCode::NodeDoesNotExist => "NODE_DOES_NOT_EXIST",
            ErrorCode::MountError => "MOUNT_ERROR",
            ErrorCode::UnmountError => "UNMOUNT_ERROR",
        };
        f.write_str(code)
    }
}

// =============================================================================
// Publish Requests
// =============================================================================

/// Request to attach a volume to a node
#[derive(Debug, Clone)]
pub struct ControllerPublishRequest {
    pub volume_id: VolumeId,
    pub metadata: BTreeMap<String, String>,
    pub node_id: String,
    pub capability: VolumeCapability,
    pub readonly: bool,
}

/// Request to expose an attached volume at a target path
#[derive(Debug, Clone)]
pub struct NodePublishRequest {
    pub volume_id: VolumeId,
    pub metadata: BTreeMap<String, String>,
    pub publish_info: Option<PublishInfo>,
    pub target_path: String,
    pub capability: VolumeCapability,
    pub readonly: bool,
}

// =============================================================================
// Remote Volume Service Ports
// =============================================================================

/// Port for the remote, idempotent volume service.
///
/// Every call is a single RPC; failures carry a structured
/// [`RpcError`](crate::error::RpcError) when the service produced one.
#[async_trait]
pub trait RemoteVolumeClient: Send + Sync {
    async fn create_volume(&self, request: CreateVolumeRequest) -> Result<VolumeDescriptor>;

    async fn delete_volume(
        &self,
        volume_id: &VolumeId,
        metadata: &BTreeMap<String, String>,
    ) -> Result<()>;

    async fn controller_publish_volume(
        &self,
        request: ControllerPublishRequest,
    ) -> Result<PublishInfo>;

    async fn controller_unpublish_volume(
        &self,
        volume_id: &VolumeId,
        metadata: &BTreeMap<String, String>,
        node_id: &str,
    ) -> Result<()>;

    async fn node_publish_volume(&self, request: NodePublishRequest) -> Result<()>;

    async fn node_unpublish_volume(
        &self,
        volume_id: &VolumeId,
        metadata: &BTreeMap<String, String>,
        target_path: &str,
    ) -> Result<()>;

    async fn get_node_id(&self) -> Result<String>;

    /// List one page of volumes; `max_entries == 0` lets the service decide
    async fn list_volumes(&self, max_entries: u32, starting_token: &str) -> Result<VolumePage>;

    /// Inspect a volume by backend id.
    ///
    /// A volume that does not exist yields `Error::ResourceNotFound`.
    async fn inspect_volume(&self, id: &str, options: InspectOptions) -> Result<VolumeDescriptor>;

    /// Name-based inspection, when the backend supports it
    fn name_lookup(&self) -> Option<&dyn InspectByName> {
        None
    }
}

/// Optional capability: inspect a volume by its human-readable name
#[async_trait]
pub trait InspectByName: Send + Sync {
    /// A volume that does not exist yields `Error::ResourceNotFound`.
    async fn inspect_volume_by_name(
        &self,
        name: &str,
        options: InspectOptions,
    ) -> Result<VolumeDescriptor>;
}

// =============================================================================
// Host Inspection Port
// =============================================================================

/// Port for reading live host state. Nothing returned here is cached.
pub trait HostInspector: Send + Sync {
    /// Current mount table
    fn mounts(&self) -> Result<Vec<MountRecord>>;

    /// Current attachment token to device path map
    fn local_devices(&self, scan: DeviceScan) -> Result<DeviceMap>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type RemoteVolumeClientRef = Arc<dyn RemoteVolumeClient>;
pub type HostInspectorRef = Arc<dyn HostInspector>;
