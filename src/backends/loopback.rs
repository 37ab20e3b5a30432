//! Loopback Volume Service
//!
//! In-process implementation of the remote volume service contract. Volumes
//! live in memory; publishing assigns an attachment token and a device name
//! but touches nothing on the host. Used for standalone operation and as the
//! backend of the bridge's own tests.

use crate::domain::ports::{
    ControllerPublishRequest, ErrorCode, InspectByName, NodePublishRequest, RemoteVolumeClient,
    RpcMethod,
};
use crate::domain::volume::{
    Attachment, AttachmentRequest, AttachmentState, CreateVolumeRequest, InspectOptions,
    PublishInfo, VolumeDescriptor, VolumeId, VolumePage, METADATA_KEY_NAME,
};
use crate::error::{Error, Result, RpcError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

const GIB: u64 = 1024 * 1024 * 1024;

/// Parameter that requests an encrypted volume
pub const PARAM_ENCRYPTED: &str = "encrypted";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the loopback service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    /// Node id reported by GetNodeID
    pub node_id: String,
    /// Whether name-based inspection is offered
    pub supports_name_lookup: bool,
    /// Size used when a create request carries no minimum
    pub default_size_gib: u64,
    /// Prefix for assigned device names
    pub device_prefix: String,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            node_id: "loopback-node".to_string(),
            supports_name_lookup: true,
            default_size_gib: 16,
            device_prefix: "/dev/xvd".to_string(),
        }
    }
}

// =============================================================================
// Volume State
// =============================================================================

#[derive(Debug, Clone)]
struct AttachmentRecord {
    node_id: String,
    token: String,
    device_name: String,
}

#[derive(Debug, Clone)]
struct VolumeState {
    id: String,
    name: String,
    capacity_bytes: u64,
    encrypted: bool,
    attachment: Option<AttachmentRecord>,
    /// Target paths this volume is node-published at
    targets: BTreeSet<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
enum Fault {
    Code(ErrorCode),
    Transport(String),
}

// =============================================================================
// Loopback Service
// =============================================================================

pub struct LoopbackVolumeService {
    config: LoopbackConfig,
    volumes: DashMap<String, VolumeState>,
    /// Volume name to id; claimed before a volume is inserted
    names: DashMap<String, String>,
    /// Raw entries appended to every listing
    extra_listing: Mutex<Vec<VolumeDescriptor>>,
    calls: Mutex<Vec<RpcMethod>>,
    create_requests: Mutex<Vec<CreateVolumeRequest>>,
    faults: Mutex<HashMap<RpcMethod, Fault>>,
    devices: AtomicU64,
}

impl LoopbackVolumeService {
    pub fn new(config: LoopbackConfig) -> Self {
        info!(node_id = %config.node_id, "starting loopback volume service");
        Self {
            config,
            volumes: DashMap::new(),
            names: DashMap::new(),
            extra_listing: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            create_requests: Mutex::new(Vec::new()),
            faults: Mutex::new(HashMap::new()),
            devices: AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Every RPC received, in order
    pub fn calls(&self) -> Vec<RpcMethod> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, method: RpcMethod) -> usize {
        self.calls.lock().iter().filter(|m| **m == method).count()
    }

    /// Every create request received, in order
    pub fn create_requests(&self) -> Vec<CreateVolumeRequest> {
        self.create_requests.lock().clone()
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.len()
    }

    /// Target paths the volume is currently node-published at
    pub fn node_targets(&self, id: &str) -> Vec<String> {
        self.volumes
            .get(id)
            .map(|v| v.targets.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Fail the next call of `method` with a structured code
    pub fn fail_next(&self, method: RpcMethod, code: ErrorCode) {
        self.faults.lock().insert(method, Fault::Code(code));
    }

    /// Append a descriptor to every list result as-is, the way a backend
    /// with half-created or malformed volumes reports them
    pub fn add_raw_listing(&self, descriptor: VolumeDescriptor) {
        self.extra_listing.lock().push(descriptor);
    }

    /// Fail the next call of `method` as if the transport broke
    pub fn fail_next_transport(&self, method: RpcMethod, message: impl Into<String>) {
        self.faults
            .lock()
            .insert(method, Fault::Transport(message.into()));
    }

    /// Record the call and fire any injected fault
    fn enter(&self, method: RpcMethod) -> Result<()> {
        self.calls.lock().push(method);
        match self.faults.lock().remove(&method) {
            Some(Fault::Code(code)) => Err(rpc_error(method, code, "injected failure")),
            Some(Fault::Transport(message)) => Err(Error::Transport(message)),
            None => Ok(()),
        }
    }

    fn lookup_id<'a>(&self, method: RpcMethod, volume_id: &'a VolumeId) -> Result<&'a str> {
        volume_id
            .id()
            .ok_or_else(|| rpc_error(method, ErrorCode::InvalidVolumeId, "missing id"))
    }

    fn next_device(&self) -> String {
        let n = self.devices.fetch_add(1, Ordering::Relaxed);
        // xvdf, xvdg, ... then numbered past z
        match u8::try_from(n).ok().filter(|n| *n < 21) {
            Some(n) => format!("{}{}", self.config.device_prefix, char::from(b'f' + n)),
            None => format!("{}{}", self.config.device_prefix, n),
        }
    }

    fn describe(&self, state: &VolumeState, options: InspectOptions) -> VolumeDescriptor {
        let mut metadata = BTreeMap::new();
        metadata.insert(METADATA_KEY_NAME.to_string(), state.name.clone());
        metadata.insert("createdAt".to_string(), state.created_at.to_rfc3339());

        let local = state
            .attachment
            .as_ref()
            .filter(|a| a.node_id == self.config.node_id);

        let attachments = match (options.attachments, local) {
            (AttachmentRequest::None, _) | (_, None) => Vec::new(),
            (AttachmentRequest::ForInstance, Some(a)) => vec![Attachment {
                device_name: String::new(),
                instance_id: a.node_id.clone(),
            }],
            (AttachmentRequest::WithDeviceMapForInstance, Some(a)) => vec![Attachment {
                device_name: a.device_name.clone(),
                instance_id: a.node_id.clone(),
            }],
        };

        VolumeDescriptor {
            id: Some(VolumeId::new(state.id.clone())),
            name: state.name.clone(),
            metadata,
            attachment_state: if local.is_some() {
                AttachmentState::Attached
            } else {
                AttachmentState::Unattached
            },
            attachments,
            capacity_bytes: state.capacity_bytes,
            encrypted: state.encrypted,
        }
    }
}

#[async_trait]
impl RemoteVolumeClient for LoopbackVolumeService {
    async fn create_volume(&self, request: CreateVolumeRequest) -> Result<VolumeDescriptor> {
        let method = RpcMethod::CreateVolume;
        self.enter(method)?;
        self.create_requests.lock().push(request.clone());

        if request.name.is_empty() {
            return Err(rpc_error(method, ErrorCode::InvalidVolumeName, "name is empty"));
        }
        let capacity_bytes = if request.required_bytes > 0 {
            request.required_bytes
        } else {
            self.config.default_size_gib * GIB
        };
        if request.limit_bytes > 0 && capacity_bytes > request.limit_bytes {
            return Err(rpc_error(
                method,
                ErrorCode::UnsupportedCapacityRange,
                &format!("{} bytes exceeds limit {}", capacity_bytes, request.limit_bytes),
            ));
        }

        // the name stays claimed while the volume is built and inserted
        let slot = match self.names.entry(request.name.clone()) {
            Entry::Occupied(_) => {
                return Err(rpc_error(
                    method,
                    ErrorCode::VolumeAlreadyExists,
                    &format!("volume {} exists", request.name),
                ))
            }
            Entry::Vacant(slot) => slot,
        };

        let state = VolumeState {
            id: format!("vol-{}", generate_id()),
            name: request.name.clone(),
            capacity_bytes,
            encrypted: request
                .parameters
                .get(PARAM_ENCRYPTED)
                .map(|v| v == "true")
                .unwrap_or(false),
            attachment: None,
            targets: BTreeSet::new(),
            created_at: Utc::now(),
        };

        info!(
            volume_id = %state.id,
            volume_name = %state.name,
            capacity_bytes,
            "created volume"
        );
        let descriptor = self.describe(&state, InspectOptions::default());
        let id = state.id.clone();
        self.volumes.insert(id.clone(), state);
        slot.insert(id);
        Ok(descriptor)
    }

    async fn delete_volume(
        &self,
        volume_id: &VolumeId,
        _metadata: &BTreeMap<String, String>,
    ) -> Result<()> {
        let method = RpcMethod::DeleteVolume;
        self.enter(method)?;
        let id = self.lookup_id(method, volume_id)?;

        match self.volumes.remove(id) {
            Some((_, state)) => {
                self.names.remove(&state.name);
                info!(volume_id = id, "deleted volume");
                Ok(())
            }
            None => Err(does_not_exist(method, id)),
        }
    }

    async fn controller_publish_volume(
        &self,
        request: ControllerPublishRequest,
    ) -> Result<PublishInfo> {
        let method = RpcMethod::ControllerPublishVolume;
        self.enter(method)?;
        let id = self.lookup_id(method, &request.volume_id)?;

        let mut vol = self.volumes.get_mut(id).ok_or_else(|| does_not_exist(method, id))?;

        if let Some(existing) = &vol.attachment {
            if existing.node_id != request.node_id {
                return Err(rpc_error(
                    method,
                    ErrorCode::VolumeAlreadyPublished,
                    &format!("attached to {}", existing.node_id),
                ));
            }
            return Ok(PublishInfo::new(existing.token.clone(), vol.encrypted));
        }

        let token = format!("att-{}", generate_id());
        vol.attachment = Some(AttachmentRecord {
            node_id: request.node_id.clone(),
            token: token.clone(),
            device_name: self.next_device(),
        });
        debug!(volume_id = id, node_id = %request.node_id, token = %token, "attached volume");
        Ok(PublishInfo::new(token, vol.encrypted))
    }

    async fn controller_unpublish_volume(
        &self,
        volume_id: &VolumeId,
        _metadata: &BTreeMap<String, String>,
        node_id: &str,
    ) -> Result<()> {
        let method = RpcMethod::ControllerUnpublishVolume;
        self.enter(method)?;
        let id = self.lookup_id(method, volume_id)?;

        let mut vol = self.volumes.get_mut(id).ok_or_else(|| does_not_exist(method, id))?;
        let attached_to = vol.attachment.as_ref().map(|a| a.node_id.clone());
        match attached_to {
            Some(attached) if attached == node_id => {
                vol.attachment = None;
                vol.targets.clear();
                debug!(volume_id = id, node_id, "detached volume");
            }
            Some(attached) => {
                return Err(rpc_error(
                    method,
                    ErrorCode::VolumeNotAttachedToNode,
                    &format!("attached to {}", attached),
                ))
            }
            None => {}
        }
        Ok(())
    }

    async fn node_publish_volume(&self, request: NodePublishRequest) -> Result<()> {
        let method = RpcMethod::NodePublishVolume;
        self.enter(method)?;
        let id = self.lookup_id(method, &request.volume_id)?;

        if request.target_path.is_empty() {
            return Err(rpc_error(method, ErrorCode::MountError, "target path is empty"));
        }

        let mut vol = self.volumes.get_mut(id).ok_or_else(|| does_not_exist(method, id))?;
        if !vol
            .attachment
            .as_ref()
            .map(|a| a.node_id == self.config.node_id)
            .unwrap_or(false)
        {
            return Err(rpc_error(
                method,
                ErrorCode::VolumeNotAttachedToNode,
                "volume is not attached to this node",
            ));
        }

        vol.targets.insert(request.target_path.clone());
        debug!(volume_id = id, target_path = %request.target_path, "published volume");
        Ok(())
    }

    async fn node_unpublish_volume(
        &self,
        volume_id: &VolumeId,
        _metadata: &BTreeMap<String, String>,
        target_path: &str,
    ) -> Result<()> {
        let method = RpcMethod::NodeUnpublishVolume;
        self.enter(method)?;
        let id = self.lookup_id(method, volume_id)?;

        let mut vol = self.volumes.get_mut(id).ok_or_else(|| does_not_exist(method, id))?;
        vol.targets.remove(target_path);
        debug!(volume_id = id, target_path, "unpublished volume");
        Ok(())
    }

    async fn get_node_id(&self) -> Result<String> {
        self.enter(RpcMethod::GetNodeId)?;
        Ok(self.config.node_id.clone())
    }

    async fn list_volumes(&self, max_entries: u32, starting_token: &str) -> Result<VolumePage> {
        let method = RpcMethod::ListVolumes;
        self.enter(method)?;

        let start: usize = if starting_token.is_empty() {
            0
        } else {
            starting_token.parse().map_err(|_| {
                rpc_error(
                    method,
                    ErrorCode::Unknown,
                    &format!("invalid starting token {}", starting_token),
                )
            })?
        };

        let mut all: Vec<VolumeDescriptor> = self
            .volumes
            .iter()
            .map(|v| self.describe(&v, InspectOptions::default()))
            .collect();
        all.sort_by(|a, b| a.id_value().cmp(&b.id_value()));
        all.extend(self.extra_listing.lock().iter().cloned());

        let end = match max_entries {
            0 => all.len(),
            n => all.len().min(start.saturating_add(n as usize)),
        };
        let entries = all.get(start..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_token = if end < all.len() {
            end.to_string()
        } else {
            String::new()
        };

        Ok(VolumePage {
            entries,
            next_token,
        })
    }

    async fn inspect_volume(&self, id: &str, options: InspectOptions) -> Result<VolumeDescriptor> {
        self.enter(RpcMethod::InspectVolume)?;
        self.volumes
            .get(id)
            .map(|v| self.describe(&v, options))
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "Volume".into(),
                name: id.into(),
            })
    }

    fn name_lookup(&self) -> Option<&dyn InspectByName> {
        if self.config.supports_name_lookup {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl InspectByName for LoopbackVolumeService {
    async fn inspect_volume_by_name(
        &self,
        name: &str,
        options: InspectOptions,
    ) -> Result<VolumeDescriptor> {
        self.enter(RpcMethod::InspectVolumeByName)?;
        self.volumes
            .iter()
            .find(|v| v.name == name)
            .map(|v| self.describe(&v, options))
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "Volume".into(),
                name: name.into(),
            })
    }
}

fn rpc_error(method: RpcMethod, code: ErrorCode, description: &str) -> Error {
    Error::Rpc(RpcError::new(method, code, description))
}

fn does_not_exist(method: RpcMethod, id: &str) -> Error {
    rpc_error(
        method,
        ErrorCode::VolumeDoesNotExist,
        &format!("volume {} does not exist", id),
    )
}

/// Generate a unique id
fn generate_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{:016x}{:04x}", now, SEQ.fetch_add(1, Ordering::Relaxed) & 0xffff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::volume::VolumeCapability;
    use assert_matches::assert_matches;

    fn service() -> LoopbackVolumeService {
        LoopbackVolumeService::new(LoopbackConfig::default())
    }

    fn create(name: &str) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn publish(svc: &LoopbackVolumeService, vol: &VolumeDescriptor) -> ControllerPublishRequest {
        ControllerPublishRequest {
            volume_id: vol.id.clone().unwrap(),
            metadata: BTreeMap::new(),
            node_id: svc.node_id().to_string(),
            capability: VolumeCapability::mount("ext4"),
            readonly: false,
        }
    }

    #[tokio::test]
    async fn test_create_defaults_and_duplicate() {
        let svc = service();
        let vol = svc.create_volume(create("data")).await.unwrap();
        assert_eq!(vol.capacity_bytes, 16 * GIB);
        assert_eq!(vol.derived_name(), "data");

        let dup = svc.create_volume(create("data")).await;
        assert_matches!(dup, Err(Error::Rpc(e))
            if e.method == RpcMethod::CreateVolume && e.code == ErrorCode::VolumeAlreadyExists);
        assert_eq!(svc.volume_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_of_one_name() {
        for _ in 0..20 {
            let svc = std::sync::Arc::new(service());
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let svc = svc.clone();
                    tokio::spawn(async move { svc.create_volume(create("data")).await })
                })
                .collect();

            let mut created = 0;
            for handle in handles {
                match handle.await.unwrap() {
                    Ok(_) => created += 1,
                    Err(e) => assert_eq!(
                        e.rpc().map(|r| r.code),
                        Some(ErrorCode::VolumeAlreadyExists)
                    ),
                }
            }
            assert_eq!(created, 1);
            assert_eq!(svc.volume_count(), 1);
        }
    }

    #[tokio::test]
    async fn test_deleted_name_can_be_reused() {
        let svc = service();
        let vol = svc.create_volume(create("data")).await.unwrap();
        svc.delete_volume(vol.id.as_ref().unwrap(), &BTreeMap::new())
            .await
            .unwrap();

        let again = svc.create_volume(create("data")).await.unwrap();
        assert_ne!(again.id, vol.id);
        assert_eq!(svc.volume_count(), 1);
    }

    #[tokio::test]
    async fn test_raw_listing_entries_are_appended() {
        let svc = service();
        svc.create_volume(create("data")).await.unwrap();
        svc.add_raw_listing(VolumeDescriptor {
            name: "half-created".into(),
            ..Default::default()
        });

        let page = svc.list_volumes(0, "").await.unwrap();
        assert_eq!(page.entries.len(), 2);
        assert!(page.entries[1].id.is_none());
    }

    #[tokio::test]
    async fn test_missing_volume_codes_are_per_method() {
        let svc = service();
        let id = VolumeId::new("vol-nope");
        let meta = BTreeMap::new();

        assert_matches!(svc.delete_volume(&id, &meta).await,
            Err(Error::Rpc(e))
                if e.method == RpcMethod::DeleteVolume
                    && e.code == ErrorCode::VolumeDoesNotExist);
        assert_matches!(svc.node_unpublish_volume(&id, &meta, "/t").await,
            Err(Error::Rpc(e)) if e.method == RpcMethod::NodeUnpublishVolume);
        assert_matches!(svc.controller_unpublish_volume(&id, &meta, "n").await,
            Err(Error::Rpc(e)) if e.method == RpcMethod::ControllerUnpublishVolume);
        assert_matches!(svc.inspect_volume("vol-nope", InspectOptions::default()).await,
            Err(Error::ResourceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_publish_lifecycle() {
        let svc = service();
        let vol = svc.create_volume(create("data")).await.unwrap();
        let id = vol.id.clone().unwrap();

        let info = svc.controller_publish_volume(publish(&svc, &vol)).await.unwrap();
        let token = info.token().unwrap().to_string();
        assert!(token.starts_with("att-"));

        // same node again: same token
        let again = svc.controller_publish_volume(publish(&svc, &vol)).await.unwrap();
        assert_eq!(again.token(), Some(token.as_str()));

        let inspected = svc
            .inspect_volume(id.id().unwrap(), InspectOptions::with_device_map())
            .await
            .unwrap();
        assert_eq!(inspected.attachment_state, AttachmentState::Attached);
        assert_eq!(inspected.attachments[0].device_name, "/dev/xvdf");

        let plain = svc
            .inspect_volume(id.id().unwrap(), InspectOptions::default())
            .await
            .unwrap();
        assert!(plain.attachments.is_empty());

        svc.controller_unpublish_volume(&id, &BTreeMap::new(), svc.node_id())
            .await
            .unwrap();
        let detached = svc
            .inspect_volume(id.id().unwrap(), InspectOptions::for_instance())
            .await
            .unwrap();
        assert_eq!(detached.attachment_state, AttachmentState::Unattached);
    }

    #[tokio::test]
    async fn test_node_publish_requires_attachment() {
        let svc = service();
        let vol = svc.create_volume(create("data")).await.unwrap();
        let request = NodePublishRequest {
            volume_id: vol.id.clone().unwrap(),
            metadata: BTreeMap::new(),
            publish_info: None,
            target_path: "/mnt/data".into(),
            capability: VolumeCapability::mount("ext4"),
            readonly: false,
        };

        assert_matches!(svc.node_publish_volume(request.clone()).await,
            Err(Error::Rpc(e)) if e.code == ErrorCode::VolumeNotAttachedToNode);

        svc.controller_publish_volume(publish(&svc, &vol)).await.unwrap();
        svc.node_publish_volume(request).await.unwrap();
        assert_eq!(svc.node_targets(vol.id_value().unwrap()), vec!["/mnt/data".to_string()]);
    }

    #[tokio::test]
    async fn test_fault_injection_fires_once() {
        let svc = service();
        svc.fail_next(RpcMethod::GetNodeId, ErrorCode::NodeDoesNotExist);
        assert_matches!(svc.get_node_id().await,
            Err(Error::Rpc(e)) if e.code == ErrorCode::NodeDoesNotExist);
        assert_eq!(svc.get_node_id().await.unwrap(), "loopback-node");

        svc.fail_next_transport(RpcMethod::ListVolumes, "connection reset");
        assert_matches!(svc.list_volumes(0, "").await, Err(Error::Transport(_)));
        assert_eq!(svc.call_count(RpcMethod::ListVolumes), 1);
    }

    #[tokio::test]
    async fn test_list_pages() {
        let svc = service();
        for name in ["a", "b", "c"] {
            svc.create_volume(create(name)).await.unwrap();
        }

        let first = svc.list_volumes(2, "").await.unwrap();
        assert_eq!(first.entries.len(), 2);
        assert_eq!(first.next_token, "2");

        let rest = svc.list_volumes(2, &first.next_token).await.unwrap();
        assert_eq!(rest.entries.len(), 1);
        assert!(rest.next_token.is_empty());

        assert_matches!(svc.list_volumes(0, "bogus").await, Err(Error::Rpc(_)));
    }

    #[tokio::test]
    async fn test_name_lookup_capability() {
        let svc = service();
        svc.create_volume(create("data")).await.unwrap();
        let lookup = svc.name_lookup().unwrap();
        let vol = lookup
            .inspect_volume_by_name("data", InspectOptions::default())
            .await
            .unwrap();
        assert_eq!(vol.name, "data");

        let without = LoopbackVolumeService::new(LoopbackConfig {
            supports_name_lookup: false,
            ..Default::default()
        });
        assert!(without.name_lookup().is_none());
    }
}
