//! Idempotency Resolver
//!
//! Answers "is this volume already in the state the next call would put it
//! in?" by cross-referencing the remote volume descriptor, the locally cached
//! attachment token, the live mount table and the live device map. Every
//! operation here is read-only against the remote service.

use crate::domain::ports::{HostInspectorRef, RemoteVolumeClientRef};
use crate::domain::volume::{
    AttachmentState, DeviceScan, InspectOptions, PublishInfo, StorageType, VolumeDescriptor,
    VolumeId, PUBLISH_KEY_ENCRYPTED, PUBLISH_KEY_TOKEN,
};
use crate::error::{Error, Result};
use crate::idempotency::tokens::PublishTokenCache;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Device reported by the mount table for bind/tmpfs-style publishes
pub const BIND_PSEUDO_DEVICE: &str = "devtmpfs";

/// Capability name reported when name-based inspection is unavailable
pub const CAPABILITY_INSPECT_BY_NAME: &str = "inspect-by-name";

// =============================================================================
// Controller Publish State
// =============================================================================

/// Controller-level publish state of a volume on this node.
///
/// `Unknown` is distinct from `NotPublished`: the volume is attached, but no
/// token was cached by this process, so the resolver cannot tell whether the
/// caller's publish already happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerPublishState {
    NotPublished,
    /// Attached, with the cached attachment token
    Published(PublishInfo),
    /// Attached, token field left empty
    Unknown(PublishInfo),
}

impl ControllerPublishState {
    /// Publish-info for either attached state
    pub fn publish_info(&self) -> Option<&PublishInfo> {
        match self {
            ControllerPublishState::NotPublished => None,
            ControllerPublishState::Published(info) | ControllerPublishState::Unknown(info) => {
                Some(info)
            }
        }
    }
}

// =============================================================================
// Resolver Configuration
// =============================================================================

/// Configuration for the resolver
#[derive(Debug, Clone, Default)]
pub struct ResolverConfig {
    /// Whether published volumes surface as local block devices
    pub storage_type: StorageType,
    /// Depth of the device scan used to resolve tokens
    pub device_scan: DeviceScan,
}

// =============================================================================
// Resolver
// =============================================================================

pub struct IdempotencyResolver {
    client: RemoteVolumeClientRef,
    host: HostInspectorRef,
    tokens: Arc<PublishTokenCache>,
    config: ResolverConfig,
}

impl IdempotencyResolver {
    pub fn new(
        client: RemoteVolumeClientRef,
        host: HostInspectorRef,
        tokens: Arc<PublishTokenCache>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            client,
            host,
            tokens,
            config,
        }
    }

    /// Attachment token cache shared with the interceptor
    pub fn tokens(&self) -> &Arc<PublishTokenCache> {
        &self.tokens
    }

    /// Name of the volume with the given id, or `None` when it does not exist
    pub async fn resolve_name(&self, volume_id: &VolumeId) -> Result<Option<String>> {
        let id = volume_id.id().ok_or(Error::MissingIdKey)?;

        match self
            .client
            .inspect_volume(id, InspectOptions::default())
            .await
        {
            Ok(vol) if vol.name.is_empty() => Ok(None),
            Ok(vol) => Ok(Some(vol.name)),
            Err(e) if e.is_not_found() => {
                debug!(volume_id = id, "volume not found while resolving name");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Descriptor of the volume with the given name, or `None` when absent.
    ///
    /// Fails with `CapabilityUnavailable` when the backend cannot look
    /// volumes up by name.
    pub async fn resolve_descriptor(&self, name: &str) -> Result<Option<VolumeDescriptor>> {
        let lookup = self
            .client
            .name_lookup()
            .ok_or_else(|| Error::CapabilityUnavailable {
                capability: CAPABILITY_INSPECT_BY_NAME.to_string(),
            })?;

        match lookup
            .inspect_volume_by_name(name, InspectOptions::default())
            .await
        {
            Ok(vol) => Ok(Some(vol)),
            Err(e) if e.is_not_found() => {
                debug!(volume_name = name, "volume not found while resolving descriptor");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether the name-based lookup capability is present
    pub fn supports_name_lookup(&self) -> bool {
        self.client.name_lookup().is_some()
    }

    /// Controller-level publish state of the volume on this instance
    pub async fn is_controller_published(
        &self,
        volume_id: &VolumeId,
    ) -> Result<ControllerPublishState> {
        let id = volume_id.id().ok_or(Error::MissingIdKey)?;

        let vol = self
            .client
            .inspect_volume(id, InspectOptions::for_instance())
            .await?;

        if vol.attachment_state != AttachmentState::Attached {
            return Ok(ControllerPublishState::NotPublished);
        }

        let mut info = PublishInfo::default();
        info.values
            .insert(PUBLISH_KEY_ENCRYPTED.to_string(), vol.encrypted.to_string());

        match self.tokens.get(id) {
            Some(token) => {
                info.values.insert(PUBLISH_KEY_TOKEN.to_string(), token);
                Ok(ControllerPublishState::Published(info))
            }
            None => {
                debug!(volume_id = id, "attached but no cached token, state unknown");
                info.values
                    .insert(PUBLISH_KEY_TOKEN.to_string(), String::new());
                Ok(ControllerPublishState::Unknown(info))
            }
        }
    }

    /// Whether the volume is mounted at `target_path` on this host.
    ///
    /// Only a missing target path is an error; a token not yet in the device
    /// map or a missing mount-table entry are ordinary `false` results.
    pub async fn is_node_published(
        &self,
        volume_id: &VolumeId,
        publish_info: Option<&PublishInfo>,
        target_path: &str,
    ) -> Result<bool> {
        let meta = match std::fs::metadata(target_path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::MissingTargetPath {
                    path: target_path.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let is_mount_target = meta.is_dir();

        let device = match publish_info {
            Some(info) => match self.device_from_token(info)? {
                Some(device) => device,
                None => return Ok(false),
            },
            None => match self.device_from_remote(volume_id).await? {
                Some(device) => device,
                None => return Ok(false),
            },
        };

        let mounts = self.host.mounts()?;
        let target = Path::new(target_path);
        let found = if is_mount_target {
            mounts
                .iter()
                .any(|m| m.device == device && Path::new(&m.path) == target)
        } else {
            mounts
                .iter()
                .any(|m| m.device == BIND_PSEUDO_DEVICE && Path::new(&m.path) == target)
        };

        debug!(
            volume_id = %volume_id,
            device = %device,
            target_path,
            is_mount_target,
            found,
            "checked node publication"
        );
        Ok(found)
    }

    /// Expected device for a publish-info token; `None` if not visible yet
    fn device_from_token(&self, info: &PublishInfo) -> Result<Option<String>> {
        let token = info.token().ok_or(Error::MissingTokenKey)?;

        if self.config.storage_type != StorageType::Block {
            return Ok(Some(token.to_string()));
        }

        let devices = self
            .host
            .local_devices(self.config.device_scan)
            .map_err(|e| Error::LocalDevices(e.to_string()))?;

        match devices.get(token) {
            Some(path) => Ok(Some(path.clone())),
            None => {
                debug!(token, "token not in device map yet");
                Ok(None)
            }
        }
    }

    /// Expected device from an authoritative inspect; `None` if not attached
    async fn device_from_remote(&self, volume_id: &VolumeId) -> Result<Option<String>> {
        let id = volume_id.id().ok_or(Error::MissingIdKey)?;

        let vol = self
            .client
            .inspect_volume(id, InspectOptions::with_device_map())
            .await?;

        if vol.attachment_state != AttachmentState::Attached {
            return Ok(None);
        }

        Ok(vol.attachments.first().map(|a| a.device_name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::loopback::{LoopbackConfig, LoopbackVolumeService};
    use crate::domain::ports::{ControllerPublishRequest, RemoteVolumeClient};
    use crate::domain::volume::{CreateVolumeRequest, MountRecord, VolumeCapability};
    use crate::host::testing::FakeHost;
    use assert_matches::assert_matches;

    struct Fixture {
        service: Arc<LoopbackVolumeService>,
        host: Arc<FakeHost>,
        resolver: IdempotencyResolver,
    }

    fn fixture(storage_type: StorageType, name_lookup: bool) -> Fixture {
        let service = Arc::new(LoopbackVolumeService::new(LoopbackConfig {
            supports_name_lookup: name_lookup,
            ..Default::default()
        }));
        let host = Arc::new(FakeHost::default());
        let resolver = IdempotencyResolver::new(
            service.clone(),
            host.clone(),
            Arc::new(PublishTokenCache::new()),
            ResolverConfig {
                storage_type,
                device_scan: DeviceScan::Quick,
            },
        );
        Fixture {
            service,
            host,
            resolver,
        }
    }

    async fn create(service: &LoopbackVolumeService, name: &str) -> VolumeDescriptor {
        service
            .create_volume(CreateVolumeRequest {
                name: name.to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    async fn attach(service: &LoopbackVolumeService, vol: &VolumeDescriptor) -> PublishInfo {
        service
            .controller_publish_volume(ControllerPublishRequest {
                volume_id: vol.id.clone().unwrap(),
                metadata: vol.metadata.clone(),
                node_id: service.node_id().to_string(),
                capability: VolumeCapability::mount("ext4"),
                readonly: false,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_resolve_name_absent_is_not_error() {
        let f = fixture(StorageType::Block, true);
        let name = f.resolver.resolve_name(&VolumeId::new("vol-missing")).await.unwrap();
        assert!(name.is_none());
    }

    #[tokio::test]
    async fn test_resolve_name_requires_id_key() {
        let f = fixture(StorageType::Block, true);
        let res = f.resolver.resolve_name(&VolumeId::default()).await;
        assert_matches!(res, Err(Error::MissingIdKey));
    }

    #[tokio::test]
    async fn test_resolve_name_and_descriptor() {
        let f = fixture(StorageType::Block, true);
        let vol = create(&f.service, "data").await;

        let name = f.resolver.resolve_name(vol.id.as_ref().unwrap()).await.unwrap();
        assert_eq!(name.as_deref(), Some("data"));

        let found = f.resolver.resolve_descriptor("data").await.unwrap().unwrap();
        assert_eq!(found.id, vol.id);
        assert!(f.resolver.resolve_descriptor("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_descriptor_without_capability() {
        let f = fixture(StorageType::Block, false);
        assert!(!f.resolver.supports_name_lookup());
        let res = f.resolver.resolve_descriptor("data").await;
        assert_matches!(res, Err(Error::CapabilityUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_controller_published_three_states() {
        let f = fixture(StorageType::Block, true);
        let vol = create(&f.service, "data").await;
        let id = vol.id.clone().unwrap();

        let state = f.resolver.is_controller_published(&id).await.unwrap();
        assert_eq!(state, ControllerPublishState::NotPublished);

        let info = attach(&f.service, &vol).await;

        // attached, but this resolver never saw the token
        let state = f.resolver.is_controller_published(&id).await.unwrap();
        assert_matches!(state, ControllerPublishState::Unknown(ref i) if i.token() == Some(""));

        f.resolver
            .tokens()
            .insert(id.id().unwrap(), info.token().unwrap());
        let state = f.resolver.is_controller_published(&id).await.unwrap();
        assert_matches!(state,
            ControllerPublishState::Published(ref i) if i.token() == info.token());
    }

    #[tokio::test]
    async fn test_node_published_missing_target_is_error() {
        let f = fixture(StorageType::Block, true);
        let res = f
            .resolver
            .is_node_published(&VolumeId::new("vol-1"), None, "/nonexistent/target/path")
            .await;
        assert_matches!(res, Err(Error::MissingTargetPath { .. }));
    }

    #[tokio::test]
    async fn test_node_published_token_not_in_device_map() {
        let f = fixture(StorageType::Block, true);
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().to_str().unwrap();

        let info = PublishInfo::new("tok-unseen", false);
        let published = f
            .resolver
            .is_node_published(&VolumeId::new("vol-1"), Some(&info), target)
            .await
            .unwrap();
        assert!(!published);
    }

    #[tokio::test]
    async fn test_node_published_missing_token_key() {
        let f = fixture(StorageType::Block, true);
        let dir = tempfile::tempdir().unwrap();
        let res = f
            .resolver
            .is_node_published(
                &VolumeId::new("vol-1"),
                Some(&PublishInfo::default()),
                dir.path().to_str().unwrap(),
            )
            .await;
        assert_matches!(res, Err(Error::MissingTokenKey));
    }

    #[tokio::test]
    async fn test_node_published_directory_matches_device() {
        let f = fixture(StorageType::Block, true);
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().to_str().unwrap();

        f.host.add_device("tok-1", "/dev/xvdf");
        let info = PublishInfo::new("tok-1", false);
        let id = VolumeId::new("vol-1");

        // device known, nothing mounted yet
        assert!(!f.resolver.is_node_published(&id, Some(&info), target).await.unwrap());

        f.host.add_mount(MountRecord::new("/dev/xvdf", target));
        assert!(f.resolver.is_node_published(&id, Some(&info), target).await.unwrap());
    }

    #[tokio::test]
    async fn test_node_published_file_target_uses_pseudo_device() {
        let f = fixture(StorageType::Block, true);
        let file = tempfile::NamedTempFile::new().unwrap();
        let target = file.path().to_str().unwrap();

        f.host.add_device("tok-1", "/dev/xvdf");
        let info = PublishInfo::new("tok-1", false);
        let id = VolumeId::new("vol-1");

        // the real device at a file target is not a match
        f.host.add_mount(MountRecord::new("/dev/xvdf", target));
        assert!(!f.resolver.is_node_published(&id, Some(&info), target).await.unwrap());

        f.host.add_mount(MountRecord::new(BIND_PSEUDO_DEVICE, target));
        assert!(f.resolver.is_node_published(&id, Some(&info), target).await.unwrap());
    }

    #[tokio::test]
    async fn test_node_published_file_storage_uses_token_directly() {
        let f = fixture(StorageType::File, true);
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().to_str().unwrap();

        f.host
            .add_mount(MountRecord::new("nfs-server:/exports/data", target));
        let info = PublishInfo::new("nfs-server:/exports/data", false);
        assert!(f
            .resolver
            .is_node_published(&VolumeId::new("vol-1"), Some(&info), target)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_node_published_falls_back_to_remote_inspect() {
        let f = fixture(StorageType::Block, true);
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().to_str().unwrap();

        let vol = create(&f.service, "data").await;
        let id = vol.id.clone().unwrap();

        // not attached: false, not an error
        assert!(!f.resolver.is_node_published(&id, None, target).await.unwrap());

        attach(&f.service, &vol).await;
        let attached = f
            .service
            .inspect_volume(id.id().unwrap(), InspectOptions::with_device_map())
            .await
            .unwrap();
        let device = attached.attachments[0].device_name.clone();

        assert!(!f.resolver.is_node_published(&id, None, target).await.unwrap());
        f.host.add_mount(MountRecord::new(device, target));
        assert!(f.resolver.is_node_published(&id, None, target).await.unwrap());
    }
}
