//! Volume Lifecycle Bridge
//!
//! Implements the plugin-facing create/list/get/path/mount/unmount/remove
//! operations by sequencing remote RPCs:
//!
//! ```text
//! setup:    create -> controller-publish -> node-publish
//! teardown: node-unpublish -> controller-unpublish -> delete
//! ```
//!
//! Per-volume state is never stored; it is inferred on each call from the
//! name cache and the remote service. Benign "already in that state" codes
//! are absorbed, every other failure is surfaced unchanged with no rollback
//! of steps already completed.

use crate::cache::NameCache;
use crate::config::{BridgeConfig, MountFailurePolicy};
use crate::domain::ports::{ControllerPublishRequest, NodePublishRequest, RemoteVolumeClientRef};
use crate::domain::volume::{
    CreateVolumeRequest, InspectOptions, VolumeCapability, VolumeDescriptor, VolumeId,
};
use crate::error::{Error, Result};
use crate::idempotency::classifier::{tolerate_already_exists, tolerate_does_not_exist};
use crate::metrics::BridgeMetrics;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

const GIB: u64 = 1024 * 1024 * 1024;

/// Create option carrying the requested size in GiB, matched case-insensitively
pub const OPTION_SIZE: &str = "size";

/// Volume as reported to the plugin-facing caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    pub mountpoint: Option<String>,
}

/// Capabilities advertised to the container runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginCapabilities {
    #[serde(rename = "Scope", skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

pub struct VolumeBridge {
    client: RemoteVolumeClientRef,
    cache: Arc<NameCache>,
    config: BridgeConfig,
    metrics: BridgeMetrics,
}

impl VolumeBridge {
    pub fn new(
        client: RemoteVolumeClientRef,
        config: BridgeConfig,
        metrics: BridgeMetrics,
    ) -> Self {
        Self {
            client,
            cache: Arc::new(NameCache::new()),
            config,
            metrics,
        }
    }

    pub fn cache(&self) -> &Arc<NameCache> {
        &self.cache
    }

    pub fn metrics(&self) -> &BridgeMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    // =========================================================================
    // Plugin-facing operations
    // =========================================================================

    #[instrument(skip(self, options), fields(volume_name = %name))]
    pub async fn create(&self, name: &str, options: &HashMap<String, String>) -> Result<()> {
        let started = Instant::now();
        let result = self.do_create(name, options).await;
        self.finish("create", started, &result);
        result
    }

    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<VolumeInfo>> {
        let started = Instant::now();
        let result = self.do_list().await;
        self.finish("list", started, &result);
        result
    }

    #[instrument(skip(self), fields(volume_name = %name))]
    pub fn get(&self, name: &str) -> Result<VolumeInfo> {
        let started = Instant::now();
        let result = self
            .cached("get", name)
            .map(|vol| VolumeInfo {
                name: name.to_string(),
                mountpoint: vol.target_path().map(str::to_string),
            });
        self.finish("get", started, &result);
        result
    }

    #[instrument(skip(self), fields(volume_name = %name))]
    pub fn path(&self, name: &str) -> Result<String> {
        let started = Instant::now();
        let result = self.cached("path", name).and_then(|vol| {
            vol.target_path()
                .map(str::to_string)
                .ok_or_else(|| Error::NotMounted {
                    name: name.to_string(),
                })
        });
        self.finish("path", started, &result);
        result
    }

    #[instrument(skip(self), fields(volume_name = %name))]
    pub async fn mount(&self, name: &str) -> Result<String> {
        let started = Instant::now();
        let result = self.do_mount(name).await;
        self.finish("mount", started, &result);
        result
    }

    #[instrument(skip(self), fields(volume_name = %name))]
    pub async fn unmount(&self, name: &str) -> Result<()> {
        let started = Instant::now();
        let result = self.do_unmount(name).await;
        self.finish("unmount", started, &result);
        result
    }

    #[instrument(skip(self), fields(volume_name = %name))]
    pub async fn remove(&self, name: &str) -> Result<()> {
        let started = Instant::now();
        let result = self.do_remove(name).await;
        self.finish("remove", started, &result);
        result
    }

    pub fn capabilities(&self) -> PluginCapabilities {
        PluginCapabilities::default()
    }

    // =========================================================================
    // Create & List
    // =========================================================================

    async fn do_create(&self, name: &str, options: &HashMap<String, String>) -> Result<()> {
        validate_name(name)?;
        let request = self.create_request(name, options)?;

        match tolerate_already_exists(self.client.create_volume(request).await)? {
            Some(vol) => {
                info!(
                    volume_id = ?vol.id_value(),
                    capacity_bytes = vol.capacity_bytes,
                    "volume created"
                );
                self.cache.set(name, vol);
            }
            None => match self.locate(name).await {
                Ok(Some(vol)) => self.cache.set(name, vol),
                Ok(None) => warn!("volume exists but could not be located"),
                Err(e) => warn!(error = %e, "volume exists, lookup failed"),
            },
        }
        Ok(())
    }

    fn create_request(
        &self,
        name: &str,
        options: &HashMap<String, String>,
    ) -> Result<CreateVolumeRequest> {
        let mut request = CreateVolumeRequest {
            name: name.to_string(),
            capabilities: vec![VolumeCapability::mount(&self.config.fs_type)],
            ..Default::default()
        };

        for (key, value) in options {
            if key.eq_ignore_ascii_case(OPTION_SIZE) {
                request.required_bytes = parse_size_gib(key, value)?;
            } else {
                request.parameters.insert(key.clone(), value.clone());
            }
        }
        Ok(request)
    }

    async fn do_list(&self) -> Result<Vec<VolumeInfo>> {
        let descriptors = self.list_all().await?;

        let mut volumes = Vec::with_capacity(descriptors.len());
        for vol in &descriptors {
            if vol.id_value().is_none() {
                warn!(volume_name = %vol.name, "listed volume has no id, skipping");
                continue;
            }
            let name = vol.derived_name();
            if name.is_empty() {
                warn!(volume_id = ?vol.id_value(), "listed volume has no name, skipping");
                continue;
            }
            let mountpoint = self
                .cache
                .get(&name)
                .and_then(|cached| cached.target_path().map(str::to_string));
            volumes.push(VolumeInfo { name, mountpoint });
        }

        let cache = self.cache.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let count = refresh_cache(&cache, descriptors);
            metrics.set_cached_volumes(count);
        });

        Ok(volumes)
    }

    /// Every volume the backend reports, following page tokens
    async fn list_all(&self) -> Result<Vec<VolumeDescriptor>> {
        let mut all = Vec::new();
        let mut token = String::new();
        loop {
            let page = self
                .client
                .list_volumes(self.config.list_page_size, &token)
                .await?;
            all.extend(page.entries);
            if page.next_token.is_empty() {
                break;
            }
            token = page.next_token;
        }
        debug!(count = all.len(), "listed volumes");
        Ok(all)
    }

    /// Find an existing volume by name, by lookup when offered, else by scan
    async fn locate(&self, name: &str) -> Result<Option<VolumeDescriptor>> {
        if let Some(lookup) = self.client.name_lookup() {
            return match lookup
                .inspect_volume_by_name(name, InspectOptions::default())
                .await
            {
                Ok(vol) => Ok(Some(vol)),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            };
        }

        Ok(self
            .list_all()
            .await?
            .into_iter()
            .find(|vol| vol.derived_name() == name || vol.name == name))
    }

    // =========================================================================
    // Mount & Unmount
    // =========================================================================

    async fn do_mount(&self, name: &str) -> Result<String> {
        validate_name(name)?;
        let (mut vol, created) = match self.cache.get(name) {
            Some(vol) => (vol, false),
            None => self.create_for_mount(name).await?,
        };

        if let Some(target) = vol.target_path() {
            if Path::new(target).exists() {
                debug!(target_path = target, "already mounted");
                return Ok(target.to_string());
            }
            debug!(target_path = target, "recorded target path is gone, republishing");
        }

        match self.publish(name, &vol).await {
            Ok(target) => {
                vol.set_target_path(target.clone());
                self.cache.set(name, vol);
                info!(target_path = %target, "volume mounted");
                Ok(target)
            }
            Err(e) => {
                error!(error = %e, "mount aborted");
                if created && self.config.mount_failure == MountFailurePolicy::DeleteCreated {
                    self.discard_created(name, &vol).await;
                }
                Err(e)
            }
        }
    }

    /// Find or create the volume for a Mount of an uncached name.
    ///
    /// The flag is true only when this call's create made the volume; a
    /// client may answer create for an existing name with that volume.
    async fn create_for_mount(&self, name: &str) -> Result<(VolumeDescriptor, bool)> {
        if let Some(vol) = self.locate(name).await? {
            debug!(volume_id = ?vol.id_value(), "volume exists remotely, not cached");
            self.cache.set(name, vol.clone());
            return Ok((vol, false));
        }

        let request = self.create_request(name, &HashMap::new())?;
        let found = match tolerate_already_exists(self.client.create_volume(request).await)? {
            Some(vol) => (vol, true),
            None => match self.locate(name).await? {
                Some(vol) => (vol, false),
                None => {
                    return Err(Error::UnknownVolume {
                        op: "mount".into(),
                        name: name.into(),
                    })
                }
            },
        };
        self.cache.set(name, found.0.clone());
        Ok(found)
    }

    /// controller-publish then node-publish; returns the target path
    async fn publish(&self, name: &str, vol: &VolumeDescriptor) -> Result<String> {
        let volume_id = volume_id(vol)?;
        let capability = VolumeCapability::mount(&self.config.fs_type);

        let node_id = self.client.get_node_id().await?;
        let publish_info = self
            .client
            .controller_publish_volume(ControllerPublishRequest {
                volume_id: volume_id.clone(),
                metadata: vol.metadata.clone(),
                node_id,
                capability: capability.clone(),
                readonly: false,
            })
            .await?;

        let target = self.config.target_path(name);
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&target)?;
        let target = target.to_string_lossy().to_string();

        self.client
            .node_publish_volume(NodePublishRequest {
                volume_id,
                metadata: vol.metadata.clone(),
                publish_info: Some(publish_info),
                target_path: target.clone(),
                capability,
                readonly: false,
            })
            .await?;

        Ok(target)
    }

    /// Best-effort teardown of a volume this Mount created
    async fn discard_created(&self, name: &str, vol: &VolumeDescriptor) {
        let Ok(volume_id) = volume_id(vol) else {
            return;
        };
        let target = self.config.target_path(name).to_string_lossy().to_string();

        let result = match self.unpublish(&volume_id, vol, &target).await {
            Ok(()) => tolerate_does_not_exist(
                self.client.delete_volume(&volume_id, &vol.metadata).await,
            ),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.cache.delete(name);
                info!(volume_id = %volume_id, "deleted volume created by failed mount");
            }
            Err(e) => {
                warn!(
                    volume_id = %volume_id,
                    error = %e,
                    "could not delete volume created by failed mount"
                )
            }
        }
    }

    async fn do_unmount(&self, name: &str) -> Result<()> {
        let mut vol = self.cached("unmount", name)?;

        let Some(target) = vol.target_path().map(str::to_string) else {
            debug!("no target path recorded, already unmounted");
            return Ok(());
        };

        let volume_id = volume_id(&vol)?;
        self.unpublish(&volume_id, &vol, &target).await?;

        vol.clear_target_path();
        self.cache.set(name, vol);
        info!(target_path = %target, "volume unmounted");
        Ok(())
    }

    /// node-unpublish then controller-unpublish, both absence-tolerant
    async fn unpublish(
        &self,
        volume_id: &VolumeId,
        vol: &VolumeDescriptor,
        target: &str,
    ) -> Result<()> {
        tolerate_does_not_exist(
            self.client
                .node_unpublish_volume(volume_id, &vol.metadata, target)
                .await,
        )?;

        let node_id = self.client.get_node_id().await?;
        tolerate_does_not_exist(
            self.client
                .controller_unpublish_volume(volume_id, &vol.metadata, &node_id)
                .await,
        )
    }

    // =========================================================================
    // Remove
    // =========================================================================

    async fn do_remove(&self, name: &str) -> Result<()> {
        let vol = self.cached("remove", name)?;
        let volume_id = volume_id(&vol)?;

        let target = vol
            .target_path()
            .map(str::to_string)
            .unwrap_or_else(|| self.config.target_path(name).to_string_lossy().to_string());

        self.unpublish(&volume_id, &vol, &target).await?;
        tolerate_does_not_exist(self.client.delete_volume(&volume_id, &vol.metadata).await)?;

        self.cache.delete(name);
        info!(volume_id = %volume_id, "volume removed");
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn cached(&self, op: &str, name: &str) -> Result<VolumeDescriptor> {
        self.cache.get(name).ok_or_else(|| Error::UnknownVolume {
            op: op.to_string(),
            name: name.to_string(),
        })
    }

    fn finish<T>(&self, op: &str, started: Instant, result: &Result<T>) {
        self.metrics.observe(op, started, result.is_ok());
        if let Err(e) = result {
            debug!(op, error = %e, retryable = e.is_retryable(), "operation failed");
        }
    }
}

fn volume_id(vol: &VolumeDescriptor) -> Result<VolumeId> {
    vol.id
        .clone()
        .filter(|id| id.id().is_some())
        .ok_or(Error::MissingIdKey)
}

/// Names become a single directory under the mount root
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(Error::InvalidVolumeName {
            name: name.to_string(),
        });
    }
    Ok(())
}

fn parse_size_gib(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|gib| gib.checked_mul(GIB))
        .ok_or_else(|| Error::InvalidOption {
            key: key.to_string(),
            value: value.to_string(),
        })
}

/// Replace the cache with a listing, keeping target paths this process
/// stamped on volumes that are still present under the same id
fn refresh_cache(cache: &NameCache, descriptors: Vec<VolumeDescriptor>) -> usize {
    let previous: HashMap<String, VolumeDescriptor> = cache.snapshot().into_iter().collect();

    let merged = descriptors.into_iter().map(|mut vol| {
        if let Some(old) = previous.get(&vol.derived_name()) {
            if old.id_value() == vol.id_value() {
                if let Some(target) = old.target_path() {
                    vol.set_target_path(target);
                }
            }
        }
        vol
    });

    cache.replace_all(merged)
}
