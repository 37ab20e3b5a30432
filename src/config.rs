//! Bridge configuration
//!
//! Loaded from an optional YAML file; every key has a default so an empty
//! file (or none at all) yields a working loopback setup.

use crate::backends::BackendConfig;
use crate::domain::volume::{DeviceScan, StorageType};
use crate::error::{Error, Result};
use crate::host::HostConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Default filesystem type requested on publish
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Default root under which per-volume target directories are created
pub const DEFAULT_MOUNT_ROOT: &str = "/var/lib/csi-volume-bridge/volumes";

/// What Mount does with a volume it created itself when a later step fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MountFailurePolicy {
    /// Keep the volume for a later retry
    #[default]
    Leave,
    /// Best-effort delete of the freshly created volume
    DeleteCreated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub fs_type: String,
    pub mount_root: PathBuf,
    pub storage_type: StorageType,
    pub device_scan: DeviceScan,
    /// Wrap the remote client with the idempotent interceptor
    pub idempotency: bool,
    pub mount_failure: MountFailurePolicy,
    /// Entries requested per ListVolumes page, 0 lets the backend decide
    pub list_page_size: u32,
    pub backend: String,
    pub backends: BackendConfig,
    pub host: HostConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            fs_type: DEFAULT_FS_TYPE.to_string(),
            mount_root: PathBuf::from(DEFAULT_MOUNT_ROOT),
            storage_type: StorageType::Block,
            device_scan: DeviceScan::Quick,
            idempotency: true,
            mount_failure: MountFailurePolicy::Leave,
            list_page_size: 0,
            backend: "loopback".to_string(),
            backends: BackendConfig::default(),
            host: HostConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml(&content)?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fs_type.trim().is_empty() {
            return Err(Error::Configuration("fs_type must not be empty".into()));
        }
        if !self.mount_root.is_absolute() {
            return Err(Error::Configuration(format!(
                "mount_root must be absolute: {}",
                self.mount_root.display()
            )));
        }
        if self.backend.trim().is_empty() {
            return Err(Error::Configuration("backend must not be empty".into()));
        }
        Ok(())
    }

    /// Target path for a volume: `<mount_root>/<name>`
    pub fn target_path(&self, name: &str) -> PathBuf {
        self.mount_root.join(name)
    }
}
