//! Host Inspection
//!
//! Read-only view of the local host used by the idempotency resolver:
//! - Mount table: live (device, path) pairs
//! - Device map: attachment token to local device path

pub mod devices;
pub mod mounts;

pub use devices::DeviceScanner;
pub use mounts::{parse_mount_table, read_mount_table};

use crate::domain::ports::HostInspector;
use crate::domain::volume::{DeviceMap, DeviceScan, MountRecord};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Host paths, overridable for tests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub mount_table_path: PathBuf,
    pub by_id_dir: PathBuf,
    pub sysfs_path: PathBuf,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            mount_table_path: PathBuf::from("/proc/self/mounts"),
            by_id_dir: PathBuf::from("/dev/disk/by-id"),
            sysfs_path: PathBuf::from("/sys"),
        }
    }
}

/// Mount/device inspector backed by procfs, devfs and sysfs
pub struct LinuxHostInspector {
    config: HostConfig,
    scanner: DeviceScanner,
}

impl LinuxHostInspector {
    pub fn new(config: HostConfig) -> Self {
        let scanner = DeviceScanner::new(&config.by_id_dir, &config.sysfs_path);
        Self { config, scanner }
    }
}

impl HostInspector for LinuxHostInspector {
    fn mounts(&self) -> Result<Vec<MountRecord>> {
        read_mount_table(&self.config.mount_table_path)
    }

    fn local_devices(&self, scan: DeviceScan) -> Result<DeviceMap> {
        self.scanner
            .scan(scan)
            .map_err(|e| Error::LocalDevices(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::RwLock;

    /// In-memory host state
    #[derive(Default)]
    pub struct FakeHost {
        mounts: RwLock<Vec<MountRecord>>,
        devices: RwLock<DeviceMap>,
    }

    impl FakeHost {
        pub fn add_mount(&self, record: MountRecord) {
            self.mounts.write().push(record);
        }

        pub fn remove_mount(&self, path: &str) {
            self.mounts.write().retain(|m| m.path != path);
        }

        pub fn add_device(&self, token: &str, device: &str) {
            self.devices
                .write()
                .insert(token.to_string(), device.to_string());
        }
    }

    impl HostInspector for FakeHost {
        fn mounts(&self) -> Result<Vec<MountRecord>> {
            Ok(self.mounts.read().clone())
        }

        fn local_devices(&self, _scan: DeviceScan) -> Result<DeviceMap> {
            Ok(self.devices.read().clone())
        }
    }
}
