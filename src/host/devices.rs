//! Local Device Map
//!
//! Builds the attachment-token to device-path map from the host:
//! - Quick scan: the `/dev/disk/by-id` symlink directory
//! - Deep scan: additionally the per-device serials exposed in sysfs

use crate::domain::volume::{DeviceMap, DeviceScan};
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Reads device identities from devfs and sysfs
#[derive(Debug, Clone)]
pub struct DeviceScanner {
    by_id_dir: PathBuf,
    sysfs_path: PathBuf,
}

impl DeviceScanner {
    pub fn new(by_id_dir: impl Into<PathBuf>, sysfs_path: impl Into<PathBuf>) -> Self {
        Self {
            by_id_dir: by_id_dir.into(),
            sysfs_path: sysfs_path.into(),
        }
    }

    /// Scan the host at the requested depth
    pub fn scan(&self, depth: DeviceScan) -> Result<DeviceMap> {
        let mut devices = self.scan_by_id()?;

        if depth == DeviceScan::Deep {
            for (serial, device) in self.scan_serials()? {
                devices.entry(serial).or_insert(device);
            }
        }

        debug!(?depth, count = devices.len(), "scanned local devices");
        Ok(devices)
    }

    /// Symlink name to canonical device path
    fn scan_by_id(&self) -> Result<DeviceMap> {
        let mut devices = DeviceMap::new();

        let entries = match fs::read_dir(&self.by_id_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // no disks with stable ids attached yet
                debug!(dir = %self.by_id_dir.display(), "device id directory absent");
                return Ok(devices);
            }
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_symlink() {
                continue;
            }

            let token = entry.file_name().to_string_lossy().to_string();
            match fs::canonicalize(entry.path()) {
                Ok(target) => {
                    devices.insert(token, target.to_string_lossy().to_string());
                }
                Err(e) => {
                    warn!(token = %token, error = %e, "dangling device link");
                }
            }
        }

        Ok(devices)
    }

    /// Serial to `/dev/<name>` for every block device that exposes one
    fn scan_serials(&self) -> Result<Vec<(String, String)>> {
        let block = self.sysfs_path.join("class/block");
        let mut serials = Vec::new();

        for pattern in ["*/device/serial", "*/serial"] {
            let pattern = block.join(pattern);
            let pattern = pattern.to_string_lossy();
            let paths = glob::glob(&pattern)
                .map_err(|e| Error::LocalDevices(format!("invalid sysfs pattern: {}", e)))?;

            for path in paths.flatten() {
                let Some(name) = device_name(&block, &path) else {
                    continue;
                };
                match fs::read_to_string(&path) {
                    Ok(serial) if !serial.trim().is_empty() => {
                        serials.push((serial.trim().to_string(), format!("/dev/{}", name)));
                    }
                    Ok(_) => {}
                    Err(e) => debug!(path = %path.display(), error = %e, "unreadable serial"),
                }
            }
        }

        Ok(serials)
    }
}

/// First path component below the sysfs block directory
fn device_name(block: &Path, serial_path: &Path) -> Option<String> {
    serial_path
        .strip_prefix(block)
        .ok()?
        .components()
        .next()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
}
