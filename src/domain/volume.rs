//! Volume data model
//!
//! Snapshots of remote volume state as seen by the bridge. The remote
//! service owns these; the bridge only ever holds read-only copies.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

// =============================================================================
// Well-known keys
// =============================================================================

/// Key of the opaque id map that carries the backend volume id
pub const ID_KEY: &str = "id";

/// Metadata key holding the human-readable volume name
pub const METADATA_KEY_NAME: &str = "name";

/// Metadata key holding the locally assigned target mount path
pub const METADATA_KEY_TARGET_PATH: &str = "targetPath";

/// Publish-info key holding the attachment token
pub const PUBLISH_KEY_TOKEN: &str = "token";

/// Publish-info key holding the encryption flag
pub const PUBLISH_KEY_ENCRYPTED: &str = "encrypted";

// =============================================================================
// Volume Id
// =============================================================================

/// Opaque volume identifier: a map of key to value with at least an `id` key
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeId(pub BTreeMap<String, String>);

impl VolumeId {
    /// Build an id map holding only the backend id
    pub fn new(id: impl Into<String>) -> Self {
        let mut values = BTreeMap::new();
        values.insert(ID_KEY.to_string(), id.into());
        Self(values)
    }

    /// The backend id, if the map carries one
    pub fn id(&self) -> Option<&str> {
        self.0.get(ID_KEY).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id() {
            Some(id) => write!(f, "{}", id),
            None => write!(f, "{:?}", self.0),
        }
    }
}

// =============================================================================
// Attachments
// =============================================================================

/// Attachment state of a volume relative to the inspecting instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentState {
    #[default]
    Unattached,
    Attached,
}

/// A single attachment of a volume to an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Device name on the instance (e.g., /dev/xvdf)
    pub device_name: String,
    /// Instance the volume is attached to
    pub instance_id: String,
}

// =============================================================================
// Volume Descriptor
// =============================================================================

/// Remote-authoritative description of a volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDescriptor {
    /// Opaque id; absent for malformed entries returned by a list
    pub id: Option<VolumeId>,
    /// Display name as reported by the backend
    pub name: String,
    /// Free-form metadata bag
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub attachment_state: AttachmentState,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Provisioned capacity in bytes
    #[serde(default)]
    pub capacity_bytes: u64,
    #[serde(default)]
    pub encrypted: bool,
}

impl VolumeDescriptor {
    /// The backend id, if present
    pub fn id_value(&self) -> Option<&str> {
        self.id.as_ref().and_then(VolumeId::id)
    }

    /// Name used to key this volume locally.
    ///
    /// Prefers the `name` metadata entry and falls back to the backend id.
    /// An empty string means no usable name could be derived.
    pub fn derived_name(&self) -> String {
        if let Some(name) = self.metadata.get(METADATA_KEY_NAME) {
            if !name.is_empty() {
                return name.clone();
            }
        }
        self.id_value().unwrap_or_default().to_string()
    }

    /// Target path stamped by a previous mount, if any
    pub fn target_path(&self) -> Option<&str> {
        self.metadata
            .get(METADATA_KEY_TARGET_PATH)
            .map(String::as_str)
            .filter(|p| !p.is_empty())
    }

    pub fn set_target_path(&mut self, path: impl Into<String>) {
        self.metadata
            .insert(METADATA_KEY_TARGET_PATH.to_string(), path.into());
    }

    pub fn clear_target_path(&mut self) {
        self.metadata.remove(METADATA_KEY_TARGET_PATH);
    }
}

// =============================================================================
// Publish Info
// =============================================================================

/// Publish-info returned by a controller-level publish
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishInfo {
    pub values: BTreeMap<String, String>,
}

impl PublishInfo {
    pub fn new(token: impl Into<String>, encrypted: bool) -> Self {
        let mut values = BTreeMap::new();
        values.insert(PUBLISH_KEY_TOKEN.to_string(), token.into());
        values.insert(PUBLISH_KEY_ENCRYPTED.to_string(), encrypted.to_string());
        Self { values }
    }

    /// Attachment token; `None` when the key is missing entirely
    pub fn token(&self) -> Option<&str> {
        self.values.get(PUBLISH_KEY_TOKEN).map(String::as_str)
    }

    pub fn encrypted(&self) -> bool {
        self.values
            .get(PUBLISH_KEY_ENCRYPTED)
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// How a published volume may be accessed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
}

/// Whether the volume is consumed as a filesystem or a raw device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    Mount {
        fs_type: String,
        mount_flags: Vec<String>,
    },
    Block,
}

/// Capability requested when publishing a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeCapability {
    pub access_mode: AccessMode,
    pub access_type: AccessType,
}

impl VolumeCapability {
    /// Single-node-writer filesystem mount with the given fs type
    pub fn mount(fs_type: impl Into<String>) -> Self {
        Self {
            access_mode: AccessMode::SingleNodeWriter,
            access_type: AccessType::Mount {
                fs_type: fs_type.into(),
                mount_flags: Vec::new(),
            },
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Request to create a volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    pub name: String,
    /// Minimum size in bytes, 0 lets the backend decide
    pub required_bytes: u64,
    /// Maximum size in bytes, 0 means unbounded
    pub limit_bytes: u64,
    pub capabilities: Vec<VolumeCapability>,
    pub parameters: BTreeMap<String, String>,
}

/// One page of a volume listing
#[derive(Debug, Clone, Default)]
pub struct VolumePage {
    pub entries: Vec<VolumeDescriptor>,
    /// Token for the next page; empty when the listing is complete
    pub next_token: String,
}

/// How much attachment information an inspect should return
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AttachmentRequest {
    #[default]
    None,
    /// Only attachments to the inspecting instance
    ForInstance,
    /// Attachments to the inspecting instance, with device names resolved
    WithDeviceMapForInstance,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InspectOptions {
    pub attachments: AttachmentRequest,
}

impl InspectOptions {
    pub fn for_instance() -> Self {
        Self {
            attachments: AttachmentRequest::ForInstance,
        }
    }

    pub fn with_device_map() -> Self {
        Self {
            attachments: AttachmentRequest::WithDeviceMapForInstance,
        }
    }
}

// =============================================================================
// Host State
// =============================================================================

/// One entry of the live host mount table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRecord {
    pub device: String,
    pub path: String,
}

impl MountRecord {
    pub fn new(device: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            path: path.into(),
        }
    }
}

/// Attachment token to local device path
pub type DeviceMap = HashMap<String, String>;

/// Depth of a local device scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceScan {
    /// Symlink directories only
    #[default]
    Quick,
    /// Symlinks plus per-device sysfs serials
    Deep,
}

/// Whether volumes of the configured backend surface as block devices
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Block,
    File,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageType::Block => write!(f, "block"),
            StorageType::File => write!(f, "file"),
        }
    }
}
