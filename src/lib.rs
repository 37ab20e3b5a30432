//! CSI Volume Bridge
//!
//! Exposes remote volumes through the container runtime's volume plugin
//! protocol, sequencing controller- and node-level publish calls against a
//! CSI-style remote volume service and making every step safe to repeat.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          Plugin API (axum)                            │
//! │        Create / Remove / Mount / Unmount / Path / Get / List          │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────┐          ┌─────────────────────────────┐  │
//! │  │    Lifecycle Bridge    │─────────▶│   Name Cache (name → id)    │  │
//! │  └───────────┬────────────┘          └─────────────────────────────┘  │
//! │              │                                                        │
//! │  ┌───────────┴────────────┐          ┌─────────────────────────────┐  │
//! │  │ Idempotent Interceptor │─────────▶│  Resolver + Token Cache     │  │
//! │  └───────────┬────────────┘          └──────────────┬──────────────┘  │
//! │              │                                      │                 │
//! │              │                       ┌──────────────┴──────────────┐  │
//! │              │                       │ Host Inspector (mounts/dev) │  │
//! │              │                       └─────────────────────────────┘  │
//! ├──────────────┴───────────────────────────────────────────────────────┤
//! │                  Remote Volume Service (backends)                     │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`bridge`]: Plugin protocol, lifecycle sequencing and server
//! - [`idempotency`]: Error classification and already-done detection
//! - [`host`]: Mount table and local device inspection
//! - [`backends`]: Remote volume service implementations
//! - [`cache`]: Volume name cache
//! - [`domain`]: Core domain types and traits
//! - [`error`]: Error types and handling

pub mod backends;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod host;
pub mod idempotency;
pub mod metrics;

// Re-export commonly used types
pub use backends::{BackendConfig, BackendFactory};

pub use bridge::{
    assemble, wrap_idempotent, PluginCapabilities, PluginRouter, PluginServer,
    PluginServerConfig, VolumeBridge, VolumeInfo,
};

pub use cache::NameCache;

pub use config::{BridgeConfig, MountFailurePolicy};

pub use domain::ports::{
    ErrorCode, HostInspector, InspectByName, RemoteVolumeClient, RpcMethod,
};

pub use domain::volume::{DeviceScan, StorageType, VolumeDescriptor, VolumeId};

pub use error::{Error, ErrorAction, Result};

pub use host::{HostConfig, LinuxHostInspector};

pub use idempotency::{IdempotencyResolver, IdempotentClient, PublishTokenCache};

pub use metrics::BridgeMetrics;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
