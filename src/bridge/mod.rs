//! Lifecycle Bridge
//!
//! Glues the plugin-facing protocol to the remote volume service:
//! - Lifecycle: create/mount/unmount/remove sequencing
//! - Plugin API: HTTP/JSON handlers
//! - Server: listener and shutdown

pub mod lifecycle;
pub mod plugin_api;
pub mod server;

pub use lifecycle::{PluginCapabilities, VolumeBridge, VolumeInfo};
pub use plugin_api::PluginRouter;
pub use server::{PluginServer, PluginServerConfig};

use crate::backends::BackendFactory;
use crate::config::BridgeConfig;
use crate::domain::ports::{HostInspectorRef, RemoteVolumeClientRef};
use crate::error::Result;
use crate::host::LinuxHostInspector;
use crate::idempotency::{IdempotencyResolver, IdempotentClient, PublishTokenCache, ResolverConfig};
use crate::metrics::BridgeMetrics;
use std::sync::Arc;
use tracing::info;

/// Put the idempotent interceptor in front of `inner`
pub fn wrap_idempotent(
    inner: RemoteVolumeClientRef,
    host: HostInspectorRef,
    config: &BridgeConfig,
) -> RemoteVolumeClientRef {
    let resolver = IdempotencyResolver::new(
        inner.clone(),
        host,
        Arc::new(PublishTokenCache::new()),
        ResolverConfig {
            storage_type: config.storage_type,
            device_scan: config.device_scan,
        },
    );
    Arc::new(IdempotentClient::new(inner, Arc::new(resolver)))
}

/// Build a bridge from configuration: backend, host inspector, interceptor
pub fn assemble(config: BridgeConfig) -> Result<Arc<VolumeBridge>> {
    config.validate()?;

    let backend = BackendFactory::create(&config.backend, config.backends.clone())?;
    let client = if config.idempotency {
        let host: HostInspectorRef = Arc::new(LinuxHostInspector::new(config.host.clone()));
        wrap_idempotent(backend, host, &config)
    } else {
        backend
    };

    info!(
        backend = %config.backend,
        idempotency = config.idempotency,
        storage_type = %config.storage_type,
        mount_root = %config.mount_root.display(),
        "bridge assembled"
    );
    Ok(Arc::new(VolumeBridge::new(client, config, BridgeMetrics::new()?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_assemble_loopback_bridge() {
        let root = tempfile::tempdir().unwrap();
        let bridge = assemble(BridgeConfig {
            mount_root: root.path().to_path_buf(),
            idempotency: false,
            ..Default::default()
        })
        .unwrap();

        let mountpoint = bridge.mount("data").await.unwrap();
        assert_eq!(mountpoint, root.path().join("data").to_string_lossy());
    }

    #[test]
    fn test_assemble_unknown_backend() {
        let res = assemble(BridgeConfig {
            backend: "nfs-appliance".into(),
            ..Default::default()
        });
        assert_matches!(res.err(), Some(Error::BackendUnavailable { .. }));
    }
}
