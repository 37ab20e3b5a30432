//! Remote Volume Backends
//!
//! Provides implementations of the remote volume service contract:
//! - Loopback: in-process service for standalone operation and tests

pub mod loopback;

pub use loopback::{LoopbackConfig, LoopbackVolumeService};

use crate::domain::ports::RemoteVolumeClientRef;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Factory for creating remote volume clients
pub struct BackendFactory;

impl BackendFactory {
    /// Create a client by backend name
    pub fn create(name: &str, config: BackendConfig) -> Result<RemoteVolumeClientRef> {
        match name.to_lowercase().as_str() {
            "loopback" | "mock" => Ok(Arc::new(LoopbackVolumeService::new(config.loopback))),
            _ => Err(Error::BackendUnavailable {
                backend: name.to_string(),
            }),
        }
    }
}

/// Combined backend configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub loopback: LoopbackConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::RemoteVolumeClient;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_factory_creates_loopback() {
        let client = BackendFactory::create("Loopback", BackendConfig::default()).unwrap();
        assert_eq!(client.get_node_id().await.unwrap(), "loopback-node");
        assert!(client.name_lookup().is_some());
    }

    #[test]
    fn test_factory_rejects_unknown_backend() {
        let res = BackendFactory::create("ebs", BackendConfig::default());
        assert_matches!(res.err(), Some(Error::BackendUnavailable { backend }) if backend == "ebs");
    }
}
