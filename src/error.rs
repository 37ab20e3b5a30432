//! Error types for the volume bridge
//!
//! Provides structured error types for the lifecycle bridge, the remote
//! volume client, the idempotency resolver and host inspection.

use crate::domain::ports::{ErrorCode, RpcMethod};
use std::time::Duration;
use thiserror::Error;

/// A structured error returned by the remote volume service.
///
/// The method that produced the error travels with it so that
/// classification is always done against that method's own codes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{method} failed: {code}: {description}")]
pub struct RpcError {
    pub method: RpcMethod,
    pub code: ErrorCode,
    pub description: String,
}

impl RpcError {
    pub fn new(method: RpcMethod, code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            method,
            code,
            description: description.into(),
        }
    }
}

/// Unified error type for the bridge
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Remote Volume Service Errors
    // =========================================================================
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Backend unavailable: {backend}")]
    BackendUnavailable { backend: String },

    #[error("Capability unavailable: {capability}")]
    CapabilityUnavailable { capability: String },

    // =========================================================================
    // Idempotency Input Errors
    // =========================================================================
    #[error("missing id key path")]
    MissingIdKey,

    #[error("missing token key")]
    MissingTokenKey,

    #[error("target path not created: {path}")]
    MissingTargetPath { path: String },

    #[error("unable to get local devices: {0}")]
    LocalDevices(String),

    // =========================================================================
    // Plugin-Facing Errors
    // =========================================================================
    #[error("{op}: unknown volume: {name}")]
    UnknownVolume { op: String, name: String },

    #[error("volume not mounted: {name}")]
    NotMounted { name: String },

    #[error("invalid option {key}={value}")]
    InvalidOption { key: String, value: String },

    #[error("invalid volume name: {name:?}")]
    InvalidVolumeName { name: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Mount table parse error: {0}")]
    MountTableParse(String),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action a caller should take after a failed plugin-facing operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Retry after a specific duration
    RetryAfter(Duration),
    /// Don't retry, the request itself must change
    NoRetry,
}

impl Error {
    /// Determine what a caller should do about this error.
    ///
    /// The bridge never retries on its own; this only advises the caller.
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::Transport(_) | Error::BackendUnavailable { .. } => ErrorAction::RetryWithBackoff,

            Error::Rpc(e) if e.code == ErrorCode::OperationPending => {
                ErrorAction::RetryAfter(Duration::from_secs(5))
            }

            Error::Configuration(_)
            | Error::CapabilityUnavailable { .. }
            | Error::MissingIdKey
            | Error::MissingTokenKey
            | Error::MissingTargetPath { .. }
            | Error::UnknownVolume { .. }
            | Error::NotMounted { .. }
            | Error::InvalidOption { .. }
            | Error::InvalidVolumeName { .. }
            | Error::YamlParse(_) => ErrorAction::NoRetry,

            _ => ErrorAction::RetryWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRetry)
    }

    /// Check if this error means the inspected resource does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ResourceNotFound { .. })
    }

    /// The structured RPC error, if this error carries one
    pub fn rpc(&self) -> Option<&RpcError> {
        match self {
            Error::Rpc(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type alias for the bridge
pub type Result<T> = std::result::Result<T, Error>;
