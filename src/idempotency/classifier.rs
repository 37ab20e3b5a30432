//! RPC Error Classifier
//!
//! Decides whether a failed remote call means "the desired end state is
//! already in place" or a genuine failure. Classification only ever looks
//! at the codes of the method that produced the error.

use crate::domain::ports::{ErrorCode, RpcMethod};
use crate::error::{Error, Result};
use tracing::debug;

/// Outcome of classifying a failed RPC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The resource the call would have produced already exists
    AlreadySatisfied,
    /// The resource the call would have acted on is already gone
    AlreadyAbsent,
    /// A genuine failure, surfaced unchanged
    Real,
}

impl Classification {
    pub fn is_benign(self) -> bool {
        !matches!(self, Classification::Real)
    }
}

/// The code that means "already in the desired state" for a method
fn benign_code(method: RpcMethod) -> Option<(ErrorCode, Classification)> {
    match method {
        RpcMethod::CreateVolume => Some((
            ErrorCode::VolumeAlreadyExists,
            Classification::AlreadySatisfied,
        )),
        RpcMethod::DeleteVolume
        | RpcMethod::ControllerPublishVolume
        | RpcMethod::ControllerUnpublishVolume
        | RpcMethod::NodePublishVolume
        | RpcMethod::NodeUnpublishVolume => {
            Some((ErrorCode::VolumeDoesNotExist, Classification::AlreadyAbsent))
        }
        RpcMethod::GetNodeId
        | RpcMethod::ListVolumes
        | RpcMethod::InspectVolume
        | RpcMethod::InspectVolumeByName => None,
    }
}

/// Classify a structured (method, code) pair
pub fn classify_rpc(method: RpcMethod, code: ErrorCode) -> Classification {
    match benign_code(method) {
        Some((expected, class)) if expected == code => class,
        _ => Classification::Real,
    }
}

/// Classify any bridge error; errors without a structured code are real
pub fn classify(err: &Error) -> Classification {
    match err.rpc() {
        Some(rpc) => classify_rpc(rpc.method, rpc.code),
        None => Classification::Real,
    }
}

/// Turn a benign VOLUME_ALREADY_EXISTS into `Ok(None)`.
///
/// Any other failure, including a does-not-exist code, is returned as is.
pub fn tolerate_already_exists<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if classify(&err) == Classification::AlreadySatisfied => {
            debug!(error = %err, "tolerating already-exists");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Turn a benign VOLUME_DOES_NOT_EXIST into success
pub fn tolerate_does_not_exist(result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if classify(&err) == Classification::AlreadyAbsent => {
            debug!(error = %err, "tolerating does-not-exist");
            Ok(())
        }
        Err(err) => Err(err),
    }
}
