//! Idempotent client interceptor
//!
//! Wraps a [`RemoteVolumeClient`] and consults the [`IdempotencyResolver`]
//! before each lifecycle RPC, skipping calls whose end state is already
//! observable. Anything the resolver cannot prove is passed through to the
//! inner client, whose own idempotent semantics remain the final word.

use crate::domain::ports::{
    ControllerPublishRequest, InspectByName, NodePublishRequest, RemoteVolumeClient,
    RemoteVolumeClientRef,
};
use crate::domain::volume::{
    CreateVolumeRequest, InspectOptions, PublishInfo, VolumeDescriptor, VolumeId, VolumePage,
};
use crate::error::{Error, Result};
use crate::idempotency::resolver::{ControllerPublishState, IdempotencyResolver};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub struct IdempotentClient {
    inner: RemoteVolumeClientRef,
    resolver: Arc<IdempotencyResolver>,
}

impl IdempotentClient {
    /// `resolver` must have been built over the same `inner` client
    pub fn new(inner: RemoteVolumeClientRef, resolver: Arc<IdempotencyResolver>) -> Self {
        Self { inner, resolver }
    }

    pub fn resolver(&self) -> &Arc<IdempotencyResolver> {
        &self.resolver
    }
}

#[async_trait]
impl RemoteVolumeClient for IdempotentClient {
    async fn create_volume(&self, request: CreateVolumeRequest) -> Result<VolumeDescriptor> {
        if self.resolver.supports_name_lookup() {
            if let Some(existing) = self.resolver.resolve_descriptor(&request.name).await? {
                debug!(volume_name = %request.name, "volume exists, skipping create");
                return Ok(existing);
            }
        }
        self.inner.create_volume(request).await
    }

    async fn delete_volume(
        &self,
        volume_id: &VolumeId,
        metadata: &BTreeMap<String, String>,
    ) -> Result<()> {
        if self.resolver.resolve_name(volume_id).await?.is_none() {
            debug!(volume_id = %volume_id, "volume absent, skipping delete");
            return Ok(());
        }
        self.inner.delete_volume(volume_id, metadata).await
    }

    async fn controller_publish_volume(
        &self,
        request: ControllerPublishRequest,
    ) -> Result<PublishInfo> {
        let id = request.volume_id.id().ok_or(Error::MissingIdKey)?.to_string();

        let state = absent_as(
            self.resolver.is_controller_published(&request.volume_id).await,
            ControllerPublishState::NotPublished,
        )?;
        if let ControllerPublishState::Published(info) = state {
            debug!(volume_id = %id, "already controller-published, skipping publish");
            return Ok(info);
        }

        let info = self.inner.controller_publish_volume(request).await?;
        if let Some(token) = info.token().filter(|t| !t.is_empty()) {
            self.resolver.tokens().insert(&id, token);
        }
        Ok(info)
    }

    async fn controller_unpublish_volume(
        &self,
        volume_id: &VolumeId,
        metadata: &BTreeMap<String, String>,
        node_id: &str,
    ) -> Result<()> {
        let id = volume_id.id().ok_or(Error::MissingIdKey)?;

        let state = absent_as(
            self.resolver.is_controller_published(volume_id).await,
            ControllerPublishState::NotPublished,
        )?;
        if state == ControllerPublishState::NotPublished {
            debug!(volume_id = id, "not controller-published, skipping unpublish");
            self.resolver.tokens().remove(id);
            return Ok(());
        }

        self.inner
            .controller_unpublish_volume(volume_id, metadata, node_id)
            .await?;
        self.resolver.tokens().remove(id);
        Ok(())
    }

    async fn node_publish_volume(&self, request: NodePublishRequest) -> Result<()> {
        let published = absent_as(
            self.resolver
                .is_node_published(
                    &request.volume_id,
                    request.publish_info.as_ref(),
                    &request.target_path,
                )
                .await,
            false,
        )?;

        if published {
            debug!(target_path = %request.target_path, "already node-published, skipping publish");
            return Ok(());
        }
        self.inner.node_publish_volume(request).await
    }

    async fn node_unpublish_volume(
        &self,
        volume_id: &VolumeId,
        metadata: &BTreeMap<String, String>,
        target_path: &str,
    ) -> Result<()> {
        match absent_as(
            self.resolver
                .is_node_published(volume_id, None, target_path)
                .await,
            false,
        ) {
            Ok(true) => {}
            Ok(false) | Err(Error::MissingTargetPath { .. }) => {
                debug!(target_path, "not node-published, skipping unpublish");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        self.inner
            .node_unpublish_volume(volume_id, metadata, target_path)
            .await
    }

    async fn get_node_id(&self) -> Result<String> {
        self.inner.get_node_id().await
    }

    async fn list_volumes(&self, max_entries: u32, starting_token: &str) -> Result<VolumePage> {
        self.inner.list_volumes(max_entries, starting_token).await
    }

    async fn inspect_volume(&self, id: &str, options: InspectOptions) -> Result<VolumeDescriptor> {
        self.inner.inspect_volume(id, options).await
    }

    fn name_lookup(&self) -> Option<&dyn InspectByName> {
        self.inner.name_lookup()
    }
}

/// A volume the remote no longer knows is in no publish state at all; the
/// delegated call reports the method's own does-not-exist code.
fn absent_as<T>(result: Result<T>, absent: T) -> Result<T> {
    match result {
        Err(e) if e.is_not_found() => Ok(absent),
        other => other,
    }
}
