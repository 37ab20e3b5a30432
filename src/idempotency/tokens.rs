//! Attachment token cache
//!
//! Remembers the attachment token returned by each controller-level publish
//! this process performed. Entries are hints only: a cached token does not
//! prove the volume is still published, and a missing one does not prove it
//! is not. Nothing survives a restart.

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// Volume id to attachment token, guarded by its own lock
#[derive(Debug, Default)]
pub struct PublishTokenCache {
    tokens: RwLock<HashMap<String, String>>,
}

impl PublishTokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, volume_id: &str) -> Option<String> {
        self.tokens.read().get(volume_id).cloned()
    }

    pub fn insert(&self, volume_id: &str, token: impl Into<String>) {
        let token = token.into();
        debug!(volume_id, token = %token, "caching attachment token");
        self.tokens.write().insert(volume_id.to_string(), token);
    }

    pub fn remove(&self, volume_id: &str) -> Option<String> {
        debug!(volume_id, "forgetting attachment token");
        self.tokens.write().remove(volume_id)
    }

    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.read().is_empty()
    }
}
