//! Name/ID Cache
//!
//! Concurrent index from human-readable volume name to the last descriptor
//! this process observed. Advisory only: entries may be older than the
//! remote's true state.

use crate::domain::volume::VolumeDescriptor;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Name to descriptor map behind a single read/write lock.
///
/// The lock is held only for the map operation itself, never across I/O.
#[derive(Debug, Default)]
pub struct NameCache {
    entries: RwLock<HashMap<String, VolumeDescriptor>>,
}

impl NameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<VolumeDescriptor> {
        let found = self.entries.read().get(name).cloned();
        debug!(volume_name = name, found = found.is_some(), "cache get");
        found
    }

    pub fn set(&self, name: &str, descriptor: VolumeDescriptor) {
        debug!(volume_name = name, volume_id = ?descriptor.id_value(), "cache set");
        self.entries.write().insert(name.to_string(), descriptor);
    }

    pub fn delete(&self, name: &str) -> Option<VolumeDescriptor> {
        debug!(volume_name = name, "cache delete");
        self.entries.write().remove(name)
    }

    /// Swap the whole mapping for the given descriptors.
    ///
    /// Descriptors without an id or with an empty derived name are skipped.
    /// Returns the number of entries now cached.
    pub fn replace_all(&self, descriptors: impl IntoIterator<Item = VolumeDescriptor>) -> usize {
        let mut next = HashMap::new();

        for descriptor in descriptors {
            if descriptor.id_value().is_none() {
                warn!(volume_name = %descriptor.name, "skipping volume without id");
                continue;
            }
            let name = descriptor.derived_name();
            if name.is_empty() {
                warn!(volume_id = ?descriptor.id_value(), "skipping volume with empty name");
                continue;
            }
            next.insert(name, descriptor);
        }

        let count = next.len();
        *self.entries.write() = next;
        debug!(count, "cache replaced");
        count
    }

    /// Copy of every cached entry, sorted by name
    pub fn snapshot(&self) -> Vec<(String, VolumeDescriptor)> {
        let mut entries: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::volume::{VolumeId, METADATA_KEY_NAME};
    use std::sync::Arc;

    fn descriptor(id: &str, name: Option<&str>) -> VolumeDescriptor {
        let mut d = VolumeDescriptor {
            id: Some(VolumeId::new(id)),
            ..Default::default()
        };
        if let Some(name) = name {
            d.metadata
                .insert(METADATA_KEY_NAME.to_string(), name.to_string());
        }
        d
    }

    #[test]
    fn test_set_get_delete() {
        let cache = NameCache::new();
        let d = descriptor("vol-1", Some("data"));

        cache.set("data", d.clone());
        assert_eq!(cache.get("data"), Some(d.clone()));
        assert_eq!(cache.delete("data"), Some(d));
        assert!(cache.get("data").is_none());
    }

    #[test]
    fn test_replace_all_drops_previous_entries() {
        let cache = NameCache::new();
        cache.set("old", descriptor("vol-0", Some("old")));

        let d1 = descriptor("vol-1", Some("one"));
        let d2 = descriptor("vol-2", None);
        assert_eq!(cache.replace_all(vec![d1.clone(), d2.clone()]), 2);

        assert!(cache.get("old").is_none());
        assert_eq!(cache.get("one"), Some(d1));
        // no name metadata: keyed by id
        assert_eq!(cache.get("vol-2"), Some(d2));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_replace_all_skips_unusable_entries() {
        let cache = NameCache::new();
        let no_id = VolumeDescriptor {
            name: "orphan".into(),
            ..Default::default()
        };
        let empty_name = VolumeDescriptor {
            id: Some(VolumeId::new("")),
            ..Default::default()
        };

        assert_eq!(cache.replace_all(vec![no_id, empty_name]), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_access() {
        let cache = Arc::new(NameCache::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let name = format!("vol-{}-{}", t, i);
                        cache.set(&name, descriptor(&name, Some(&name)));
                        assert!(cache.get(&name).is_some());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 800);
        assert_eq!(cache.snapshot()[0].0, "vol-0-0");
    }
}
