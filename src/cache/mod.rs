//! Volume Caches
//!
//! Local, process-lifetime indexes kept by the bridge. Nothing here is
//! persisted or authoritative.

pub mod name_cache;

pub use name_cache::NameCache;
