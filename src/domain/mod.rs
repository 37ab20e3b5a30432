//! Domain layer - Volume data model and port definitions
//!
//! This module defines the volume descriptors exchanged with the remote
//! volume service and the traits (ports) that adapters implement,
//! following hexagonal architecture principles.

pub mod ports;
pub mod volume;

pub use ports::*;
pub use volume::*;
