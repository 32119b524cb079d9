//! Name registries
//!
//! Two layers: the cluster-wide name registry (users and public rooms,
//! coordinator-backed with a per-node mirror) and the per-node unique-name
//! index over resident rooms.

pub mod cluster;
pub mod key;
pub mod local;

pub use cluster::ClusterRegistry;
pub use key::{RegistryEvent, RegistryKey};
pub use local::LocalRooms;
