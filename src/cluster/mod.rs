//! Inter-node plumbing
//!
//! Nodes talk to each other over plain TCP links carrying length-prefixed
//! JSON frames: request/reply invocations with correlation ids, and registry
//! mirror events pushed by the coordinator.

pub mod config;
pub mod peer;
pub mod rpc;
pub mod wire;

pub use config::NodeConfig;
pub use peer::Peers;
pub use rpc::{OpResult, RegistryRequest, RemoteOp, RoomOp};
pub use wire::{PeerFrame, WireCodec};
