//! Hashing primitives for the Access Manager.
//!
//! Provides the domain-separated BLAKE3 content hasher that derives an
//! object's [`ObjectId`](am_types::ObjectId) from its payload, and the
//! task-affinity hash that pins same-volume or same-blob requests to one
//! ordered execution lane.
//!
//! All hashing goes through `blake3`; nothing here is hand-rolled.

pub mod affinity;
pub mod hasher;

pub use affinity::{blob_affinity, volume_affinity};
pub use hasher::ContentHasher;
