//! Foundation types for the Access Manager (AM).
//!
//! This crate provides the identifiers, volume descriptors, and error
//! taxonomy shared by every other AM crate.
//!
//! # Key Types
//!
//! - [`ObjectId`] — Content-addressed identifier of a storage object
//! - [`VolumeId`], [`NodeId`], [`TxId`], [`RequestId`] — Integer identities
//! - [`TableVersion`] — Version (epoch) of a DLT or DMT placement table
//! - [`BlobKey`] — A (volume, blob name) pair, the unit of sector locking
//! - [`VolumeDescriptor`] — Per-volume object size and replica policy
//! - [`AmError`] — Error taxonomy with not-found / duplicate / failure classes

pub mod error;
pub mod ids;
pub mod object;
pub mod volume;

pub use error::{AmError, AmResult, ErrorClass};
pub use ids::{BlobKey, NodeId, RequestId, TableVersion, TxId, VolumeId};
pub use object::ObjectId;
pub use volume::{
    ReplicaPolicy, SerializationMode, VolumeDescriptor, WriteMode, DEFAULT_OBJECT_SIZE,
};
