//! Backend storage for the Access Manager's in-process cluster.
//!
//! Two stores live on every backend node:
//!
//! - an SM object store: content-addressed, immutable storage objects keyed
//!   by their [`ObjectId`](am_types::ObjectId)
//! - a DM catalog: per-volume blob metadata mapping each sector offset to the
//!   object holding it, with transactions staging catalog updates until
//!   commit
//!
//! # Design Rules
//!
//! 1. Objects are immutable once written; a put verifies the content hash.
//! 2. Writes inside a transaction are invisible outside it until commit.
//! 3. Reads inside a transaction see its own staged writes.
//! 4. Every mutation records the volume sequence number it carried.

pub mod catalog;
pub mod error;
pub mod memory;
pub mod traits;

pub use catalog::{BlobRecord, BlobStat, CatalogEntry, CatalogUpdate, Extent, InMemoryCatalog};
pub use error::{StoreError, StoreResult};
pub use memory::InMemoryObjectStore;
pub use traits::ObjectStore;
