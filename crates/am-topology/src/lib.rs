//! Placement tables for the Access Manager.
//!
//! The SM shards objects over the **DLT** (object-id token → node column) and
//! the DM shards catalogs over the **DMT** (volume → node column). Both tables
//! are versioned and change underneath in-flight requests, so every request
//! pins the version it was dispatched under and releases the pin once its RPC
//! completes. A superseded version is only retired — and the change acked to
//! the control plane — after its last pin is released.
//!
//! This crate only consumes tables; building or rebalancing them is the
//! control plane's job.

pub mod error;
pub mod pin;
pub mod service;
pub mod table;

pub use error::TopologyError;
pub use pin::{RetireFn, TablePin, VersionPin};
pub use service::{TopologyService, VersionedTable};
pub use table::{Dlt, Dmt, PlacementTable};
