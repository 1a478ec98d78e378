//! Sector-granularity write coalescing for the Access Manager.
//!
//! A blob is stored as a sequence of fixed-size storage objects ("sectors").
//! A client write that does not cover a whole sector needs a
//! read-modify-write, and concurrent writers to one sector must be merged in
//! arrival order instead of racing. This crate owns that logic:
//!
//! - [`SectorUpdate`] — one pending mutation of one sector, with the
//!   fold-forward and combine merge operators
//! - [`SectorLock`] — per-sector state machine: a FIFO of queued updates and
//!   at most one in-flight update
//! - [`SectorLockMap`] — all sector locks of one blob plus the request
//!   arena; turns backend responses into the next [`SectorAction`]s
//! - [`RequestTable`] — client write requests by [`RequestId`], their
//!   outstanding offsets and merged dependency groups
//! - [`WriteSplitter`] — aligns a [`BlobWrite`] to sector boundaries
//! - [`BlobLockTable`] — volume/blob → lock map, pruned when idle
//!
//! Nothing here performs I/O. Every transition returns the follow-up actions
//! for the caller to dispatch after it has released the blob's lock.
//!
//! [`RequestId`]: am_types::RequestId

pub mod lock;
pub mod map;
pub mod requests;
pub mod splitter;
pub mod update;

pub use lock::{LockResult, SectorLock};
pub use map::{BlobLockTable, Progress, SectorAction, SectorLockMap};
pub use requests::{Completion, RequestTable};
pub use splitter::{BlobWrite, SplitOutcome, WriteSplitter};
pub use update::SectorUpdate;
