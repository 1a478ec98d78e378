//! Replica dispatch for the Access Manager.
//!
//! Every outgoing request pins the placement table it was routed with,
//! fans out to that version's replica group under one of three
//! disciplines, and releases the pin once every replica has answered:
//!
//! - **Quorum** — object puts; succeeds at `min(group, 2)` acks
//! - **Failover** — reads; tries replicas in order, stopping early on
//!   errors a predicate marks terminal (not-found)
//! - **MultiPrimary** — catalog mutations; answers once the leading
//!   primaries responded, the rest are best-effort
//!
//! Catalog mutations are stamped with a per-volume sequence number by the
//! [`VolumeSequencer`], and transaction starts pass the
//! [`TxStartBarrier`] so one blob's transactions never straddle two DMT
//! versions.

pub mod barrier;
pub mod dispatcher;
pub mod fanout;
pub mod sequencer;

pub use barrier::TxStartBarrier;
pub use dispatcher::{DispatcherConfig, ReplicaDispatcher, ResponseFn};
pub use fanout::{FailoverCursor, FanoutTracker, MultiPrimaryTracker, QuorumTracker};
pub use sequencer::{SequenceEntry, VolumeSequencer};
