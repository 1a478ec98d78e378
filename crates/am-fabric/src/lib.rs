//! RPC substrate for the Access Manager.
//!
//! The gateway talks to backend nodes through the callback-style
//! [`Transport`] trait: `send(node, envelope, responder)`, where the
//! responder is invoked exactly once with the node's reply or a transport
//! error. [`LocalFabric`] implements it in-process over [`BackendNode`]s,
//! which is what the tests and the `amctl` demo run against.
//!
//! # Ordering
//!
//! An [`Envelope`] may carry a task-affinity id. Requests to the same node
//! with the same affinity run on one lane, one after another, in the order
//! they were sent. Requests without an affinity run unordered.

pub mod error;
pub mod fabric;
pub mod fault;
pub mod message;
pub mod node;

pub use error::FabricError;
pub use fabric::{FabricConfig, LocalFabric};
pub use fault::{FaultAction, FaultRule};
pub use message::{Envelope, Request, RequestKind, Responder, Response, Transport};
pub use node::{Arrival, BackendNode};
