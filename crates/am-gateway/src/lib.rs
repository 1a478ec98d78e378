//! The Access Manager gateway.
//!
//! [`AccessManager`] is the façade clients call: attach and detach volumes,
//! run blob transactions, and get, put, stat, delete or rename blobs. Writes
//! flow through the [`WritePipeline`] (splitter → sector lock map → dispatch
//! stage); everything else goes straight to the
//! [`ReplicaDispatcher`](am_dispatch::ReplicaDispatcher).
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use am_fabric::{LocalFabric, Transport};
//! use am_gateway::{AccessManager, GatewayConfig};
//! use am_topology::{Dlt, Dmt, TopologyService};
//! use am_types::{BlobKey, NodeId, TableVersion, VolumeId, WriteMode};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatewayConfig::default();
//! let ids = vec![NodeId(1), NodeId(2), NodeId(3)];
//! let fabric = Arc::new(LocalFabric::with_nodes(config.fabric.clone(), ids.clone())?);
//! let topology = Arc::new(TopologyService::new(
//!     Dlt::new(TableVersion(1), 0, vec![ids.clone()])?,
//!     Dmt::new(TableVersion(1), vec![ids])?,
//! ));
//! let am = AccessManager::new(config, fabric as Arc<dyn Transport>, topology)?;
//! am.attach_volume(am.volume_descriptor(VolumeId(1), "photos")).await?;
//!
//! let key = BlobKey::new(VolumeId(1), "cat.jpg");
//! am.put_blob(&key, None, 0, "meow".into(), WriteMode::Overwrite).await?;
//! assert_eq!(&am.get_blob(&key, None, 0, 4).await?[..], b"meow");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod gateway;
pub mod pipeline;
pub mod volume;

pub use config::{ConfigError, GatewayConfig, PolicyKind};
pub use error::{GatewayError, GatewayResult};
pub use gateway::AccessManager;
pub use pipeline::WritePipeline;
pub use volume::VolumeTable;
