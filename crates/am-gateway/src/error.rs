use thiserror::Error;

/// Errors raised while assembling an [`AccessManager`](crate::AccessManager).
///
/// Blob operations themselves report [`am_types::AmError`].
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("fabric error: {0}")]
    Fabric(#[from] am_fabric::FabricError),

    #[error("topology error: {0}")]
    Topology(#[from] am_topology::TopologyError),

    #[error("the access manager needs a tokio runtime: {0}")]
    NoRuntime(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;
