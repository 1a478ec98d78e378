use am_types::NodeId;

/// Errors from setting up the in-process fabric.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    /// The fabric spawns lane workers and must be created inside a tokio
    /// runtime.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("node already registered: {0}")]
    DuplicateNode(NodeId),

    #[error("fabric lane count must be non-zero")]
    ZeroLanes,
}
