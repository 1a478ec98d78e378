use serde::{Deserialize, Serialize};

use crate::error::AmError;
use crate::ids::VolumeId;

/// Default storage-object size: 2 MiB.
pub const DEFAULT_OBJECT_SIZE: u32 = 2 * 1024 * 1024;

/// How catalog-affecting requests fan out over a volume's DMT group.
///
/// Chosen once per volume when it is attached; the dispatcher never branches
/// on a runtime toggle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ReplicaPolicy {
    /// The first `num_primaries` nodes must all respond; the rest are
    /// best-effort optionals.
    MultiPrimary { num_primaries: usize },
    /// Quorum over the whole DMT group.
    Legacy,
}

impl Default for ReplicaPolicy {
    fn default() -> Self {
        Self::MultiPrimary { num_primaries: 2 }
    }
}

/// Which task-affinity key orders requests at the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationMode {
    /// No affinity; requests may execute in any order.
    None,
    /// All requests of a volume share one lane.
    #[default]
    Volume,
    /// All requests of one (volume, blob) share one lane.
    Blob,
}

/// Client write semantics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Bytes outside the written range keep their previous contents.
    #[default]
    Overwrite,
    /// The blob ends where the write ends.
    Truncate,
}

/// Static description of an attached volume.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDescriptor {
    pub id: VolumeId,
    pub name: String,
    /// Size of one storage object; writes are coalesced at this granularity.
    pub object_size: u32,
    /// Overrides the gateway's default replica policy when set.
    #[serde(default)]
    pub replica_policy: Option<ReplicaPolicy>,
}

impl VolumeDescriptor {
    pub fn new(id: VolumeId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            object_size: DEFAULT_OBJECT_SIZE,
            replica_policy: None,
        }
    }

    pub fn with_object_size(mut self, object_size: u32) -> Self {
        self.object_size = object_size;
        self
    }

    pub fn with_replica_policy(mut self, policy: ReplicaPolicy) -> Self {
        self.replica_policy = Some(policy);
        self
    }

    /// Structural checks performed on attach.
    pub fn validate(&self) -> Result<(), AmError> {
        if self.name.trim().is_empty() {
            return Err(AmError::InvalidArgument("volume name must not be empty".into()));
        }
        if self.object_size == 0 {
            return Err(AmError::InvalidArgument("object size must be non-zero".into()));
        }
        if let Some(ReplicaPolicy::MultiPrimary { num_primaries: 0 }) = self.replica_policy {
            return Err(AmError::InvalidArgument(
                "multi-primary policy needs at least one primary".into(),
            ));
        }
        Ok(())
    }
}
