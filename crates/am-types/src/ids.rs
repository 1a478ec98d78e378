use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! int_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// The raw integer value.
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }
    };
}

int_id!(
    /// Identity of a volume. Volumes shard the catalog over the DMT.
    VolumeId,
    "vol:"
);
int_id!(
    /// Identity of a backend node (SM and/or DM service).
    NodeId,
    "node:"
);
int_id!(
    /// Blob transaction identity, allocated by the gateway.
    TxId,
    "tx:"
);
int_id!(
    /// Stable arena index of a client write request.
    RequestId,
    "req:"
);

/// Version (epoch) of a placement table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableVersion(pub u64);

impl TableVersion {
    /// The version that follows this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for TableVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A blob within a volume. Sector locks and tx barriers are keyed on this.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct BlobKey {
    pub volume: VolumeId,
    pub blob: String,
}

impl BlobKey {
    pub fn new(volume: VolumeId, blob: impl Into<String>) -> Self {
        Self {
            volume,
            blob: blob.into(),
        }
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.volume, self.blob)
    }
}
