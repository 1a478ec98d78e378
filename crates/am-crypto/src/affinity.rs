//! Task-affinity ids.
//!
//! Requests carrying the same affinity id execute in dispatch order on a
//! backend; requests with different ids may run in parallel. The id is a
//! stable hash so every gateway instance derives the same value.

use am_types::{BlobKey, VolumeId};

const VOLUME_DOMAIN: &[u8] = b"am-affinity-volume:";
const BLOB_DOMAIN: &[u8] = b"am-affinity-blob:";

fn fold(hash: blake3::Hash) -> u64 {
    let bytes = hash.as_bytes();
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

/// Affinity id shared by every request of a volume.
pub fn volume_affinity(volume: VolumeId) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(VOLUME_DOMAIN);
    hasher.update(&volume.get().to_le_bytes());
    fold(hasher.finalize())
}

/// Affinity id shared by every request of one (volume, blob).
pub fn blob_affinity(key: &BlobKey) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(BLOB_DOMAIN);
    hasher.update(&key.volume.get().to_le_bytes());
    hasher.update(key.blob.as_bytes());
    fold(hasher.finalize())
}
