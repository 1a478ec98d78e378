use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::AmError;

/// Content-addressed identifier of a storage object.
///
/// An `ObjectId` is a 32-byte digest of an object's payload. The SM shards
/// objects by the leading bits of this id (see [`ObjectId::token`]), and the
/// sector pipeline uses it to match write responses with the update that
/// produced them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    /// Create an `ObjectId` from a pre-computed digest.
    pub const fn from_hash(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    /// The null object ID (all zeros). Represents "no object".
    pub const fn null() -> Self {
        Self([0u8; 32])
    }

    /// Returns `true` if this is the null object ID.
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// The raw 32-byte digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Placement token: the top `width_bits` bits of the id.
    ///
    /// `width_bits` of zero maps every object to token 0.
    pub fn token(&self, width_bits: u32) -> u32 {
        if width_bits == 0 {
            return 0;
        }
        let width = width_bits.min(32);
        let head = u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]);
        if width == 32 {
            head
        } else {
            head >> (32 - width)
        }
    }

    /// Hex-encoded string representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, AmError> {
        let bytes =
            hex::decode(s).map_err(|e| AmError::InvalidArgument(format!("bad hex: {e}")))?;
        let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            AmError::InvalidArgument(format!("object id must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.short_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for ObjectId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}
