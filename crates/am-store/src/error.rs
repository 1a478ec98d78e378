use am_types::{AmError, ObjectId, TxId, VolumeId};

/// Errors from the object store and catalog.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    /// Payload does not hash to the id it was stored under.
    #[error("hash mismatch: stored as {expected}, content hashes to {computed}")]
    HashMismatch { expected: ObjectId, computed: ObjectId },

    #[error("cannot store object with null ID")]
    NullObjectId,

    #[error("volume not found: {0}")]
    VolumeNotFound(VolumeId),

    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("transaction not found: {0}")]
    TxNotFound(TxId),

    #[error("transaction already started: {0}")]
    DuplicateTx(TxId),

    /// A catalog update named a transaction opened on another blob.
    #[error("{tx} belongs to blob {expected}, not {actual}")]
    TxBlobMismatch {
        tx: TxId,
        expected: String,
        actual: String,
    },
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for AmError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ObjectNotFound(id) => AmError::ObjectNotFound(id),
            StoreError::VolumeNotFound(volume) => AmError::VolumeNotFound(volume),
            StoreError::BlobNotFound(blob) => AmError::BlobNotFound(blob),
            StoreError::TxNotFound(tx) => AmError::TxNotFound(tx),
            StoreError::DuplicateTx(tx) => AmError::Duplicate(tx.to_string()),
            StoreError::NullObjectId | StoreError::TxBlobMismatch { .. } => {
                AmError::InvalidArgument(err.to_string())
            }
            StoreError::HashMismatch { .. } => AmError::Backend(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_types::ErrorClass;

    #[test]
    fn maps_onto_gateway_error_classes() {
        assert!(AmError::from(StoreError::BlobNotFound("b".into())).is_not_found());
        assert_eq!(AmError::from(StoreError::DuplicateTx(TxId(3))).class(), ErrorClass::Duplicate);
        assert_eq!(AmError::from(StoreError::NullObjectId).class(), ErrorClass::Invalid);
    }
}
