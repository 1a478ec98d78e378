use crate::ids::{TableVersion, TxId, VolumeId};
use crate::object::ObjectId;

/// Coarse classification that drives retry, logging, and failover choices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Object, blob, offset or transaction absent. Never logged as an error.
    NotFound,
    /// Idempotent re-registration; downgraded to success where detected.
    Duplicate,
    /// Wrong coordinator, inactive volume, or stale placement.
    AccessDenied,
    /// Transport failures and timeouts.
    Transport,
    /// Any other backend failure.
    Failure,
    /// Caller supplied a malformed request.
    Invalid,
}

/// Errors surfaced by the Access Manager and its backends.
///
/// `AmError` is `Clone` because a single backend failure is fanned out to
/// every client request that waited on the failed sector.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmError {
    #[error("volume not found: {0}")]
    VolumeNotFound(VolumeId),

    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    #[error("transaction not found: {0}")]
    TxNotFound(TxId),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("volume {0} is not activated")]
    VolumeNotActivated(VolumeId),

    #[error("placement mismatch: request carried {carried}, node holds {current}")]
    TopologyMismatch {
        carried: TableVersion,
        current: TableVersion,
    },

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("backend failure: {0}")]
    Backend(String),

    #[error("quorum unreachable: {acked} acks of {required} required, {failed} failed")]
    QuorumUnreachable {
        acked: usize,
        required: usize,
        failed: usize,
    },

    #[error("no replicas for {0}")]
    NoReplicas(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("access manager is shut down")]
    Shutdown,
}

/// Result alias used across the AM crates.
pub type AmResult<T> = Result<T, AmError>;

impl AmError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::VolumeNotFound(_)
            | Self::BlobNotFound(_)
            | Self::ObjectNotFound(_)
            | Self::TxNotFound(_) => ErrorClass::NotFound,
            Self::Duplicate(_) => ErrorClass::Duplicate,
            Self::AccessDenied(_)
            | Self::VolumeNotActivated(_)
            | Self::TopologyMismatch { .. } => ErrorClass::AccessDenied,
            Self::Timeout | Self::Transport(_) => ErrorClass::Transport,
            Self::Backend(_)
            | Self::QuorumUnreachable { .. }
            | Self::NoReplicas(_)
            | Self::Shutdown => ErrorClass::Failure,
            Self::InvalidArgument(_) => ErrorClass::Invalid,
        }
    }

    /// Returns `true` for the not-found class.
    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }

    /// Rank used to pick the worst error seen by a multi-part request.
    pub fn severity(&self) -> u8 {
        match self.class() {
            ErrorClass::Duplicate => 0,
            ErrorClass::NotFound => 1,
            ErrorClass::Transport => 2,
            ErrorClass::Failure => 3,
            ErrorClass::Invalid => 4,
            ErrorClass::AccessDenied => 5,
        }
    }

    /// Keep whichever of `current` and `candidate` is worse. Ties keep the
    /// error recorded first.
    pub fn keep_worst(current: &mut Option<AmError>, candidate: &AmError) {
        match current {
            Some(existing) if existing.severity() >= candidate.severity() => {}
            _ => *current = Some(candidate.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_classification() {
        assert!(AmError::BlobNotFound("b".into()).is_not_found());
        assert!(AmError::ObjectNotFound(ObjectId::null()).is_not_found());
        assert!(!AmError::Timeout.is_not_found());
    }

    #[test]
    fn topology_mismatch_is_access_denied() {
        let err = AmError::TopologyMismatch {
            carried: TableVersion(1),
            current: TableVersion(2),
        };
        assert_eq!(err.class(), ErrorClass::AccessDenied);
    }

    #[test]
    fn keep_worst_prefers_higher_severity() {
        let mut worst = None;
        AmError::keep_worst(&mut worst, &AmError::Timeout);
        AmError::keep_worst(&mut worst, &AmError::BlobNotFound("x".into()));
        assert_eq!(worst, Some(AmError::Timeout));
        AmError::keep_worst(&mut worst, &AmError::AccessDenied("lease".into()));
        assert_eq!(worst, Some(AmError::AccessDenied("lease".into())));
    }

    #[test]
    fn keep_worst_ties_keep_first() {
        let mut worst = Some(AmError::Backend("first".into()));
        AmError::keep_worst(&mut worst, &AmError::Backend("second".into()));
        assert_eq!(worst, Some(AmError::Backend("first".into())));
    }
}
