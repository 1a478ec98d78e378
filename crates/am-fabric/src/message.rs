use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use am_store::{BlobStat, CatalogEntry, CatalogUpdate};
use am_types::{AmError, NodeId, ObjectId, TableVersion, TxId, VolumeId};

/// A request to one backend node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    PutObject {
        id: ObjectId,
        data: Bytes,
    },
    GetObject {
        id: ObjectId,
    },
    OpenVolume {
        volume: VolumeId,
    },
    StartTx {
        volume: VolumeId,
        blob: String,
        tx: TxId,
        seq: u64,
    },
    UpdateCatalog {
        volume: VolumeId,
        blob: String,
        tx: Option<TxId>,
        seq: u64,
        update: CatalogUpdate,
    },
    CommitTx {
        volume: VolumeId,
        tx: TxId,
        seq: u64,
    },
    AbortTx {
        volume: VolumeId,
        tx: TxId,
        seq: u64,
    },
    QueryCatalog {
        volume: VolumeId,
        blob: String,
        tx: Option<TxId>,
        start: u64,
        end: u64,
    },
    StatBlob {
        volume: VolumeId,
        blob: String,
    },
    DeleteBlob {
        volume: VolumeId,
        blob: String,
        seq: u64,
    },
    RenameBlob {
        volume: VolumeId,
        from: String,
        to: String,
        seq: u64,
    },
}

/// Request discriminant, used for fault rules and accounting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestKind {
    PutObject,
    GetObject,
    OpenVolume,
    StartTx,
    UpdateCatalog,
    CommitTx,
    AbortTx,
    QueryCatalog,
    StatBlob,
    DeleteBlob,
    RenameBlob,
}

impl RequestKind {
    /// Served by the DM catalog rather than the SM object store.
    pub fn is_catalog(self) -> bool {
        !matches!(self, Self::PutObject | Self::GetObject)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PutObject => "put-object",
            Self::GetObject => "get-object",
            Self::OpenVolume => "open-volume",
            Self::StartTx => "start-tx",
            Self::UpdateCatalog => "update-catalog",
            Self::CommitTx => "commit-tx",
            Self::AbortTx => "abort-tx",
            Self::QueryCatalog => "query-catalog",
            Self::StatBlob => "stat-blob",
            Self::DeleteBlob => "delete-blob",
            Self::RenameBlob => "rename-blob",
        };
        f.write_str(name)
    }
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::PutObject { .. } => RequestKind::PutObject,
            Self::GetObject { .. } => RequestKind::GetObject,
            Self::OpenVolume { .. } => RequestKind::OpenVolume,
            Self::StartTx { .. } => RequestKind::StartTx,
            Self::UpdateCatalog { .. } => RequestKind::UpdateCatalog,
            Self::CommitTx { .. } => RequestKind::CommitTx,
            Self::AbortTx { .. } => RequestKind::AbortTx,
            Self::QueryCatalog { .. } => RequestKind::QueryCatalog,
            Self::StatBlob { .. } => RequestKind::StatBlob,
            Self::DeleteBlob { .. } => RequestKind::DeleteBlob,
            Self::RenameBlob { .. } => RequestKind::RenameBlob,
        }
    }

    pub fn volume(&self) -> Option<VolumeId> {
        match self {
            Self::PutObject { .. } | Self::GetObject { .. } => None,
            Self::OpenVolume { volume }
            | Self::StartTx { volume, .. }
            | Self::UpdateCatalog { volume, .. }
            | Self::CommitTx { volume, .. }
            | Self::AbortTx { volume, .. }
            | Self::QueryCatalog { volume, .. }
            | Self::StatBlob { volume, .. }
            | Self::DeleteBlob { volume, .. }
            | Self::RenameBlob { volume, .. } => Some(*volume),
        }
    }

    /// Volume sequence number, for the catalog mutations that carry one.
    pub fn seq(&self) -> Option<u64> {
        match self {
            Self::StartTx { seq, .. }
            | Self::UpdateCatalog { seq, .. }
            | Self::CommitTx { seq, .. }
            | Self::AbortTx { seq, .. }
            | Self::DeleteBlob { seq, .. }
            | Self::RenameBlob { seq, .. } => Some(*seq),
            _ => None,
        }
    }

    /// Stamp the volume sequence number. No-op for requests without one.
    pub fn set_seq(&mut self, value: u64) {
        match self {
            Self::StartTx { seq, .. }
            | Self::UpdateCatalog { seq, .. }
            | Self::CommitTx { seq, .. }
            | Self::AbortTx { seq, .. }
            | Self::DeleteBlob { seq, .. }
            | Self::RenameBlob { seq, .. } => *seq = value,
            _ => {}
        }
    }
}

/// A node's successful reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Ack,
    Object(Bytes),
    VolumeOpened { last_seq: u64 },
    Catalog { size: u64, entries: Vec<CatalogEntry> },
    Stat(BlobStat),
    Committed { size: u64 },
}

/// A request plus its routing metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub request: Request,
    /// Requests sharing an affinity id execute in send order on a node.
    pub affinity: Option<u64>,
    /// Version of the placement table the target was chosen from.
    pub table_version: TableVersion,
}

impl Envelope {
    pub fn new(request: Request, table_version: TableVersion) -> Self {
        Self {
            request,
            affinity: None,
            table_version,
        }
    }

    pub fn with_affinity(mut self, affinity: Option<u64>) -> Self {
        self.affinity = affinity;
        self
    }
}

/// Completion callback for one sent request. Invoked exactly once.
pub type Responder = Box<dyn FnOnce(Result<Response, AmError>) + Send>;

/// The asynchronous RPC substrate.
///
/// `send` must not block. Replies are delivered from the transport's own
/// tasks, never from inside `send`, so callers may send while holding a
/// lock that the responder also takes.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, node: NodeId, envelope: Envelope, responder: Responder);
}
