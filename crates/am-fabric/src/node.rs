use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::debug;

use am_store::{InMemoryCatalog, InMemoryObjectStore, ObjectStore};
use am_types::{AmError, NodeId, TableVersion, VolumeId};

use crate::message::{Envelope, Request, RequestKind, Response};

/// A sequenced catalog request as it reached a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Arrival {
    pub volume: VolumeId,
    pub seq: u64,
    pub kind: RequestKind,
}

/// One backend node hosting an SM object store and a DM catalog.
///
/// A node can be fenced at a placement version: requests chosen from an
/// older table are refused with `TopologyMismatch`.
pub struct BackendNode {
    id: NodeId,
    objects: InMemoryObjectStore,
    catalog: InMemoryCatalog,
    dlt_fence: AtomicU64,
    dmt_fence: AtomicU64,
    arrivals: Mutex<Vec<Arrival>>,
    handled: Mutex<BTreeMap<RequestKind, usize>>,
}

impl BackendNode {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            objects: InMemoryObjectStore::new(),
            catalog: InMemoryCatalog::new(),
            dlt_fence: AtomicU64::new(0),
            dmt_fence: AtomicU64::new(0),
            arrivals: Mutex::new(Vec::new()),
            handled: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn objects(&self) -> &InMemoryObjectStore {
        &self.objects
    }

    pub fn catalog(&self) -> &InMemoryCatalog {
        &self.catalog
    }

    /// Refuse SM requests carrying a DLT version below `version`.
    pub fn fence_dlt(&self, version: TableVersion) {
        self.dlt_fence.fetch_max(version.0, Ordering::SeqCst);
    }

    /// Refuse DM requests carrying a DMT version below `version`.
    pub fn fence_dmt(&self, version: TableVersion) {
        self.dmt_fence.fetch_max(version.0, Ordering::SeqCst);
    }

    /// Sequenced catalog requests in the order they were executed.
    pub fn arrivals(&self) -> Vec<Arrival> {
        self.arrivals.lock().expect("arrival log poisoned").clone()
    }

    /// Requests of `kind` this node has executed.
    pub fn handled(&self, kind: RequestKind) -> usize {
        self.handled
            .lock()
            .expect("request counters poisoned")
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }

    /// Execute one request.
    pub fn handle(&self, envelope: Envelope) -> Result<Response, AmError> {
        let kind = envelope.request.kind();
        self.check_fence(kind, envelope.table_version)?;
        *self
            .handled
            .lock()
            .expect("request counters poisoned")
            .entry(kind)
            .or_default() += 1;
        if let (Some(volume), Some(seq)) = (envelope.request.volume(), envelope.request.seq()) {
            self.arrivals
                .lock()
                .expect("arrival log poisoned")
                .push(Arrival { volume, seq, kind });
        }
        debug!(node = %self.id, %kind, "executing request");
        self.execute(envelope.request)
    }

    fn check_fence(&self, kind: RequestKind, carried: TableVersion) -> Result<(), AmError> {
        let fence = if kind.is_catalog() {
            &self.dmt_fence
        } else {
            &self.dlt_fence
        };
        let current = TableVersion(fence.load(Ordering::SeqCst));
        if carried < current {
            return Err(AmError::TopologyMismatch { carried, current });
        }
        Ok(())
    }

    fn execute(&self, request: Request) -> Result<Response, AmError> {
        let response = match request {
            Request::PutObject { id, data } => {
                self.objects.put(id, data)?;
                Response::Ack
            }
            Request::GetObject { id } => match self.objects.get(&id)? {
                Some(data) => Response::Object(data),
                None => return Err(AmError::ObjectNotFound(id)),
            },
            Request::OpenVolume { volume } => Response::VolumeOpened {
                last_seq: self.catalog.open_volume(volume),
            },
            Request::StartTx { volume, blob, tx, seq } => {
                self.catalog.start_tx(volume, &blob, tx, seq)?;
                Response::Ack
            }
            Request::UpdateCatalog { volume, blob, tx, seq, update } => {
                self.catalog.update(volume, &blob, tx, seq, update)?;
                Response::Ack
            }
            Request::CommitTx { volume, tx, seq } => Response::Committed {
                size: self.catalog.commit_tx(volume, tx, seq)?,
            },
            Request::AbortTx { volume, tx, seq } => {
                self.catalog.abort_tx(volume, tx, seq)?;
                Response::Ack
            }
            Request::QueryCatalog { volume, blob, tx, start, end } => {
                let (size, entries) = self.catalog.query(volume, &blob, tx, start, end)?;
                Response::Catalog { size, entries }
            }
            Request::StatBlob { volume, blob } => Response::Stat(self.catalog.stat(volume, &blob)?),
            Request::DeleteBlob { volume, blob, seq } => {
                self.catalog.delete(volume, &blob, seq)?;
                Response::Ack
            }
            Request::RenameBlob { volume, from, to, seq } => {
                self.catalog.rename(volume, &from, &to, seq)?;
                Response::Ack
            }
        };
        Ok(response)
    }
}

impl std::fmt::Debug for BackendNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendNode")
            .field("id", &self.id)
            .field("objects", &self.objects.len())
            .finish()
    }
}
