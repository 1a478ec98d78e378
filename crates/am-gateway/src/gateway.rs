use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use am_dispatch::{ReplicaDispatcher, ResponseFn};
use am_fabric::Transport;
use am_sector::BlobWrite;
use am_store::BlobStat;
use am_topology::{Dlt, Dmt, TopologyError, TopologyService};
use am_types::{AmError, AmResult, BlobKey, TableVersion, TxId, VolumeDescriptor, VolumeId, WriteMode};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::pipeline::WritePipeline;
use crate::volume::VolumeTable;

/// Hand a completion callback to `issue` and wait for it to fire.
async fn call<T: Send + 'static>(issue: impl FnOnce(ResponseFn<T>)) -> AmResult<T> {
    let (tx, rx) = oneshot::channel();
    issue(Box::new(move |result| {
        let _ = tx.send(result);
    }));
    rx.await.map_err(|_| AmError::Shutdown)?
}

/// Open blob transactions. Commit and abort remove the entry first, so each
/// transaction ends once.
#[derive(Debug)]
struct TxTable {
    open: Mutex<HashMap<TxId, BlobKey>>,
    next: AtomicU64,
}

impl TxTable {
    fn new() -> Self {
        Self {
            open: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        }
    }

    fn allocate(&self, key: &BlobKey) -> TxId {
        let tx = TxId(self.next.fetch_add(1, Ordering::Relaxed));
        self.open
            .lock()
            .expect("tx table poisoned")
            .insert(tx, key.clone());
        tx
    }

    fn blob_of(&self, tx: TxId) -> Option<BlobKey> {
        self.open.lock().expect("tx table poisoned").get(&tx).cloned()
    }

    fn take(&self, tx: TxId) -> AmResult<BlobKey> {
        self.open
            .lock()
            .expect("tx table poisoned")
            .remove(&tx)
            .ok_or(AmError::TxNotFound(tx))
    }

    fn len(&self) -> usize {
        self.open.lock().expect("tx table poisoned").len()
    }
}

/// The Access Manager: blob operations over sector coalescing and replica
/// dispatch.
///
/// Transport and topology are injected so the same gateway runs against the
/// in-process [`LocalFabric`](am_fabric::LocalFabric) or any other
/// [`Transport`]. Must be created inside a tokio runtime; the write pipeline
/// spawns its dispatch stage there.
pub struct AccessManager {
    config: GatewayConfig,
    dispatcher: Arc<ReplicaDispatcher>,
    volumes: VolumeTable,
    txs: TxTable,
    pipeline: Arc<WritePipeline>,
}

impl AccessManager {
    pub fn new(
        config: GatewayConfig,
        transport: Arc<dyn Transport>,
        topology: Arc<TopologyService>,
    ) -> GatewayResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| GatewayError::NoRuntime(e.to_string()))?;
        let dispatcher = Arc::new(ReplicaDispatcher::new(transport, topology, config.dispatcher_config()));
        let pipeline = WritePipeline::spawn(Arc::clone(&dispatcher), &runtime);
        info!(
            serialization = ?config.serialization,
            policy = ?config.replica_policy(),
            "access manager started"
        );
        Ok(Self {
            config,
            dispatcher,
            volumes: VolumeTable::new(),
            txs: TxTable::new(),
            pipeline,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<ReplicaDispatcher> {
        &self.dispatcher
    }

    pub fn topology(&self) -> &Arc<TopologyService> {
        self.dispatcher.topology()
    }

    pub fn volumes(&self) -> &VolumeTable {
        &self.volumes
    }

    /// Client writes still waiting on the backend.
    pub fn pending_writes(&self) -> usize {
        self.pipeline.pending_writes()
    }

    /// Blobs with sector state in flight.
    pub fn active_blobs(&self) -> usize {
        self.pipeline.active_blobs()
    }

    pub fn open_transactions(&self) -> usize {
        self.txs.len()
    }

    /// A descriptor using the configured object size.
    pub fn volume_descriptor(&self, id: VolumeId, name: impl Into<String>) -> VolumeDescriptor {
        VolumeDescriptor::new(id, name).with_object_size(self.config.object_size)
    }

    // -----------------------------------------------------------------------
    // Volumes
    // -----------------------------------------------------------------------

    /// Attach a volume and open it on its DM group. Returns the volume's last
    /// sequence number as reported by the group.
    pub async fn attach_volume(&self, descriptor: VolumeDescriptor) -> AmResult<u64> {
        descriptor.validate()?;
        let id = descriptor.id;
        let policy = descriptor.replica_policy;
        self.volumes.insert(descriptor)?;
        if let Some(policy) = policy {
            self.dispatcher.set_policy(id, policy);
        }
        match call(|done| self.dispatcher.open_volume(id, done)).await {
            Ok(last_seq) => {
                info!(volume = %id, last_seq, "volume attached");
                Ok(last_seq)
            }
            Err(error) => {
                warn!(volume = %id, %error, "volume open failed");
                self.volumes.remove(id);
                self.dispatcher.forget_volume(id);
                Err(error)
            }
        }
    }

    pub fn detach_volume(&self, id: VolumeId) -> AmResult<()> {
        self.volumes.remove(id).ok_or(AmError::VolumeNotFound(id))?;
        self.dispatcher.forget_volume(id);
        info!(volume = %id, "volume detached");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    pub async fn start_blob_tx(&self, key: &BlobKey) -> AmResult<TxId> {
        self.volumes.get(key.volume)?;
        let tx = self.txs.allocate(key);
        match call(|done| self.dispatcher.start_tx(key.clone(), tx, done)).await {
            Ok(()) => {
                debug!(blob = %key, %tx, "transaction started");
                Ok(tx)
            }
            Err(error) => {
                let _ = self.txs.take(tx);
                Err(error)
            }
        }
    }

    /// Commit `tx`, returning the blob's size afterwards.
    pub async fn commit_blob_tx(&self, tx: TxId) -> AmResult<u64> {
        let key = self.txs.take(tx)?;
        let size = call(|done| self.dispatcher.commit_tx(&key, tx, done)).await?;
        debug!(blob = %key, %tx, size, "transaction committed");
        Ok(size)
    }

    pub async fn abort_blob_tx(&self, tx: TxId) -> AmResult<()> {
        let key = self.txs.take(tx)?;
        call(|done| self.dispatcher.abort_tx(&key, tx, done)).await?;
        debug!(blob = %key, %tx, "transaction aborted");
        Ok(())
    }

    fn check_tx(&self, key: &BlobKey, tx: Option<TxId>) -> AmResult<()> {
        let Some(tx) = tx else {
            return Ok(());
        };
        match self.txs.blob_of(tx) {
            Some(owner) if owner == *key => Ok(()),
            Some(owner) => Err(AmError::InvalidArgument(format!("{tx} belongs to {owner}, not {key}"))),
            None => Err(AmError::TxNotFound(tx)),
        }
    }

    // -----------------------------------------------------------------------
    // Blobs
    // -----------------------------------------------------------------------

    /// Write `data` at `offset`. Completes once every touched sector is
    /// stored and cataloged, with the worst error among them.
    pub async fn put_blob(
        &self,
        key: &BlobKey,
        tx: Option<TxId>,
        offset: u64,
        data: Bytes,
        mode: WriteMode,
    ) -> AmResult<()> {
        let object_size = self.volumes.object_size(key.volume)?;
        self.check_tx(key, tx)?;
        let write = BlobWrite {
            key: key.clone(),
            tx,
            offset,
            data,
            mode,
        };
        self.pipeline.write(write, object_size).await
    }

    /// Read up to `len` bytes at `offset`. The result stops at the end of the
    /// blob; holes read as zeros.
    pub async fn get_blob(&self, key: &BlobKey, tx: Option<TxId>, offset: u64, len: u64) -> AmResult<Bytes> {
        let object_size = u64::from(self.volumes.object_size(key.volume)?);
        self.check_tx(key, tx)?;
        let requested_end = offset.saturating_add(len);
        let (size, entries) = call(|done| self.dispatcher.query_catalog(key, tx, offset, requested_end, done)).await?;
        let end = requested_end.min(size);
        if offset >= end {
            return Ok(Bytes::new());
        }

        let mut fetches = Vec::new();
        for entry in entries
            .iter()
            .filter(|e| e.offset < end && e.offset.saturating_add(object_size) > offset)
        {
            let (tx, rx) = oneshot::channel();
            self.dispatcher.get_object(
                key,
                entry.object,
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
            );
            fetches.push((entry.offset, rx));
        }

        let mut out = BytesMut::zeroed((end - offset) as usize);
        for (sector, rx) in fetches {
            let data = rx.await.map_err(|_| AmError::Shutdown)??;
            let from = sector.max(offset);
            let to = sector.saturating_add(data.len() as u64).min(end);
            if from < to {
                out[(from - offset) as usize..(to - offset) as usize]
                    .copy_from_slice(&data[(from - sector) as usize..(to - sector) as usize]);
            }
        }
        Ok(out.freeze())
    }

    pub async fn stat_blob(&self, key: &BlobKey) -> AmResult<BlobStat> {
        self.volumes.get(key.volume)?;
        call(|done| self.dispatcher.stat_blob(key, done)).await
    }

    pub async fn delete_blob(&self, key: &BlobKey) -> AmResult<()> {
        self.volumes.get(key.volume)?;
        call(|done| self.dispatcher.delete_blob(key, done)).await
    }

    pub async fn rename_blob(&self, key: &BlobKey, to: impl Into<String>) -> AmResult<()> {
        self.volumes.get(key.volume)?;
        let to = to.into();
        if to.is_empty() {
            return Err(AmError::InvalidArgument("rename target must not be empty".into()));
        }
        call(|done| self.dispatcher.rename_blob(key, to, done)).await
    }

    // -----------------------------------------------------------------------
    // Placement
    // -----------------------------------------------------------------------

    /// Install a new DLT. The receiver resolves with the old version once
    /// every request dispatched under it has completed.
    pub fn install_dlt(&self, dlt: Dlt) -> Result<oneshot::Receiver<TableVersion>, TopologyError> {
        self.topology().install_dlt(dlt)
    }

    /// Install a new DMT and open every attached volume on its new group.
    pub fn install_dmt(&self, dmt: Dmt) -> Result<oneshot::Receiver<TableVersion>, TopologyError> {
        let retired = self.topology().install_dmt(dmt)?;
        for id in self.volumes.ids() {
            self.dispatcher.open_volume(
                id,
                Box::new(move |result| {
                    if let Err(error) = result {
                        warn!(volume = %id, %error, "reopen after DMT change failed");
                    }
                }),
            );
        }
        Ok(retired)
    }
}

impl std::fmt::Debug for AccessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessManager")
            .field("volumes", &self.volumes.len())
            .field("transactions", &self.txs.len())
            .field("pipeline", &self.pipeline)
            .finish()
    }
}
