//! The staged write path.
//!
//! A client write is split into sector pieces and queued on its blob's
//! [`SectorLockMap`](am_sector::SectorLockMap) under the map's mutex. The
//! resulting [`SectorAction`]s cross a channel to the dispatch stage, which
//! hands them to the [`ReplicaDispatcher`]. Replies re-enter the lock map,
//! producing more actions and finished client writes, until every sector the
//! write touched is durable in both the SM and the DM.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use am_dispatch::ReplicaDispatcher;
use am_sector::{BlobLockTable, BlobWrite, Progress, SectorAction, SectorLockMap, WriteSplitter};
use am_store::{CatalogEntry, CatalogUpdate};
use am_types::{AmError, BlobKey, ObjectId, RequestId, TxId};

type Waiter = oneshot::Sender<Result<(), AmError>>;

/// Sector stage plus the channel into the dispatch stage.
pub struct WritePipeline {
    locks: BlobLockTable,
    dispatcher: Arc<ReplicaDispatcher>,
    stage: mpsc::UnboundedSender<SectorAction>,
    waiters: Mutex<HashMap<RequestId, Waiter>>,
    next_request: AtomicU64,
}

impl WritePipeline {
    /// Create the pipeline and spawn its dispatch stage on the current
    /// runtime. The stage exits once the pipeline is dropped.
    pub fn spawn(dispatcher: Arc<ReplicaDispatcher>, runtime: &tokio::runtime::Handle) -> Arc<Self> {
        let (stage, jobs) = mpsc::unbounded_channel();
        let pipeline = Arc::new(Self {
            locks: BlobLockTable::new(),
            dispatcher,
            stage,
            waiters: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
        });
        runtime.spawn(run_dispatch_stage(Arc::downgrade(&pipeline), jobs));
        pipeline
    }

    /// Blobs with sector state in flight.
    pub fn active_blobs(&self) -> usize {
        self.locks.len()
    }

    /// Client writes not yet acknowledged.
    pub fn pending_writes(&self) -> usize {
        self.waiters.lock().expect("write waiters poisoned").len()
    }

    /// Run `write` through the sector stage and wait until every piece is
    /// durable or failed.
    pub async fn write(&self, write: BlobWrite, object_size: u32) -> Result<(), AmError> {
        let splitter = WriteSplitter::new(object_size);
        splitter.check(&write)?;
        let request = RequestId(self.next_request.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .expect("write waiters poisoned")
            .insert(request, tx);

        let outcome = self
            .locks
            .with_map(&write.key, object_size, |map| splitter.feed(map, request, &write));
        debug!(
            blob = %write.key,
            %request,
            offset = write.offset,
            len = write.data.len(),
            sectors = outcome.offsets.len(),
            rmw = outcome.need_get.len(),
            "write queued"
        );
        self.advance(outcome.progress);
        rx.await.map_err(|_| AmError::Shutdown)?
    }

    /// Forward new actions to the dispatch stage and acknowledge finished
    /// writes.
    fn advance(&self, progress: Progress) {
        for action in progress.actions {
            if self.stage.send(action).is_err() {
                warn!("dispatch stage is gone; dropping sector action");
            }
        }
        if progress.completed.is_empty() {
            return;
        }
        let mut waiters = self.waiters.lock().expect("write waiters poisoned");
        for completion in progress.completed {
            match waiters.remove(&completion.request) {
                Some(waiter) => {
                    let _ = waiter.send(completion.result);
                }
                None => debug!(request = %completion.request, "completion for unknown write"),
            }
        }
    }

    fn dispatch(self: &Arc<Self>, action: SectorAction) {
        trace!(?action, "dispatching sector action");
        match action {
            SectorAction::Read {
                key,
                tx,
                start,
                end,
                offsets,
            } => self.rmw_read(key, tx, start, end, offsets),
            SectorAction::Put {
                key,
                offset,
                content_id,
                payload,
            } => {
                let this = Arc::clone(self);
                let reply_key = key.clone();
                self.dispatcher.put_object(
                    &key,
                    content_id,
                    payload,
                    Box::new(move |result| {
                        this.on_reply(&reply_key, |map| map.write_resp(offset, content_id, result));
                    }),
                );
            }
            SectorAction::Catalog {
                key,
                tx,
                offset,
                content_id,
                length,
                truncate,
            } => {
                let this = Arc::clone(self);
                let reply_key = key.clone();
                let update = CatalogUpdate {
                    offset,
                    object: content_id,
                    length,
                    truncate,
                };
                self.dispatcher.update_catalog(
                    &key,
                    tx,
                    update,
                    Box::new(move |result| {
                        this.on_reply(&reply_key, |map| map.catalog_resp(offset, content_id, result));
                    }),
                );
            }
        }
    }

    /// Look up the current objects of `offsets` and feed their contents back
    /// as read responses. Sectors the catalog does not know read as empty.
    fn rmw_read(self: &Arc<Self>, key: BlobKey, tx: Option<TxId>, start: u64, end: u64, offsets: Vec<u64>) {
        let this = Arc::clone(self);
        let reply_key = key.clone();
        self.dispatcher.query_catalog(
            &key,
            tx,
            start,
            end,
            Box::new(move |result| match result {
                Ok((_, entries)) => this.fetch_sectors(reply_key, &entries, offsets),
                Err(error) => {
                    for offset in offsets {
                        let error = error.clone();
                        this.on_reply(&reply_key, |map| map.read_resp(offset, Err(error)));
                    }
                }
            }),
        );
    }

    fn fetch_sectors(self: &Arc<Self>, key: BlobKey, entries: &[CatalogEntry], offsets: Vec<u64>) {
        let objects: HashMap<u64, ObjectId> = entries.iter().map(|e| (e.offset, e.object)).collect();
        for offset in offsets {
            let Some(object) = objects.get(&offset).copied() else {
                self.on_reply(&key, |map| map.read_resp(offset, Ok(Bytes::new())));
                continue;
            };
            let this = Arc::clone(self);
            let reply_key = key.clone();
            self.dispatcher.get_object(
                &key,
                object,
                Box::new(move |result| {
                    this.on_reply(&reply_key, |map| map.read_resp(offset, result));
                }),
            );
        }
    }

    fn on_reply(&self, key: &BlobKey, apply: impl FnOnce(&mut SectorLockMap) -> Progress) {
        match self.locks.with_existing(key, apply) {
            Some(progress) => self.advance(progress),
            None => debug!(blob = %key, "reply for blob without sector state"),
        }
    }
}

async fn run_dispatch_stage(pipeline: Weak<WritePipeline>, mut jobs: mpsc::UnboundedReceiver<SectorAction>) {
    while let Some(action) = jobs.recv().await {
        let Some(pipeline) = pipeline.upgrade() else {
            break;
        };
        pipeline.dispatch(action);
    }
    debug!("dispatch stage stopped");
}

impl std::fmt::Debug for WritePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritePipeline")
            .field("active_blobs", &self.active_blobs())
            .field("pending_writes", &self.pending_writes())
            .finish()
    }
}
