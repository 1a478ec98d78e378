use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

use am_types::{ObjectId, TxId, VolumeId};

use crate::error::{StoreError, StoreResult};

/// The object holding one sector of a blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub object: ObjectId,
    pub length: u64,
}

/// One sector of a catalog query result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub offset: u64,
    pub object: ObjectId,
    pub length: u64,
}

/// A single catalog mutation: point `offset` at `object`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogUpdate {
    pub offset: u64,
    pub object: ObjectId,
    pub length: u64,
    /// The blob ends with this sector: set the size to its end and drop
    /// every later sector.
    pub truncate: bool,
}

/// Summary of one blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobStat {
    pub name: String,
    pub size: u64,
    pub objects: usize,
}

/// Catalog state of one blob.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlobRecord {
    pub size: u64,
    pub extents: BTreeMap<u64, Extent>,
}

impl BlobRecord {
    pub fn apply(&mut self, update: &CatalogUpdate) {
        self.extents.insert(
            update.offset,
            Extent {
                object: update.object,
                length: update.length,
            },
        );
        let end = update.offset.saturating_add(update.length);
        if update.truncate {
            self.extents.retain(|offset, _| *offset <= update.offset);
            self.size = end;
        } else {
            self.size = self.size.max(end);
        }
    }

    /// Sectors overlapping `[start, end)`.
    pub fn range(&self, start: u64, end: u64) -> Vec<CatalogEntry> {
        self.extents
            .range(..end)
            .filter(|(offset, extent)| offset.saturating_add(extent.length.max(1)) > start)
            .map(|(offset, extent)| CatalogEntry {
                offset: *offset,
                object: extent.object,
                length: extent.length,
            })
            .collect()
    }
}

#[derive(Debug)]
struct TxState {
    blob: String,
    staged: Vec<CatalogUpdate>,
}

#[derive(Debug, Default)]
struct VolumeState {
    blobs: BTreeMap<String, BlobRecord>,
    txs: HashMap<TxId, TxState>,
    last_seq: u64,
}

impl VolumeState {
    fn observe(&mut self, seq: u64) {
        self.last_seq = self.last_seq.max(seq);
    }

    fn tx(&self, tx: TxId, blob: &str) -> StoreResult<&TxState> {
        let state = self.txs.get(&tx).ok_or(StoreError::TxNotFound(tx))?;
        if state.blob != blob {
            return Err(StoreError::TxBlobMismatch {
                tx,
                expected: state.blob.clone(),
                actual: blob.to_string(),
            });
        }
        Ok(state)
    }

    /// The blob as seen from `tx`: committed state plus its staged updates.
    fn view(&self, blob: &str, tx: Option<TxId>) -> StoreResult<BlobRecord> {
        let committed = self.blobs.get(blob);
        let staged = match tx {
            Some(tx) => Some(self.tx(tx, blob)?),
            None => None,
        };
        let mut record = match (committed, staged) {
            (Some(record), _) => record.clone(),
            (None, Some(_)) => BlobRecord::default(),
            (None, None) => return Err(StoreError::BlobNotFound(blob.to_string())),
        };
        if let Some(state) = staged {
            for update in &state.staged {
                record.apply(update);
            }
        }
        Ok(record)
    }
}

/// In-memory DM catalog.
///
/// Volumes are created by [`Self::open_volume`]. Catalog updates carrying a
/// transaction are staged on it and applied atomically on commit; updates
/// without one apply immediately.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    volumes: RwLock<HashMap<VolumeId, VolumeState>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_volume<R>(
        &self,
        volume: VolumeId,
        f: impl FnOnce(&mut VolumeState) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let mut volumes = self.volumes.write().expect("catalog lock poisoned");
        let state = volumes
            .get_mut(&volume)
            .ok_or(StoreError::VolumeNotFound(volume))?;
        f(state)
    }

    fn read_volume<R>(&self, volume: VolumeId, f: impl FnOnce(&VolumeState) -> StoreResult<R>) -> StoreResult<R> {
        let volumes = self.volumes.read().expect("catalog lock poisoned");
        let state = volumes.get(&volume).ok_or(StoreError::VolumeNotFound(volume))?;
        f(state)
    }

    /// Open (creating if needed) a volume. Returns the highest sequence
    /// number this catalog has seen for it.
    pub fn open_volume(&self, volume: VolumeId) -> u64 {
        let mut volumes = self.volumes.write().expect("catalog lock poisoned");
        volumes.entry(volume).or_default().last_seq
    }

    pub fn has_volume(&self, volume: VolumeId) -> bool {
        self.volumes
            .read()
            .expect("catalog lock poisoned")
            .contains_key(&volume)
    }

    pub fn last_seq(&self, volume: VolumeId) -> StoreResult<u64> {
        self.read_volume(volume, |state| Ok(state.last_seq))
    }

    pub fn start_tx(&self, volume: VolumeId, blob: &str, tx: TxId, seq: u64) -> StoreResult<()> {
        self.with_volume(volume, |state| {
            state.observe(seq);
            if state.txs.contains_key(&tx) {
                return Err(StoreError::DuplicateTx(tx));
            }
            state.txs.insert(
                tx,
                TxState {
                    blob: blob.to_string(),
                    staged: Vec::new(),
                },
            );
            Ok(())
        })
    }

    /// Apply `update` to `blob`, or stage it on `tx`.
    pub fn update(
        &self,
        volume: VolumeId,
        blob: &str,
        tx: Option<TxId>,
        seq: u64,
        update: CatalogUpdate,
    ) -> StoreResult<()> {
        self.with_volume(volume, |state| {
            state.observe(seq);
            match tx {
                Some(tx) => {
                    state.tx(tx, blob)?;
                    if let Some(staged) = state.txs.get_mut(&tx) {
                        staged.staged.push(update);
                    }
                }
                None => state.blobs.entry(blob.to_string()).or_default().apply(&update),
            }
            Ok(())
        })
    }

    /// Apply everything staged on `tx`. Returns the blob's final size.
    pub fn commit_tx(&self, volume: VolumeId, tx: TxId, seq: u64) -> StoreResult<u64> {
        self.with_volume(volume, |state| {
            state.observe(seq);
            let staged = state.txs.remove(&tx).ok_or(StoreError::TxNotFound(tx))?;
            let record = state.blobs.entry(staged.blob.clone()).or_default();
            for update in &staged.staged {
                record.apply(update);
            }
            debug!(volume = %volume, %tx, blob = %staged.blob, size = record.size, "transaction committed");
            Ok(record.size)
        })
    }

    pub fn abort_tx(&self, volume: VolumeId, tx: TxId, seq: u64) -> StoreResult<()> {
        self.with_volume(volume, |state| {
            state.observe(seq);
            state.txs.remove(&tx).ok_or(StoreError::TxNotFound(tx))?;
            Ok(())
        })
    }

    /// Size and sectors of `blob` overlapping `[start, end)`, as seen from
    /// `tx`.
    pub fn query(
        &self,
        volume: VolumeId,
        blob: &str,
        tx: Option<TxId>,
        start: u64,
        end: u64,
    ) -> StoreResult<(u64, Vec<CatalogEntry>)> {
        self.read_volume(volume, |state| {
            let record = state.view(blob, tx)?;
            Ok((record.size, record.range(start, end)))
        })
    }

    pub fn stat(&self, volume: VolumeId, blob: &str) -> StoreResult<BlobStat> {
        self.read_volume(volume, |state| {
            let record = state
                .blobs
                .get(blob)
                .ok_or_else(|| StoreError::BlobNotFound(blob.to_string()))?;
            Ok(BlobStat {
                name: blob.to_string(),
                size: record.size,
                objects: record.extents.len(),
            })
        })
    }

    pub fn delete(&self, volume: VolumeId, blob: &str, seq: u64) -> StoreResult<()> {
        self.with_volume(volume, |state| {
            state.observe(seq);
            state
                .blobs
                .remove(blob)
                .map(|_| ())
                .ok_or_else(|| StoreError::BlobNotFound(blob.to_string()))
        })
    }

    /// Move `from` to `to`, replacing any blob already named `to`.
    pub fn rename(&self, volume: VolumeId, from: &str, to: &str, seq: u64) -> StoreResult<()> {
        self.with_volume(volume, |state| {
            state.observe(seq);
            let record = state
                .blobs
                .remove(from)
                .ok_or_else(|| StoreError::BlobNotFound(from.to_string()))?;
            state.blobs.insert(to.to_string(), record);
            Ok(())
        })
    }

    /// Names of every committed blob in `volume`.
    pub fn list(&self, volume: VolumeId) -> StoreResult<Vec<String>> {
        self.read_volume(volume, |state| Ok(state.blobs.keys().cloned().collect()))
    }
}
