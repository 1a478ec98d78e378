use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, trace};

use am_types::{AmError, BlobKey, ObjectId, RequestId, TxId};

use crate::lock::{LockResult, SectorLock};
use crate::requests::{Completion, RequestTable};
use crate::update::SectorUpdate;

/// Backend work produced by a sector transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SectorAction {
    /// Read the current contents of `offsets` (all within `[start, end)`)
    /// for read-modify-write.
    Read {
        key: BlobKey,
        tx: Option<TxId>,
        start: u64,
        end: u64,
        offsets: Vec<u64>,
    },
    /// Store `payload` under `content_id`.
    Put {
        key: BlobKey,
        offset: u64,
        content_id: ObjectId,
        payload: Bytes,
    },
    /// Point the blob's `offset` at `content_id`.
    Catalog {
        key: BlobKey,
        tx: Option<TxId>,
        offset: u64,
        content_id: ObjectId,
        length: u64,
        truncate: bool,
    },
}

/// Outcome of one lock-map call: what to dispatch next and which client
/// writes are finished.
#[derive(Debug, Default)]
pub struct Progress {
    pub actions: Vec<SectorAction>,
    pub completed: Vec<Completion>,
}

impl Progress {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.completed.is_empty()
    }

    pub fn extend(&mut self, other: Progress) {
        self.actions.extend(other.actions);
        self.completed.extend(other.completed);
    }
}

/// Sector locks and in-progress requests of one blob.
///
/// A sector entry exists only while some request depends on it. The map is
/// not thread-safe itself; [`BlobLockTable`] wraps each one in a mutex.
#[derive(Debug)]
pub struct SectorLockMap {
    key: BlobKey,
    object_size: u32,
    sectors: BTreeMap<u64, SectorLock>,
    requests: RequestTable,
}

impl SectorLockMap {
    pub fn new(key: BlobKey, object_size: u32) -> Self {
        Self {
            key,
            object_size,
            sectors: BTreeMap::new(),
            requests: RequestTable::default(),
        }
    }

    pub fn key(&self) -> &BlobKey {
        &self.key
    }

    pub fn object_size(&self) -> u32 {
        self.object_size
    }

    /// No sector is locked and no request is outstanding.
    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty() && self.requests.is_empty()
    }

    pub fn sector(&self, offset: u64) -> Option<&SectorLock> {
        self.sectors.get(&offset)
    }

    pub fn requests(&self) -> &RequestTable {
        &self.requests
    }

    /// Queue the sector pieces of one client write.
    pub fn queue_write(&mut self, request: RequestId, updates: Vec<SectorUpdate>) -> Progress {
        self.requests.register(request, updates.iter().map(SectorUpdate::offset));
        let mut progress = Progress::default();
        let mut reads = Vec::new();
        for mut update in updates {
            update.add_waiter(request);
            let offset = update.offset();
            let tx = update.tx();
            let step = self.sectors.entry(offset).or_default().queue_update(update);
            trace!(blob = %self.key, offset, ?step, "queued sector update");
            match step {
                LockResult::FirstEntry => reads.push((tx, offset)),
                LockResult::MergedEntry => progress.actions.extend(self.put_action(offset)),
                LockResult::Delayed | LockResult::Stable | LockResult::Finished => {}
            }
        }
        self.push_reads(reads, &mut progress);
        progress.completed = self.requests.take_completed();
        progress
    }

    /// Apply the RMW read of `offset`. An absent object reads as empty.
    pub fn read_resp(&mut self, offset: u64, read: Result<Bytes, AmError>) -> Progress {
        let read = match read {
            Err(error) if error.is_not_found() => Ok(Bytes::new()),
            other => other,
        };
        let Some(lock) = self.sectors.get_mut(&offset) else {
            debug!(blob = %self.key, offset, "read response for unknown sector");
            return Progress::default();
        };
        let step = lock.get_resp(
            read.map(|payload| SectorUpdate::read_result(offset, payload)),
            &mut self.requests,
        );
        self.follow_up(offset, step)
    }

    /// Apply the put response for `content_id` at `offset`.
    pub fn write_resp(&mut self, offset: u64, content_id: ObjectId, result: Result<(), AmError>) -> Progress {
        let Some(lock) = self.sectors.get_mut(&offset) else {
            debug!(blob = %self.key, offset, "put response for unknown sector");
            return Progress::default();
        };
        let step = lock.write_resp(
            SectorUpdate::stored(offset, content_id),
            result.err(),
            &mut self.requests,
        );
        self.follow_up(offset, step)
    }

    /// Apply the catalog response for `content_id` at `offset`.
    pub fn catalog_resp(&mut self, offset: u64, content_id: ObjectId, result: Result<(), AmError>) -> Progress {
        let Some(lock) = self.sectors.get_mut(&offset) else {
            debug!(blob = %self.key, offset, "catalog response for unknown sector");
            return Progress::default();
        };
        let step = lock.cat_resp(
            SectorUpdate::stored(offset, content_id),
            result.err(),
            &mut self.requests,
        );
        self.follow_up(offset, step)
    }

    fn follow_up(&mut self, offset: u64, step: LockResult) -> Progress {
        let mut progress = Progress::default();
        match step {
            LockResult::FirstEntry => {
                let tx = self.sectors.get(&offset).and_then(|l| l.front()).and_then(SectorUpdate::tx);
                self.push_reads(vec![(tx, offset)], &mut progress);
            }
            LockResult::MergedEntry => progress.actions.extend(self.put_action(offset)),
            LockResult::Stable => progress.actions.extend(self.catalog_action(offset)),
            LockResult::Delayed | LockResult::Finished => {}
        }
        if self.sectors.get(&offset).is_some_and(SectorLock::is_idle) {
            self.sectors.remove(&offset);
        }
        progress.completed = self.requests.take_completed();
        progress
    }

    fn put_action(&mut self, offset: u64) -> Option<SectorAction> {
        let inflight = self.sectors.get_mut(&offset)?.inflight_mut()?;
        Some(SectorAction::Put {
            key: self.key.clone(),
            offset,
            content_id: inflight.content_id(),
            payload: inflight.payload().cloned().unwrap_or_default(),
        })
    }

    fn catalog_action(&mut self, offset: u64) -> Option<SectorAction> {
        let inflight = self.sectors.get_mut(&offset)?.inflight_mut()?;
        Some(SectorAction::Catalog {
            key: self.key.clone(),
            tx: inflight.tx(),
            offset,
            content_id: inflight.content_id(),
            length: inflight.len(),
            truncate: inflight.truncates(),
        })
    }

    /// One consolidated read per transaction context.
    fn push_reads(&self, reads: Vec<(Option<TxId>, u64)>, progress: &mut Progress) {
        let mut by_tx: BTreeMap<Option<TxId>, Vec<u64>> = BTreeMap::new();
        for (tx, offset) in reads {
            by_tx.entry(tx).or_default().push(offset);
        }
        for (tx, mut offsets) in by_tx {
            offsets.sort_unstable();
            let (Some(&start), Some(&last)) = (offsets.first(), offsets.last()) else {
                continue;
            };
            progress.actions.push(SectorAction::Read {
                key: self.key.clone(),
                tx,
                start,
                end: last.saturating_add(u64::from(self.object_size)),
                offsets,
            });
        }
    }
}

/// Volume/blob → sector lock map.
///
/// Each map sits behind its own mutex; the table lock is only held to look
/// a map up or prune it. A map is dropped once it is empty and no other
/// caller holds a handle to it.
#[derive(Debug, Default)]
pub struct BlobLockTable {
    maps: Mutex<HashMap<BlobKey, Arc<Mutex<SectorLockMap>>>>,
}

impl BlobLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs with live sector state.
    pub fn len(&self) -> usize {
        self.maps.lock().expect("blob lock table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` on the map for `key`, creating it if needed.
    pub fn with_map<R>(&self, key: &BlobKey, object_size: u32, f: impl FnOnce(&mut SectorLockMap) -> R) -> R {
        let handle = {
            let mut maps = self.maps.lock().expect("blob lock table poisoned");
            Arc::clone(
                maps.entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(SectorLockMap::new(key.clone(), object_size)))),
            )
        };
        let result = {
            let mut map = handle.lock().expect("sector lock map poisoned");
            f(&mut map)
        };
        self.prune(key, handle);
        result
    }

    /// Run `f` on the map for `key` if one exists.
    pub fn with_existing<R>(&self, key: &BlobKey, f: impl FnOnce(&mut SectorLockMap) -> R) -> Option<R> {
        let handle = {
            let maps = self.maps.lock().expect("blob lock table poisoned");
            Arc::clone(maps.get(key)?)
        };
        let result = {
            let mut map = handle.lock().expect("sector lock map poisoned");
            f(&mut map)
        };
        self.prune(key, handle);
        Some(result)
    }

    fn prune(&self, key: &BlobKey, handle: Arc<Mutex<SectorLockMap>>) {
        let mut maps = self.maps.lock().expect("blob lock table poisoned");
        let Some(entry) = maps.get(key) else {
            return;
        };
        // The table and `handle` are the only holders.
        if !Arc::ptr_eq(entry, &handle) || Arc::strong_count(entry) != 2 {
            return;
        }
        let empty = entry.lock().expect("sector lock map poisoned").is_empty();
        if empty {
            maps.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_types::VolumeId;
    use proptest::prelude::*;

    const SIZE: u32 = 8;

    fn key() -> BlobKey {
        BlobKey::new(VolumeId(1), "blob")
    }

    fn piece(offset: u64, sub: u32, data: &[u8]) -> SectorUpdate {
        let complete = sub == 0 && data.len() == SIZE as usize;
        SectorUpdate::write(offset, sub, Bytes::copy_from_slice(data), complete)
    }

    /// Drive every action to success against `store`, the way a backend
    /// would, until the map goes quiet.
    fn run_to_completion(
        map: &mut SectorLockMap,
        store: &mut BTreeMap<u64, Bytes>,
        mut progress: Progress,
        completed: &mut Vec<Completion>,
    ) {
        let mut catalog: BTreeMap<u64, ObjectId> = BTreeMap::new();
        let mut objects: HashMap<ObjectId, Bytes> = HashMap::new();
        loop {
            completed.append(&mut progress.completed);
            let Some(action) = progress.actions.pop() else {
                break;
            };
            let next = match action {
                SectorAction::Read { offsets, .. } => {
                    let mut all = Progress::default();
                    for offset in offsets {
                        let data = store.get(&offset).cloned().ok_or(AmError::ObjectNotFound(ObjectId::null()));
                        all.extend(map.read_resp(offset, data));
                    }
                    all
                }
                SectorAction::Put { offset, content_id, payload, .. } => {
                    objects.insert(content_id, payload);
                    map.write_resp(offset, content_id, Ok(()))
                }
                SectorAction::Catalog { offset, content_id, .. } => {
                    catalog.insert(offset, content_id);
                    store.insert(offset, objects[&content_id].clone());
                    map.catalog_resp(offset, content_id, Ok(()))
                }
            };
            progress.extend(next);
        }
    }

    #[test]
    fn full_pieces_skip_the_read() {
        let mut map = SectorLockMap::new(key(), SIZE);
        let progress = map.queue_write(RequestId(1), vec![piece(0, 0, b"01234567"), piece(8, 0, b"89abcdef")]);
        assert_eq!(progress.actions.len(), 2);
        assert!(progress.actions.iter().all(|a| matches!(a, SectorAction::Put { .. })));
    }

    #[test]
    fn partial_pieces_share_one_read() {
        let mut map = SectorLockMap::new(key(), SIZE);
        let progress = map.queue_write(
            RequestId(1),
            vec![piece(0, 6, b"xy"), piece(8, 0, b"12345678"), piece(16, 0, b"z")],
        );
        let reads: Vec<_> = progress
            .actions
            .iter()
            .filter_map(|a| match a {
                SectorAction::Read { start, end, offsets, .. } => Some((*start, *end, offsets.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(reads, vec![(0, 24, vec![0, 16])]);
    }

    #[test]
    fn request_completes_after_every_sector_catalogued() {
        let mut map = SectorLockMap::new(key(), SIZE);
        let mut store = BTreeMap::new();
        let mut completed = Vec::new();
        let progress = map.queue_write(RequestId(1), vec![piece(0, 0, b"aaaaaaaa"), piece(8, 2, b"bb")]);
        run_to_completion(&mut map, &mut store, progress, &mut completed);
        assert_eq!(completed, vec![Completion { request: RequestId(1), result: Ok(()) }]);
        assert_eq!(store[&8].as_ref(), b"\0\0bb");
        assert!(map.is_empty());
    }

    #[test]
    fn not_found_read_is_treated_as_empty() {
        let mut map = SectorLockMap::new(key(), SIZE);
        map.queue_write(RequestId(1), vec![piece(0, 1, b"q")]);
        let progress = map.read_resp(0, Err(AmError::ObjectNotFound(ObjectId::null())));
        match &progress.actions[..] {
            [SectorAction::Put { payload, .. }] => assert_eq!(payload.as_ref(), b"\0q"),
            other => panic!("unexpected actions {other:?}"),
        }
    }

    #[test]
    fn read_failure_fails_every_request_on_the_sector() {
        let mut map = SectorLockMap::new(key(), SIZE);
        map.queue_write(RequestId(1), vec![piece(0, 1, b"a")]);
        map.queue_write(RequestId(2), vec![piece(0, 3, b"b"), piece(8, 0, b"cccccccc")]);
        let progress = map.read_resp(0, Err(AmError::Timeout));
        assert_eq!(progress.completed.len(), 1);
        assert_eq!(progress.completed[0].request, RequestId(1));
        // Request 2 still waits on offset 8, and must report the error.
        let mut store = BTreeMap::new();
        let mut completed = Vec::new();
        let put = map.put_action(8).into_iter().collect();
        run_to_completion(&mut map, &mut store, Progress { actions: put, completed: Vec::new() }, &mut completed);
        assert_eq!(completed, vec![Completion { request: RequestId(2), result: Err(AmError::Timeout) }]);
    }

    #[test]
    fn merged_requests_share_a_dependency_group() {
        let mut map = SectorLockMap::new(key(), SIZE);
        map.queue_write(RequestId(1), vec![piece(0, 0, b"a"), piece(8, 0, b"bbbbbbbb")]);
        map.queue_write(RequestId(2), vec![piece(0, 4, b"c")]);
        map.read_resp(0, Ok(Bytes::from_static(b"........")));
        let group = map.requests().dependencies(RequestId(2)).unwrap();
        assert!(group.contains(&RequestId(1)));
    }

    #[test]
    fn writes_of_different_transactions_catalog_separately() {
        let mut map = SectorLockMap::new(key(), SIZE);
        let progress = map.queue_write(RequestId(1), vec![piece(0, 0, b"TTTTTTTT").with_tx(Some(TxId(7)))]);
        let Some(SectorAction::Put { content_id: first, .. }) = progress.actions.first().cloned() else {
            panic!("expected put, got {:?}", progress.actions);
        };
        assert!(map.queue_write(RequestId(2), vec![piece(0, 2, b"nn")]).actions.is_empty());

        let progress = map.write_resp(0, first, Ok(()));
        assert!(matches!(
            progress.actions[..],
            [SectorAction::Catalog { tx: Some(TxId(7)), .. }]
        ));
        let progress = map.catalog_resp(0, first, Ok(()));
        assert_eq!(progress.completed, vec![Completion { request: RequestId(1), result: Ok(()) }]);
        match &progress.actions[..] {
            [SectorAction::Read { tx: None, offsets, .. }] => assert_eq!(offsets, &vec![0]),
            other => panic!("expected a read outside the transaction, got {other:?}"),
        }

        // Outside tx 7 the sector still holds its committed contents.
        let progress = map.read_resp(0, Ok(Bytes::from_static(b"cccccccc")));
        let Some(SectorAction::Put { content_id: second, payload, .. }) = progress.actions.first().cloned() else {
            panic!("expected put, got {:?}", progress.actions);
        };
        assert_eq!(payload.as_ref(), b"ccnncccc");
        let progress = map.write_resp(0, second, Ok(()));
        assert!(matches!(
            progress.actions[..],
            [SectorAction::Catalog { tx: None, .. }]
        ));
        let progress = map.catalog_resp(0, second, Ok(()));
        assert_eq!(progress.completed, vec![Completion { request: RequestId(2), result: Ok(()) }]);
        assert!(map.is_empty());
    }

    #[test]
    fn stale_response_for_unknown_sector_is_ignored() {
        let mut map = SectorLockMap::new(key(), SIZE);
        assert!(map.write_resp(64, ObjectId::null(), Ok(())).is_empty());
        assert!(map.catalog_resp(64, ObjectId::null(), Ok(())).is_empty());
    }

    #[test]
    fn lock_table_prunes_idle_maps() {
        let table = BlobLockTable::new();
        let progress = table.with_map(&key(), SIZE, |map| map.queue_write(RequestId(1), vec![piece(0, 0, b"aaaaaaaa")]));
        assert_eq!(table.len(), 1);
        let SectorAction::Put { content_id, .. } = progress.actions[0].clone() else {
            panic!("expected put");
        };
        table.with_existing(&key(), |map| map.write_resp(0, content_id, Ok(()))).unwrap();
        assert_eq!(table.len(), 1);
        let done = table
            .with_existing(&key(), |map| map.catalog_resp(0, content_id, Ok(())))
            .unwrap();
        assert_eq!(done.completed.len(), 1);
        assert!(table.is_empty());
        assert!(table.with_existing(&key(), |_| ()).is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// However writes to one sector interleave with backend responses,
        /// the stored result equals applying them in arrival order.
        #[test]
        fn writes_apply_in_arrival_order(
            writes in proptest::collection::vec((0u32..SIZE, proptest::collection::vec(any::<u8>(), 1..=SIZE as usize)), 1..8),
            initial in proptest::collection::vec(any::<u8>(), 0..=SIZE as usize),
        ) {
            let mut map = SectorLockMap::new(key(), SIZE);
            let mut store = BTreeMap::new();
            if !initial.is_empty() {
                store.insert(0u64, Bytes::from(initial.clone()));
            }

            let mut expected = initial.clone();
            let mut progress = Progress::default();
            for (index, (sub, data)) in writes.iter().enumerate() {
                let sub = *sub;
                let take = data.len().min((SIZE - sub) as usize);
                let data = &data[..take];
                let start = sub as usize;
                if sub == 0 && take == SIZE as usize {
                    expected = data.to_vec();
                } else {
                    if expected.len() < start + take {
                        expected.resize(start + take, 0);
                    }
                    expected[start..start + take].copy_from_slice(data);
                }
                progress.extend(map.queue_write(RequestId(index as u64), vec![piece(0, sub, data)]));
            }

            let mut completed = Vec::new();
            run_to_completion(&mut map, &mut store, progress, &mut completed);
            prop_assert_eq!(completed.len(), writes.len());
            prop_assert!(completed.iter().all(|c| c.result.is_ok()));
            prop_assert_eq!(store[&0].as_ref(), &expected[..]);
            prop_assert!(map.is_empty());
        }
    }
}
