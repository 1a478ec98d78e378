use std::collections::BTreeSet;

use bytes::{Bytes, BytesMut};

use am_crypto::ContentHasher;
use am_types::{AmError, ObjectId, RequestId, TxId};

use crate::requests::RequestTable;

/// One pending mutation of a single sector of a blob.
///
/// An update either carries a payload (a client write, a read result, or a
/// merge of several of those) or only a content id (a "result" update that
/// stands in for data already stored). The content id is derived lazily from
/// the payload and cached until the payload changes again.
#[derive(Clone, Debug)]
pub struct SectorUpdate {
    offset: u64,
    sub_offset: u32,
    payload: Option<Bytes>,
    content_id: Option<ObjectId>,
    complete: bool,
    dirty: bool,
    cached: bool,
    tx: Option<TxId>,
    truncate: bool,
    waiters: BTreeSet<RequestId>,
}

impl SectorUpdate {
    /// A client write of `payload` at `sub_offset` within the sector that
    /// starts at `offset`. `complete` means the payload is the whole sector.
    pub fn write(offset: u64, sub_offset: u32, payload: Bytes, complete: bool) -> Self {
        Self {
            offset,
            sub_offset,
            payload: Some(payload),
            content_id: None,
            complete,
            dirty: true,
            cached: false,
            tx: None,
            truncate: false,
            waiters: BTreeSet::new(),
        }
    }

    /// Current sector contents as returned by a backend read. An absent
    /// object reads as an empty payload.
    pub fn read_result(offset: u64, payload: Bytes) -> Self {
        Self {
            offset,
            sub_offset: 0,
            payload: Some(payload),
            content_id: None,
            complete: true,
            dirty: true,
            cached: true,
            tx: None,
            truncate: false,
            waiters: BTreeSet::new(),
        }
    }

    /// A result update: data already stored under `content_id`.
    pub fn stored(offset: u64, content_id: ObjectId) -> Self {
        Self {
            offset,
            sub_offset: 0,
            payload: None,
            content_id: Some(content_id),
            complete: true,
            dirty: false,
            cached: false,
            tx: None,
            truncate: false,
            waiters: BTreeSet::new(),
        }
    }

    pub fn with_tx(mut self, tx: Option<TxId>) -> Self {
        self.tx = tx;
        self
    }

    pub fn with_truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    pub fn with_waiter(mut self, request: RequestId) -> Self {
        self.waiters.insert(request);
        self
    }

    pub fn add_waiter(&mut self, request: RequestId) {
        self.waiters.insert(request);
    }

    /// Absolute, sector-aligned offset within the blob.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Offset of the payload within the sector.
    pub fn sub_offset(&self) -> u32 {
        self.sub_offset
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// Payload length, or zero for a result update.
    pub fn len(&self) -> u64 {
        self.payload.as_ref().map_or(0, |p| p.len() as u64)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The payload covers the whole sector; no read is needed to apply it.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_cached(&self) -> bool {
        self.cached
    }

    /// Mark the payload as stable and safe to serve from a cache.
    pub fn mark_cached(&mut self) {
        self.cached = true;
    }

    pub fn tx(&self) -> Option<TxId> {
        self.tx
    }

    pub fn truncates(&self) -> bool {
        self.truncate
    }

    pub fn waiters(&self) -> &BTreeSet<RequestId> {
        &self.waiters
    }

    pub fn clear_waiters(&mut self) {
        self.waiters.clear();
    }

    /// Content id if already derived and still current.
    pub fn peek_content_id(&self) -> Option<ObjectId> {
        if self.dirty && self.payload.is_some() {
            None
        } else {
            self.content_id
        }
    }

    /// Content id of the payload, hashing it if it changed since the last
    /// call.
    pub fn content_id(&mut self) -> ObjectId {
        if let Some(id) = self.peek_content_id() {
            return id;
        }
        let id = match &self.payload {
            Some(payload) => ContentHasher::OBJECT.hash(payload),
            None => ObjectId::null(),
        };
        self.content_id = Some(id);
        self.dirty = false;
        id
    }

    /// Fold-forward (`self >> later`): hand this update's waiters to `later`.
    /// The payload is dropped.
    pub fn fold_into(self, later: &mut SectorUpdate) {
        later.waiters.extend(self.waiters);
    }

    /// Combine (`self << incoming`): make `self` the state after applying
    /// `incoming`.
    ///
    /// A partial `incoming` is spliced into a fresh copy of a whole-sector
    /// payload, so a cached buffer is never written through. Any other
    /// `incoming` replaces the payload outright. The result belongs to
    /// `incoming`'s transaction. Waiters are unioned and their requests
    /// joined into one dependency group.
    pub fn combine(&mut self, incoming: SectorUpdate, requests: &mut RequestTable) {
        debug_assert_eq!(self.offset, incoming.offset, "combining different sectors");
        let base_is_whole = self.complete && self.payload.is_some();

        if base_is_whole && !incoming.complete {
            let base = self.payload.take().unwrap_or_default();
            let data = incoming.payload.unwrap_or_default();
            self.payload = Some(splice(&base, incoming.sub_offset as usize, &data, incoming.truncate));
            self.content_id = None;
            self.dirty = true;
            self.cached = false;
            self.truncate |= incoming.truncate;
        } else {
            self.sub_offset = incoming.sub_offset;
            self.payload = incoming.payload;
            self.content_id = incoming.content_id;
            self.complete = incoming.complete;
            self.dirty = incoming.dirty;
            self.cached = incoming.cached;
            self.truncate = incoming.truncate;
        }
        self.tx = incoming.tx;

        self.waiters.extend(incoming.waiters);
        requests.link(&self.waiters);
    }

    /// Worst error recorded so far by any waiter.
    pub fn result(&self, requests: &RequestTable) -> Option<AmError> {
        let mut worst = None;
        for waiter in &self.waiters {
            if let Some(error) = requests.error_of(*waiter) {
                AmError::keep_worst(&mut worst, error);
            }
        }
        worst
    }

    /// Resolve this sector for every waiter. Returns `true` when every
    /// waiter's request (and its dependency group) is now fully resolved.
    pub fn notify_all(&self, error: Option<&AmError>, requests: &mut RequestTable) -> bool {
        let mut all_done = true;
        for waiter in &self.waiters {
            all_done &= requests.resolve(*waiter, self.offset, error);
        }
        all_done
    }
}

/// `base` with `data` written at `at`. Gaps are zero-filled. A truncating
/// splice drops whatever `base` held past the end of `data`.
fn splice(base: &[u8], at: usize, data: &[u8], truncate: bool) -> Bytes {
    let end = at + data.len();
    let len = if truncate { end } else { base.len().max(end) };
    let mut buf = BytesMut::with_capacity(len);
    buf.extend_from_slice(&base[..base.len().min(at)]);
    buf.resize(at, 0);
    buf.extend_from_slice(data);
    if len > end {
        buf.extend_from_slice(&base[end..len]);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(ids: &[u64]) -> RequestTable {
        let mut requests = RequestTable::default();
        for id in ids {
            requests.register(RequestId(*id), [0u64]);
        }
        requests
    }

    #[test]
    fn partial_is_spliced_into_whole_sector() {
        let mut requests = table(&[1, 2]);
        let mut base = SectorUpdate::read_result(0, Bytes::from_static(b"aaaaaaaa"))
            .with_waiter(RequestId(1));
        let partial = SectorUpdate::write(0, 2, Bytes::from_static(b"bb"), false)
            .with_waiter(RequestId(2));
        base.combine(partial, &mut requests);
        assert_eq!(base.payload().unwrap().as_ref(), b"aabbaaaa");
        assert!(base.is_complete());
        assert!(!base.is_cached());
        assert_eq!(base.waiters().len(), 2);
    }

    #[test]
    fn splice_past_end_zero_fills() {
        let mut requests = table(&[1]);
        let mut base = SectorUpdate::read_result(0, Bytes::from_static(b"ab"));
        base.combine(
            SectorUpdate::write(0, 4, Bytes::from_static(b"z"), false).with_waiter(RequestId(1)),
            &mut requests,
        );
        assert_eq!(base.payload().unwrap().as_ref(), b"ab\0\0z");
    }

    #[test]
    fn truncating_splice_drops_tail() {
        let mut requests = table(&[1]);
        let mut base = SectorUpdate::read_result(0, Bytes::from_static(b"0123456789"));
        base.combine(
            SectorUpdate::write(0, 3, Bytes::from_static(b"xy"), false)
                .with_truncate(true)
                .with_waiter(RequestId(1)),
            &mut requests,
        );
        assert_eq!(base.payload().unwrap().as_ref(), b"012xy");
        assert!(base.truncates());
    }

    #[test]
    fn full_incoming_replaces_base() {
        let mut requests = table(&[1, 2]);
        let mut base = SectorUpdate::read_result(0, Bytes::from_static(b"old!")).with_waiter(RequestId(1));
        let full = SectorUpdate::write(0, 0, Bytes::from_static(b"new!"), true)
            .with_tx(Some(TxId(9)))
            .with_waiter(RequestId(2));
        base.combine(full, &mut requests);
        assert_eq!(base.payload().unwrap().as_ref(), b"new!");
        assert_eq!(base.tx(), Some(TxId(9)));
        assert!(base.waiters().contains(&RequestId(1)));
    }

    #[test]
    fn cached_buffer_is_not_mutated() {
        let mut requests = table(&[1]);
        let shared = Bytes::from(vec![1u8; 8]);
        let mut base = SectorUpdate::read_result(0, shared.clone());
        base.combine(
            SectorUpdate::write(0, 0, Bytes::from_static(&[9, 9]), false).with_waiter(RequestId(1)),
            &mut requests,
        );
        assert_eq!(shared.as_ref(), &[1u8; 8]);
        assert_eq!(&base.payload().unwrap()[..2], &[9, 9]);
    }

    #[test]
    fn content_id_is_lazy_and_refreshed_after_change() {
        let mut requests = table(&[1]);
        let mut base = SectorUpdate::read_result(0, Bytes::from_static(b"abcd"));
        assert!(base.peek_content_id().is_none());
        let first = base.content_id();
        assert_eq!(base.peek_content_id(), Some(first));
        base.combine(
            SectorUpdate::write(0, 0, Bytes::from_static(b"z"), false).with_waiter(RequestId(1)),
            &mut requests,
        );
        assert!(base.peek_content_id().is_none());
        assert_ne!(base.content_id(), first);
    }

    #[test]
    fn fold_into_moves_only_waiters() {
        let earlier = SectorUpdate::write(0, 0, Bytes::from_static(b"x"), true).with_waiter(RequestId(3));
        let mut later = SectorUpdate::stored(0, ObjectId::from_hash([1; 32])).with_waiter(RequestId(4));
        earlier.fold_into(&mut later);
        assert!(later.payload().is_none());
        assert_eq!(later.waiters().len(), 2);
    }

    #[test]
    fn combine_links_dependencies() {
        let mut requests = table(&[1, 2]);
        let mut base = SectorUpdate::read_result(0, Bytes::from_static(b"....")).with_waiter(RequestId(1));
        base.combine(
            SectorUpdate::write(0, 1, Bytes::from_static(b"x"), false).with_waiter(RequestId(2)),
            &mut requests,
        );
        let group = requests.dependencies(RequestId(1)).unwrap();
        assert!(group.contains(&RequestId(2)));
    }

    #[test]
    fn notify_all_reports_worst_error() {
        let mut requests = RequestTable::default();
        requests.register(RequestId(1), [0u64, 4096]);
        let update = SectorUpdate::stored(0, ObjectId::null()).with_waiter(RequestId(1));
        let done = update.notify_all(Some(&AmError::Timeout), &mut requests);
        assert!(!done);
        assert_eq!(update.result(&requests), Some(AmError::Timeout));
    }
}
