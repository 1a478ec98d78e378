use bytes::Bytes;

use am_types::ObjectId;

use crate::error::StoreResult;

/// Content-addressed object store (the SM side of a backend node).
///
/// Implementations must satisfy these invariants:
/// - Objects are immutable once written. The same id always names the same
///   bytes, so a repeated put is a no-op.
/// - A put is rejected unless the payload hashes to the id it is stored
///   under.
/// - Concurrent reads are always safe.
pub trait ObjectStore: Send + Sync {
    /// Read an object. Returns `Ok(None)` if it does not exist.
    fn get(&self, id: &ObjectId) -> StoreResult<Option<Bytes>>;

    /// Store `data` under `id`. Returns `true` if the object was new.
    fn put(&self, id: ObjectId, data: Bytes) -> StoreResult<bool>;

    fn exists(&self, id: &ObjectId) -> StoreResult<bool>;

    /// Delete an object. Returns `true` if it existed.
    fn delete(&self, id: &ObjectId) -> StoreResult<bool>;

    /// Read several objects. The default calls [`Self::get`] per id.
    fn get_batch(&self, ids: &[ObjectId]) -> StoreResult<Vec<Option<Bytes>>> {
        ids.iter().map(|id| self.get(id)).collect()
    }
}
