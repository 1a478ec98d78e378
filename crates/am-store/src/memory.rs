use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;

use am_crypto::ContentHasher;
use am_types::ObjectId;

use crate::error::{StoreError, StoreResult};
use crate::traits::ObjectStore;

/// In-memory, HashMap-based object store.
///
/// Payloads are `Bytes`, so reads hand out shared views rather than copies.
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<ObjectId, Bytes>>,
    hasher: ContentHasher,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            hasher: ContentHasher::OBJECT,
        }
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.objects.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().expect("lock poisoned").is_empty()
    }

    /// Total bytes across all stored objects.
    pub fn total_bytes(&self) -> u64 {
        self.objects
            .read()
            .expect("lock poisoned")
            .values()
            .map(|data| data.len() as u64)
            .sum()
    }

    /// Sorted list of all object IDs in the store.
    pub fn all_ids(&self) -> Vec<ObjectId> {
        let map = self.objects.read().expect("lock poisoned");
        let mut ids: Vec<ObjectId> = map.keys().copied().collect();
        ids.sort();
        ids
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn get(&self, id: &ObjectId) -> StoreResult<Option<Bytes>> {
        let map = self.objects.read().expect("lock poisoned");
        Ok(map.get(id).cloned())
    }

    fn put(&self, id: ObjectId, data: Bytes) -> StoreResult<bool> {
        if id.is_null() {
            return Err(StoreError::NullObjectId);
        }
        let computed = self.hasher.hash(&data);
        if computed != id {
            return Err(StoreError::HashMismatch {
                expected: id,
                computed,
            });
        }
        let mut map = self.objects.write().expect("lock poisoned");
        if map.contains_key(&id) {
            return Ok(false);
        }
        map.insert(id, data);
        Ok(true)
    }

    fn exists(&self, id: &ObjectId) -> StoreResult<bool> {
        let map = self.objects.read().expect("lock poisoned");
        Ok(map.contains_key(id))
    }

    fn delete(&self, id: &ObjectId) -> StoreResult<bool> {
        let mut map = self.objects.write().expect("lock poisoned");
        Ok(map.remove(id).is_some())
    }
}

impl std::fmt::Debug for InMemoryObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryObjectStore")
            .field("object_count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(content: &'static [u8]) -> (ObjectId, Bytes) {
        (ContentHasher::OBJECT.hash(content), Bytes::from_static(content))
    }

    #[test]
    fn put_and_get() {
        let store = InMemoryObjectStore::new();
        let (id, data) = object(b"sector");
        assert!(store.put(id, data.clone()).unwrap());
        assert_eq!(store.get(&id).unwrap(), Some(data));
        assert!(store.exists(&id).unwrap());
    }

    #[test]
    fn put_is_idempotent() {
        let store = InMemoryObjectStore::new();
        let (id, data) = object(b"same");
        assert!(store.put(id, data.clone()).unwrap());
        assert!(!store.put(id, data).unwrap());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn put_rejects_wrong_id() {
        let store = InMemoryObjectStore::new();
        let (id, _) = object(b"one");
        let err = store.put(id, Bytes::from_static(b"two")).unwrap_err();
        assert!(matches!(err, StoreError::HashMismatch { .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn put_rejects_null_id() {
        let store = InMemoryObjectStore::new();
        assert_eq!(
            store.put(ObjectId::null(), Bytes::new()).unwrap_err(),
            StoreError::NullObjectId
        );
    }

    #[test]
    fn missing_object_reads_none() {
        let store = InMemoryObjectStore::new();
        let (id, _) = object(b"absent");
        assert_eq!(store.get(&id).unwrap(), None);
        assert!(!store.delete(&id).unwrap());
    }

    #[test]
    fn batch_and_accounting() {
        let store = InMemoryObjectStore::default();
        let (a, da) = object(b"aaaa");
        let (b, db) = object(b"bb");
        let (missing, _) = object(b"zz");
        store.put(a, da).unwrap();
        store.put(b, db).unwrap();
        let got = store.get_batch(&[a, missing, b]).unwrap();
        assert!(got[0].is_some() && got[1].is_none() && got[2].is_some());
        assert_eq!(store.total_bytes(), 6);
        let ids = store.all_ids();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert!(format!("{store:?}").contains("object_count: 2"));
    }

    #[test]
    fn concurrent_reads_are_safe() {
        use std::sync::Arc;
        use std::thread;

        let store = Arc::new(InMemoryObjectStore::new());
        let (id, data) = object(b"shared");
        store.put(id, data.clone()).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let data = data.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        assert_eq!(store.get(&id).unwrap(), Some(data.clone()));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
