use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tracing::{info, warn};

use am_types::{BlobKey, TableVersion};

#[derive(Debug)]
struct BarrierEntry<T> {
    version: TableVersion,
    outstanding: usize,
    queued: VecDeque<T>,
}

/// Keeps one blob's transaction starts on a single DMT version.
///
/// Starts issued under the version of the currently outstanding epoch are
/// admitted immediately. A start under any other version waits until every
/// outstanding start of the current epoch has been released; the whole
/// queue is then handed back as the next epoch.
#[derive(Debug)]
pub struct TxStartBarrier<T> {
    entries: Mutex<HashMap<BlobKey, BarrierEntry<T>>>,
}

impl<T> Default for TxStartBarrier<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> TxStartBarrier<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `start` issued under `version`. Returns it back if it may be
    /// dispatched now, or `None` if it was queued.
    pub fn admit(&self, key: &BlobKey, version: TableVersion, start: T) -> Option<T> {
        let mut entries = self.entries.lock().expect("tx barrier poisoned");
        let entry = entries.entry(key.clone()).or_insert_with(|| BarrierEntry {
            version,
            outstanding: 0,
            queued: VecDeque::new(),
        });
        if entry.outstanding == 0 && entry.queued.is_empty() {
            entry.version = version;
        }
        if entry.version == version && entry.queued.is_empty() {
            entry.outstanding += 1;
            return Some(start);
        }
        entry.queued.push_back(start);
        info!(
            blob = %key,
            epoch = %entry.version,
            issued = %version,
            outstanding = entry.outstanding,
            queued = entry.queued.len(),
            "transaction start queued behind previous placement epoch"
        );
        None
    }

    /// Release one outstanding start. When the epoch drains, every queued
    /// start is returned to be dispatched under `current`.
    pub fn release(&self, key: &BlobKey, current: TableVersion) -> Vec<T> {
        let mut entries = self.entries.lock().expect("tx barrier poisoned");
        let Some(entry) = entries.get_mut(key) else {
            warn!(blob = %key, "release without an outstanding transaction start");
            return Vec::new();
        };
        entry.outstanding = entry.outstanding.saturating_sub(1);
        if entry.outstanding > 0 {
            return Vec::new();
        }
        if entry.queued.is_empty() {
            entries.remove(key);
            return Vec::new();
        }
        let batch: Vec<T> = entry.queued.drain(..).collect();
        info!(
            blob = %key,
            from = %entry.version,
            to = %current,
            starts = batch.len(),
            "placement epoch drained; dispatching queued transaction starts"
        );
        entry.version = current;
        entry.outstanding = batch.len();
        batch
    }

    /// Outstanding starts and queued starts for `key`.
    pub fn state(&self, key: &BlobKey) -> Option<(TableVersion, usize, usize)> {
        let entries = self.entries.lock().expect("tx barrier poisoned");
        entries
            .get(key)
            .map(|e| (e.version, e.outstanding, e.queued.len()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().expect("tx barrier poisoned").is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_types::VolumeId;

    fn key() -> BlobKey {
        BlobKey::new(VolumeId(1), "blob")
    }

    #[test]
    fn same_version_starts_run_concurrently() {
        let barrier = TxStartBarrier::new();
        assert_eq!(barrier.admit(&key(), TableVersion(1), "a"), Some("a"));
        assert_eq!(barrier.admit(&key(), TableVersion(1), "b"), Some("b"));
        assert_eq!(barrier.state(&key()), Some((TableVersion(1), 2, 0)));
    }

    #[test]
    fn new_version_waits_for_drain() {
        let barrier = TxStartBarrier::new();
        barrier.admit(&key(), TableVersion(1), "a");
        barrier.admit(&key(), TableVersion(1), "b");
        assert_eq!(barrier.admit(&key(), TableVersion(2), "c"), None);
        // Same-version starts queue too once something is waiting.
        assert_eq!(barrier.admit(&key(), TableVersion(1), "d"), None);

        assert!(barrier.release(&key(), TableVersion(2)).is_empty());
        let batch = barrier.release(&key(), TableVersion(2));
        assert_eq!(batch, vec!["c", "d"]);
        assert_eq!(barrier.state(&key()), Some((TableVersion(2), 2, 0)));

        barrier.release(&key(), TableVersion(2));
        barrier.release(&key(), TableVersion(2));
        assert!(barrier.is_empty());
    }

    #[test]
    fn drained_entry_adopts_new_version() {
        let barrier = TxStartBarrier::new();
        barrier.admit(&key(), TableVersion(1), 1);
        barrier.release(&key(), TableVersion(1));
        assert!(barrier.is_empty());
        assert_eq!(barrier.admit(&key(), TableVersion(5), 2), Some(2));
    }

    #[test]
    fn blobs_are_independent() {
        let barrier = TxStartBarrier::new();
        let other = BlobKey::new(VolumeId(1), "other");
        barrier.admit(&key(), TableVersion(1), 1);
        assert_eq!(barrier.admit(&other, TableVersion(2), 2), Some(2));
    }

    #[test]
    fn spurious_release_is_ignored() {
        let barrier: TxStartBarrier<u8> = TxStartBarrier::new();
        assert!(barrier.release(&key(), TableVersion(1)).is_empty());
    }
}
