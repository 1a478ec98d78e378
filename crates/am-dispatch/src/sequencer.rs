use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use am_types::VolumeId;

/// Sequence counter of one volume.
#[derive(Debug, Default)]
pub struct SequenceEntry {
    last: Mutex<u64>,
}

impl SequenceEntry {
    /// Allocate the next sequence number and keep the counter locked.
    ///
    /// Hold the guard until the request carrying the number has been handed
    /// to the transport, so numbers reach each lane in increasing order.
    pub fn get_and_lock(&self) -> (MutexGuard<'_, u64>, u64) {
        let mut guard = self.last.lock().expect("volume sequence poisoned");
        *guard += 1;
        let seq = *guard;
        (guard, seq)
    }

    pub fn current(&self) -> u64 {
        *self.last.lock().expect("volume sequence poisoned")
    }

    /// Raise the counter to at least `seq`.
    pub fn register(&self, seq: u64) {
        let mut guard = self.last.lock().expect("volume sequence poisoned");
        *guard = (*guard).max(seq);
    }
}

/// Per-volume monotonic sequence numbers for catalog mutations.
#[derive(Debug, Default)]
pub struct VolumeSequencer {
    entries: Mutex<HashMap<VolumeId, Arc<SequenceEntry>>>,
}

impl VolumeSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The counter for `volume`, created at zero on first use.
    pub fn entry(&self, volume: VolumeId) -> Arc<SequenceEntry> {
        let mut entries = self.entries.lock().expect("sequencer poisoned");
        Arc::clone(entries.entry(volume).or_default())
    }

    /// Seed `volume` from an open-volume reply. Never moves backwards.
    pub fn register(&self, volume: VolumeId, seq: u64) {
        debug!(volume = %volume, seq, "registering volume sequence");
        self.entry(volume).register(seq);
    }

    pub fn current(&self, volume: VolumeId) -> u64 {
        self.entries
            .lock()
            .expect("sequencer poisoned")
            .get(&volume)
            .map_or(0, |entry| entry.current())
    }

    /// Drop the counter of a detached volume.
    pub fn forget(&self, volume: VolumeId) {
        self.entries.lock().expect("sequencer poisoned").remove(&volume);
    }
}
