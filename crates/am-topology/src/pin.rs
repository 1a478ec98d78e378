use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use am_types::TableVersion;

/// Callback run once a retired version has no outstanding pins.
pub type RetireFn = Box<dyn FnOnce(TableVersion) + Send>;

/// Reference count over one placement-table version.
///
/// Pins and releases are lock-free. Retirement registers a callback that
/// fires exactly once, on whichever thread observes the count at zero after
/// the version was marked retiring.
pub struct VersionPin {
    version: TableVersion,
    outstanding: AtomicUsize,
    retiring: AtomicBool,
    on_retire: Mutex<Option<RetireFn>>,
}

impl VersionPin {
    pub fn new(version: TableVersion) -> Self {
        Self {
            version,
            outstanding: AtomicUsize::new(0),
            retiring: AtomicBool::new(false),
            on_retire: Mutex::new(None),
        }
    }

    pub fn version(&self) -> TableVersion {
        self.version
    }

    /// Number of requests currently holding this version.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Returns `true` once [`Self::retire`] has been called.
    pub fn is_retiring(&self) -> bool {
        self.retiring.load(Ordering::SeqCst)
    }

    pub fn pin(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    pub fn release(&self) {
        let previous = self.outstanding.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "released {} more often than pinned", self.version);
        if previous == 1 {
            self.fire_if_drained();
        }
    }

    /// Mark the version superseded. `on_retire` runs as soon as the count is
    /// zero, which may be immediately.
    pub fn retire(&self, on_retire: RetireFn) {
        *self.on_retire.lock().expect("retire lock poisoned") = Some(on_retire);
        self.retiring.store(true, Ordering::SeqCst);
        self.fire_if_drained();
    }

    fn fire_if_drained(&self) {
        if !self.is_retiring() || self.outstanding() != 0 {
            return;
        }
        let callback = self.on_retire.lock().expect("retire lock poisoned").take();
        if let Some(callback) = callback {
            callback(self.version);
        }
    }
}

/// RAII pin on a placement-table snapshot.
///
/// Dereferences to the table. Dropping the guard releases the pin, so moving
/// it into an RPC completion closure releases it exactly once, when the
/// response arrives or the closure is discarded.
pub struct TablePin<T> {
    table: Arc<T>,
    state: Arc<VersionPin>,
}

impl<T> TablePin<T> {
    pub(crate) fn acquire(table: Arc<T>, state: Arc<VersionPin>) -> Self {
        state.pin();
        Self { table, state }
    }

    pub fn version(&self) -> TableVersion {
        self.state.version()
    }

    /// Shared handle to the pinned snapshot.
    pub fn table(&self) -> &Arc<T> {
        &self.table
    }
}

impl<T> Clone for TablePin<T> {
    fn clone(&self) -> Self {
        Self::acquire(Arc::clone(&self.table), Arc::clone(&self.state))
    }
}

impl<T> Deref for TablePin<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.table
    }
}

impl<T> Drop for TablePin<T> {
    fn drop(&mut self) {
        self.state.release();
    }
}

impl<T> std::fmt::Debug for TablePin<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TablePin")
            .field("version", &self.state.version())
            .field("outstanding", &self.state.outstanding())
            .finish()
    }
}
