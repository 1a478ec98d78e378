use std::sync::{Arc, RwLock};

use tokio::sync::oneshot;
use tracing::{debug, info};

use am_types::TableVersion;

use crate::error::TopologyError;
use crate::pin::{RetireFn, TablePin, VersionPin};
use crate::table::{Dlt, Dmt, PlacementTable};

/// The current snapshot of one placement table and its pin count.
struct Epoch<T> {
    table: Arc<T>,
    pin: Arc<VersionPin>,
}

impl<T: PlacementTable> Epoch<T> {
    fn new(table: T) -> Self {
        let pin = Arc::new(VersionPin::new(table.version()));
        Self {
            table: Arc::new(table),
            pin,
        }
    }
}

/// One placement table whose current version can be swapped while requests
/// are in flight.
///
/// Pinning happens under the read lock and swapping under the write lock, so
/// once a new version is installed no further pins can land on the old one.
pub struct VersionedTable<T> {
    current: RwLock<Epoch<T>>,
}

impl<T: PlacementTable> VersionedTable<T> {
    pub fn new(table: T) -> Self {
        Self {
            current: RwLock::new(Epoch::new(table)),
        }
    }

    /// Pin the current snapshot.
    pub fn pin(&self) -> TablePin<T> {
        let epoch = self.current.read().expect("placement lock poisoned");
        TablePin::acquire(Arc::clone(&epoch.table), Arc::clone(&epoch.pin))
    }

    pub fn version(&self) -> TableVersion {
        self.current.read().expect("placement lock poisoned").pin.version()
    }

    /// Pins currently held on the installed version.
    pub fn outstanding(&self) -> usize {
        self.current
            .read()
            .expect("placement lock poisoned")
            .pin
            .outstanding()
    }

    /// Install `table` as the current version. `on_retired` runs once every
    /// request pinned on the previous version has completed.
    pub fn install_with(&self, table: T, on_retired: RetireFn) -> Result<(), TopologyError> {
        let proposed = table.version();
        let previous = {
            let mut epoch = self.current.write().expect("placement lock poisoned");
            let current = epoch.pin.version();
            if proposed <= current {
                return Err(TopologyError::StaleVersion {
                    table: T::KIND,
                    current,
                    proposed,
                });
            }
            std::mem::replace(&mut *epoch, Epoch::new(table))
        };

        info!(
            table = T::KIND,
            old = %previous.pin.version(),
            new = %proposed,
            outstanding = previous.pin.outstanding(),
            "placement table installed"
        );
        previous.pin.retire(on_retired);
        Ok(())
    }

    /// Install `table` and return a receiver that resolves with the old
    /// version once it has drained.
    pub fn install(&self, table: T) -> Result<oneshot::Receiver<TableVersion>, TopologyError> {
        let (tx, rx) = oneshot::channel();
        self.install_with(
            table,
            Box::new(move |retired| {
                debug!(table = T::KIND, version = %retired, "placement version retired");
                let _ = tx.send(retired);
            }),
        )?;
        Ok(rx)
    }
}

/// DLT and DMT provider handed to every dispatch path.
pub struct TopologyService {
    dlt: VersionedTable<Dlt>,
    dmt: VersionedTable<Dmt>,
}

impl TopologyService {
    pub fn new(dlt: Dlt, dmt: Dmt) -> Self {
        Self {
            dlt: VersionedTable::new(dlt),
            dmt: VersionedTable::new(dmt),
        }
    }

    pub fn pin_dlt(&self) -> TablePin<Dlt> {
        self.dlt.pin()
    }

    pub fn pin_dmt(&self) -> TablePin<Dmt> {
        self.dmt.pin()
    }

    pub fn dlt_version(&self) -> TableVersion {
        self.dlt.version()
    }

    pub fn dmt_version(&self) -> TableVersion {
        self.dmt.version()
    }

    pub fn dlt(&self) -> &VersionedTable<Dlt> {
        &self.dlt
    }

    pub fn dmt(&self) -> &VersionedTable<Dmt> {
        &self.dmt
    }

    pub fn install_dlt(&self, dlt: Dlt) -> Result<oneshot::Receiver<TableVersion>, TopologyError> {
        self.dlt.install(dlt)
    }

    pub fn install_dmt(&self, dmt: Dmt) -> Result<oneshot::Receiver<TableVersion>, TopologyError> {
        self.dmt.install(dmt)
    }
}
