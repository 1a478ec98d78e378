use std::collections::BTreeSet;

use am_types::{NodeId, ObjectId, TableVersion, VolumeId};

use crate::error::TopologyError;

/// Largest supported DLT width; 2^24 columns is far beyond any real cluster.
const MAX_WIDTH_BITS: u32 = 24;

/// A versioned mapping from a placement key to an ordered replica group.
///
/// Group order matters: failover walks it front to back and multi-primary
/// treats the leading nodes as primaries.
pub trait PlacementTable: Send + Sync + 'static {
    type Key: ?Sized;

    /// Short name used in logs and errors ("DLT", "DMT").
    const KIND: &'static str;

    fn version(&self) -> TableVersion;

    /// Ordered replica group for `key`. Never empty for a validated table.
    fn node_group(&self, key: &Self::Key) -> &[NodeId];
}

fn validate_columns(table: &'static str, columns: &[Vec<NodeId>]) -> Result<(), TopologyError> {
    if columns.is_empty() {
        return Err(TopologyError::NoColumns { table });
    }
    for (index, column) in columns.iter().enumerate() {
        if column.is_empty() {
            return Err(TopologyError::EmptyColumn { table, index });
        }
        let mut seen = BTreeSet::new();
        for node in column {
            if !seen.insert(*node) {
                return Err(TopologyError::DuplicateNode {
                    table,
                    index,
                    node: node.get(),
                });
            }
        }
    }
    Ok(())
}

/// Data Location Table: object-id token → SM replica group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dlt {
    version: TableVersion,
    width_bits: u32,
    columns: Vec<Vec<NodeId>>,
}

impl Dlt {
    /// Build a DLT from explicit columns. There must be exactly
    /// `2^width_bits` columns.
    pub fn new(
        version: TableVersion,
        width_bits: u32,
        columns: Vec<Vec<NodeId>>,
    ) -> Result<Self, TopologyError> {
        if width_bits > MAX_WIDTH_BITS {
            return Err(TopologyError::WidthTooLarge(width_bits));
        }
        let expected = 1usize << width_bits;
        if columns.len() != expected {
            return Err(TopologyError::ColumnCount {
                width_bits,
                expected,
                actual: columns.len(),
            });
        }
        validate_columns(Self::KIND, &columns)?;
        Ok(Self {
            version,
            width_bits,
            columns,
        })
    }

    pub fn width_bits(&self) -> u32 {
        self.width_bits
    }

    pub fn columns(&self) -> &[Vec<NodeId>] {
        &self.columns
    }

    /// Every node referenced by the table.
    pub fn nodes(&self) -> BTreeSet<NodeId> {
        self.columns.iter().flatten().copied().collect()
    }
}

impl PlacementTable for Dlt {
    type Key = ObjectId;
    const KIND: &'static str = "DLT";

    fn version(&self) -> TableVersion {
        self.version
    }

    fn node_group(&self, key: &ObjectId) -> &[NodeId] {
        &self.columns[key.token(self.width_bits) as usize]
    }
}

/// Data Management Table: volume → DM replica group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dmt {
    version: TableVersion,
    columns: Vec<Vec<NodeId>>,
}

impl Dmt {
    pub fn new(version: TableVersion, columns: Vec<Vec<NodeId>>) -> Result<Self, TopologyError> {
        validate_columns(Self::KIND, &columns)?;
        Ok(Self { version, columns })
    }

    pub fn columns(&self) -> &[Vec<NodeId>] {
        &self.columns
    }

    /// Every node referenced by the table.
    pub fn nodes(&self) -> BTreeSet<NodeId> {
        self.columns.iter().flatten().copied().collect()
    }
}

impl PlacementTable for Dmt {
    type Key = VolumeId;
    const KIND: &'static str = "DMT";

    fn version(&self) -> TableVersion {
        self.version
    }

    fn node_group(&self, key: &VolumeId) -> &[NodeId] {
        let index = (key.get() % self.columns.len() as u64) as usize;
        &self.columns[index]
    }
}
