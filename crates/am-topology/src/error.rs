use am_types::TableVersion;

/// Errors from placement-table validation and installation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    /// A table must have at least one column.
    #[error("{table} has no columns")]
    NoColumns { table: &'static str },

    /// Every column needs at least one node.
    #[error("{table} column {index} is empty")]
    EmptyColumn { table: &'static str, index: usize },

    /// A node may appear at most once per column.
    #[error("{table} column {index} lists node {node} twice")]
    DuplicateNode {
        table: &'static str,
        index: usize,
        node: u64,
    },

    /// DLT column count must equal `2^width_bits`.
    #[error("DLT with width {width_bits} needs {expected} columns, got {actual}")]
    ColumnCount {
        width_bits: u32,
        expected: usize,
        actual: usize,
    },

    /// DLT width beyond the supported token size.
    #[error("DLT width {0} exceeds 24 bits")]
    WidthTooLarge(u32),

    /// Installed tables must move forward.
    #[error("{table} version {proposed} does not supersede current {current}")]
    StaleVersion {
        table: &'static str,
        current: TableVersion,
        proposed: TableVersion,
    },
}
