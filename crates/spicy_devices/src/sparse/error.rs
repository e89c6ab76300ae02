use thiserror::Error;

/// Structural problems with a compressed-column pattern.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CscError {
    #[error("index {index} out of range (dimension {max})")]
    OutOfBoundsIndex { index: usize, max: usize },

    #[error("column pointer array has {actual} entries, expected {expected}")]
    InvalidColumnPointersLength { expected: usize, actual: usize },

    #[error("column pointer {index} is {actual}, expected {expected}")]
    InvalidColumnPointers {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("value planes hold {values} entries but the pattern has {pattern}")]
    PlaneLengthMismatch { values: usize, pattern: usize },

    #[error("column {column} lists row {row} after row {previous}")]
    UnsortedColumn {
        column: usize,
        previous: usize,
        row: usize,
    },
}
