//! This module contains all the specific error implementation for the crate
//!
//! Hopefully like this errors are easier to catch and manage from another crate.
//! The split follows when the fault can be detected: [`MatrixError`] is raised while
//! building matrices, expressions or operation descriptors (nothing has been scheduled
//! yet), while [`OperationError`] is raised once an operation is already in flight,
//! right before dispatch or inside a kernel.

use thiserror::Error;

/// Errors raised while constructing matrices, views, expressions or operation
/// descriptors. When one of these comes up, no data has flowed anywhere yet.
#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("Invalid dimensions: a matrix needs at least one row and one column, got {rows} x {columns}")]
    InvalidDimensions { rows: usize, columns: usize },
    #[error("Invalid stride {stride} for a matrix with {rows} rows, the stride can't be smaller than the number of rows")]
    InvalidStride { stride: usize, rows: usize },
    #[error("A {rows} x {columns} matrix with stride {stride} doesn't fit in a buffer of {length} elements")]
    BufferTooShort {
        rows: usize,
        columns: usize,
        stride: usize,
        length: usize,
    },
    #[error("Unknown data type \"{0}\", expected \"float32\" or \"float64\"")]
    InvalidDataType(String),
    #[error("Wrong number of entries: a {rows} x {columns} matrix takes {} values, got {found}", rows * columns)]
    IncorrectLength {
        rows: usize,
        columns: usize,
        found: usize,
    },
    #[error("Invalid block [{first_row}..{last_row}, {first_column}..{last_column}] of a {rows} x {columns} matrix")]
    InvalidBlock {
        first_row: usize,
        last_row: usize,
        first_column: usize,
        last_column: usize,
        rows: usize,
        columns: usize,
    },
    #[error("Invalid range [{begin}, {end}) of a buffer with {length} elements")]
    InvalidRange {
        begin: usize,
        end: usize,
        length: usize,
    },
    #[error("Unknown kernel \"{0}\", please register it before using it in an operation")]
    UnknownKernel(String),
    #[error("Kernel \"{0}\" is already registered, it can't be redefined")]
    DuplicateKernel(String),
    #[error("Invalid kernel name \"{0}\"")]
    InvalidKernelName(String),
    #[error("Incompatible shape for \"{method}\": expected a {expected_rows} x {expected_columns} matrix, got {rows} x {columns}")]
    IncompatibleShape {
        method: String,
        expected_rows: usize,
        expected_columns: usize,
        rows: usize,
        columns: usize,
    },
    #[error("Incompatible data types: expected {expected}, got {found}")]
    IncompatibleType { expected: String, found: String },
    #[error("Can't invert a {rows} x {columns} matrix, the inverse kernel only handles square matrices up to 3 x 3")]
    UnsupportedInverse { rows: usize, columns: usize },
    #[error("Can't solve a least squares problem with a {rows} x {columns} coefficient matrix, it needs at least as many equations as unknowns")]
    UnderdeterminedSystem { rows: usize, columns: usize },
    #[error("A bound operation with {inputs} input(s) can't wrap {children} child node(s)")]
    MalformedTree { inputs: usize, children: usize },
    #[error("Internal error: an expression view was used before being materialized")]
    ViewNotMaterialized,
}

/// Errors raised while an operation runs: the dispatch-time shape check, numeric
/// kernel failures and worker channel failures all end up here. These reject the
/// completion future handed out by the scheduler.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("Unknown kernel \"{0}\"")]
    UnknownMethod(String),
    #[error("Shape mismatch for \"{method}\": the operation was built for a {expected_rows} x {expected_columns} matrix, got {rows} x {columns}")]
    ShapeMismatch {
        method: String,
        expected_rows: usize,
        expected_columns: usize,
        rows: usize,
        columns: usize,
    },
    #[error("Data type mismatch for \"{method}\": the operation was built for {expected}, got {found}")]
    TypeMismatch {
        method: String,
        expected: String,
        found: String,
    },
    #[error("Wrong number of inputs for \"{method}\": expected {expected}, got {found}")]
    InputCountMismatch {
        method: String,
        expected: usize,
        found: usize,
    },
    #[error("Kernel \"{0}\" is missing its arguments")]
    MissingArguments(&'static str),
    #[error("Can't compute the QR decomposition of a {rows} x {columns} matrix")]
    QrShape { rows: usize, columns: usize },
    #[error("Bad output shape for the QR decomposition: expected {expected_rows} x {expected_columns}, got {rows} x {columns}")]
    QrOutputShape {
        expected_rows: usize,
        expected_columns: usize,
        rows: usize,
        columns: usize,
    },
    #[error("Back-substitution expects an n x (n+1) input, got {rows} x {columns}")]
    BacksubShape { rows: usize, columns: usize },
    #[error("Bad output shape for back-substitution: expected {expected} x 1, got {rows} x {columns}")]
    BacksubOutputShape {
        expected: usize,
        rows: usize,
        columns: usize,
    },
    #[error("Can't reinterpret matrix storage: {0}")]
    Storage(String),
    #[error("Worker error: {0}")]
    WorkerError(String),
    #[error("The operations queue is no longer running")]
    QueueClosed,
}
