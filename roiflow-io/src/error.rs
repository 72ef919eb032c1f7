//! Persistence error types.

use thiserror::Error;

/// Result type for persistence operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Persistence error types.
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Classifier (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HDF5 library error.
    #[cfg(feature = "hdf5")]
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    /// Project content that does not match the expected layout.
    #[error("invalid project format: {0}")]
    InvalidFormat(String),

    /// Error raised by the pipeline.
    #[error("pipeline error: {0}")]
    Core(#[from] roiflow_core::Error),
}
