//! Error types for roiflow-core.

use thiserror::Error;

/// Result type alias for roiflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types shared by the engine and its operators.
///
/// Errors are `Clone` because a single failed request is handed to every
/// waiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A read was attempted on a slot without metadata or value.
    #[error("slot '{slot}' is not ready")]
    NotReady { slot: String },

    /// Connect-time mismatch between two slots.
    #[error("cannot connect '{upstream}' to '{downstream}': {reason}")]
    IncompatibleSlot {
        upstream: String,
        downstream: String,
        reason: String,
    },

    /// Failure raised while an operator produced data.
    #[error("compute error in '{operator}': {message}")]
    Compute { operator: String, message: String },

    /// A sub-slot index that no longer exists.
    #[error("slot '{slot}' has no sub-slot {index} (length {len})")]
    StructuralRace {
        slot: String,
        index: usize,
        len: usize,
    },

    /// Malformed or out-of-bounds region of interest.
    #[error("invalid region of interest: {0}")]
    InvalidRoi(String),

    /// Slicing string that cannot be parsed.
    #[error("invalid slicing '{0}'")]
    InvalidSlicing(String),

    /// Element type mismatch.
    #[error("dtype mismatch: expected {expected}, found {found}")]
    DTypeMismatch { expected: String, found: String },

    /// Array shape mismatch.
    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    /// Operation not supported by this slot or operator.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Creates a [`Error::NotReady`] for the named slot.
    pub fn not_ready(slot: impl Into<String>) -> Self {
        Self::NotReady { slot: slot.into() }
    }

    /// Creates a [`Error::Compute`] attributed to the named operator.
    pub fn compute(operator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Compute {
            operator: operator.into(),
            message: message.into(),
        }
    }

    /// Returns true for errors a caller may retry once inputs stabilize.
    #[must_use]
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady { .. })
    }
}
