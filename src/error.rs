//! Error types for Hyperion
//!
//! All fallible operations return [`Result`]. Variants follow the failure
//! taxonomy of the runtime:
//!
//! - malformed input (`InvalidShape`) is detected at function entry and
//!   the operation aborts with no side effects
//! - format violations (`FormatError`) abort a load; nothing partially
//!   decoded is returned
//! - unsupported configuration (`UnsupportedOperation`) is fatal to the
//!   current forward pass only

use thiserror::Error;

/// Result type alias for Hyperion operations
pub type Result<T> = std::result::Result<T, HyperionError>;

/// Error type for all Hyperion operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HyperionError {
    /// Input has the wrong length, dimension or is empty
    #[error("Invalid shape: {reason}")]
    InvalidShape {
        /// Description of the problem
        reason: String,
    },

    /// Data length does not match declared shape
    #[error("Data size {data_size} does not match shape {shape:?} (expected {expected})")]
    DataShapeMismatch {
        /// Actual number of elements
        data_size: usize,
        /// Declared shape
        shape: Vec<usize>,
        /// Expected number of elements
        expected: usize,
    },

    /// Binary package or legacy file could not be decoded
    #[error("Format error: {reason}")]
    FormatError {
        /// Description of the problem
        reason: String,
    },

    /// Operation is not supported for this layer, model or format
    #[error("Unsupported operation '{operation}': {reason}")]
    UnsupportedOperation {
        /// Operation name
        operation: String,
        /// Why it is unsupported
        reason: String,
    },

    /// Configuration value out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Prompt does not fit in the output buffer
    #[error("Context limit exceeded: {provided} tokens provided, maximum is {maximum}")]
    ContextLimitExceeded {
        /// Tokens provided
        provided: usize,
        /// Maximum allowed
        maximum: usize,
    },

    /// Allocation refused or failed
    #[error("Out of memory: need {needed} values ({reason})")]
    OutOfMemory {
        /// Number of values requested
        needed: usize,
        /// Limit exceeded or allocator failure
        reason: String,
    },

    /// Underlying I/O failure
    #[error("I/O error: {message}")]
    IoError {
        /// Error message
        message: String,
    },

    /// JSON (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for HyperionError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for HyperionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
