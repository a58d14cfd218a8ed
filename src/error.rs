//! Error types for the expert cache

use thiserror::Error;

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while indexing, loading or paging experts
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing safetensors file
    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    /// JSON parsing error (config files, manifests)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Model configuration does not match the weight manifest
    #[error("Config error: {0}")]
    Config(String),

    /// Tensor shape mismatch
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Unsupported data type
    #[error("Unsupported dtype: {0}")]
    UnsupportedDType(String),

    /// Tensor not found in the manifest
    #[error("Tensor not found: {0}")]
    TensorNotFound(String),

    /// Pool could not be sized or allocated
    #[error("Memory error: {0}")]
    Memory(String),

    /// No free run long enough and nothing left to evict
    #[error("Slot pool exhausted: requested {requested} slots, largest free run is {largest_free}")]
    AllocationExhausted { requested: usize, largest_free: usize },

    /// Backing file ended before a shard span was fully read
    #[error("Short read from file {file} at offset {offset}: expected {expected} bytes, got {got}")]
    ShortRead {
        file: usize,
        offset: u64,
        expected: usize,
        got: usize,
    },

    /// The demand-paging protocol was violated by the caller
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// Another worker's layer check failed while this one waited on it
    #[error("Layer {layer} residency check failed: {reason}")]
    LayerCheck { layer: usize, reason: String },
}

impl Error {
    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        Error::Invariant(msg.into())
    }
}
