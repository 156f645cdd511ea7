//! Error types for the block-schur library
//!
//! All fallible operations return [`LinAlgResult`]. Errors are produced at API
//! boundaries (structure set-up, vector length checks, reduced-system
//! factorization); numeric kernels themselves never fail.
//! All errors use the `thiserror` crate for automatic trait implementations.

use thiserror::Error;

/// Main result type used throughout the block-schur library
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Main error type for the block-schur library
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinAlgError {
    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Block structure violates the E/F partition or the chunk layout
    #[error("Invalid block structure: {0}")]
    InvalidStructure(String),

    /// A vector or matrix does not have the size implied by the block structure
    #[error("Dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Operation called in the wrong state (e.g. before `init`)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Numeric factorization of the reduced system failed
    #[error("Factorization failed: {0}")]
    FactorizationFailed(String),

    /// Sparse matrix assembly failed
    #[error("Sparse matrix creation failed: {0}")]
    SparseMatrixCreation(String),

    /// Thread pool construction errors
    #[error("Thread synchronization error: {0}")]
    ThreadError(String),
}

impl LinAlgError {
    /// Shorthand used by the length checks sprinkled across the API.
    pub(crate) fn check_len(what: &'static str, expected: usize, actual: usize) -> LinAlgResult<()> {
        if expected == actual {
            Ok(())
        } else {
            Err(LinAlgError::DimensionMismatch {
                what,
                expected,
                actual,
            })
        }
    }
}

impl From<rayon::ThreadPoolBuildError> for LinAlgError {
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        LinAlgError::ThreadError(err.to_string())
    }
}
