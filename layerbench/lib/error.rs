use std::{
    error::Error,
    fmt::{self, Display},
    io,
    path::PathBuf,
};

use thiserror::Error;

use crate::{manifest::ManifestDiff, StoreError};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a layerbench operation.
pub type LayerbenchResult<T> = Result<T, LayerbenchError>;

/// An error that occurred while building or verifying layers.
#[derive(pretty_error_debug::Debug, Error)]
pub enum LayerbenchError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The layer store failed a lifecycle operation.
    #[error("failed to {operation}: {source}")]
    Store {
        /// The store operation that failed
        operation: &'static str,

        /// The error reported by the store
        #[source]
        source: StoreError,
    },

    /// A filesystem delta could not be applied.
    #[error("failed to apply {delta}: {source}")]
    DeltaApplication {
        /// The delta that failed, rendered for display
        delta: String,

        /// The underlying filesystem error
        #[source]
        source: io::Error,
    },

    /// A layer at a given chain position failed.
    #[error("layer {index}: {source}")]
    ChainLayer {
        /// The 1-based position of the layer in the chain
        index: usize,

        /// The error that occurred for that layer
        #[source]
        source: Box<LayerbenchError>,
    },

    /// A chain was requested without any layer initializers.
    #[error("cannot build a layer chain without layer initializers")]
    EmptyChain,

    /// A mount session operation was called out of order.
    #[error("lifecycle violation: cannot {operation} a session that is {state}")]
    LifecycleViolation {
        /// The operation that was attempted
        operation: &'static str,

        /// The state the session was in
        state: &'static str,
    },

    /// Two directory trees differ.
    #[error("directory diff between {} and {}\n{diff}", .actual.display(), .expected.display())]
    DirectoryMismatch {
        /// The directory under test
        actual: PathBuf,

        /// The reference directory
        expected: PathBuf,

        /// Every divergence between the two trees
        diff: ManifestDiff,
    },

    /// A layer's diff stream does not match the expected bytes.
    #[error("layer diff mismatch: {0}")]
    LayerDiffMismatch(String),

    /// Two layers are not the same.
    #[error("layer mismatch: {0}")]
    LayerMismatch(String),

    /// Release metadata does not match the expected set of deleted layers.
    #[error("release metadata mismatch:\n{}", .0.join("\n"))]
    MetadataMismatch(Vec<String>),

    /// The harness configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LayerbenchError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> LayerbenchError {
        LayerbenchError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Wraps a store error with the operation that produced it.
    pub fn store(operation: &'static str, source: StoreError) -> LayerbenchError {
        LayerbenchError::Store { operation, source }
    }

    /// Wraps this error with the 1-based chain position it occurred at.
    pub fn at_layer(self, index: usize) -> LayerbenchError {
        LayerbenchError::ChainLayer {
            index,
            source: Box::new(self),
        }
    }

    /// Returns the store error at the root of this error, if there is one.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            LayerbenchError::Store { source, .. } => Some(source),
            LayerbenchError::ChainLayer { source, .. } => source.store_error(),
            _ => None,
        }
    }

    /// Returns `true` if this error reports a verification mismatch rather than a failure to run.
    pub fn is_mismatch(&self) -> bool {
        match self {
            LayerbenchError::DirectoryMismatch { .. }
            | LayerbenchError::LayerDiffMismatch(_)
            | LayerbenchError::LayerMismatch(_)
            | LayerbenchError::MetadataMismatch(_) => true,
            LayerbenchError::ChainLayer { source, .. } => source.is_mismatch(),
            _ => false,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
