use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use thiserror::Error;

use super::ChainId;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a layer store operation.
pub type StoreResult<T> = Result<T, StoreError>;

/// An error reported by a layer store.
#[derive(pretty_error_debug::Debug, Error)]
pub enum StoreError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The layer does not exist in the store.
    #[error("layer does not exist: {0}")]
    LayerNotFound(ChainId),

    /// Registering the layer would exceed the store's maximum chain depth.
    #[error("maximum layer depth of {0} exceeded")]
    MaxDepthExceeded(usize),

    /// An RW layer with the same ID already exists.
    #[error("rw layer already exists: {0}")]
    RwLayerExists(String),

    /// The RW layer is not mounted.
    #[error("rw layer is not mounted: {0}")]
    RwLayerNotMounted(String),

    /// The diff archive could not be read or applied.
    #[error("invalid diff archive: {0}")]
    InvalidArchive(String),

    /// A digest string is malformed.
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// A backend option is unknown or malformed.
    #[error("invalid store option: {0}")]
    InvalidOption(String),

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

impl StoreError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> StoreError {
        StoreError::Custom(AnyError {
            error: error.into(),
        })
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
