//! `layerbench` is a differential testing harness for content-addressed, copy-on-write layer stores.
//!
//! # Overview
//!
//! The harness never looks inside the store it drives. It describes layer content declaratively,
//! builds a layer chain through the store's public lifecycle, and then proves that the mounted
//! composite view matches a directory it flattened on its own. It handles:
//! - Declarative filesystem deltas ([`FilesystemDelta`], [`LayerInit`])
//! - Reference materialization of expected state ([`materialize`])
//! - Chain construction with correct reference-count lifecycle ([`build_layer`], [`build_chain`])
//! - Structural directory equivalence ([`check_layer`], [`check_directory_equal`])
//! - Byte-exact diff and chain identity verification ([`check_layer_diff`], [`check_same_layer`])
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use layerbench::{
//!     build_chain, check_layer, make_directory, open_store, write_file, HarnessConfig, Layer,
//!     LayerInit, LayerStore,
//! };
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut store = open_store(&HarnessConfig::from_env()?)?;
//!
//!     let inits = vec![
//!         LayerInit::new(vec![
//!             make_directory("/etc", 0o755),
//!             write_file("/etc/hosts", "mydomain 10.0.0.1", 0o644),
//!         ]),
//!         LayerInit::new(vec![write_file("/etc/hosts", "mydomain 10.0.0.2", 0o644)]),
//!     ];
//!
//!     let layer = build_chain(&mut store, &inits)?;
//!     check_layer(&mut store, layer.chain_id(), &inits)?;
//!
//!     store.release(layer)?;
//!     store.cleanup()?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`store`] - The layer store contract the harness drives
//! - [`implementations`] - The reference copy-based store backend
//! - [`manifest`] - Directory manifests and their diffs
//! - [`utils`] - Common utilities and helpers

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

mod archive;
mod chain;
mod check;
mod clock;
mod config;
mod delta;
mod error;
mod materialize;
mod verify;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod implementations;
pub mod manifest;
pub mod store;
pub mod utils;

pub use archive::*;
pub use chain::*;
pub use check::*;
pub use clock::*;
pub use config::*;
pub use delta::*;
pub use error::*;
pub use materialize::*;
pub use store::{
    ChainId, DiffId, Digest, Layer, LayerStore, ReleaseMetadata, RwLayer, RwLayerOptions,
    StoreError, StoreResult,
};
pub use verify::*;
