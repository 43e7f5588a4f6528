//! Layer store backends that ship with the harness.
//!
//! The harness drives every backend through [`LayerStore`](crate::LayerStore) only. The backends
//! here exist so scenarios have a concrete store to run against.

mod vfs;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use vfs::*;
