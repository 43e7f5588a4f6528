//! The layer store contract driven by the harness.
//!
//! A layer store keeps immutable, content-addressed layers that form parent chains, and hands out
//! mutable RW layers that can be mounted on top of a chain, modified, and snapshotted into a diff
//! stream. The harness only ever talks to a store through the traits in this module.

mod digest;
mod error;
mod store;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use digest::*;
pub use error::*;
pub use store::*;
