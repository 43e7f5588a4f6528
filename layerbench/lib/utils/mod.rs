//! Utility functions and types.

mod mode;
mod path;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use mode::*;
pub use path::*;
