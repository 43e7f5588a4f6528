//! A naive copy-per-layer store.
//!
//! Every layer is kept as a full copy of its parent with its own diff applied on top, so mounting a
//! layer is a plain directory copy and no union filesystem is involved.
//!
//! ```text
//! <root>/
//! ├── layers/<chain-id-hex>/
//! │   ├── diff/       - the flattened content of the layer and its ancestry
//! │   └── layer.tar   - the registered diff stream
//! └── mounts/<rw-id>/ - the working directory of an RW layer
//! ```

mod copy;
mod layer;
mod store;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use layer::*;
pub use store::*;
