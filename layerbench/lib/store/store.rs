use std::{collections::BTreeMap, io::Read, path::PathBuf};

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::LayerInit;

use super::{ChainId, DiffId, StoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Describes a layer that was physically deleted because its last reference was released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseMetadata {
    /// The chain ID of the deleted layer.
    pub chain_id: ChainId,

    /// The diff ID of the deleted layer.
    pub diff_id: DiffId,

    /// The size of the layer's own content in bytes.
    pub size: u64,

    /// The size of the layer's diff stream in bytes.
    pub diff_size: u64,
}

/// Options for creating an RW layer.
#[derive(Debug, Clone, Default, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct RwLayerOptions {
    /// The mount label to apply when the layer is mounted.
    #[builder(default, setter(into))]
    mount_label: String,

    /// Content applied beneath the RW layer. It is visible when mounted but is not part of the
    /// layer's diff stream.
    #[builder(default, setter(strip_option))]
    init: Option<LayerInit>,

    /// Backend-specific storage options.
    #[builder(default)]
    storage_opts: BTreeMap<String, String>,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// A content-addressed store of immutable layers and the RW layers used to create them.
///
/// Every handle returned by [`register`](LayerStore::register) owns one reference on its layer and
/// must be given back through [`release`](LayerStore::release). A layer is deleted once nothing
/// references it anymore, which includes handles, child layers, and RW layers built on top of it.
pub trait LayerStore {
    /// The handle to a registered layer.
    type Layer: Layer;

    /// The handle to a mutable RW layer.
    type RwLayer: RwLayer;

    /// Creates a new RW layer on top of `parent`, or on an empty root if `parent` is `None`.
    ///
    /// ## Errors
    ///
    /// Returns an error if `id` is already in use or `parent` does not exist.
    fn create_rw_layer(
        &mut self,
        id: &str,
        parent: Option<&ChainId>,
        opts: RwLayerOptions,
    ) -> StoreResult<Self::RwLayer>;

    /// Registers a diff stream on top of `parent` and returns a new reference to the resulting layer.
    ///
    /// Registering a diff that yields an existing chain ID returns another reference to the
    /// existing layer.
    ///
    /// ## Errors
    ///
    /// Returns an error if the diff cannot be applied, `parent` does not exist, or the chain would
    /// exceed the store's maximum depth.
    fn register(&mut self, diff: impl Read, parent: Option<&ChainId>) -> StoreResult<Self::Layer>;

    /// Releases a reference to a layer.
    ///
    /// Returns the metadata of every layer that was deleted as a result, starting at `layer` and
    /// walking towards the base.
    fn release(&mut self, layer: Self::Layer) -> StoreResult<Vec<ReleaseMetadata>>;

    /// Releases an RW layer and its reference on its parent. A layer that is still mounted is
    /// unmounted first.
    ///
    /// Returns the metadata of every layer that was deleted as a result.
    fn release_rw_layer(&mut self, rw_layer: Self::RwLayer) -> StoreResult<Vec<ReleaseMetadata>>;

    /// Releases every resource backing the store.
    fn cleanup(&mut self) -> StoreResult<()>;
}

/// A registered, immutable layer.
pub trait Layer {
    /// Returns the identity of this layer and its ancestry.
    fn chain_id(&self) -> &ChainId;

    /// Returns the identity of this layer's own diff.
    fn diff_id(&self) -> &DiffId;

    /// Returns the size of this layer's own content in bytes.
    fn size(&self) -> StoreResult<u64>;

    /// Returns the size of this layer's diff stream in bytes.
    fn diff_size(&self) -> StoreResult<u64>;

    /// Returns the parent layer. The returned handle is borrowed and carries no reference.
    fn parent(&self) -> Option<&Self>;

    /// Opens this layer's diff stream.
    fn tar_stream(&self) -> StoreResult<Box<dyn Read + '_>>;
}

/// A mutable layer that can be mounted, modified, and snapshotted into a diff stream.
pub trait RwLayer {
    /// Returns the caller-chosen ID of this RW layer.
    fn id(&self) -> &str;

    /// Returns the chain ID this RW layer was created on.
    fn parent(&self) -> Option<&ChainId>;

    /// Mounts the layer and returns the path of its composite view.
    fn mount(&mut self, mount_label: &str) -> StoreResult<PathBuf>;

    /// Unmounts the layer.
    fn unmount(&mut self) -> StoreResult<()>;

    /// Returns the changes made on top of the parent as a diff stream.
    fn tar_stream(&self) -> StoreResult<Box<dyn Read + '_>>;
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the chain of `layer` and all of its ancestors, starting at `layer`.
pub fn layer_ancestry<L: Layer>(layer: &L) -> Vec<&L> {
    let mut chain = vec![layer];
    let mut current = layer;
    while let Some(parent) = current.parent() {
        chain.push(parent);
        current = parent;
    }

    chain
}
