use std::{
    fs::File,
    io::{Cursor, Read},
    path::{Path, PathBuf},
};

use crate::{
    archive,
    manifest::DirectoryManifest,
    store::{ChainId, DiffId, Layer, RwLayer, StoreError, StoreResult},
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A handle to a layer registered in a [`VfsLayerStore`](super::VfsLayerStore).
///
/// The handle owns one reference on its layer. Its parents are carried along as borrowed views and
/// own nothing.
#[derive(Debug)]
pub struct VfsLayer {
    pub(super) chain_id: ChainId,
    pub(super) diff_id: DiffId,
    pub(super) size: u64,
    pub(super) diff_size: u64,
    pub(super) tar_path: PathBuf,
    pub(super) parent: Option<Box<VfsLayer>>,
}

/// A handle to an RW layer of a [`VfsLayerStore`](super::VfsLayerStore).
#[derive(Debug)]
pub struct VfsRwLayer {
    pub(super) id: String,
    pub(super) parent: Option<ChainId>,
    pub(super) path: PathBuf,
    pub(super) base: DirectoryManifest,
    pub(super) mount_count: usize,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VfsRwLayer {
    /// Returns `true` if the layer has more mounts than unmounts.
    pub fn is_mounted(&self) -> bool {
        self.mount_count > 0
    }

    /// Returns the working directory of the layer.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Layer for VfsLayer {
    fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    fn diff_id(&self) -> &DiffId {
        &self.diff_id
    }

    fn size(&self) -> StoreResult<u64> {
        Ok(self.size)
    }

    fn diff_size(&self) -> StoreResult<u64> {
        Ok(self.diff_size)
    }

    fn parent(&self) -> Option<&Self> {
        self.parent.as_deref()
    }

    fn tar_stream(&self) -> StoreResult<Box<dyn Read + '_>> {
        Ok(Box::new(File::open(&self.tar_path)?))
    }
}

impl RwLayer for VfsRwLayer {
    fn id(&self) -> &str {
        &self.id
    }

    fn parent(&self) -> Option<&ChainId> {
        self.parent.as_ref()
    }

    fn mount(&mut self, mount_label: &str) -> StoreResult<PathBuf> {
        self.mount_count += 1;
        tracing::debug!(
            "Mounted rw layer {} at {} (label: {:?}, mounts: {})",
            self.id,
            self.path.display(),
            mount_label,
            self.mount_count
        );

        Ok(self.path.clone())
    }

    fn unmount(&mut self) -> StoreResult<()> {
        if self.mount_count == 0 {
            return Err(StoreError::RwLayerNotMounted(self.id.clone()));
        }

        self.mount_count -= 1;
        tracing::debug!("Unmounted rw layer {} (mounts: {})", self.id, self.mount_count);

        Ok(())
    }

    fn tar_stream(&self) -> StoreResult<Box<dyn Read + '_>> {
        let current = DirectoryManifest::build(&self.path)?;
        let bytes = archive::pack_changes(&self.path, &self.base, &current)?;
        Ok(Box::new(Cursor::new(bytes)))
    }
}
