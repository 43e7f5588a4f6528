use std::{
    collections::{HashMap, HashSet},
    fs,
    io::Read,
    path::{Path, PathBuf},
};

use crate::{
    archive,
    manifest::DirectoryManifest,
    store::{
        ChainId, DiffId, Layer, LayerStore, ReleaseMetadata, RwLayer, RwLayerOptions, StoreError,
        StoreResult,
    },
    LayerInit,
};

use super::{copy, VfsLayer, VfsRwLayer};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The maximum number of layers in a chain unless configured otherwise.
pub const DEFAULT_MAX_DEPTH: usize = 125;

/// The backend option that overrides the maximum chain depth, e.g. `vfs.max_depth=10`.
pub const MAX_DEPTH_OPTION: &str = "vfs.max_depth";

const LAYERS_SUBDIR: &str = "layers";
const MOUNTS_SUBDIR: &str = "mounts";
const DIFF_SUBDIR: &str = "diff";
const LAYER_TAR_FILENAME: &str = "layer.tar";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A reference-counted layer store that keeps every layer as a full copy of its content.
///
/// References are counted per layer. Every handle returned by [`register`](LayerStore::register)
/// counts one, every child layer counts one on its parent, and every RW layer counts one on the
/// layer it was created on. A layer is deleted from disk when its count drops to zero, which in
/// turn releases its parent.
#[derive(Debug)]
pub struct VfsLayerStore {
    root: PathBuf,
    max_depth: usize,
    layers: HashMap<ChainId, LayerRecord>,
    rw_layers: HashSet<String>,
}

#[derive(Debug)]
struct LayerRecord {
    diff_id: DiffId,
    parent: Option<ChainId>,
    depth: usize,
    size: u64,
    diff_size: u64,
    references: usize,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VfsLayerStore {
    /// Creates a store rooted at `root` with default options.
    pub fn new(root: impl Into<PathBuf>) -> StoreResult<Self> {
        Self::with_options(root, &[] as &[&str])
    }

    /// Creates a store rooted at `root`, configured by `key=value` backend options.
    ///
    /// ## Errors
    ///
    /// Returns [`StoreError::InvalidOption`] for unknown or malformed options and an I/O error if
    /// the store directories cannot be created.
    pub fn with_options(
        root: impl Into<PathBuf>,
        options: &[impl AsRef<str>],
    ) -> StoreResult<Self> {
        let root = root.into();
        let mut max_depth = DEFAULT_MAX_DEPTH;

        for option in options {
            let option = option.as_ref();
            let (key, value) = option
                .split_once('=')
                .ok_or_else(|| StoreError::InvalidOption(option.to_string()))?;

            match key.trim() {
                MAX_DEPTH_OPTION => {
                    max_depth = value
                        .trim()
                        .parse()
                        .ok()
                        .filter(|depth| *depth > 0)
                        .ok_or_else(|| StoreError::InvalidOption(option.to_string()))?;
                }
                _ => return Err(StoreError::InvalidOption(option.to_string())),
            }
        }

        fs::create_dir_all(root.join(LAYERS_SUBDIR))?;
        fs::create_dir_all(root.join(MOUNTS_SUBDIR))?;
        tracing::info!(
            "Opened vfs layer store at {} (max depth {})",
            root.display(),
            max_depth
        );

        Ok(Self {
            root,
            max_depth,
            layers: HashMap::new(),
            rw_layers: HashSet::new(),
        })
    }

    /// Returns the directory the store keeps its layers and mounts in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the maximum number of layers in a chain.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Returns the number of layers currently stored.
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Returns the reference count of a layer, or `None` if it is not stored.
    pub fn reference_count(&self, chain_id: &ChainId) -> Option<usize> {
        self.layers.get(chain_id).map(|record| record.references)
    }

    fn layer_dir(&self, chain_id: &ChainId) -> PathBuf {
        self.root
            .join(LAYERS_SUBDIR)
            .join(chain_id.digest().hex())
    }

    fn diff_dir(&self, chain_id: &ChainId) -> PathBuf {
        self.layer_dir(chain_id).join(DIFF_SUBDIR)
    }

    fn handle(&self, chain_id: &ChainId) -> StoreResult<VfsLayer> {
        let mut ancestry = Vec::new();
        let mut current = Some(chain_id);
        while let Some(id) = current {
            let record = self
                .layers
                .get(id)
                .ok_or_else(|| StoreError::LayerNotFound(id.clone()))?;
            ancestry.push((id, record));
            current = record.parent.as_ref();
        }

        let mut handle = None;
        for (id, record) in ancestry.into_iter().rev() {
            handle = Some(VfsLayer {
                chain_id: id.clone(),
                diff_id: record.diff_id.clone(),
                size: record.size,
                diff_size: record.diff_size,
                tar_path: self.layer_dir(id).join(LAYER_TAR_FILENAME),
                parent: handle.map(Box::new),
            });
        }

        handle.ok_or_else(|| StoreError::LayerNotFound(chain_id.clone()))
    }

    fn acquire(&mut self, chain_id: &ChainId) -> StoreResult<()> {
        let record = self
            .layers
            .get_mut(chain_id)
            .ok_or_else(|| StoreError::LayerNotFound(chain_id.clone()))?;
        record.references += 1;
        Ok(())
    }

    fn release_reference(&mut self, chain_id: &ChainId) -> StoreResult<Vec<ReleaseMetadata>> {
        let mut released = Vec::new();
        let mut current = Some(chain_id.clone());

        while let Some(id) = current.take() {
            let record = self
                .layers
                .get_mut(&id)
                .ok_or_else(|| StoreError::LayerNotFound(id.clone()))?;

            record.references = record.references.saturating_sub(1);
            if record.references > 0 {
                tracing::debug!("Released reference on layer {} ({} left)", id, record.references);
                break;
            }

            fs::remove_dir_all(self.layer_dir(&id))?;
            let Some(record) = self.layers.remove(&id) else {
                break;
            };
            tracing::info!("Deleted layer {}", id);

            current = record.parent;
            released.push(ReleaseMetadata {
                chain_id: id,
                diff_id: record.diff_id,
                size: record.size,
                diff_size: record.diff_size,
            });
        }

        Ok(released)
    }

    fn populate_layer(
        &self,
        layer_dir: &Path,
        diff: &[u8],
        parent: Option<&ChainId>,
    ) -> StoreResult<u64> {
        let diff_dir = layer_dir.join(DIFF_SUBDIR);
        match parent {
            Some(parent) => copy::copy_tree(&self.diff_dir(parent), &diff_dir)?,
            None => fs::create_dir_all(&diff_dir)?,
        }

        let size = archive::unpack(diff, &diff_dir)
            .map_err(|e| StoreError::InvalidArchive(e.to_string()))?;
        fs::write(layer_dir.join(LAYER_TAR_FILENAME), diff)?;

        Ok(size)
    }

    fn populate_rw_dir(
        &self,
        path: &Path,
        parent: Option<&ChainId>,
        init: Option<&LayerInit>,
    ) -> StoreResult<DirectoryManifest> {
        match parent {
            Some(parent) => copy::copy_tree(&self.diff_dir(parent), path)?,
            None => fs::create_dir_all(path)?,
        }

        if let Some(init) = init {
            init.apply(path).map_err(StoreError::custom)?;
        }

        Ok(DirectoryManifest::build(path)?)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl LayerStore for VfsLayerStore {
    type Layer = VfsLayer;
    type RwLayer = VfsRwLayer;

    fn create_rw_layer(
        &mut self,
        id: &str,
        parent: Option<&ChainId>,
        opts: RwLayerOptions,
    ) -> StoreResult<VfsRwLayer> {
        if id.is_empty() || id.contains('/') || id == "." || id == ".." {
            return Err(StoreError::InvalidOption(format!("invalid rw layer id: {id:?}")));
        }

        if self.rw_layers.contains(id) {
            return Err(StoreError::RwLayerExists(id.to_string()));
        }

        if let Some(key) = opts.get_storage_opts().keys().next() {
            return Err(StoreError::InvalidOption(format!(
                "unsupported storage option: {key}"
            )));
        }

        if let Some(parent) = parent {
            if !self.layers.contains_key(parent) {
                return Err(StoreError::LayerNotFound(parent.clone()));
            }
        }

        let path = self.root.join(MOUNTS_SUBDIR).join(id);
        let base = match self.populate_rw_dir(&path, parent, opts.get_init().as_ref()) {
            Ok(base) => base,
            Err(e) => {
                if let Err(cleanup_err) = fs::remove_dir_all(&path) {
                    tracing::warn!(
                        "Failed to clean up rw layer {} after error: {}",
                        id,
                        cleanup_err
                    );
                }
                return Err(e);
            }
        };

        if let Some(parent) = parent {
            self.acquire(parent)?;
        }
        self.rw_layers.insert(id.to_string());

        tracing::info!(
            "Created rw layer {} on {}",
            id,
            parent.map_or_else(|| "empty root".to_string(), ChainId::to_string)
        );

        Ok(VfsRwLayer {
            id: id.to_string(),
            parent: parent.cloned(),
            path,
            base,
            mount_count: 0,
        })
    }

    fn register(&mut self, mut diff: impl Read, parent: Option<&ChainId>) -> StoreResult<VfsLayer> {
        let mut bytes = Vec::new();
        diff.read_to_end(&mut bytes)?;

        let diff_id = DiffId::from_bytes(&bytes);
        let chain_id = ChainId::derive(parent, &diff_id);

        let depth = match parent {
            Some(parent) => {
                self.layers
                    .get(parent)
                    .ok_or_else(|| StoreError::LayerNotFound(parent.clone()))?
                    .depth
                    + 1
            }
            None => 1,
        };

        if depth > self.max_depth {
            return Err(StoreError::MaxDepthExceeded(self.max_depth));
        }

        if self.layers.contains_key(&chain_id) {
            self.acquire(&chain_id)?;
            tracing::debug!("Layer {} already exists, added reference", chain_id);
            return self.handle(&chain_id);
        }

        let layer_dir = self.layer_dir(&chain_id);
        let size = match self.populate_layer(&layer_dir, &bytes, parent) {
            Ok(size) => size,
            Err(e) => {
                if let Err(cleanup_err) = fs::remove_dir_all(&layer_dir) {
                    tracing::warn!(
                        "Failed to clean up layer {} after error: {}",
                        chain_id,
                        cleanup_err
                    );
                }
                return Err(e);
            }
        };

        if let Some(parent) = parent {
            self.acquire(parent)?;
        }

        self.layers.insert(
            chain_id.clone(),
            LayerRecord {
                diff_id,
                parent: parent.cloned(),
                depth,
                size,
                diff_size: bytes.len() as u64,
                references: 1,
            },
        );
        tracing::info!("Registered layer {} at depth {}", chain_id, depth);

        self.handle(&chain_id)
    }

    fn release(&mut self, layer: VfsLayer) -> StoreResult<Vec<ReleaseMetadata>> {
        let chain_id = layer.chain_id().clone();
        drop(layer);
        self.release_reference(&chain_id)
    }

    fn release_rw_layer(&mut self, mut rw_layer: VfsRwLayer) -> StoreResult<Vec<ReleaseMetadata>> {
        if rw_layer.is_mounted() {
            tracing::warn!(
                "Releasing rw layer {} with {} active mounts, unmounting",
                rw_layer.id(),
                rw_layer.mount_count
            );
            rw_layer.mount_count = 0;
        }

        if !self.rw_layers.remove(rw_layer.id()) {
            return Err(StoreError::custom(anyhow::anyhow!(
                "rw layer does not belong to this store: {}",
                rw_layer.id()
            )));
        }

        fs::remove_dir_all(rw_layer.path())?;
        tracing::info!("Released rw layer {}", rw_layer.id());

        match rw_layer.parent() {
            Some(parent) => self.release_reference(parent),
            None => Ok(Vec::new()),
        }
    }

    fn cleanup(&mut self) -> StoreResult<()> {
        for subdir in [LAYERS_SUBDIR, MOUNTS_SUBDIR] {
            let path = self.root.join(subdir);
            if path.exists() {
                fs::remove_dir_all(&path)?;
            }
        }

        self.layers.clear();
        self.rw_layers.clear();
        tracing::info!("Cleaned up vfs layer store at {}", self.root.display());

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
