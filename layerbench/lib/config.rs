use std::{
    env,
    fmt::{self, Display},
    io::Read,
    path::{Path, PathBuf},
    str::FromStr,
};

use getset::Getters;
use tempfile::TempDir;
use typed_builder::TypedBuilder;

use crate::{
    implementations::{VfsLayer, VfsLayerStore, VfsRwLayer},
    store::{ChainId, LayerStore, ReleaseMetadata, RwLayerOptions, StoreResult},
    LayerbenchError, LayerbenchResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Selects the store backend.
pub const GRAPHDRIVER_ENV_VAR: &str = "LAYERBENCH_GRAPHDRIVER";

/// Space separated backend options, e.g. `vfs.max_depth=10`.
pub const GRAPHDRIVER_OPTIONS_ENV_VAR: &str = "LAYERBENCH_GRAPHDRIVER_OPTIONS";

/// Overrides the directory scratch store roots are created in.
pub const TEST_DIR_ENV_VAR: &str = "LAYERBENCH_TEST_DIR";

/// Keeps store roots around for inspection: `never`, `on-failure` or `always`.
pub const KEEP_ENV_VAR: &str = "LAYERBENCH_KEEP";

const STORE_ROOT_PREFIX: &str = "layer-test-";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The layer store backends the harness can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    /// The copy-based reference backend.
    #[default]
    Vfs,
}

/// When to keep a store's scratch root instead of removing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetainPolicy {
    /// Always remove the root.
    #[default]
    Never,

    /// Keep the root unless the store was cleaned up, i.e. the scenario did not run to completion.
    OnFailure,

    /// Always keep the root.
    Always,
}

/// Configuration of a harness run.
#[derive(Debug, Clone, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct HarnessConfig {
    /// The backend to construct.
    #[builder(default)]
    backend: StoreBackend,

    /// Options passed to the backend.
    #[builder(default, setter(into))]
    backend_options: Vec<String>,

    /// The directory store roots are created in. Defaults to the system temp dir.
    #[builder(default, setter(strip_option, into))]
    temp_root: Option<PathBuf>,

    /// When to keep store roots around.
    #[builder(default)]
    retain: RetainPolicy,
}

/// A layer store living in its own scratch root.
///
/// The root is removed on [`cleanup`](LayerStore::cleanup) or drop, unless the [`RetainPolicy`]
/// says otherwise. A store dropped without a successful cleanup counts as a failed run.
#[derive(Debug)]
pub struct TestStore {
    backend: VfsLayerStore,
    root: Option<TempDir>,
    retain: RetainPolicy,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HarnessConfig {
    /// Reads the configuration from `LAYERBENCH_*` environment variables.
    ///
    /// Unset variables fall back to the defaults: the `vfs` backend with no options, the system
    /// temp dir, and never retaining roots.
    pub fn from_env() -> LayerbenchResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> LayerbenchResult<Self> {
        let backend = match lookup(GRAPHDRIVER_ENV_VAR) {
            Some(value) if !value.is_empty() => value.parse()?,
            _ => StoreBackend::default(),
        };

        let backend_options = lookup(GRAPHDRIVER_OPTIONS_ENV_VAR)
            .map(|value| value.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        let temp_root = lookup(TEST_DIR_ENV_VAR)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);

        let retain = match lookup(KEEP_ENV_VAR) {
            Some(value) if !value.is_empty() => value.parse()?,
            _ => RetainPolicy::default(),
        };

        tracing::debug!(
            "Harness config from env: backend {}, options {:?}, retain {:?}",
            backend,
            backend_options,
            retain
        );

        Ok(Self {
            backend,
            backend_options,
            temp_root,
            retain,
        })
    }
}

impl TestStore {
    /// Returns the scratch root of the store, or `None` once it has been cleaned up.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_ref().map(TempDir::path)
    }

    /// Returns the underlying backend.
    pub fn backend(&self) -> &VfsLayerStore {
        &self.backend
    }

    /// Whether a root still present on drop is kept. Cleanup takes the root, so reaching drop with
    /// one means the run bailed out early, through an error or a panic.
    fn retain_on_drop(&self) -> bool {
        match self.retain {
            RetainPolicy::Always | RetainPolicy::OnFailure => true,
            RetainPolicy::Never => false,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates a scratch root and opens the configured backend in it.
pub fn open_store(config: &HarnessConfig) -> LayerbenchResult<TestStore> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(STORE_ROOT_PREFIX);
    let root = match config.get_temp_root() {
        Some(parent) => builder.tempdir_in(parent)?,
        None => builder.tempdir()?,
    };

    let backend = match config.get_backend() {
        StoreBackend::Vfs => VfsLayerStore::with_options(root.path(), config.get_backend_options())
            .map_err(|e| LayerbenchError::store("open store", e))?,
    };

    tracing::info!(
        "Opened {} store at {}",
        config.get_backend(),
        root.path().display()
    );

    Ok(TestStore {
        backend,
        root: Some(root),
        retain: *config.get_retain(),
    })
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl FromStr for StoreBackend {
    type Err = LayerbenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vfs" => Ok(Self::Vfs),
            _ => Err(LayerbenchError::InvalidConfig(format!(
                "unsupported graph driver: {s}"
            ))),
        }
    }
}

impl Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vfs => f.write_str("vfs"),
        }
    }
}

impl FromStr for RetainPolicy {
    type Err = LayerbenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "never" | "0" | "false" => Ok(Self::Never),
            "on-failure" => Ok(Self::OnFailure),
            "always" | "1" | "true" => Ok(Self::Always),
            _ => Err(LayerbenchError::InvalidConfig(format!(
                "invalid retain policy: {s}"
            ))),
        }
    }
}

impl LayerStore for TestStore {
    type Layer = VfsLayer;
    type RwLayer = VfsRwLayer;

    fn create_rw_layer(
        &mut self,
        id: &str,
        parent: Option<&ChainId>,
        opts: RwLayerOptions,
    ) -> StoreResult<VfsRwLayer> {
        self.backend.create_rw_layer(id, parent, opts)
    }

    fn register(&mut self, diff: impl Read, parent: Option<&ChainId>) -> StoreResult<VfsLayer> {
        self.backend.register(diff, parent)
    }

    fn release(&mut self, layer: VfsLayer) -> StoreResult<Vec<ReleaseMetadata>> {
        self.backend.release(layer)
    }

    fn release_rw_layer(&mut self, rw_layer: VfsRwLayer) -> StoreResult<Vec<ReleaseMetadata>> {
        self.backend.release_rw_layer(rw_layer)
    }

    fn cleanup(&mut self) -> StoreResult<()> {
        self.backend.cleanup()?;

        let Some(root) = self.root.take() else {
            return Ok(());
        };

        if self.retain == RetainPolicy::Always {
            let path = root.keep();
            tracing::info!("Keeping store root {}", path.display());
            return Ok(());
        }

        root.close()?;
        Ok(())
    }
}

impl Drop for TestStore {
    fn drop(&mut self) {
        let retain = self.retain_on_drop();
        if let Some(root) = self.root.take() {
            if retain {
                let path = root.keep();
                tracing::warn!("Store dropped without cleanup, keeping root {}", path.display());
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
