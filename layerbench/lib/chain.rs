use std::{
    fmt::{self, Display},
    io::Read,
    path::PathBuf,
};

use crate::{
    store::{ChainId, Layer, LayerStore, ReleaseMetadata, RwLayer, RwLayerOptions},
    LayerInit, LayerbenchError, LayerbenchResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The lifecycle state of a [`MountSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The RW layer exists but is not mounted.
    Created,

    /// The RW layer is mounted and may be modified.
    Mounted,

    /// The diff of the RW layer has been taken.
    Snapshotted,

    /// The RW layer has been unmounted.
    Unmounted,

    /// The RW layer has been released back to the store.
    Released,
}

/// A scoped RW layer that walks the store's lifecycle in order.
///
/// The session moves through `Created -> Mounted -> Snapshotted -> Unmounted -> Released`.
/// Snapshotting is optional. Calling an operation out of order fails with
/// [`LayerbenchError::LifecycleViolation`]. A session that is dropped before it was released
/// unmounts and releases its RW layer, logging rather than returning any error.
pub struct MountSession<'a, S: LayerStore> {
    store: &'a mut S,
    rw_layer: Option<S::RwLayer>,
    state: SessionState,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<'a, S: LayerStore> MountSession<'a, S> {
    /// Creates a fresh RW layer on top of `parent` with a generated scratch ID.
    pub fn create(store: &'a mut S, parent: Option<&ChainId>) -> LayerbenchResult<Self> {
        Self::create_with(store, parent, RwLayerOptions::default())
    }

    /// Creates a fresh RW layer on top of `parent` with the given options.
    pub fn create_with(
        store: &'a mut S,
        parent: Option<&ChainId>,
        opts: RwLayerOptions,
    ) -> LayerbenchResult<Self> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let rw_layer = store
            .create_rw_layer(&id, parent, opts)
            .map_err(|e| LayerbenchError::store("create rw layer", e))?;

        tracing::debug!("Created mount session {}", id);

        Ok(Self {
            store,
            rw_layer: Some(rw_layer),
            state: SessionState::Created,
        })
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns the store the session belongs to.
    pub fn store(&mut self) -> &mut S {
        self.store
    }

    /// Mounts the RW layer and returns the path of its writable view.
    pub fn mount(&mut self) -> LayerbenchResult<PathBuf> {
        self.expect_state("mount", &[SessionState::Created])?;
        let rw_layer = self.rw_layer_mut("mount")?;
        let path = rw_layer
            .mount("")
            .map_err(|e| LayerbenchError::store("mount", e))?;

        self.state = SessionState::Mounted;
        Ok(path)
    }

    /// Reads the diff stream of everything changed since the layer was created.
    pub fn snapshot(&mut self) -> LayerbenchResult<Vec<u8>> {
        self.expect_state("snapshot", &[SessionState::Mounted])?;
        let rw_layer = self.rw_layer_mut("snapshot")?;

        let mut diff = Vec::new();
        rw_layer
            .tar_stream()
            .map_err(|e| LayerbenchError::store("get tar stream", e))?
            .read_to_end(&mut diff)?;

        self.state = SessionState::Snapshotted;
        Ok(diff)
    }

    /// Unmounts the RW layer.
    pub fn unmount(&mut self) -> LayerbenchResult<()> {
        self.expect_state("unmount", &[SessionState::Mounted, SessionState::Snapshotted])?;
        let rw_layer = self.rw_layer_mut("unmount")?;
        let result = rw_layer
            .unmount()
            .map_err(|e| LayerbenchError::store("unmount", e));

        self.state = SessionState::Unmounted;
        result
    }

    /// Releases the RW layer back to the store.
    pub fn release(&mut self) -> LayerbenchResult<Vec<ReleaseMetadata>> {
        self.expect_state("release", &[SessionState::Created, SessionState::Unmounted])?;
        let rw_layer = self
            .rw_layer
            .take()
            .ok_or(LayerbenchError::LifecycleViolation {
                operation: "release",
                state: "released",
            })?;

        self.state = SessionState::Released;
        self.store
            .release_rw_layer(rw_layer)
            .map_err(|e| LayerbenchError::store("release rw layer", e))
    }

    /// Unmounts the layer if it is mounted and then releases it.
    ///
    /// Release is attempted even if unmounting fails. The first error is returned.
    pub fn close(mut self) -> LayerbenchResult<Vec<ReleaseMetadata>> {
        let unmounted = match self.state {
            SessionState::Mounted | SessionState::Snapshotted => self.unmount(),
            _ => Ok(()),
        };

        let released = self.release();
        match (unmounted, released) {
            (Err(e), Err(release_err)) => {
                tracing::warn!("Failed to release rw layer after unmount error: {}", release_err);
                Err(e)
            }
            (Err(e), Ok(_)) => Err(e),
            (Ok(()), released) => released,
        }
    }

    fn rw_layer_mut(&mut self, operation: &'static str) -> LayerbenchResult<&mut S::RwLayer> {
        self.rw_layer
            .as_mut()
            .ok_or(LayerbenchError::LifecycleViolation {
                operation,
                state: "released",
            })
    }

    fn expect_state(
        &self,
        operation: &'static str,
        allowed: &[SessionState],
    ) -> LayerbenchResult<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }

        tracing::error!(
            "Lifecycle violation: cannot {} a session that is {}",
            operation,
            self.state
        );

        Err(LayerbenchError::LifecycleViolation {
            operation,
            state: self.state.name(),
        })
    }
}

impl SessionState {
    /// Returns the lowercase name of the state.
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Mounted => "mounted",
            SessionState::Snapshotted => "snapshotted",
            SessionState::Unmounted => "unmounted",
            SessionState::Released => "released",
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds a single layer on top of `parent` from `init`.
///
/// A scratch RW layer is created on `parent` and mounted, `init` is applied to the mount, and the
/// resulting diff is registered against `parent`. The RW layer is unmounted and released on every
/// exit path.
///
/// ## Errors
///
/// Returns an error if a store operation fails or a delta cannot be applied. If the session cannot
/// be closed after registration, the new layer is released again before the error is returned.
pub fn build_layer<S: LayerStore>(
    store: &mut S,
    parent: Option<&ChainId>,
    init: &LayerInit,
) -> LayerbenchResult<S::Layer> {
    let layer = {
        let mut session = MountSession::create(store, parent)?;
        let path = session.mount()?;
        init.apply(&path)?;

        let diff = session.snapshot()?;
        let layer = session
            .store()
            .register(&diff[..], parent)
            .map_err(|e| LayerbenchError::store("register layer", e))?;

        match session.close() {
            Ok(_) => layer,
            Err(e) => {
                if let Err(release_err) = store.release(layer) {
                    tracing::warn!(
                        "Failed to release layer after session error: {}",
                        release_err
                    );
                }
                return Err(e);
            }
        }
    };

    tracing::info!(
        "Built layer {} on {}",
        layer.chain_id(),
        parent.map_or_else(|| "empty root".to_string(), ChainId::to_string)
    );

    Ok(layer)
}

/// Builds a chain of layers, one per initializer, and returns the topmost layer.
///
/// Each layer is built on top of the previous one. Once a layer is registered, the reference on the
/// previous tip is released, so the caller ends up holding exactly one reference.
///
/// ## Errors
///
/// Returns [`LayerbenchError::EmptyChain`] if `inits` is empty. Any other error is wrapped with the
/// 1-based position of the failing layer. On failure the builder releases the only reference it
/// holds, which lets the store collect every layer built so far.
pub fn build_chain<S: LayerStore>(
    store: &mut S,
    inits: &[LayerInit],
) -> LayerbenchResult<S::Layer> {
    if inits.is_empty() {
        return Err(LayerbenchError::EmptyChain);
    }

    let mut tip: Option<S::Layer> = None;
    for (i, init) in inits.iter().enumerate() {
        let index = i + 1;
        let parent = tip.as_ref().map(|layer| layer.chain_id().clone());

        let layer = match build_layer(store, parent.as_ref(), init) {
            Ok(layer) => layer,
            Err(e) => {
                if let Some(previous) = tip.take() {
                    rollback(store, previous);
                }
                return Err(e.at_layer(index));
            }
        };

        if let Some(previous) = tip.replace(layer) {
            if let Err(e) = store.release(previous) {
                if let Some(current) = tip.take() {
                    rollback(store, current);
                }
                return Err(LayerbenchError::store("release layer", e).at_layer(i));
            }
        }
    }

    tip.ok_or(LayerbenchError::EmptyChain)
}

fn rollback<S: LayerStore>(store: &mut S, layer: S::Layer) {
    let chain_id = layer.chain_id().clone();
    match store.release(layer) {
        Ok(released) => tracing::debug!(
            "Rolled back chain at {}, {} layers deleted",
            chain_id,
            released.len()
        ),
        Err(e) => tracing::warn!("Failed to roll back chain at {}: {}", chain_id, e),
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl<S: LayerStore> Drop for MountSession<'_, S> {
    fn drop(&mut self) {
        if self.state == SessionState::Released {
            return;
        }

        if matches!(self.state, SessionState::Mounted | SessionState::Snapshotted) {
            if let Err(e) = self.unmount() {
                tracing::warn!("Failed to unmount dropped session: {}", e);
            }
        }

        if let Err(e) = self.release() {
            tracing::warn!("Failed to release dropped session: {}", e);
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
