use std::{
    fmt::{self, Display},
    fs::{self, DirBuilder},
    io,
    os::unix::fs::{DirBuilderExt, PermissionsExt},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{utils, LayerbenchError, LayerbenchResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A single mutation of a filesystem subtree.
///
/// Paths are relative to the root the delta is applied against. A leading `/` is ignored, so
/// `/etc/hosts` and `etc/hosts` name the same file. Paths containing `..` are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FilesystemDelta {
    /// Creates or truncates a file, writes `content`, then sets its permissions to `mode`.
    WriteFile {
        /// The file to write.
        path: PathBuf,

        /// The full content of the file.
        content: Vec<u8>,

        /// The permission bits of the file.
        mode: u32,
    },

    /// Removes a file or a directory tree. Missing paths are ignored.
    RemoveSubtree {
        /// The path to remove.
        path: PathBuf,
    },

    /// Creates a directory and any missing ancestors. Existing directories are left untouched.
    MakeDirectory {
        /// The directory to create.
        path: PathBuf,

        /// The permission bits of every directory created.
        mode: u32,
    },

    /// Renames `from` to `to`, replacing `to` if it exists.
    Rename {
        /// The existing path.
        from: PathBuf,

        /// The new path.
        to: PathBuf,
    },

    /// Changes the owner of a path, following symlinks.
    Chown {
        /// The path to change.
        path: PathBuf,

        /// The new user ID.
        uid: u32,

        /// The new group ID.
        gid: u32,
    },
}

/// The ordered deltas that make up the content of exactly one layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerInit {
    deltas: Vec<FilesystemDelta>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FilesystemDelta {
    /// Applies the delta against `root`.
    ///
    /// ## Errors
    ///
    /// Returns [`LayerbenchError::DeltaApplication`] carrying the failed delta if the underlying
    /// filesystem operation fails.
    pub fn apply(&self, root: impl AsRef<Path>) -> LayerbenchResult<()> {
        self.apply_inner(root.as_ref())
            .map_err(|source| LayerbenchError::DeltaApplication {
                delta: self.to_string(),
                source,
            })
    }

    fn apply_inner(&self, root: &Path) -> io::Result<()> {
        match self {
            FilesystemDelta::WriteFile {
                path,
                content,
                mode,
            } => {
                let full_path = utils::resolve_in_root(root, path)?;
                tracing::debug!("Writing file: {}", full_path.display());
                fs::write(&full_path, content)?;
                fs::set_permissions(&full_path, fs::Permissions::from_mode(*mode))
            }
            FilesystemDelta::RemoveSubtree { path } => {
                let full_path = utils::resolve_in_root(root, path)?;
                let metadata = match fs::symlink_metadata(&full_path) {
                    Ok(metadata) => metadata,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                    Err(e) => return Err(e),
                };

                tracing::debug!("Removing: {}", full_path.display());
                if metadata.is_dir() {
                    fs::remove_dir_all(&full_path)
                } else {
                    fs::remove_file(&full_path)
                }
            }
            FilesystemDelta::MakeDirectory { path, mode } => {
                let full_path = utils::resolve_in_root(root, path)?;
                tracing::debug!("Creating directory: {}", full_path.display());
                DirBuilder::new()
                    .recursive(true)
                    .mode(*mode)
                    .create(&full_path)
            }
            FilesystemDelta::Rename { from, to } => {
                let from = utils::resolve_in_root(root, from)?;
                let to = utils::resolve_in_root(root, to)?;
                tracing::debug!("Renaming: {} -> {}", from.display(), to.display());
                fs::rename(&from, &to)
            }
            FilesystemDelta::Chown { path, uid, gid } => {
                let full_path = utils::resolve_in_root(root, path)?;
                tracing::debug!("Changing owner of {} to {uid}:{gid}", full_path.display());
                std::os::unix::fs::chown(&full_path, Some(*uid), Some(*gid))
            }
        }
    }
}

impl LayerInit {
    /// Creates a layer initializer from an ordered list of deltas.
    pub fn new(deltas: impl Into<Vec<FilesystemDelta>>) -> Self {
        Self {
            deltas: deltas.into(),
        }
    }

    /// Creates a layer initializer that changes nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the deltas in application order.
    pub fn deltas(&self) -> &[FilesystemDelta] {
        &self.deltas
    }

    /// Returns `true` if the initializer changes nothing.
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Appends a delta and returns the initializer.
    pub fn with(mut self, delta: FilesystemDelta) -> Self {
        self.deltas.push(delta);
        self
    }

    /// Applies every delta against `root` in order, stopping at the first failure.
    pub fn apply(&self, root: impl AsRef<Path>) -> LayerbenchResult<()> {
        let root = root.as_ref();
        for delta in &self.deltas {
            delta.apply(root)?;
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates a [`FilesystemDelta::WriteFile`].
pub fn write_file(
    path: impl Into<PathBuf>,
    content: impl Into<Vec<u8>>,
    mode: u32,
) -> FilesystemDelta {
    FilesystemDelta::WriteFile {
        path: path.into(),
        content: content.into(),
        mode,
    }
}

/// Creates a [`FilesystemDelta::RemoveSubtree`].
pub fn remove_subtree(path: impl Into<PathBuf>) -> FilesystemDelta {
    FilesystemDelta::RemoveSubtree { path: path.into() }
}

/// Creates a [`FilesystemDelta::MakeDirectory`].
pub fn make_directory(path: impl Into<PathBuf>, mode: u32) -> FilesystemDelta {
    FilesystemDelta::MakeDirectory {
        path: path.into(),
        mode,
    }
}

/// Creates a [`FilesystemDelta::Rename`].
pub fn rename(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> FilesystemDelta {
    FilesystemDelta::Rename {
        from: from.into(),
        to: to.into(),
    }
}

/// Creates a [`FilesystemDelta::Chown`].
pub fn chown(path: impl Into<PathBuf>, uid: u32, gid: u32) -> FilesystemDelta {
    FilesystemDelta::Chown {
        path: path.into(),
        uid,
        gid,
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for FilesystemDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilesystemDelta::WriteFile {
                path,
                content,
                mode,
            } => write!(
                f,
                "write file {} ({} bytes, {})",
                path.display(),
                content.len(),
                utils::format_mode(*mode)
            ),
            FilesystemDelta::RemoveSubtree { path } => write!(f, "remove {}", path.display()),
            FilesystemDelta::MakeDirectory { path, mode } => write!(
                f,
                "make directory {} ({})",
                path.display(),
                utils::format_mode(*mode)
            ),
            FilesystemDelta::Rename { from, to } => {
                write!(f, "rename {} to {}", from.display(), to.display())
            }
            FilesystemDelta::Chown { path, uid, gid } => {
                write!(f, "chown {} to {uid}:{gid}", path.display())
            }
        }
    }
}

impl From<Vec<FilesystemDelta>> for LayerInit {
    fn from(deltas: Vec<FilesystemDelta>) -> Self {
        Self::new(deltas)
    }
}

impl FromIterator<FilesystemDelta> for LayerInit {
    fn from_iter<I: IntoIterator<Item = FilesystemDelta>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect::<Vec<_>>())
    }
}

impl<'a> IntoIterator for &'a LayerInit {
    type Item = &'a FilesystemDelta;
    type IntoIter = std::slice::Iter<'a, FilesystemDelta>;

    fn into_iter(self) -> Self::IntoIter {
        self.deltas.iter()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
