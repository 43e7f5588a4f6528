//! Structural snapshots of directory trees and the differences between them.
//!
//! A [`DirectoryManifest`] records, for every path below a root, the properties a layered
//! filesystem has to preserve: type, permission bits, ownership, content digest, symlink target,
//! device number and hardlink groups. Two trees are equivalent when their manifests are equal.

mod diff;
mod resource;

use std::{
    collections::{btree_map, BTreeMap, HashMap},
    io,
    os::unix::fs::MetadataExt,
    path::Path,
};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::utils;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use diff::*;
pub use resource::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An order-independent snapshot of every resource below a directory.
///
/// Resources are keyed by their root-relative path, for example `/etc/hosts`. The root directory
/// itself is not part of the manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryManifest {
    resources: BTreeMap<String, Resource>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DirectoryManifest {
    /// Walks `root` and records every resource below it. Symlinks are not followed.
    ///
    /// ## Errors
    ///
    /// Returns an error if the tree cannot be walked or a file cannot be read.
    pub fn build(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref();
        let mut resources = BTreeMap::new();
        let mut inodes: HashMap<(u64, u64), Vec<String>> = HashMap::new();

        for entry in WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry?;
            let Some(path) = utils::relative_to_root(root, entry.path()) else {
                continue;
            };

            let metadata = entry.metadata()?;
            if !metadata.is_dir() && metadata.nlink() > 1 {
                inodes
                    .entry((metadata.dev(), metadata.ino()))
                    .or_default()
                    .push(path.clone());
            }

            resources.insert(path, Resource::from_metadata(entry.path(), &metadata)?);
        }

        for mut group in inodes.into_values().filter(|group| group.len() > 1) {
            group.sort();
            for path in &group {
                if let Some(resource) = resources.get_mut(path) {
                    resource.hardlinks = group.clone();
                }
            }
        }

        tracing::debug!(
            "Built manifest of {} with {} resources",
            root.display(),
            resources.len()
        );

        Ok(Self { resources })
    }

    /// Returns the resource at a root-relative path.
    pub fn get(&self, path: &str) -> Option<&Resource> {
        self.resources.get(path)
    }

    /// Iterates over every resource in path order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, Resource> {
        self.resources.iter()
    }

    /// Returns the number of resources.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns `true` if the tree is empty.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Computes the differences from `self` to `new`.
    pub fn diff(&self, new: &DirectoryManifest) -> ManifestDiff {
        ManifestDiff::between(self, new)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<'a> IntoIterator for &'a DirectoryManifest {
    type Item = (&'a String, &'a Resource);
    type IntoIter = btree_map::Iter<'a, String, Resource>;

    fn into_iter(self) -> Self::IntoIter {
        self.resources.iter()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
