use std::fmt::{self, Display};

use getset::Getters;
use serde::{Deserialize, Serialize};

use super::{DirectoryManifest, Resource, ResourceField};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Every difference between an old and a new [`DirectoryManifest`].
///
/// Each path appears at most once, either as added, deleted, or modified.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ManifestDiff {
    /// Paths only present in the new manifest.
    added: Vec<String>,

    /// Paths only present in the old manifest.
    deleted: Vec<String>,

    /// Paths present in both manifests whose resources differ.
    modified: Vec<ModifiedResource>,
}

/// A path whose resource differs between two manifests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ModifiedResource {
    /// The root-relative path.
    path: String,

    /// The fields that differ.
    fields: Vec<ResourceField>,

    /// The resource in the old manifest.
    old: Resource,

    /// The resource in the new manifest.
    new: Resource,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ManifestDiff {
    /// Computes the differences from `old` to `new`.
    pub fn between(old: &DirectoryManifest, new: &DirectoryManifest) -> Self {
        let mut diff = Self::default();

        for (path, old_resource) in old.iter() {
            match new.get(path) {
                None => diff.deleted.push(path.to_string()),
                Some(new_resource) => {
                    let fields = old_resource.differing_fields(new_resource);
                    if !fields.is_empty() {
                        diff.modified.push(ModifiedResource {
                            path: path.to_string(),
                            fields,
                            old: old_resource.clone(),
                            new: new_resource.clone(),
                        });
                    }
                }
            }
        }

        diff.added = new
            .iter()
            .filter(|(path, _)| old.get(path).is_none())
            .map(|(path, _)| path.to_string())
            .collect();

        diff
    }

    /// Returns `true` if the manifests are identical.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty() && self.modified.is_empty()
    }

    /// Returns the number of paths that differ.
    pub fn len(&self) -> usize {
        self.added.len() + self.deleted.len() + self.modified.len()
    }

    /// Returns every path that differs, sorted.
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self
            .added
            .iter()
            .chain(&self.deleted)
            .map(String::as_str)
            .chain(self.modified.iter().map(|m| m.path.as_str()))
            .collect();
        paths.sort_unstable();
        paths
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for ManifestDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for path in &self.added {
            writeln!(f, "+ {path}")?;
        }

        for path in &self.deleted {
            writeln!(f, "- {path}")?;
        }

        for modified in &self.modified {
            writeln!(f, "{modified}")?;
        }

        Ok(())
    }
}

impl Display for ModifiedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "~ {}:", self.path)?;
        for (i, field) in self.fields.iter().enumerate() {
            let separator = if i == 0 { " " } else { "; " };
            write!(
                f,
                "{separator}{field} {} -> {}",
                self.old.describe(*field),
                self.new.describe(*field)
            )?;
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::PermissionsExt};

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_manifest_diff_reports_each_path_once() -> anyhow::Result<()> {
        let old_dir = tempdir()?;
        let new_dir = tempdir()?;

        helper::write(old_dir.path(), "kept", "same", 0o644)?;
        helper::write(old_dir.path(), "changed", "before", 0o644)?;
        helper::write(old_dir.path(), "gone", "bye", 0o644)?;

        helper::write(new_dir.path(), "kept", "same", 0o644)?;
        helper::write(new_dir.path(), "changed", "after!", 0o600)?;
        helper::write(new_dir.path(), "new", "hi", 0o644)?;

        let old = DirectoryManifest::build(old_dir.path())?;
        let new = DirectoryManifest::build(new_dir.path())?;
        let diff = ManifestDiff::between(&old, &new);

        assert_eq!(diff.get_added(), &vec!["/new".to_string()]);
        assert_eq!(diff.get_deleted(), &vec!["/gone".to_string()]);
        assert_eq!(diff.get_modified().len(), 1);
        assert_eq!(
            diff.get_modified()[0].get_fields(),
            &vec![ResourceField::Mode, ResourceField::Digest]
        );
        assert_eq!(diff.len(), 3);
        assert_eq!(diff.paths(), vec!["/changed", "/gone", "/new"]);

        let rendered = diff.to_string();
        assert!(rendered.contains("+ /new\n"));
        assert!(rendered.contains("- /gone\n"));
        assert!(rendered.contains("~ /changed: mode rw-r--r-- (0o644) -> rw------- (0o600)"));

        Ok(())
    }

    #[test]
    fn test_manifest_diff_of_identical_trees_is_empty() -> anyhow::Result<()> {
        let dir = tempdir()?;
        helper::write(dir.path(), "file", "content", 0o644)?;

        let manifest = DirectoryManifest::build(dir.path())?;
        let diff = ManifestDiff::between(&manifest, &manifest.clone());
        assert!(diff.is_empty());
        assert_eq!(diff.to_string(), "");

        Ok(())
    }

    mod helper {
        use std::path::Path;

        use super::*;

        pub(super) fn write(
            root: &Path,
            name: &str,
            content: &str,
            mode: u32,
        ) -> anyhow::Result<()> {
            let path = root.join(name);
            fs::write(&path, content)?;
            fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
            Ok(())
        }
    }
}
