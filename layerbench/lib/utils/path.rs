use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Resolves a root-relative path such as `/etc/hosts` against `root`.
///
/// A leading `/` is ignored. Paths that would escape `root` are rejected.
///
/// ## Examples
///
/// ```
/// use std::path::Path;
/// use layerbench::utils::resolve_in_root;
///
/// let full = resolve_in_root(Path::new("/tmp/root"), "/etc/hosts").unwrap();
/// assert_eq!(full, Path::new("/tmp/root/etc/hosts"));
///
/// assert!(resolve_in_root(Path::new("/tmp/root"), "/etc/../../passwd").is_err());
/// ```
pub fn resolve_in_root(root: &Path, path: impl AsRef<Path>) -> io::Result<PathBuf> {
    let path = path.as_ref();
    let mut resolved = root.to_path_buf();

    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(name) => resolved.push(name),
            Component::ParentDir | Component::Prefix(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("path escapes root: {}", path.display()),
                ));
            }
        }
    }

    Ok(resolved)
}

/// Fails if any existing directory between `root` and `full` is a symlink.
///
/// `full` must already be resolved under `root`. The final component is not checked, so a symlink
/// at `full` itself can still be replaced or removed.
pub fn reject_symlink_ancestors(root: &Path, full: &Path) -> io::Result<()> {
    let Some(parent) = full.parent() else {
        return Ok(());
    };
    let relative = parent.strip_prefix(root).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path escapes root: {}", full.display()),
        )
    })?;

    let mut current = root.to_path_buf();
    for component in relative.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "path traverses symlink {}: {}",
                        current.display(),
                        full.display()
                    ),
                ));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

/// Renders `full`, which must live under `root`, as a root-relative path like `/etc/hosts`.
///
/// Returns `None` for `root` itself or for paths outside `root`.
pub fn relative_to_root(root: &Path, full: &Path) -> Option<String> {
    let relative = full.strip_prefix(root).ok()?;
    if relative.as_os_str().is_empty() {
        return None;
    }

    Some(format!("/{}", relative.to_string_lossy()))
}

/// Returns the root-relative parent of a root-relative path, or `None` for top-level entries.
pub fn parent_of(path: &str) -> Option<&str> {
    let path = path.trim_end_matches('/');
    match path.rfind('/') {
        Some(0) | None => None,
        Some(pos) => Some(&path[..pos]),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
