use std::{
    collections::HashMap,
    fs,
    io,
    os::unix::fs::{lchown, symlink, FileTypeExt, MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
};

use nix::{
    sys::stat::{self, Mode, SFlag},
    unistd,
};
use walkdir::WalkDir;

use crate::utils::{self, PERMISSION_MASK};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Copies the tree below `source_dir` into `dest_dir`, preserving file types, ownership,
/// permissions and hardlinks.
///
/// `dest_dir` is created if it does not exist. Directory permissions are applied after their
/// content has been copied, deepest first, so read-only directories can still be filled.
///
/// ## Errors
///
/// Returns an error if the source cannot be walked or any entry cannot be recreated.
pub(super) fn copy_tree(source_dir: &Path, dest_dir: &Path) -> io::Result<()> {
    let mut links: HashMap<(u64, u64), PathBuf> = HashMap::new();
    let mut directories: Vec<(PathBuf, u32)> = Vec::new();

    fs::create_dir_all(dest_dir)?;

    for entry in WalkDir::new(source_dir).min_depth(1).follow_links(false) {
        let entry = entry?;
        let source_path = entry.path();
        let relative = source_path
            .strip_prefix(source_dir)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let target_path = dest_dir.join(relative);

        let metadata = entry.metadata()?;
        let file_type = metadata.file_type();
        let mode = metadata.mode() & PERMISSION_MASK;

        if file_type.is_dir() {
            fs::create_dir(&target_path)?;
            directories.push((target_path.clone(), mode));
        } else if file_type.is_file() {
            if metadata.nlink() > 1 {
                let key = (metadata.dev(), metadata.ino());
                if let Some(first) = links.get(&key) {
                    tracing::debug!(
                        "Linking file: {} -> {}",
                        target_path.display(),
                        first.display()
                    );
                    fs::hard_link(first, &target_path)?;
                    continue;
                }
                links.insert(key, target_path.clone());
            }

            fs::copy(source_path, &target_path)?;
        } else if file_type.is_symlink() {
            symlink(fs::read_link(source_path)?, &target_path)?;
        } else if file_type.is_fifo() {
            unistd::mkfifo(&target_path, Mode::from_bits_truncate(mode))?;
        } else if file_type.is_char_device() || file_type.is_block_device() {
            let kind = if file_type.is_char_device() {
                SFlag::S_IFCHR
            } else {
                SFlag::S_IFBLK
            };
            stat::mknod(
                &target_path,
                kind,
                Mode::from_bits_truncate(mode),
                metadata.rdev(),
            )?;
        } else {
            tracing::debug!("Skipping socket: {}", source_path.display());
            continue;
        }

        let target_metadata = fs::symlink_metadata(&target_path)?;
        if target_metadata.uid() != metadata.uid() || target_metadata.gid() != metadata.gid() {
            lchown(&target_path, Some(metadata.uid()), Some(metadata.gid()))?;
        }

        if !file_type.is_dir() && !file_type.is_symlink() {
            fs::set_permissions(&target_path, fs::Permissions::from_mode(mode))?;
        }
    }

    for (dir, mode) in directories.into_iter().rev() {
        fs::set_permissions(&dir, fs::Permissions::from_mode(mode))?;
        tracing::debug!(
            "Applied permissions to {}: {} ({:#o})",
            dir.display(),
            utils::format_mode(mode),
            mode
        );
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
