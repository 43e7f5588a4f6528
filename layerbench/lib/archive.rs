use std::{
    collections::{BTreeMap, HashSet},
    fs::{self, File},
    io::{self, Read},
    os::unix::fs::{lchown, symlink, MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
};

use nix::{
    sys::stat::{self, Mode, SFlag},
    unistd,
};
use tar::{Archive, Builder, EntryType, Header};

use crate::{
    manifest::{DirectoryManifest, Resource, ResourceKind},
    utils::{self, PERMISSION_MASK},
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The file name prefix that marks a path as deleted in a diff archive.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// The file name that hides every lower entry of the directory it is placed in.
pub const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

const WHITEOUT_MODE: u32 = 0o644;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Writes manifest resources into a deterministic tar stream.
///
/// Every entry carries a GNU header with a zero mtime and no user or group names, so the same tree
/// always packs to the same bytes.
struct Packer<'a> {
    root: &'a Path,
    builder: Builder<Vec<u8>>,
    written: HashSet<String>,
}

enum Change<'a> {
    Write(&'a Resource),
    Whiteout,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<'a> Packer<'a> {
    fn new(root: &'a Path) -> Self {
        Self {
            root,
            builder: Builder::new(Vec::new()),
            written: HashSet::new(),
        }
    }

    fn append(&mut self, path: &str, resource: &Resource) -> io::Result<()> {
        let name = path.trim_start_matches('/');
        let mut header = Header::new_gnu();
        header.set_mode(*resource.get_mode());
        header.set_uid(u64::from(*resource.get_uid()));
        header.set_gid(u64::from(*resource.get_gid()));
        header.set_mtime(0);
        header.set_size(0);

        match resource.get_kind() {
            ResourceKind::Directory => {
                header.set_entry_type(EntryType::Directory);
                self.builder.append_data(&mut header, name, io::empty())?;
            }
            ResourceKind::File => {
                let link_target = resource
                    .get_hardlinks()
                    .iter()
                    .find(|other| self.written.contains(other.as_str()));

                if let Some(link_target) = link_target {
                    header.set_entry_type(EntryType::Link);
                    self.builder.append_link(
                        &mut header,
                        name,
                        link_target.trim_start_matches('/'),
                    )?;
                } else {
                    header.set_entry_type(EntryType::Regular);
                    header.set_size(*resource.get_size());
                    let file = File::open(utils::resolve_in_root(self.root, path)?)?;
                    self.builder.append_data(&mut header, name, file)?;
                }
            }
            ResourceKind::Symlink => {
                let target = resource.get_target().as_deref().ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("symlink without target: {path}"),
                    )
                })?;

                header.set_entry_type(EntryType::Symlink);
                self.builder.append_link(&mut header, name, target)?;
            }
            ResourceKind::Fifo => {
                header.set_entry_type(EntryType::Fifo);
                self.builder.append_data(&mut header, name, io::empty())?;
            }
            ResourceKind::CharDevice | ResourceKind::BlockDevice => {
                let entry_type = match resource.get_kind() {
                    ResourceKind::CharDevice => EntryType::Char,
                    _ => EntryType::Block,
                };
                let rdev = resource.get_rdev().unwrap_or_default();

                header.set_entry_type(entry_type);
                header.set_device_major(stat::major(rdev) as u32)?;
                header.set_device_minor(stat::minor(rdev) as u32)?;
                self.builder.append_data(&mut header, name, io::empty())?;
            }
            ResourceKind::Socket => {
                tracing::debug!("Skipping socket: {path}");
                return Ok(());
            }
        }

        self.written.insert(path.to_string());
        Ok(())
    }

    fn append_whiteout(&mut self, path: &str) -> io::Result<()> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(WHITEOUT_MODE);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        header.set_size(0);

        self.builder
            .append_data(&mut header, path.trim_start_matches('/'), io::empty())
    }

    fn finish(self) -> io::Result<Vec<u8>> {
        self.builder.into_inner()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Archives every entry below `root` into an uncompressed, deterministic tar stream.
///
/// The root directory itself is not archived. Entries are written in path order and hardlinked
/// files after the first are written as link entries.
pub fn pack_directory(root: impl AsRef<Path>) -> io::Result<Vec<u8>> {
    let root = root.as_ref();
    let manifest = DirectoryManifest::build(root)?;

    let mut packer = Packer::new(root);
    for (path, resource) in &manifest {
        packer.append(path, resource)?;
    }

    packer.finish()
}

/// Archives the changes that turn `base` into `current`, the manifest of `root`.
///
/// Added and modified entries are packed from `root`. A deleted entry becomes a `.wh.<name>`
/// whiteout unless its parent was deleted or is no longer a directory, in which case the parent's
/// own change already covers it.
pub fn pack_changes(
    root: impl AsRef<Path>,
    base: &DirectoryManifest,
    current: &DirectoryManifest,
) -> io::Result<Vec<u8>> {
    let root = root.as_ref();
    let diff = base.diff(current);
    let mut changes: BTreeMap<String, Change> = BTreeMap::new();

    for path in diff.get_added() {
        if let Some(resource) = current.get(path) {
            changes.insert(path.clone(), Change::Write(resource));
        }
    }

    for modified in diff.get_modified() {
        changes.insert(modified.get_path().clone(), Change::Write(modified.get_new()));
    }

    for path in diff.get_deleted() {
        let parent_survives = match utils::parent_of(path) {
            None => true,
            Some(parent) => current.get(parent).is_some_and(Resource::is_dir),
        };

        if parent_survives {
            changes.insert(whiteout_path(path), Change::Whiteout);
        }
    }

    tracing::debug!(
        "Packing {} changes from {}",
        changes.len(),
        root.display()
    );

    let mut packer = Packer::new(root);
    for (path, change) in &changes {
        match change {
            Change::Write(resource) => packer.append(path, resource)?,
            Change::Whiteout => packer.append_whiteout(path)?,
        }
    }

    packer.finish()
}

/// Applies a diff stream onto `dest`.
///
/// Whiteouts delete the entry they name, opaque whiteouts hide every entry of their directory that
/// is not part of this stream, and entries of a different type replace existing ones. Ownership is
/// only changed where it differs from the unpacking user. Directory permissions are applied last,
/// deepest first.
///
/// Returns the total number of regular file bytes written.
///
/// ## Errors
///
/// Returns an error if the stream is malformed, contains a path escaping `dest`, or an entry
/// cannot be created.
pub fn unpack(diff: impl Read, dest: impl AsRef<Path>) -> io::Result<u64> {
    let dest = dest.as_ref();
    let mut archive = Archive::new(diff);
    let mut size = 0;
    let mut unpacked: HashSet<PathBuf> = HashSet::new();
    let mut opaque_dirs: Vec<PathBuf> = Vec::new();
    let mut directories: Vec<(PathBuf, u32)> = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let target = utils::resolve_in_root(dest, entry.path()?)?;
        utils::reject_symlink_ancestors(dest, &target)?;
        let (Some(parent), Some(name)) = (target.parent(), target.file_name()) else {
            continue;
        };
        if target == dest {
            continue;
        }

        let name = name.to_string_lossy();
        if name == WHITEOUT_OPAQUE {
            opaque_dirs.push(parent.to_path_buf());
            continue;
        }

        if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            tracing::debug!("Applying whiteout for: {}", parent.join(hidden).display());
            remove_path(&parent.join(hidden))?;
            continue;
        }

        let header = entry.header();
        let entry_type = header.entry_type();
        let mode = header.mode()? & PERMISSION_MASK;
        let uid = header.uid()? as u32;
        let gid = header.gid()? as u32;
        let link_name = entry.link_name()?.map(|link| link.into_owned());

        fs::create_dir_all(parent)?;
        if let Ok(existing) = fs::symlink_metadata(&target) {
            if !(existing.is_dir() && entry_type.is_dir()) {
                remove_path(&target)?;
            }
        }

        match entry_type {
            EntryType::Directory => {
                if !target.exists() {
                    fs::create_dir(&target)?;
                }
            }
            EntryType::Regular | EntryType::Continuous => {
                let mut file = File::create(&target)?;
                size += io::copy(&mut entry, &mut file)?;
            }
            EntryType::Symlink => {
                symlink(require_link(link_name, &target)?, &target)?;
            }
            EntryType::Link => {
                let source = utils::resolve_in_root(dest, require_link(link_name, &target)?)?;
                utils::reject_symlink_ancestors(dest, &source)?;
                fs::hard_link(&source, &target)?;
                unpacked.insert(target);
                continue;
            }
            EntryType::Fifo => {
                unistd::mkfifo(&target, Mode::from_bits_truncate(mode))?;
            }
            EntryType::Char | EntryType::Block => {
                let kind = if entry_type == EntryType::Char {
                    SFlag::S_IFCHR
                } else {
                    SFlag::S_IFBLK
                };
                let major = entry.header().device_major()?.unwrap_or_default();
                let minor = entry.header().device_minor()?.unwrap_or_default();
                stat::mknod(
                    &target,
                    kind,
                    Mode::from_bits_truncate(mode),
                    stat::makedev(u64::from(major), u64::from(minor)),
                )?;
            }
            other => {
                tracing::debug!("Skipping {:?} entry: {}", other, target.display());
                continue;
            }
        }

        let metadata = fs::symlink_metadata(&target)?;
        if metadata.uid() != uid || metadata.gid() != gid {
            lchown(&target, Some(uid), Some(gid))?;
        }

        match entry_type {
            EntryType::Directory => directories.push((target.clone(), mode)),
            EntryType::Symlink => {}
            _ => fs::set_permissions(&target, fs::Permissions::from_mode(mode))?,
        }

        unpacked.insert(target);
    }

    for dir in opaque_dirs {
        if !is_real_dir(dest, &dir)? {
            continue;
        }
        tracing::debug!("Applying opaque whiteout for: {}", dir.display());
        for child in fs::read_dir(&dir)? {
            let child = child?.path();
            if !unpacked.iter().any(|path| path.starts_with(&child)) {
                remove_path(&child)?;
            }
        }
    }

    for (dir, mode) in directories.into_iter().rev() {
        if !is_real_dir(dest, &dir)? {
            continue;
        }
        fs::set_permissions(&dir, fs::Permissions::from_mode(mode))?;
    }

    Ok(size)
}

/// Returns the whiteout path that marks `path` as deleted.
fn whiteout_path(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((parent, name)) => format!("{parent}/{WHITEOUT_PREFIX}{name}"),
        None => format!("{WHITEOUT_PREFIX}{path}"),
    }
}

fn require_link(link_name: Option<PathBuf>, target: &Path) -> io::Result<PathBuf> {
    link_name.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("link entry without target: {}", target.display()),
        )
    })
}

/// Whether `dir` is still a directory reached without passing through a symlink.
fn is_real_dir(dest: &Path, dir: &Path) -> io::Result<bool> {
    utils::reject_symlink_ancestors(dest, dir)?;
    match fs::symlink_metadata(dir) {
        Ok(metadata) => Ok(metadata.is_dir()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::{make_directory, remove_subtree, write_file, LayerInit};

    #[test_log::test]
    fn test_pack_directory_is_deterministic() -> anyhow::Result<()> {
        let first = tempdir()?;
        let second = tempdir()?;
        let init = helper::etc_init();

        init.apply(first.path())?;
        std::thread::sleep(std::time::Duration::from_millis(10));
        init.apply(second.path())?;

        assert_eq!(pack_directory(first.path())?, pack_directory(second.path())?);

        Ok(())
    }

    #[test_log::test]
    fn test_pack_directory_entries_are_sorted_without_root() -> anyhow::Result<()> {
        let dir = tempdir()?;
        helper::etc_init().apply(dir.path())?;

        let bytes = pack_directory(dir.path())?;
        let mut archive = Archive::new(&bytes[..]);
        let mut names = Vec::new();
        for entry in archive.entries()? {
            let entry = entry?;
            assert_eq!(entry.header().mtime()?, 0);
            names.push(entry.path()?.to_string_lossy().into_owned());
        }

        assert_eq!(names, vec!["etc", "etc/hosts", "etc/profile"]);

        Ok(())
    }

    #[test_log::test]
    fn test_unpack_reproduces_packed_tree() -> anyhow::Result<()> {
        let source = tempdir()?;
        let dest = tempdir()?;

        helper::etc_init().apply(source.path())?;
        symlink("hosts", source.path().join("etc/hosts.link"))?;
        fs::hard_link(
            source.path().join("etc/profile"),
            source.path().join("etc/profile.link"),
        )?;

        let size = unpack(&pack_directory(source.path())?[..], dest.path())?;

        assert_eq!(size, 17 + 13);
        assert_eq!(
            DirectoryManifest::build(source.path())?,
            DirectoryManifest::build(dest.path())?
        );

        Ok(())
    }

    #[test_log::test]
    fn test_pack_changes_round_trips_deletions_and_replacements() -> anyhow::Result<()> {
        let lower = tempdir()?;
        let upper = tempdir()?;

        let base_init = LayerInit::new(vec![
            make_directory("/test/something", 0o755),
            write_file("/test/something/f1", "1", 0o644),
            write_file("/test/a", "", 0o644),
            make_directory("/test/otherdir", 0o755),
            write_file("/test/otherdir/.empty", "", 0o644),
        ]);
        base_init.apply(lower.path())?;
        base_init.apply(upper.path())?;

        let base = DirectoryManifest::build(upper.path())?;
        LayerInit::new(vec![
            remove_subtree("/test/something"),
            write_file("/test/something", "something new!", 0o644),
            remove_subtree("/test/a"),
            remove_subtree("/test/otherdir"),
        ])
        .apply(upper.path())?;
        let current = DirectoryManifest::build(upper.path())?;

        let bytes = pack_changes(upper.path(), &base, &current)?;
        let mut names = Vec::new();
        for entry in Archive::new(&bytes[..]).entries()? {
            names.push(entry?.path()?.to_string_lossy().into_owned());
        }
        assert_eq!(
            names,
            vec!["test/.wh.a", "test/.wh.otherdir", "test/something"]
        );

        unpack(&bytes[..], lower.path())?;
        assert_eq!(DirectoryManifest::build(lower.path())?, current);

        Ok(())
    }

    #[test_log::test]
    fn test_unpack_opaque_whiteout_hides_lower_entries() -> anyhow::Result<()> {
        let dest = tempdir()?;
        make_directory("/lib", 0o755).apply(dest.path())?;
        write_file("/lib/hidden", "", 0o644).apply(dest.path())?;

        let mut builder = Builder::new(Vec::new());
        for (name, entry_type) in [
            ("lib", EntryType::Directory),
            ("lib/.wh..wh..opq", EntryType::Regular),
            ("lib/not-hidden", EntryType::Regular),
        ] {
            let mut header = Header::new_gnu();
            header.set_entry_type(entry_type);
            header.set_mode(0o755);
            header.set_uid(u64::from(unistd::geteuid().as_raw()));
            header.set_gid(u64::from(unistd::getegid().as_raw()));
            header.set_size(0);
            builder.append_data(&mut header, name, io::empty())?;
        }

        unpack(&builder.into_inner()?[..], dest.path())?;

        assert!(!dest.path().join("lib/hidden").exists());
        assert!(dest.path().join("lib/not-hidden").exists());
        assert!(!dest.path().join("lib/.wh..wh..opq").exists());

        Ok(())
    }

    #[test_log::test]
    fn test_unpack_rejects_escaping_paths() -> anyhow::Result<()> {
        let dest = tempdir()?;

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(0);
        header.set_mode(0o644);
        {
            let name = b"../escape";
            let gnu = header.as_gnu_mut().ok_or_else(|| anyhow::anyhow!("not gnu"))?;
            gnu.name[..name.len()].copy_from_slice(name);
        }
        header.set_cksum();

        let mut bytes = header.as_bytes().to_vec();
        bytes.extend_from_slice(&[0; 1024]);

        assert!(unpack(&bytes[..], dest.path()).is_err());

        Ok(())
    }

    #[test_log::test]
    fn test_unpack_rejects_paths_through_symlinks() -> anyhow::Result<()> {
        let dest = tempdir()?;
        let outside = tempdir()?;
        fs::write(outside.path().join("keep"), "outside")?;

        let mut builder = Builder::new(Vec::new());
        let mut link = helper::header(EntryType::Symlink, 0o777);
        builder.append_link(&mut link, "evil", outside.path())?;
        let mut file = helper::header(EntryType::Regular, 0o644);
        file.set_size(5);
        builder.append_data(&mut file, "evil/pwned", &b"pwned"[..])?;

        let err = unpack(&builder.into_inner()?[..], dest.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(!outside.path().join("pwned").exists());

        let mut builder = Builder::new(Vec::new());
        let mut link = helper::header(EntryType::Symlink, 0o777);
        builder.append_link(&mut link, "evil", outside.path())?;
        let mut whiteout = helper::header(EntryType::Regular, 0o644);
        builder.append_data(&mut whiteout, "evil/.wh.keep", io::empty())?;

        assert!(unpack(&builder.into_inner()?[..], tempdir()?.path()).is_err());
        assert!(outside.path().join("keep").exists());

        Ok(())
    }

    #[test_log::test]
    fn test_unpack_opaque_whiteout_skips_directory_replaced_by_symlink() -> anyhow::Result<()> {
        let dest = tempdir()?;
        let outside = tempdir()?;
        fs::write(outside.path().join("keep"), "outside")?;

        let mut builder = Builder::new(Vec::new());
        let mut dir = helper::header(EntryType::Directory, 0o755);
        builder.append_data(&mut dir, "lib", io::empty())?;
        let mut opaque = helper::header(EntryType::Regular, 0o644);
        builder.append_data(&mut opaque, "lib/.wh..wh..opq", io::empty())?;
        let mut link = helper::header(EntryType::Symlink, 0o777);
        builder.append_link(&mut link, "lib", outside.path())?;

        unpack(&builder.into_inner()?[..], dest.path())?;

        assert!(fs::symlink_metadata(dest.path().join("lib"))?.file_type().is_symlink());
        assert!(outside.path().join("keep").exists());

        Ok(())
    }

    mod helper {
        use super::*;

        pub(super) fn header(entry_type: EntryType, mode: u32) -> Header {
            let mut header = Header::new_gnu();
            header.set_entry_type(entry_type);
            header.set_mode(mode);
            header.set_uid(u64::from(unistd::geteuid().as_raw()));
            header.set_gid(u64::from(unistd::getegid().as_raw()));
            header.set_size(0);
            header
        }

        pub(super) fn etc_init() -> LayerInit {
            LayerInit::new(vec![
                make_directory("/etc", 0o755),
                write_file("/etc/hosts", "mydomain 10.0.0.1", 0o644),
                write_file("/etc/profile", "PATH=/usr/bin", 0o644),
            ])
        }
    }
}
