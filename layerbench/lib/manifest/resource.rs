use std::{
    fmt::{self, Display},
    fs::{self, File, Metadata},
    io,
    os::unix::fs::{FileTypeExt, MetadataExt},
    path::{Path, PathBuf},
};

use getset::Getters;
use serde::{Deserialize, Serialize};

use crate::{
    store::Digest,
    utils::{self, PERMISSION_MASK},
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The type of a filesystem resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A regular file.
    File,

    /// A directory.
    Directory,

    /// A symbolic link.
    Symlink,

    /// A named pipe.
    Fifo,

    /// A character device.
    CharDevice,

    /// A block device.
    BlockDevice,

    /// A unix domain socket.
    Socket,
}

/// A field of a [`Resource`] that is compared between manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceField {
    /// The resource type.
    Kind,

    /// The permission bits.
    Mode,

    /// The owning user.
    Uid,

    /// The owning group.
    Gid,

    /// The content length of a regular file.
    Size,

    /// The content digest of a regular file.
    Digest,

    /// The target of a symlink.
    Target,

    /// The device number of a device node.
    Device,

    /// The other paths that share the resource's inode.
    Hardlinks,
}

/// The structural description of one entry in a directory tree.
///
/// Timestamps are not recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Resource {
    /// The resource type.
    kind: ResourceKind,

    /// The permission bits, including setuid, setgid, and sticky.
    mode: u32,

    /// The owning user ID.
    uid: u32,

    /// The owning group ID.
    gid: u32,

    /// The content length for regular files, zero otherwise.
    size: u64,

    /// The sha256 content digest for regular files.
    digest: Option<Digest>,

    /// The link target for symlinks.
    target: Option<PathBuf>,

    /// The device number for device nodes.
    rdev: Option<u64>,

    /// Every path in the tree sharing this resource's inode, sorted. Empty when unshared.
    pub(super) hardlinks: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Resource {
    /// Describes the entry at `path` without following symlinks.
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let metadata = fs::symlink_metadata(path)?;
        Self::from_metadata(path, &metadata)
    }

    pub(super) fn from_metadata(path: &Path, metadata: &Metadata) -> io::Result<Self> {
        let file_type = metadata.file_type();
        let kind = if file_type.is_dir() {
            ResourceKind::Directory
        } else if file_type.is_file() {
            ResourceKind::File
        } else if file_type.is_symlink() {
            ResourceKind::Symlink
        } else if file_type.is_fifo() {
            ResourceKind::Fifo
        } else if file_type.is_char_device() {
            ResourceKind::CharDevice
        } else if file_type.is_block_device() {
            ResourceKind::BlockDevice
        } else {
            ResourceKind::Socket
        };

        let (size, digest) = match kind {
            ResourceKind::File => (metadata.len(), Some(file_digest(path)?)),
            _ => (0, None),
        };

        let target = match kind {
            ResourceKind::Symlink => Some(fs::read_link(path)?),
            _ => None,
        };

        let rdev = match kind {
            ResourceKind::CharDevice | ResourceKind::BlockDevice => Some(metadata.rdev()),
            _ => None,
        };

        Ok(Self {
            kind,
            mode: metadata.mode() & PERMISSION_MASK,
            uid: metadata.uid(),
            gid: metadata.gid(),
            size,
            digest,
            target,
            rdev,
            hardlinks: Vec::new(),
        })
    }

    /// Returns the fields that differ between `self` and `other`.
    pub fn differing_fields(&self, other: &Resource) -> Vec<ResourceField> {
        let mut fields = Vec::new();
        if self.kind != other.kind {
            fields.push(ResourceField::Kind);
        }
        if self.mode != other.mode {
            fields.push(ResourceField::Mode);
        }
        if self.uid != other.uid {
            fields.push(ResourceField::Uid);
        }
        if self.gid != other.gid {
            fields.push(ResourceField::Gid);
        }
        if self.size != other.size {
            fields.push(ResourceField::Size);
        }
        if self.digest != other.digest {
            fields.push(ResourceField::Digest);
        }
        if self.target != other.target {
            fields.push(ResourceField::Target);
        }
        if self.rdev != other.rdev {
            fields.push(ResourceField::Device);
        }
        if self.hardlinks != other.hardlinks {
            fields.push(ResourceField::Hardlinks);
        }

        fields
    }

    /// Renders a single field of the resource for display.
    pub fn describe(&self, field: ResourceField) -> String {
        fn or_none<T: Display>(value: Option<T>) -> String {
            value.map_or_else(|| "none".to_string(), |v| v.to_string())
        }

        match field {
            ResourceField::Kind => self.kind.to_string(),
            ResourceField::Mode => format!("{} ({:#o})", utils::format_mode(self.mode), self.mode),
            ResourceField::Uid => self.uid.to_string(),
            ResourceField::Gid => self.gid.to_string(),
            ResourceField::Size => self.size.to_string(),
            ResourceField::Digest => or_none(self.digest.as_ref()),
            ResourceField::Target => or_none(self.target.as_ref().map(|t| t.display())),
            ResourceField::Device => or_none(self.rdev),
            ResourceField::Hardlinks => format!("[{}]", self.hardlinks.join(", ")),
        }
    }

    /// Returns `true` if the resource is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind == ResourceKind::Directory
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn file_digest(path: &Path) -> io::Result<Digest> {
    Digest::from_reader(File::open(path)?)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::File => "file",
            ResourceKind::Directory => "directory",
            ResourceKind::Symlink => "symlink",
            ResourceKind::Fifo => "fifo",
            ResourceKind::CharDevice => "char device",
            ResourceKind::BlockDevice => "block device",
            ResourceKind::Socket => "socket",
        };
        f.write_str(name)
    }
}

impl Display for ResourceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceField::Kind => "kind",
            ResourceField::Mode => "mode",
            ResourceField::Uid => "uid",
            ResourceField::Gid => "gid",
            ResourceField::Size => "size",
            ResourceField::Digest => "digest",
            ResourceField::Target => "target",
            ResourceField::Device => "device",
            ResourceField::Hardlinks => "hardlinks",
        };
        f.write_str(name)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
