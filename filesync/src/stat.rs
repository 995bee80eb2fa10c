//! The metadata record shared by walks, diffs, the wire protocol and copies

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// File type bits of a mode
pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

/// Permission, setuid, setgid and sticky bits
pub const MODE_PERM_MASK: u32 = 0o7777;

/// Metadata for one filesystem entry, relative to a walk root
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Slash-separated path relative to the walk root
    pub path: String,
    /// Type bits and permission bits
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// Modification time in nanoseconds since the epoch
    pub mod_time: i64,
    /// Symlink target, or the first path of a hardlinked inode
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub linkname: String,
    #[serde(default)]
    pub devmajor: u64,
    #[serde(default)]
    pub devminor: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub xattrs: HashMap<String, Vec<u8>>,
}

/// Entry kinds that the sync layer knows how to reproduce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    Directory,
    Regular,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl FileKind {
    /// Resolve the kind from the type bits of a mode
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFDIR => Some(Self::Directory),
            S_IFREG => Some(Self::Regular),
            S_IFLNK => Some(Self::Symlink),
            S_IFCHR => Some(Self::CharDevice),
            S_IFBLK => Some(Self::BlockDevice),
            S_IFIFO => Some(Self::Fifo),
            S_IFSOCK => Some(Self::Socket),
            _ => None,
        }
    }

    /// The type bits for this kind
    pub fn type_bits(self) -> u32 {
        match self {
            Self::Directory => S_IFDIR,
            Self::Regular => S_IFREG,
            Self::Symlink => S_IFLNK,
            Self::CharDevice => S_IFCHR,
            Self::BlockDevice => S_IFBLK,
            Self::Fifo => S_IFIFO,
            Self::Socket => S_IFSOCK,
        }
    }

    pub fn is_device(self) -> bool {
        matches!(self, Self::CharDevice | Self::BlockDevice)
    }
}

impl Stat {
    /// The entry kind, if the type bits are recognised
    pub fn kind(&self) -> Option<FileKind> {
        FileKind::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    /// Permission bits only
    pub fn permissions(&self) -> u32 {
        self.mode & MODE_PERM_MASK
    }

    /// Modification time as a `filetime::FileTime`
    pub fn file_time(&self) -> filetime::FileTime {
        let secs = self.mod_time.div_euclid(1_000_000_000);
        let nanos = self.mod_time.rem_euclid(1_000_000_000) as u32;
        filetime::FileTime::from_unix_time(secs, nanos)
    }
}

/// Order two slash-separated paths byte by byte, with '/' sorting below every
/// other byte so that a directory is immediately followed by its children.
pub fn compare_path(a: &str, b: &str) -> Ordering {
    fn rank(b: u8) -> u16 {
        if b == b'/' {
            0
        } else {
            u16::from(b) + 1
        }
    }
    a.bytes().map(rank).cmp(b.bytes().map(rank))
}

/// Convert a relative filesystem path into its slash-separated form
pub fn to_slash(path: &Path) -> String {
    let s = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        s.into_owned()
    } else {
        s.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

/// Lexically normalize a slash-separated path: repeated separators, `.`
/// components and trailing separators are removed and `..` is resolved
/// against the preceding component. An empty result is `"."`.
pub fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if rooted => {}
                _ => parts.push(".."),
            },
            _ => parts.push(part),
        }
    }
    let joined = parts.join("/");
    if rooted {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Build a [`Stat`] for `full_path` from its (non-followed) metadata
#[cfg(unix)]
pub fn stat_from_metadata(rel_path: &str, full_path: &Path, meta: &std::fs::Metadata) -> Result<Stat> {
    use std::os::unix::fs::MetadataExt;

    let mut stat = Stat {
        path: rel_path.to_string(),
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        size: meta.size(),
        mod_time: meta.mtime() * 1_000_000_000 + meta.mtime_nsec(),
        ..Default::default()
    };

    match FileKind::from_mode(stat.mode) {
        Some(FileKind::Symlink) => {
            stat.mode |= 0o777;
            let target = std::fs::read_link(full_path)
                .map_err(|e| SyncError::walk_error(full_path, format!("readlink: {}", e)))?;
            stat.linkname = target.to_string_lossy().into_owned();
        }
        Some(kind) if kind.is_device() => {
            let rdev = meta.rdev() as libc::dev_t;
            #[allow(unused_unsafe)]
            unsafe {
                stat.devmajor = libc::major(rdev) as u64;
                stat.devminor = libc::minor(rdev) as u64;
            }
        }
        _ => {}
    }

    if !stat.is_dir() && !stat.is_regular() {
        stat.size = 0;
    }

    stat.xattrs = read_xattrs(full_path)
        .map_err(|e| SyncError::walk_error(full_path, format!("listxattr: {}", e)))?;

    Ok(stat)
}

#[cfg(not(unix))]
pub fn stat_from_metadata(rel_path: &str, full_path: &Path, meta: &std::fs::Metadata) -> Result<Stat> {
    let file_type = meta.file_type();
    let mut stat = Stat {
        path: rel_path.to_string(),
        size: meta.len(),
        ..Default::default()
    };
    stat.mode = if file_type.is_dir() {
        S_IFDIR | 0o755
    } else if file_type.is_symlink() {
        let target = std::fs::read_link(full_path)
            .map_err(|e| SyncError::walk_error(full_path, format!("readlink: {}", e)))?;
        stat.linkname = target.to_string_lossy().into_owned();
        S_IFLNK | 0o777
    } else if meta.permissions().readonly() {
        S_IFREG | 0o444
    } else {
        S_IFREG | 0o644
    };
    if let Ok(modified) = meta.modified() {
        if let Ok(since) = modified.duration_since(std::time::UNIX_EPOCH) {
            stat.mod_time = since.as_nanos() as i64;
        }
    }
    Ok(stat)
}

/// Extended attributes of `path` without following symlinks. Filesystems
/// without xattr support report none.
#[cfg(unix)]
pub fn read_xattrs(path: &Path) -> std::io::Result<HashMap<String, Vec<u8>>> {
    let mut xattrs = HashMap::new();
    let names = match xattr::list(path) {
        Ok(names) => names,
        Err(e) if is_unsupported(&e) => return Ok(xattrs),
        Err(e) => return Err(e),
    };
    for name in names {
        let Some(key) = name.to_str() else { continue };
        match xattr::get(path, &name) {
            Ok(Some(value)) => {
                xattrs.insert(key.to_string(), value);
            }
            Ok(None) => {}
            Err(e) if is_unsupported(&e) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(xattrs)
}

#[cfg(unix)]
fn is_unsupported(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::Unsupported
        || e.raw_os_error() == Some(libc::ENOTSUP)
        || e.raw_os_error() == Some(libc::ENODATA)
}
