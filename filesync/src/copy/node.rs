//! Creating filesystem nodes and restoring their metadata

use std::path::Path;

use filetime::FileTime;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::error::{Result, SyncError};
use crate::pool::BufferPool;
use crate::stat::Stat;

/// `lstat`, with a missing path reported as `None`
pub async fn lstat_optional(path: &Path) -> Result<Option<std::fs::Metadata>> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SyncError::copy_error(path, format!("failed to stat target path: {}", e))),
    }
}

/// Create `dst` as a directory unless it already is one. Returns whether it
/// was created. An existing directory gets its permissions reset when
/// `overwrite` is set.
pub async fn copy_directory_only(dst: &Path, stat: &Stat, overwrite: bool) -> Result<bool> {
    match lstat_optional(dst).await? {
        None => {
            let mut builder = tokio::fs::DirBuilder::new();
            #[cfg(unix)]
            builder.mode(stat.permissions());
            builder
                .create(dst)
                .await
                .map_err(|e| SyncError::copy_error(dst, format!("failed to mkdir: {}", e)))?;
            Ok(true)
        }
        Some(meta) if !meta.is_dir() => Err(SyncError::copy_error(dst, "cannot copy to non-directory")),
        Some(_) => {
            if overwrite {
                chmod(dst, stat.permissions())?;
            }
            Ok(false)
        }
    }
}

/// Remove whatever non-directory sits at `dst` so a new node can be created
pub async fn ensure_empty_file_target(dst: &Path) -> Result<()> {
    match lstat_optional(dst).await? {
        None => Ok(()),
        Some(meta) if meta.is_dir() => Err(SyncError::copy_error(dst, "cannot replace to directory with file")),
        Some(_) => tokio::fs::remove_file(dst)
            .await
            .map_err(|e| SyncError::copy_error(dst, format!("failed to remove: {}", e))),
    }
}

/// Remove `dst` and everything below it
pub async fn remove_all(dst: &Path, meta: &std::fs::Metadata) -> Result<()> {
    let result = if meta.is_dir() {
        tokio::fs::remove_dir_all(dst).await
    } else {
        tokio::fs::remove_file(dst).await
    };
    match result {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            Err(SyncError::copy_error(dst, format!("failed to remove existing path: {}", e)))
        }
        _ => Ok(()),
    }
}

/// Stream `reader` into a new file at `dst` through a pooled buffer
pub async fn write_file<R>(reader: &mut R, dst: &Path, pool: &BufferPool) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dst)
        .await
        .map_err(|e| SyncError::copy_error(dst, format!("failed to create file: {}", e)))?;

    let mut buf = pool.get();
    let copied = async {
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
            total += n as u64;
        }
        file.flush().await?;
        Ok::<_, std::io::Error>(total)
    }
    .await;
    pool.put(buf);

    copied.map_err(|e| SyncError::copy_error(dst, format!("failed to copy file content: {}", e)))
}

/// Create `dst` as an empty regular file with `stat`'s permission bits
pub async fn create_empty_file(dst: &Path, stat: &Stat) -> Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(stat.permissions());
    #[cfg(not(unix))]
    let _ = stat;
    options
        .open(dst)
        .await
        .map(drop)
        .map_err(|e| SyncError::copy_error(dst, format!("failed to create file: {}", e)))
}

/// Copy the content of the regular file `src` into a new file at `dst`
pub async fn copy_file(src: &Path, dst: &Path, pool: &BufferPool) -> Result<u64> {
    let mut reader = tokio::fs::File::open(src)
        .await
        .map_err(|e| SyncError::copy_error(src, format!("failed to open source: {}", e)))?;
    write_file(&mut reader, dst, pool).await
}

pub async fn hard_link(existing: &Path, dst: &Path) -> Result<()> {
    tokio::fs::hard_link(existing, dst)
        .await
        .map_err(|e| SyncError::copy_error(dst, format!("failed to create hard link to {}: {}", existing.display(), e)))
}

#[cfg(unix)]
pub async fn symlink(target: &str, dst: &Path) -> Result<()> {
    tokio::fs::symlink(target, dst)
        .await
        .map_err(|e| SyncError::copy_error(dst, format!("failed to create symlink: {}", e)))
}

#[cfg(not(unix))]
pub async fn symlink(_target: &str, dst: &Path) -> Result<()> {
    Err(SyncError::copy_error(dst, "symlinks are not supported on this platform"))
}

/// Recreate a device, fifo or socket node. A socket that cannot be bound
/// as a node becomes an empty regular file.
#[cfg(unix)]
pub fn create_special(dst: &Path, stat: &Stat) -> Result<()> {
    use crate::stat::FileKind;

    let path = c_path(dst)?;
    let mode = stat.permissions() as libc::mode_t;
    let result = match stat.kind() {
        Some(FileKind::Fifo) => unsafe { libc::mkfifo(path.as_ptr(), mode) },
        Some(kind @ (FileKind::CharDevice | FileKind::BlockDevice | FileKind::Socket)) => {
            #[allow(unused_unsafe)]
            let dev = unsafe { libc::makedev(stat.devmajor as _, stat.devminor as _) };
            let mode = mode | kind.type_bits() as libc::mode_t;
            unsafe { libc::mknod(path.as_ptr(), mode, dev) }
        }
        _ => return Err(SyncError::copy_error(dst, "not a special file")),
    };
    if result == 0 {
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    if stat.kind() == Some(FileKind::Socket) {
        tracing::debug!(path = %dst.display(), error = %err, "Creating socket stub file");
        std::fs::File::create(dst).map_err(|e| SyncError::copy_error(dst, format!("failed to create socket stub: {}", e)))?;
        return Ok(());
    }
    Err(SyncError::copy_error(dst, format!("failed to create device: {}", err)))
}

#[cfg(not(unix))]
pub fn create_special(dst: &Path, _stat: &Stat) -> Result<()> {
    Err(SyncError::copy_error(dst, "special files are not supported on this platform"))
}

/// Change ownership without following symlinks
#[cfg(unix)]
pub fn lchown(path: &Path, uid: u32, gid: u32) -> Result<()> {
    let c = c_path(path)?;
    let result = unsafe { libc::lchown(c.as_ptr(), uid, gid) };
    if result != 0 {
        return Err(SyncError::copy_error(
            path,
            format!("failed to chown: {}", std::io::Error::last_os_error()),
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn lchown(_path: &Path, _uid: u32, _gid: u32) -> Result<()> {
    Ok(())
}

pub fn chmod(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| SyncError::copy_error(path, format!("failed to chmod: {}", e)))
    }

    #[cfg(not(unix))]
    {
        let mut perms = std::fs::symlink_metadata(path)?.permissions();
        perms.set_readonly(mode & 0o200 == 0);
        std::fs::set_permissions(path, perms).map_err(|e| SyncError::copy_error(path, format!("failed to chmod: {}", e)))
    }
}

/// Set access and modification time to `time`, on the link itself for symlinks
pub fn set_times(path: &Path, time: FileTime) -> Result<()> {
    filetime::set_symlink_file_times(path, time, time)
        .map_err(|e| SyncError::copy_error(path, format!("failed to utime: {}", e)))
}

/// Set one extended attribute without following symlinks
#[cfg(unix)]
pub fn set_xattr(path: &Path, key: &str, value: &[u8]) -> std::io::Result<()> {
    xattr::set(path, key, value)
}

#[cfg(not(unix))]
pub fn set_xattr(_path: &Path, _key: &str, _value: &[u8]) -> std::io::Result<()> {
    Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "extended attributes are not supported"))
}

#[cfg(unix)]
fn c_path(path: &Path) -> Result<std::ffi::CString> {
    use std::os::unix::ffi::OsStrExt;
    std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| SyncError::copy_error(path, format!("invalid path: {}", e)))
}
