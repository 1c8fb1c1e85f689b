//! Locked, atomic file updates
//!
//! The known_hosts file, the SSH client config and the CA key files are
//! shared between concurrently running `devbox-ssh` processes. Every writer
//! takes an advisory lock on a sibling `.lock` file for the read-check-write
//! span, writes the new contents to a temp file in the same directory and
//! renames it over the target. Readers (including live `ssh` clients) see
//! either the old or the new file, never a truncated one.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::error::{DevboxError, Result};

/// Mode for secrets and files only the owner should touch
pub const PRIVATE_FILE_MODE: u32 = 0o600;

/// Mode for public material (public keys, certificates)
pub const PUBLIC_FILE_MODE: u32 = 0o644;

/// Mode for directories holding key material
pub const PRIVATE_DIR_MODE: u32 = 0o700;

/// Exclusive advisory lock guarding one target file
///
/// The lock is released when the guard is dropped. The lock file itself is
/// left in place so that concurrent processes always contend on the same
/// inode.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the lock for `target` is held
    pub fn acquire(target: &Path) -> Result<Self> {
        let path = lock_path_for(target);
        if let Some(parent) = path.parent() {
            create_private_dir(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        FileExt::lock_exclusive(&file).map_err(|e| {
            DevboxError::Io(io::Error::new(
                e.kind(),
                format!("failed to lock {}: {}", path.display(), e),
            ))
        })?;

        debug!("Acquired lock {}", path.display());
        Ok(Self { file, path })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

/// `<target>.lock`, next to the target
fn lock_path_for(target: &Path) -> PathBuf {
    let mut name: OsString = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("devbox"));
    name.push(".lock");
    target.with_file_name(name)
}

/// Resolve the file that should actually be rewritten
///
/// A symlinked `~/.ssh/config` (common with dotfile managers) is written
/// through to its target so the link survives the rename.
pub fn resolve_target(path: &Path) -> Result<PathBuf> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => Ok(fs::canonicalize(path)?),
        Ok(_) => Ok(path.to_path_buf()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(path.to_path_buf()),
        Err(e) => Err(e.into()),
    }
}

/// Read a file, treating a missing file as `None`
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Replace `target` with `contents` via temp file + rename
///
/// The new file gets `mode` if given, otherwise the mode of the file it
/// replaces, otherwise [`PRIVATE_FILE_MODE`].
pub fn write_atomic(target: &Path, contents: &[u8], mode: Option<u32>) -> Result<()> {
    let temp = stage(target, contents, mode)?;
    temp.persist(target).map_err(|e| DevboxError::Io(e.error))?;
    debug!("Wrote {}", target.display());
    Ok(())
}

/// Like [`write_atomic`], but never replaces an existing file
///
/// Returns `Ok(false)` if `target` already exists; any other failure is an
/// error.
pub fn write_new(target: &Path, contents: &[u8], mode: u32) -> Result<bool> {
    let temp = stage(target, contents, Some(mode))?;
    match temp.persist_noclobber(target) {
        Ok(_) => {
            debug!("Created {}", target.display());
            Ok(true)
        }
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(DevboxError::Io(e.error)),
    }
}

fn stage(target: &Path, contents: &[u8], mode: Option<u32>) -> Result<tempfile::NamedTempFile> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mode = match mode {
        Some(mode) => mode,
        None => existing_mode(target).unwrap_or(PRIVATE_FILE_MODE),
    };

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    set_mode(temp.path(), mode)?;
    temp.as_file_mut().write_all(contents)?;
    temp.as_file().sync_all()?;
    Ok(temp)
}

/// Create `path` (and parents) with owner-only permissions if absent
pub fn create_private_dir(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }

    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(PRIVATE_DIR_MODE);
    }
    builder.create(path)?;
    Ok(())
}

#[cfg(unix)]
fn existing_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .ok()
        .map(|meta| meta.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn existing_mode(_path: &Path) -> Option<u32> {
    None
}

/// Set unix permission bits; a no-op elsewhere
#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_path_is_sibling() {
        let path = lock_path_for(Path::new("/home/dev/.ssh/config"));
        assert_eq!(path, PathBuf::from("/home/dev/.ssh/config.lock"));
    }

    #[test]
    fn test_write_atomic_replaces_contents() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("known_hosts");

        write_atomic(&target, b"first\n", None).unwrap();
        write_atomic(&target, b"second\n", None).unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "second\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_write_atomic_preserves_existing_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("config");
        fs::write(&target, "Host a\n").unwrap();
        set_mode(&target, 0o640).unwrap();

        write_atomic(&target, b"Host b\n", None).unwrap();

        let mode = fs::metadata(&target).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
    }

    #[test]
    fn test_write_new_refuses_to_clobber() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("ca_ed25519");
        fs::write(&target, "original").unwrap();

        assert!(!write_new(&target, b"replacement", PRIVATE_FILE_MODE).unwrap());
        assert_eq!(fs::read_to_string(&target).unwrap(), "original");
    }

    #[test]
    fn test_write_new_reports_unusable_parent_as_io_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "not a directory").unwrap();

        let err = write_new(&blocker.join("key"), b"data", PRIVATE_FILE_MODE).unwrap_err();
        assert!(matches!(err, DevboxError::Io(_)));
    }

    #[test]
    fn test_read_optional_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(read_optional(&dir.path().join("absent")).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_target_follows_symlink() {
        let dir = tempfile::TempDir::new().unwrap();
        let real = dir.path().join("dotfiles-config");
        let link = dir.path().join("config");
        fs::write(&real, "Host a\n").unwrap();
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let resolved = resolve_target(&link).unwrap();
        assert_eq!(resolved, fs::canonicalize(&real).unwrap());
    }

    #[test]
    fn test_lock_can_be_reacquired_after_drop() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("known_hosts");

        let first = FileLock::acquire(&target).unwrap();
        drop(first);
        let _second = FileLock::acquire(&target).unwrap();
        assert!(dir.path().join("known_hosts.lock").exists());
    }
}
