//! Atomic file replacement.
//!
//! Every credential the client holds is written to a temporary file in the
//! destination directory, synced, and renamed over the old file, so a crash
//! leaves either the old or the new contents and never a torn file.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use crate::error::InfraError;

/// Mode for private keys.
pub const PRIVATE_MODE: u32 = 0o600;
/// Mode for certificates and other public material.
pub const PUBLIC_MODE: u32 = 0o644;

/// Replace `path` with `bytes`. Missing parent directories are created.
pub fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> Result<(), InfraError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| InfraError::io(dir, e))?;

    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| InfraError::io(dir, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(fs::Permissions::from_mode(mode))
            .map_err(|e| InfraError::io(temp.path(), e))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    temp.as_file_mut()
        .write_all(bytes)
        .map_err(|e| InfraError::io(temp.path(), e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| InfraError::io(temp.path(), e))?;
    temp.persist(path)
        .map_err(|e| InfraError::io(path, e.error))?;
    Ok(())
}

/// Read a file that may legitimately be absent.
pub fn read_optional(path: &Path) -> Result<Option<String>, InfraError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(InfraError::io(path, e)),
    }
}

/// Delete a file; an already-missing file is not an error.
pub fn remove_if_exists(path: &Path) -> Result<bool, InfraError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(InfraError::io(path, e)),
    }
}
