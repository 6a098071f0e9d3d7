//! Filesystem helpers shared by the executor and storage backends.

use std::{
    io::{self, Write},
    path::Path,
};

/// Replace `path` with `contents` atomically.
///
/// The bytes are written to a temporary file in the same directory, synced,
/// and renamed over the target. Readers observe either the previous contents
/// or the new contents, never a partial write.
///
/// # Errors
/// Returns error if the parent directory is missing or any step fails.
pub fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".broker-")
        .suffix(".tmp")
        .tempfile_in(parent)?;
    tmp.write_all(contents)?;
    // Temp files are created 0600; keep the target's mode instead.
    match std::fs::metadata(path) {
        Ok(meta) => tmp.as_file().set_permissions(meta.permissions())?,
        #[cfg(unix)]
        Err(_) => {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o644))?;
        }
        #[cfg(not(unix))]
        Err(_) => {}
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
