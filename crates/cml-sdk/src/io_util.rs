use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// The executable file extension for the current platform.
#[cfg(target_os = "windows")]
pub const EXE_EXTENSION: &str = ".exe";
#[cfg(not(target_os = "windows"))]
pub const EXE_EXTENSION: &str = "";

/// Filesystem helpers for the runner working directory.
pub struct IOUtil;

impl IOUtil {
    /// Create `path` (and parents) if missing and apply `mode` on Unix.
    pub fn ensure_directory(path: &Path, mode: u32) -> Result<()> {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory '{}'", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(mode)).with_context(|| {
                format!("Failed to set permissions {mode:o} on '{}'", path.display())
            })?;
        }
        #[cfg(not(unix))]
        let _ = mode;

        Ok(())
    }

    /// Mark a file as executable by its owner, group and others.
    pub fn make_executable(path: &Path) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)
                .with_context(|| format!("Failed to stat '{}'", path.display()))?
                .permissions();
            perms.set_mode(perms.mode() | 0o755);
            fs::set_permissions(path, perms)
                .with_context(|| format!("Failed to chmod '{}'", path.display()))?;
        }
        #[cfg(not(unix))]
        let _ = path;
        Ok(())
    }

    /// Unpack a gzip-compressed tarball into `destination`.
    pub fn extract_tar_gz(archive: &[u8], destination: &Path) -> Result<()> {
        fs::create_dir_all(destination)?;
        let decoder = flate2::read::GzDecoder::new(archive);
        tar::Archive::new(decoder)
            .unpack(destination)
            .with_context(|| format!("Failed to extract archive into '{}'", destination.display()))
    }

    /// Write `contents` to `path`, creating parent directories.
    pub fn write_file(path: &Path, contents: impl AsRef<[u8]>) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents).with_context(|| format!("Failed to write '{}'", path.display()))
    }

    /// The current user's home directory, falling back to the working directory.
    pub fn home_dir() -> PathBuf {
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .filter(|h| !h.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}
