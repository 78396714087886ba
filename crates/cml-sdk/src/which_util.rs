use std::path::{Path, PathBuf};

/// Locates executables on PATH.
pub struct WhichUtil;

impl WhichUtil {
    /// Locate the first occurrence of `command` on the system PATH.
    ///
    /// - If `require` is true and the command is not found, returns an error.
    /// - If `require` is false and the command is not found, returns `Ok(None)`.
    pub fn which(command: &str, require: bool) -> anyhow::Result<Option<PathBuf>> {
        if command.is_empty() {
            if require {
                anyhow::bail!("command must not be empty");
            }
            return Ok(None);
        }

        match which::which(command) {
            Ok(path) => Ok(Some(path)),
            Err(_) if !require => Ok(None),
            Err(e) => anyhow::bail!(
                "{command}: command not found ({e}). Make sure '{command}' is installed and its location included in the 'PATH' environment variable."
            ),
        }
    }

    /// Resolve a runner binary: an existing file inside `dir` wins, then PATH.
    pub fn resolve_in(dir: &Path, command: &str) -> Option<PathBuf> {
        let local = dir.join(command);
        if local.is_file() {
            return Some(local);
        }
        which::which(command).ok()
    }
}
