//! PID file with an advisory lock.
//!
//! The lock keeps a second server from starting against the same PID file;
//! the file is removed again when the guard is dropped.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DEFAULT_PID_FILE: &str = "/var/run/failwarden/failwarden.pid";

/// Holds the locked PID file for the lifetime of the server.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    file: File,
}

impl PidFile {
    /// Create (or reuse) `path`, lock it and write the current PID.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create PID file directory: {}", parent.display())
                })?;
            }
        }

        // open without truncating so a running server's PID survives a
        // failed lock attempt
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open PID file: {}", path.display()))?;

        fs::set_permissions(path, fs::Permissions::from_mode(0o644))
            .context("Failed to set PID file permissions")?;

        file.try_lock_exclusive().map_err(|_| {
            anyhow::anyhow!(
                "Another server already holds {}.\n\
                 If you believe this is an error, stop the other server or remove the file.",
                path.display()
            )
        })?;

        file.set_len(0)
            .with_context(|| format!("Failed to truncate PID file: {}", path.display()))?;
        writeln!(file, "{}", std::process::id())
            .with_context(|| format!("Failed to write PID file: {}", path.display()))?;
        file.sync_all().context("Failed to sync PID file")?;

        debug!("PID file {} created", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Unable to remove PID file {}: {}", self.path.display(), e);
        }
        let _ = FileExt::unlock(&self.file);
    }
}
