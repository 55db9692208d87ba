//! Stat-based backend: compares (mtime, inode, size) on every poll cycle.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use super::backend::{LogWatcher, WatchEvent};
use crate::error::WardenResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    mtime: i64,
    mtime_nsec: i64,
    ino: u64,
    size: u64,
}

fn stamp(path: &Path) -> std::io::Result<Stamp> {
    let meta = std::fs::metadata(path)?;
    Ok(Stamp {
        mtime: meta.mtime(),
        mtime_nsec: meta.mtime_nsec(),
        ino: meta.ino(),
        size: meta.size(),
    })
}

#[derive(Debug, Default)]
pub struct PollWatcher {
    // None until the first successful stat, so that the first poll reports
    // the file as modified
    files: Mutex<HashMap<PathBuf, Option<Stamp>>>,
}

impl PollWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stat every watched file once.
    pub fn poll_once(&self) -> WatchEvent {
        let mut event = WatchEvent::default();
        let mut files = self.files.lock();
        for (path, last) in files.iter_mut() {
            match stamp(path) {
                Ok(now) => {
                    if *last != Some(now) {
                        debug!("{} has been modified", path.display());
                        *last = Some(now);
                        event.modified.push(path.clone());
                    }
                }
                Err(e) => {
                    debug!("Unable to stat {}: {}", path.display(), e);
                    event.missing.push(path.clone());
                }
            }
        }
        event.modified.sort();
        event.missing.sort();
        event
    }
}

#[async_trait]
impl LogWatcher for PollWatcher {
    fn name(&self) -> &'static str {
        "polling"
    }

    fn watch(&self, path: &Path) -> WardenResult<()> {
        self.files.lock().entry(path.to_path_buf()).or_insert(None);
        Ok(())
    }

    fn unwatch(&self, path: &Path) {
        self.files.lock().remove(path);
    }

    async fn next_event(&self, timeout: Duration) -> WatchEvent {
        tokio::time::sleep(timeout).await;
        self.poll_once()
    }
}
