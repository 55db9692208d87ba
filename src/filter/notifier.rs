//! Kernel change-notification backend built on the `notify` crate.
//!
//! The parent directory of each log is watched (not the file itself) so that
//! rotation by rename/create is seen. Events are filtered by file name.

use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::backend::{LogWatcher, WatchEvent};
use crate::error::{WardenError, WardenResult};

#[derive(Debug)]
struct Watched {
    dir: PathBuf,
    name: OsString,
    pending: bool,
}

pub struct NotifyWatcher {
    watcher: Mutex<RecommendedWatcher>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PathBuf>>,
    files: Mutex<HashMap<PathBuf, Watched>>,
    dirs: Mutex<HashMap<PathBuf, usize>>,
}

fn split(path: &Path) -> WardenResult<(PathBuf, OsString)> {
    let name = path
        .file_name()
        .ok_or_else(|| WardenError::FileSystem(format!("{} is not a file path", path.display())))?
        .to_os_string();
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let dir = parent.canonicalize().map_err(|e| {
        WardenError::FileSystem(format!("unable to resolve {}: {}", parent.display(), e))
    })?;
    Ok((dir, name))
}

impl NotifyWatcher {
    pub fn new() -> WardenResult<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                // our own reads show up as access events
                if matches!(event.kind, EventKind::Access(_)) {
                    return;
                }
                for path in event.paths {
                    let _ = tx.send(path);
                }
            }
            Err(e) => error!("file watcher error: {}", e),
        })
        .map_err(|e| WardenError::Backend(format!("notify: {}", e)))?;

        Ok(Self {
            watcher: Mutex::new(watcher),
            rx: tokio::sync::Mutex::new(rx),
            files: Mutex::new(HashMap::new()),
            dirs: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl LogWatcher for NotifyWatcher {
    fn name(&self) -> &'static str {
        "notify"
    }

    fn watch(&self, path: &Path) -> WardenResult<()> {
        let (dir, name) = split(path)?;
        let mut dirs = self.dirs.lock();
        let count = dirs.entry(dir.clone()).or_insert(0);
        if *count == 0 {
            self.watcher
                .lock()
                .watch(&dir, RecursiveMode::NonRecursive)
                .map_err(|e| {
                    WardenError::Backend(format!("unable to watch {}: {}", dir.display(), e))
                })?;
            debug!("Watching directory {}", dir.display());
        }
        *count += 1;
        self.files.lock().insert(
            path.to_path_buf(),
            Watched {
                dir,
                name,
                pending: true,
            },
        );
        Ok(())
    }

    fn unwatch(&self, path: &Path) {
        let Some(watched) = self.files.lock().remove(path) else {
            return;
        };
        let mut dirs = self.dirs.lock();
        if let Some(count) = dirs.get_mut(&watched.dir) {
            *count -= 1;
            if *count == 0 {
                dirs.remove(&watched.dir);
                if let Err(e) = self.watcher.lock().unwatch(&watched.dir) {
                    debug!("unwatch {}: {}", watched.dir.display(), e);
                }
            }
        }
    }

    async fn next_event(&self, timeout: Duration) -> WatchEvent {
        let mut changed = Vec::new();
        {
            let mut rx = self.rx.lock().await;
            match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(Some(path)) => changed.push(path),
                Ok(None) => tokio::time::sleep(timeout).await,
                Err(_) => {}
            }
            while let Ok(path) = rx.try_recv() {
                changed.push(path);
            }
        }

        let mut event = WatchEvent::default();
        let mut files = self.files.lock();
        for (path, watched) in files.iter_mut() {
            if !path.exists() {
                event.missing.push(path.clone());
                continue;
            }
            let touched = changed.iter().any(|c| {
                c.file_name() == Some(watched.name.as_os_str())
                    && c.parent() == Some(watched.dir.as_path())
            });
            if touched || watched.pending {
                watched.pending = false;
                event.modified.push(path.clone());
            }
        }
        event.modified.sort();
        event.missing.sort();
        event
    }
}
