//! File-watching backends (stat polling, kernel change notification).

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::notifier::NotifyWatcher;
use super::poll::PollWatcher;
use crate::error::{WardenError, WardenResult};

/// What happened to the watched files since the previous call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Files that may have new content.
    pub modified: Vec<PathBuf>,
    /// Files that could not be stat'ed.
    pub missing: Vec<PathBuf>,
}

impl WatchEvent {
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.missing.is_empty()
    }
}

/// Capability set shared by all backends.
#[async_trait]
pub trait LogWatcher: Send + Sync {
    /// Short backend name for status and logs.
    fn name(&self) -> &'static str;

    /// Start watching `path`. The first event after this reports it as
    /// modified so existing content gets read.
    fn watch(&self, path: &Path) -> WardenResult<()>;

    fn unwatch(&self, path: &Path);

    /// Wait up to `timeout` for changes.
    async fn next_event(&self, timeout: Duration) -> WatchEvent;
}

/// Backend selection for a jail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    Auto,
    Polling,
    Notify,
}

impl FromStr for Backend {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Backend::Auto),
            "polling" => Ok(Backend::Polling),
            "notify" | "inotify" | "pyinotify" => Ok(Backend::Notify),
            other => Err(WardenError::Backend(format!(
                "unknown backend '{}' (expected auto, polling or notify)",
                other
            ))),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Backend::Auto => "auto",
            Backend::Polling => "polling",
            Backend::Notify => "notify",
        };
        f.write_str(s)
    }
}

/// Create the watcher for `backend`. `auto` prefers kernel notification and
/// falls back to polling.
pub fn create_watcher(backend: Backend) -> WardenResult<Arc<dyn LogWatcher>> {
    match backend {
        Backend::Polling => Ok(Arc::new(PollWatcher::new())),
        Backend::Notify => Ok(Arc::new(NotifyWatcher::new()?)),
        Backend::Auto => match NotifyWatcher::new() {
            Ok(w) => {
                info!("Using notify backend");
                Ok(Arc::new(w))
            }
            Err(e) => {
                warn!("Notify backend unavailable ({}), falling back to polling", e);
                Ok(Arc::new(PollWatcher::new()))
            }
        },
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Watcher that replays scripted events; the default event reports every
    /// watched file as modified.
    #[derive(Default)]
    pub struct ScriptedWatcher {
        pub watched: Mutex<Vec<PathBuf>>,
        pub script: Mutex<VecDeque<WatchEvent>>,
    }

    #[async_trait]
    impl LogWatcher for ScriptedWatcher {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn watch(&self, path: &Path) -> WardenResult<()> {
            self.watched.lock().push(path.to_path_buf());
            Ok(())
        }

        fn unwatch(&self, path: &Path) {
            self.watched.lock().retain(|p| p != path);
        }

        async fn next_event(&self, timeout: Duration) -> WatchEvent {
            tokio::time::sleep(timeout).await;
            let scripted = self.script.lock().pop_front();
            scripted.unwrap_or_else(|| WatchEvent {
                modified: self.watched.lock().clone(),
                missing: Vec::new(),
            })
        }
    }
}
