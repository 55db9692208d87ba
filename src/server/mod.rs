//! The daemon core: jail registry plus the control plane around it.
//!
//! ```text
//!   client ──▶ transport (UnixListener) ──▶ ControlCodec ──▶ Transmitter
//!                                                               │
//!                                                               ▼
//!                                                    Server (jail registry)
//! ```

pub mod codec;
pub mod transmitter;
pub mod transport;

pub use codec::{ControlCodec, Reply};
pub use transmitter::Transmitter;
pub use transport::ControlSocket;

use futures_util::future::join_all;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::error::{WardenError, WardenResult};
use crate::filter::Backend;
use crate::jail::{Jail, JailContext};
use crate::logging::LogControl;
use crate::signal::ShutdownToken;

/// Name reserved for `stop all`.
pub const RESERVED_JAIL_NAME: &str = "all";

pub struct Server {
    jails: RwLock<HashMap<String, Arc<Jail>>>,
    context: JailContext,
    log: LogControl,
    token: ShutdownToken,
    config_path: Option<PathBuf>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("jails", &self.jail_names())
            .field("config_path", &self.config_path)
            .finish()
    }
}

impl Server {
    pub fn new(context: JailContext, log: LogControl) -> Self {
        Self {
            jails: RwLock::new(HashMap::new()),
            context,
            log,
            token: ShutdownToken::new(),
            config_path: None,
        }
    }

    /// Remember the configuration file so that `reload` can re-read it.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn log(&self) -> &LogControl {
        &self.log
    }

    pub fn token(&self) -> &ShutdownToken {
        &self.token
    }

    pub fn add_jail(&self, name: &str, backend: Backend) -> WardenResult<()> {
        if name == RESERVED_JAIL_NAME {
            return Err(WardenError::Config(format!(
                "'{}' is reserved and cannot name a jail",
                RESERVED_JAIL_NAME
            )));
        }
        let mut jails = self.jails.write();
        if jails.contains_key(name) {
            return Err(WardenError::DuplicateJail(name.to_string()));
        }
        let jail = Jail::new(name, backend, &self.context)?;
        jails.insert(name.to_string(), Arc::new(jail));
        Ok(())
    }

    pub fn jail(&self, name: &str) -> WardenResult<Arc<Jail>> {
        self.jails
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| WardenError::UnknownJail(name.to_string()))
    }

    pub fn jail_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jails.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn start_jail(&self, name: &str) -> WardenResult<()> {
        self.jail(name)?.start()
    }

    /// Stop a jail and drop it from the registry.
    pub async fn stop_jail(&self, name: &str) -> WardenResult<()> {
        let jail = self
            .jails
            .write()
            .remove(name)
            .ok_or_else(|| WardenError::UnknownJail(name.to_string()))?;
        jail.stop().await;
        Ok(())
    }

    /// Stop every jail in parallel and wait for all of them.
    pub async fn stop_all_jails(&self) {
        let jails: Vec<Arc<Jail>> = self.jails.write().drain().map(|(_, j)| j).collect();
        if jails.is_empty() {
            return;
        }
        info!("Stopping all jails");
        join_all(jails.iter().map(|j| j.stop())).await;
    }

    /// Stop every jail, then ask the transport to shut down.
    pub async fn quit(&self) {
        self.stop_all_jails().await;
        self.token.cancel();
    }

    pub fn status(&self) -> Value {
        let names = self.jail_names();
        json!([
            ["Number of jail", names.len()],
            ["Jail list", names.join(", ")],
        ])
    }

    pub fn status_jail(&self, name: &str) -> WardenResult<Value> {
        Ok(self.jail(name)?.status())
    }
}
