//! CLI command implementations.

pub mod client;
pub mod server;

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::{ServerConfig, DEFAULT_CONFIG_PATH};

/// Load the configuration named on the command line, or the default file
/// when it exists. Returns the path that was read, if any.
pub fn resolve_config(path: Option<&Path>) -> Result<(ServerConfig, Option<PathBuf>)> {
    match path {
        Some(path) => Ok((ServerConfig::load(path)?, Some(path.to_path_buf()))),
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                Ok((ServerConfig::load(default)?, Some(default.to_path_buf())))
            } else {
                debug!("No configuration file, using defaults");
                Ok((ServerConfig::default(), None))
            }
        }
    }
}
