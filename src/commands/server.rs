//! Server command implementation.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use crate::clock;
use crate::cmd_abstraction::RealCommandExecutor;
use crate::config::ServerConfig;
use crate::jail::JailContext;
use crate::logging::LogControl;
use crate::pidfile::PidFile;
use crate::server::{ControlSocket, Server, Transmitter};
use crate::signal;

/// Command-line settings that override the configuration file.
#[derive(Debug, Default, Clone)]
pub struct ServerOptions {
    pub socket: Option<PathBuf>,
    pub pidfile: Option<PathBuf>,
    pub force: bool,
    pub loglevel: Option<u8>,
    pub logtarget: Option<String>,
    pub verbose: bool,
    pub quiet: bool,
}

impl ServerOptions {
    /// Apply the overrides to `config`. An explicit `--loglevel` beats
    /// `--verbose` and `--quiet`.
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(socket) = &self.socket {
            config.socket = socket.clone();
        }
        if let Some(pidfile) = &self.pidfile {
            config.pidfile = pidfile.clone();
        }
        if self.verbose {
            config.loglevel = 4;
        } else if self.quiet {
            config.loglevel = 1;
        }
        if let Some(level) = self.loglevel {
            config.loglevel = level;
        }
        if let Some(target) = &self.logtarget {
            config.logtarget = target.clone();
        }
    }
}

/// Jail resources derived from the server settings.
pub fn jail_context(config: &ServerConfig) -> JailContext {
    let mut ctx = JailContext::new(clock::system(), Arc::new(RealCommandExecutor::new()));
    ctx.command_timeout = config.command_timeout();
    ctx.poll_interval = config.poll_interval();
    ctx.queue_capacity = config.queue_capacity;
    ctx
}

/// Run the server command
pub async fn run(options: ServerOptions, config_path: Option<&Path>) -> Result<()> {
    let (mut config, config_path) = super::resolve_config(config_path)?;
    options.apply(&mut config);
    config.validate()?;

    let log = LogControl::install(config.loglevel, &config.logtarget)?;
    info!("Starting failwarden {}", env!("CARGO_PKG_VERSION"));

    let _pidfile = PidFile::create(&config.pidfile)?;
    let socket = ControlSocket::bind(&config.socket, options.force)?;

    let mut server = Server::new(jail_context(&config), log);
    if let Some(path) = config_path {
        server = server.with_config_path(path);
    }
    let server = Arc::new(server);
    let token = server.token().clone();
    signal::install(token.clone());

    let transmitter = Transmitter::new(server.clone());
    if let Err(e) = transmitter.apply(&config.jail_commands()).await {
        error!("Failed to start configured jails: {}", e);
        server.stop_all_jails().await;
        return Err(e).context("Invalid jail configuration");
    }

    socket.serve(transmitter, token).await;

    server.stop_all_jails().await;
    info!("Exiting failwarden");
    server.log().flush();
    Ok(())
}
