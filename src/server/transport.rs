//! Unix-domain control socket: accept, read one request, reply, close.

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use super::codec::{parse_request, ControlCodec, Reply};
use super::transmitter::Transmitter;
use crate::signal::ShutdownToken;

pub const DEFAULT_SOCKET: &str = "/var/run/failwarden/failwarden.sock";

/// Time given to in-flight requests once shutdown starts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound control socket; the socket file is removed on drop.
#[derive(Debug)]
pub struct ControlSocket {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlSocket {
    /// Bind `path`. An existing socket file is removed only with `force`.
    pub fn bind(path: &Path, force: bool) -> Result<Self> {
        if path.exists() {
            if !force {
                bail!(
                    "Socket {} already exists. Is the server already running? \
                     Use --force to remove it",
                    path.display()
                );
            }
            warn!("Removing existing socket {}", path.display());
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind control socket {}", path.display()))?;
        info!("Listening on {}", path.display());
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve requests until `token` is cancelled, then wait briefly for
    /// in-flight requests.
    pub async fn serve(self, transmitter: Transmitter, token: ShutdownToken) {
        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let transmitter = transmitter.clone();
                        handlers.spawn(handle_connection(stream, transmitter));
                    }
                    Err(e) => error!("Failed to accept control connection: {}", e),
                },
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
                _ = token.cancelled() => break,
            }
        }

        debug!("Control socket closing");
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while handlers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Abandoning {} unfinished control request(s)", handlers.len());
            handlers.abort_all();
        }
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("Unable to remove {}: {}", self.path.display(), e);
        }
    }
}

async fn handle_connection(stream: UnixStream, transmitter: Transmitter) {
    let mut framed = Framed::new(stream, ControlCodec::default());
    let reply = match framed.next().await {
        Some(Ok(value)) => match parse_request(value) {
            Ok(args) => transmitter.proceed(&args).await,
            Err(e) => Reply::error(e.to_string()),
        },
        Some(Err(e)) => {
            warn!("Invalid control request: {}", e);
            Reply::error(format!("Protocol error: {}", e))
        }
        None => return,
    };
    if let Err(e) = framed.send(reply.to_value()).await {
        debug!("Unable to send reply: {}", e);
    }
}
