//! Control-socket client: send one request, wait for one reply.

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::path::Path;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use crate::server::codec::{ControlCodec, Reply};

/// Send `args` to the server listening on `socket`.
pub async fn send(socket: &Path, args: &[String]) -> Result<Reply> {
    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("Failed to connect to {}. Is the server running?", socket.display()))?;
    let mut framed = Framed::new(stream, ControlCodec::default());
    let request = Value::Array(args.iter().cloned().map(Value::String).collect());
    framed
        .send(request)
        .await
        .context("Failed to send request")?;
    let value = framed
        .next()
        .await
        .ok_or_else(|| anyhow!("Server closed the connection without replying"))?
        .context("Failed to read reply")?;
    Ok(Reply::from_value(value)?)
}
