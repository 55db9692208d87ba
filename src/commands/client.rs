//! Client command implementation.

use anyhow::{bail, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::client;

/// Run the client command
pub async fn run(socket: Option<PathBuf>, args: &[String], config_path: Option<&Path>) -> Result<()> {
    let socket = match socket {
        Some(socket) => socket,
        None => super::resolve_config(config_path)?.0.socket,
    };

    let reply = client::send(&socket, args).await?;
    if !reply.is_ok() {
        bail!("{}", plain(&reply.value));
    }
    let text = plain(&reply.value);
    if !text.is_empty() {
        println!("{}", text);
    }
    Ok(())
}

/// Strings print bare, everything else as compact JSON.
fn plain(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
