//! # failwarden - log-driven intrusion banning daemon
//!
//! Watches log files, matches failure lines against per-jail regexes, and
//! runs configurable shell actions to ban the offending hosts for a while.
//!
//! ## Features
//!
//! - **Jails** - Independent filter + action pipelines, started and stopped at runtime
//! - **Two log backends** - Polling (mtime/size) or `notify` (inotify) change events
//! - **Rotation aware** - Files are re-read from the start when their head changes
//! - **Shell actions** - Tag-substituted start/stop/check/ban/unban commands
//! - **Control socket** - `fail2ban`-compatible framed JSON protocol over a Unix socket
//! - **Runtime logging** - Level and target (stdout, stderr, syslog, file) switchable live
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        failwarden                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CLI (clap)                                                 │
//! │    └── Commands: server, client, version                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Config (serde_yaml)                                        │
//! │    └── Jails become a control command stream at start-up    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Server (tokio UnixListener + ControlCodec)                 │
//! │    └── Transmitter: add/start/stop/status/set/get/reload    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Jail                                                       │
//! │    ├── Filter: containers → DateDetector → FailRegex        │
//! │    │     └── FailManager ──▶ bounded ticket queue           │
//! │    └── Actions: BanManager + shell actions                  │
//! │          └── CommandExecutor (sh -c, timeout, global lock)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use failwarden::client;
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let socket = Path::new("/var/run/failwarden/failwarden.sock");
//!     let reply = client::send(socket, &["status".to_string(), "ssh".to_string()]).await?;
//!     println!("{}", reply.value);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`action`] - Shell actions, tag substitution and the ban worker
//! - [`banmanager`] - Currently banned addresses and their expiry
//! - [`cli`] - Command-line interface definitions
//! - [`client`] - Control socket client
//! - [`clock`] - Injectable time source
//! - [`cmd_abstraction`] - Shell execution behind a mockable trait
//! - [`commands`] - CLI command implementations
//! - [`config`] - Configuration parsing and validation
//! - [`datedetector`] - Timestamp detection in log lines
//! - [`dns`] - Hostname resolution for matched hosts
//! - [`error`] - Error types
//! - [`failmanager`] - Failure counting inside the find-time window
//! - [`failregex`] - `<HOST>` regexes
//! - [`filter`] - Log file following and line processing
//! - [`jail`] - A filter paired with its actions
//! - [`logging`] - Runtime-switchable log level and target
//! - [`net`] - Address parsing and CIDR matching
//! - [`pidfile`] - Locked PID file
//! - [`server`] - Jail registry, control protocol and socket
//! - [`signal`] - Graceful shutdown signal handling
//! - [`ticket`] - Fail and ban tickets

pub mod action;
pub mod banmanager;
pub mod cli;
pub mod client;
pub mod clock;
pub mod cmd_abstraction;
pub mod commands;
pub mod config;
pub mod datedetector;
pub mod dns;
pub mod error;
pub mod failmanager;
pub mod failregex;
pub mod filter;
pub mod jail;
pub mod logging;
pub mod net;
pub mod pidfile;
pub mod server;
pub mod signal;
pub mod ticket;

pub use cli::{Cli, Commands};
pub use config::ServerConfig;
pub use error::{WardenError, WardenResult};
