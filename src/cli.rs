//! CLI argument parsing with clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "failwarden")]
#[command(author, version, about = "Ban hosts that cause repeated failures in log files")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path (default: /etc/failwarden/config.yaml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the daemon in the foreground
    Server {
        /// Control socket path
        #[arg(short, long)]
        socket: Option<PathBuf>,

        /// PID file path
        #[arg(short, long)]
        pidfile: Option<PathBuf>,

        /// Remove a stale control socket before binding
        #[arg(short = 'x', long)]
        force: bool,

        /// Log level (0 fatal .. 4 debug)
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=4))]
        loglevel: Option<u8>,

        /// Log target: STDOUT, STDERR, SYSLOG or a file path
        #[arg(long)]
        logtarget: Option<String>,
    },

    /// Send one command to a running server and print the reply
    Client {
        /// Control socket path
        #[arg(short, long)]
        socket: Option<PathBuf>,

        /// Command and arguments, e.g. `status ssh`
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Show version
    Version,
}
