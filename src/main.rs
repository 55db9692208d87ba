//! failwarden - ban hosts that cause repeated failures in log files
//!
//! Runs the daemon (`server`) or talks to a running one (`client`).

use anyhow::Result;
use clap::Parser;

use failwarden::cli::{Cli, Commands};
use failwarden::commands::server::ServerOptions;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Server {
            socket,
            pidfile,
            force,
            loglevel,
            logtarget,
        } => {
            let options = ServerOptions {
                socket,
                pidfile,
                force,
                loglevel,
                logtarget,
                verbose: cli.verbose,
                quiet: cli.quiet,
            };
            failwarden::commands::server::run(options, cli.config.as_deref()).await
        }
        Commands::Client { socket, args } => {
            failwarden::commands::client::run(socket, &args, cli.config.as_deref()).await
        }
        Commands::Version => {
            println!("failwarden {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
