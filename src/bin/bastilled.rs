// src/bin/bastilled.rs

use anyhow::Result;
use bastille::config::DEFAULT_SOCKET;
use bastille::server::ControlServer;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bastilled")]
#[command(author, version, about = "Bastille intrusion-prevention daemon", long_about = None)]
struct Cli {
    /// Control socket path
    #[arg(short = 's', long, default_value = DEFAULT_SOCKET)]
    socket: PathBuf,

    /// Remove a stale socket file instead of refusing to start
    #[arg(short = 'x', long)]
    force: bool,

    /// Increase verbosity (repeatable)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let server = ControlServer::new(cli.socket, cli.force);
    server.run()?;
    Ok(())
}
