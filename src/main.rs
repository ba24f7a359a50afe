// src/main.rs

use anyhow::Result;
use bastille::client::{print_usage, split_command_line, Client, ClientOptions};
use bastille::config::{ServerConfig, DEFAULT_CONFIG, DEFAULT_SOCKET};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

#[derive(Parser)]
#[command(name = "bastille")]
#[command(author, version, about = "Control client for the bastille intrusion-prevention daemon", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Control socket path (defaults to the configured one)
    #[arg(short = 's', long)]
    socket: Option<PathBuf>,

    /// Seconds to wait for the server when starting or stopping
    #[arg(short = 't', long, default_value_t = 30)]
    timeout: u64,

    /// Increase verbosity (repeatable)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Start even when a stale socket file is present
    #[arg(short = 'x', long)]
    force: bool,

    /// Run the server in the foreground instead of spawning a daemon
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Interactive mode
    #[arg(short = 'i', long)]
    interactive: bool,

    /// Command to send, e.g. `start`, `status sshd`, `set sshd banip 192.0.2.7`
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();
}

/// The socket comes from the command line, else from the config file,
/// else the built-in default.
fn resolve_socket(cli: &Cli) -> PathBuf {
    if let Some(socket) = &cli.socket {
        return socket.clone();
    }
    match ServerConfig::load(&cli.config) {
        Ok(config) => config.server.socket,
        Err(e) => {
            debug!("no usable config at {}: {}", cli.config.display(), e);
            PathBuf::from(DEFAULT_SOCKET)
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let options = ClientOptions {
        socket: resolve_socket(&cli),
        config: cli.config.clone(),
        timeout: Duration::from_secs(cli.timeout),
        verbose: cli.verbose,
        force: cli.force,
        background: !cli.foreground,
    };
    let client = Client::new(options);

    let outcome = if cli.interactive {
        let initial = if cli.command.is_empty() {
            Ok(())
        } else {
            client.run_command(&normalize(&cli.command))
        };
        initial.and_then(|_| client.interactive())
    } else if cli.command.is_empty() {
        print_usage();
        std::process::exit(1);
    } else {
        client.run_command(&normalize(&cli.command))
    };

    match outcome {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("ERROR: {}", e);
            std::process::exit(1);
        }
    }
}

/// A single quoted argument (`bastille "status sshd"`) is re-split the
/// same way the interactive prompt splits its input.
fn normalize(command: &[String]) -> Vec<String> {
    if command.len() == 1 && command[0].contains(' ') {
        split_command_line(&command[0])
    } else {
        command.to_vec()
    }
}
