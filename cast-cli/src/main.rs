//! # isocast
//!
//! CLI tool for running isocast streams.
//!
//! ## Commands
//!
//! - `demo`: Pipe stdin through a source, optional relay and sink to stdout
//! - `config`: Print the effective configuration
//!
//! ## Example
//!
//! ```bash
//! # Stream a file through a relay over the in-process medium
//! isocast demo --relay < input.raw > output.raw
//!
//! # Start from the defaults
//! isocast config > isocast.toml
//! ```
//!
//! Logs go to stderr; set `RUST_LOG` to change the level.

use anyhow::{Context, Result};
use cast_stream::Config;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod commands;

use commands::{config, demo};

/// Configuration file used when `--config` is not given.
const DEFAULT_CONFIG: &str = "isocast.toml";

/// CLI tool for running isocast streams.
#[derive(Parser, Debug)]
#[command(name = "isocast")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: isocast.toml if present)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stream stdin to stdout through a loopback broadcast
    Demo {
        /// Put a relay between source and sink
        #[arg(long)]
        relay: bool,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("isocast=info".parse().context("Invalid log directive")?),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
    let result = runtime.block_on(async {
        match cli.command {
            Commands::Demo { relay, duration } => {
                demo::run(&config, relay, duration.map(Duration::from_secs)).await
            }
            Commands::Config => config::run(&config),
        }
    });
    // A pending stdin read must not keep the process alive.
    runtime.shutdown_timeout(Duration::from_millis(100));
    result
}

/// Load `path`, or the default file if it exists, or the defaults.
fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(path) => path,
        None if Path::new(DEFAULT_CONFIG).exists() => Path::new(DEFAULT_CONFIG),
        None => return Ok(Config::default()),
    };
    tracing::info!("Loading configuration from {:?}", path);
    Config::from_file(path).with_context(|| format!("Failed to load {}", path.display()))
}
