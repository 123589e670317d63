//! rashomon: local interception proxy for AI-agent network traffic
//!
//! Parses the command line, sets up diagnostic logging on stderr, resolves
//! the layered configuration and dispatches the subcommand. Subcommand output
//! goes to stdout so it can be piped; logs never do.

use anyhow::{Context, Result};
use clap::Parser;
use rashomon::{cli::Cli, cli_handler, config::ConfigLoader};
use tracing::debug;

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.log_json)?;
    debug!("Parsed CLI arguments: {:?}", cli);

    let settings = ConfigLoader::new()
        .load(&cli)
        .context("Failed to load configuration")?;
    debug!("Resolved settings: {:?}", settings);

    cli_handler::handle_command(cli.command(), &settings)
}

/// Initialize the tracing subscriber for diagnostic logging.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG` if set, otherwise warnings and errors
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8, json: bool) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
    }
    .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
