//! Build Fleet Helper
//!
//! Scales the remote BuildKit fleet, opens tunnels to it through the SSH
//! bastion, and runs multi-architecture image builds across those tunnels.

#![forbid(unsafe_code)]

mod capacity;
mod collaborators;
mod commands;
mod coordinator;
mod shutdown;
mod tunnel;

use anyhow::Result;
use bfh_common::{BfhConfig, BfhError, LogConfig, ProcessRegistry, init_logging};
use clap::{Parser, Subcommand};
use commands::CommandContext;
use commands::address::GetAddressArgs;
use commands::build::BuildArgs;
use commands::scale::ScaleCommand;
use commands::tunnel::TunnelArgs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

#[derive(Parser)]
#[command(name = "bfh")]
#[command(author, version, about = "Build Fleet Helper - remote multi-arch BuildKit builds")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to config.toml (default: <config dir>/bfh/config.toml)
    #[arg(long, global = true, env = "BFH_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and publish a multi-architecture image
    Build(BuildArgs),

    /// Open a tunnel to a build engine and hold it until interrupted
    Tunnel(TunnelArgs),

    /// Scale the build engine pools
    #[command(subcommand)]
    Scale(ScaleCommand),

    /// Print the address of the least busy build engine
    GetAddress(GetAddressArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match BfhConfig::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => exit_with(&BfhError::from(e)),
    };

    let mut log_config = LogConfig::from_env(&settings.general.log_level).with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    if cli.log_json {
        log_config = log_config.with_json();
    }
    let logging_guards = init_logging(&log_config)?;

    let registry = Arc::new(ProcessRegistry::with_policy(settings.termination_policy()));
    let (trigger, shutdown) = shutdown::channel();
    shutdown::install_signal_handlers(trigger);

    let ctx = CommandContext {
        settings,
        registry: registry.clone(),
        shutdown,
    };

    let result = match cli.command {
        Commands::Build(args) => commands::build::run(args, &ctx).await,
        Commands::Tunnel(args) => commands::tunnel::run(args, &ctx).await,
        Commands::Scale(command) => {
            ctx.shutdown.guard(commands::scale::run(command, &ctx)).await
        }
        Commands::GetAddress(args) => {
            ctx.shutdown.guard(commands::address::run(args, &ctx)).await
        }
    };

    if ctx.shutdown.is_cancelled() {
        debug!("Interrupted");
    }

    // Anything a command left behind is torn down before exit.
    if !registry.is_empty() {
        debug!(count = registry.len(), "Draining background processes");
        registry.terminate_all().await;
    }

    match result {
        Ok(()) => Ok(()),
        Err(err) => {
            drop(logging_guards);
            exit_with(&err)
        }
    }
}

fn exit_with(err: &BfhError) -> ! {
    eprintln!("error: {err}");
    eprintln!();
    eprint!("{}", err.code().entry().format_full());
    let code = match err {
        BfhError::Cancelled => 130,
        _ => 1,
    };
    std::process::exit(code)
}
