//! `bfh scale up` / `bfh scale down`

use super::{CommandContext, kube_context};
use crate::capacity::{CapacityController, ScaleDownDecision};
use crate::collaborators::Collaborators;
use bfh_common::{Architecture, Result};
use clap::Subcommand;
use std::time::Duration;

#[derive(Debug, Subcommand)]
pub enum ScaleCommand {
    /// Ensure build engines are running and record a build
    Up {
        /// Only scale these architectures (repeatable; default: all)
        #[arg(long)]
        only: Vec<Architecture>,

        /// Wait until every engine has an available replica
        #[arg(long)]
        wait: bool,

        /// How long to wait, e.g. `600`, `10m`
        #[arg(long, value_parser = parse_duration, default_value = "10m")]
        timeout: Duration,

        /// Kubernetes context
        #[arg(long)]
        context: Option<String>,
    },

    /// Scale build engines to zero
    #[command(alias = "suspend")]
    Down {
        /// Only scale down engines idle for at least this many seconds
        #[arg(long)]
        idle_timeout: Option<u64>,

        /// Kubernetes context
        #[arg(long)]
        context: Option<String>,
    },
}

fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(raw).map_err(|e| e.to_string())
}

fn selected(only: Vec<Architecture>) -> Vec<Architecture> {
    if only.is_empty() {
        Architecture::ALL.to_vec()
    } else {
        only
    }
}

pub async fn run(command: ScaleCommand, ctx: &CommandContext) -> Result<()> {
    let buildkit = ctx.buildkit().ok();
    match command {
        ScaleCommand::Up {
            only,
            wait,
            timeout,
            context,
        } => {
            let controller = controller(ctx, kube_context(context, buildkit.as_ref()));
            let architectures = selected(only);
            controller.scale_up(&architectures, wait, timeout).await?;
            for arch in &architectures {
                let state = controller.state(*arch).await?;
                let last_build = state
                    .last_build_timestamp
                    .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
                    .map_or_else(|| "never".to_string(), |at| at.to_rfc3339());
                println!(
                    "{} scaled up ({} replicas, {} available, last build {last_build})",
                    state.workload, state.current_replicas, state.available_replicas
                );
            }
        }
        ScaleCommand::Down {
            idle_timeout,
            context,
        } => {
            let controller = controller(ctx, kube_context(context, buildkit.as_ref()));
            let decisions = controller
                .scale_down(&Architecture::ALL, idle_timeout)
                .await?;
            for (arch, decision) in decisions {
                let workload = controller.workload(arch);
                match decision {
                    ScaleDownDecision::ScaledDown => println!("{workload} scaled down"),
                    ScaleDownDecision::AlreadyDown => println!("{workload} already at 0"),
                    ScaleDownDecision::Skipped { idle_secs } => {
                        println!("{workload} kept: last build {idle_secs}s ago")
                    }
                }
            }
        }
    }
    Ok(())
}

fn controller(ctx: &CommandContext, context: Option<String>) -> CapacityController {
    let collaborators = Collaborators::production(context, &ctx.settings);
    CapacityController::new(collaborators.control_plane, ctx.settings.capacity.clone())
}
