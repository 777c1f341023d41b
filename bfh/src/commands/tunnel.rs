//! `bfh tunnel`: hold a tunnel to one architecture's build engine open
//! until interrupted.

use super::{CommandContext, kube_context};
use crate::capacity::CapacityController;
use crate::collaborators::Collaborators;
use crate::tunnel::TunnelEstablisher;
use bfh_common::{Architecture, Result, wait_for_port};
use clap::Args;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Args)]
pub struct TunnelArgs {
    /// Architecture of the build engine to reach
    #[arg(long)]
    pub arch: Architecture,

    /// Local port to listen on
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,

    /// Kubernetes context (default: cluster from buildkit.json)
    #[arg(long)]
    pub context: Option<String>,
}

pub async fn run(args: TunnelArgs, ctx: &CommandContext) -> Result<()> {
    let buildkit = ctx.buildkit()?;
    let context = kube_context(args.context, Some(&buildkit));
    let collaborators = Collaborators::production(context.clone(), &ctx.settings);

    let capacity = CapacityController::new(
        collaborators.control_plane.clone(),
        ctx.settings.capacity.clone(),
    );
    let timeout = Duration::from_secs(ctx.settings.capacity.scale_timeout_secs);
    let endpoint = ctx
        .shutdown
        .guard(async {
            capacity.scale_up(&[args.arch], true, timeout).await?;
            capacity.resolve_endpoint(args.arch).await
        })
        .await?;

    // A process spawned before an interrupt stays in the registry and is
    // drained by main.
    let establisher = TunnelEstablisher::new(collaborators, ctx.registry.clone(), ctx.settings.clone())
        .with_kube_context(context);
    let handle = ctx
        .shutdown
        .guard(async {
            if buildkit.in_cluster {
                establisher.open_direct(&endpoint.instance, args.port).await
            } else {
                let authority = buildkit.authority_address()?;
                establisher
                    .open(&buildkit.bastion, &endpoint.address, args.port, &authority)
                    .await
            }
        })
        .await?;

    let readiness_policy = ctx.settings.readiness_policy();
    let readiness = wait_for_port("127.0.0.1", args.port, &readiness_policy);
    if let Err(e) = ctx.shutdown.guard(readiness).await {
        handle.close().await;
        return Err(e);
    }

    println!(
        "Tunnel ready: BUILDKIT_HOST=tcp://127.0.0.1:{} ({}). Press Ctrl-C to close.",
        args.port, endpoint.instance
    );
    info!(pid = handle.pid, bastion = ?handle.bastion_name, remote = %handle.remote_address, "Holding tunnel open");
    ctx.shutdown.cancelled().await;
    info!("Shutting down tunnel");
    handle.close().await;
    Ok(())
}
