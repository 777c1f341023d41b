//! `bfh get-address`

use super::{CommandContext, kube_context};
use crate::capacity::CapacityController;
use crate::collaborators::Collaborators;
use bfh_common::{Architecture, Result};
use clap::Args;

#[derive(Debug, Args)]
pub struct GetAddressArgs {
    /// Architecture of the build engine
    #[arg(long)]
    pub arch: Architecture,

    /// Print `host:port` without the `tcp://` prefix
    #[arg(long)]
    pub omit_protocol: bool,

    /// Kubernetes context
    #[arg(long)]
    pub context: Option<String>,
}

pub async fn run(args: GetAddressArgs, ctx: &CommandContext) -> Result<()> {
    let buildkit = ctx.buildkit().ok();
    let collaborators = Collaborators::production(
        kube_context(args.context, buildkit.as_ref()),
        &ctx.settings,
    );
    let controller =
        CapacityController::new(collaborators.control_plane, ctx.settings.capacity.clone());
    let endpoint = controller.resolve_endpoint(args.arch).await?;
    if args.omit_protocol {
        println!("{}", endpoint.address);
    } else {
        println!("{}", endpoint.url());
    }
    Ok(())
}
