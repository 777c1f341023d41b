//! `bfh build`

use super::CommandContext;
use crate::collaborators::Collaborators;
use crate::coordinator::{BuildCoordinator, BuildRequest};
use bfh_common::{Architecture, Result};
use clap::Args;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Debug, Args)]
pub struct BuildArgs {
    /// Repository name within the registry
    #[arg(long)]
    pub repo: String,

    /// Image tag
    #[arg(long)]
    pub tag: String,

    /// Path to the Dockerfile
    #[arg(long)]
    pub file: PathBuf,

    /// Build context directory
    #[arg(long)]
    pub context: PathBuf,

    /// Architecture to build (repeatable; default: all)
    #[arg(long = "arch")]
    pub architectures: Vec<Architecture>,

    /// Extra arguments passed to every `buildctl build`
    #[arg(last = true)]
    pub extra: Vec<String>,
}

impl BuildArgs {
    pub fn request(self) -> BuildRequest {
        let architectures = if self.architectures.is_empty() {
            Architecture::ALL.to_vec()
        } else {
            self.architectures
        };
        BuildRequest {
            repository: self.repo,
            tag: self.tag,
            dockerfile: self.file,
            context: self.context,
            architectures,
            extra_args: self.extra,
        }
    }
}

pub async fn run(args: BuildArgs, ctx: &CommandContext) -> Result<()> {
    let buildkit = ctx.buildkit()?;
    let collaborators = Collaborators::production(Some(buildkit.cluster.clone()), &ctx.settings);
    let coordinator = BuildCoordinator::new(
        collaborators,
        ctx.registry.clone(),
        ctx.settings.clone(),
        buildkit,
    );

    let request = args.request();
    match coordinator.run(&request, &ctx.shutdown).await {
        Ok(report) => {
            info!(run_id = %report.run_id, phases = ?report.phases, "Build complete");
            println!("Published {}", report.target);
            for image in &report.images {
                println!("  {} {}", image.architecture.platform(), image.reference);
            }
            Ok(())
        }
        Err(failure) => {
            error!(
                run_id = %failure.run_id,
                phase = %failure.failed_in,
                phases = ?failure.phases,
                "Build did not complete"
            );
            Err(failure.error)
        }
    }
}
