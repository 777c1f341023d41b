use super::{ImageReference, ManifestAggregator};
use async_trait::async_trait;
use bfh_common::{BfhError, ExternalCommand, Result};
use tracing::info;

/// Multi-architecture manifests via `manifest-tool push from-args`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestTool;

#[async_trait]
impl ManifestAggregator for ManifestTool {
    async fn publish(&self, images: &[ImageReference], target: &str) -> Result<()> {
        let args = manifest_args(images, target)?;
        ExternalCommand::new("manifest-tool")
            .args(args)
            .run()
            .await
            .map_err(|e| BfhError::PublishFailed(e.to_string()))?;
        info!(manifest = target, platforms = images.len(), "Published multi-platform manifest");
        Ok(())
    }
}

/// Every image must be named `<target>-<arch>` for the `ARCH` template to
/// resolve.
fn manifest_args(images: &[ImageReference], target: &str) -> Result<Vec<String>> {
    if images.is_empty() {
        return Err(BfhError::PublishFailed(format!(
            "no images to combine into {target}"
        )));
    }
    if let Some(stray) = images
        .iter()
        .find(|i| i.reference != format!("{target}-{}", i.architecture))
    {
        return Err(BfhError::PublishFailed(format!(
            "{} does not match the {target}-ARCH template",
            stray.reference
        )));
    }

    let platforms = images
        .iter()
        .map(|i| i.architecture.platform())
        .collect::<Vec<_>>()
        .join(",");
    Ok(vec![
        "push".to_string(),
        "from-args".to_string(),
        "--platforms".to_string(),
        platforms,
        "--template".to_string(),
        format!("{target}-ARCH"),
        "--target".to_string(),
        target.to_string(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfh_common::Architecture;

    fn image(arch: Architecture, reference: &str) -> ImageReference {
        ImageReference {
            architecture: arch,
            reference: reference.to_string(),
        }
    }

    #[test]
    fn test_manifest_args_cover_every_platform() {
        let target = "reg.example/app:v1";
        let args = manifest_args(
            &[
                image(Architecture::Amd64, "reg.example/app:v1-amd64"),
                image(Architecture::Arm64, "reg.example/app:v1-arm64"),
            ],
            target,
        )
        .unwrap();
        assert_eq!(
            args,
            [
                "push",
                "from-args",
                "--platforms",
                "linux/amd64,linux/arm64",
                "--template",
                "reg.example/app:v1-ARCH",
                "--target",
                "reg.example/app:v1"
            ]
        );
    }

    #[test]
    fn test_manifest_args_reject_empty_and_mismatched() {
        assert!(matches!(
            manifest_args(&[], "reg/app:v1"),
            Err(BfhError::PublishFailed(_))
        ));
        assert!(matches!(
            manifest_args(&[image(Architecture::Amd64, "reg/other:v1-amd64")], "reg/app:v1"),
            Err(BfhError::PublishFailed(_))
        ));
    }
}
