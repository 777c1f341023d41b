//! CLI command implementations.

pub mod address;
pub mod build;
pub mod scale;
pub mod tunnel;

use crate::shutdown::ShutdownSignal;
use bfh_common::{BfhConfig, BuildKitConfig, ProcessRegistry, Result};
use std::sync::Arc;

/// State shared by every command for the lifetime of one invocation.
pub struct CommandContext {
    pub settings: BfhConfig,
    pub registry: Arc<ProcessRegistry>,
    pub shutdown: ShutdownSignal,
}

impl CommandContext {
    pub fn buildkit(&self) -> Result<BuildKitConfig> {
        Ok(BuildKitConfig::load(&self.settings.general.buildkit_dir)?)
    }
}

/// An explicit `--context` wins over the cluster named in `buildkit.json`.
pub fn kube_context(flag: Option<String>, buildkit: Option<&BuildKitConfig>) -> Option<String> {
    flag.or_else(|| buildkit.map(|b| b.cluster.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buildkit() -> BuildKitConfig {
        BuildKitConfig {
            registry: "reg".to_string(),
            cache_bucket: "cache".to_string(),
            cache_bucket_region: "us-east-2".to_string(),
            cluster: "production-primary".to_string(),
            bastion: "bastion".to_string(),
            authority_address: None,
            in_cluster: false,
        }
    }

    #[test]
    fn test_kube_context_precedence() {
        let bk = buildkit();
        assert_eq!(
            kube_context(Some("dev".to_string()), Some(&bk)).as_deref(),
            Some("dev")
        );
        assert_eq!(
            kube_context(None, Some(&bk)).as_deref(),
            Some("production-primary")
        );
        assert_eq!(kube_context(None, None), None);
    }

    #[test]
    fn test_missing_buildkit_config_is_configuration_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut settings = BfhConfig::default();
        settings.general.buildkit_dir = dir.path().to_path_buf();
        let ctx = CommandContext {
            settings,
            registry: Arc::new(ProcessRegistry::new()),
            shutdown: ShutdownSignal::never(),
        };
        let err = ctx.buildkit().unwrap_err();
        assert_eq!(err.code(), bfh_common::ErrorCode::ConfigNotFound);
    }
}
