use super::KeyGenerator;
use async_trait::async_trait;
use bfh_common::{ExternalCommand, Result};
use std::path::Path;

/// ed25519 key pairs via `ssh-keygen`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshKeygen;

#[async_trait]
impl KeyGenerator for SshKeygen {
    async fn generate(&self, private_key: &Path, comment: &str) -> Result<()> {
        if let Some(dir) = private_key.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        ExternalCommand::new("ssh-keygen")
            .args(["-q", "-t", "ed25519", "-N", "", "-C", comment, "-f"])
            .arg(private_key.display().to_string())
            .run()
            .await?;
        Ok(())
    }
}
