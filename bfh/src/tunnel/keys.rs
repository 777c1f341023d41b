use bfh_common::Result;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Key pair and signed certificate for one bastion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedKeyMaterial {
    pub private_key: PathBuf,
    pub public_key: PathBuf,
    pub signed_certificate: PathBuf,
}

impl SignedKeyMaterial {
    /// `<ssh_dir>/id_ed25519_<bastion>` plus `.pub` and `_signed.pub`.
    pub fn for_bastion(ssh_dir: &Path, bastion: &str) -> Self {
        let private_key = ssh_dir.join(format!("id_ed25519_{bastion}"));
        let public_key = ssh_dir.join(format!("id_ed25519_{bastion}.pub"));
        let signed_certificate = ssh_dir.join(format!("id_ed25519_{bastion}_signed.pub"));
        Self {
            private_key,
            public_key,
            signed_certificate,
        }
    }

    fn files(&self) -> [&Path; 3] {
        [
            self.private_key.as_path(),
            self.public_key.as_path(),
            self.signed_certificate.as_path(),
        ]
    }

    pub fn is_complete(&self) -> bool {
        self.files().iter().all(|f| f.exists())
    }

    /// Delete whichever of the three files exist.
    pub async fn reset(&self) -> Result<()> {
        for file in self.files() {
            match tokio::fs::remove_file(file).await {
                Ok(()) => debug!(path = %file.display(), "Removed stale key file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub async fn write_certificate(&self, certificate: &str) -> Result<()> {
        tokio::fs::write(&self.signed_certificate, certificate).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reset_removes_partial_material() {
        let dir = TempDir::new().unwrap();
        let keys = SignedKeyMaterial::for_bastion(dir.path(), "prod");
        assert_eq!(keys.signed_certificate, dir.path().join("id_ed25519_prod_signed.pub"));

        std::fs::write(&keys.private_key, "k").unwrap();
        assert!(!keys.is_complete());

        keys.reset().await.unwrap();
        assert!(!keys.private_key.exists());

        std::fs::write(&keys.private_key, "k").unwrap();
        std::fs::write(&keys.public_key, "p").unwrap();
        keys.write_certificate("cert").await.unwrap();
        assert!(keys.is_complete());
    }
}
