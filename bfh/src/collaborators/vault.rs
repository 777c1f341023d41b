//! Vault-backed certificate signing and bearer token lookup.

use super::{CertificateAuthority, TokenProvider};
use async_trait::async_trait;
use bfh_common::{BfhError, ExternalCommand, Result};
use std::path::Path;
use tracing::{debug, info};

/// Signs SSH public keys with `vault write ssh/sign/default`.
#[derive(Debug, Clone, Copy, Default)]
pub struct VaultAuthority;

#[async_trait]
impl CertificateAuthority for VaultAuthority {
    async fn sign_public_key(
        &self,
        authority: &str,
        public_key: &Path,
        token: &str,
    ) -> Result<String> {
        let signed = ExternalCommand::new("vault")
            .args(["write", "-field", "signed_key", "ssh/sign/default"])
            .arg(format!("public_key=@{}", public_key.display()))
            .env("VAULT_ADDR", authority)
            .env("VAULT_TOKEN", token)
            .run()
            .await
            .map_err(|e| BfhError::Authentication(format!("certificate signing failed: {e}")))?;

        if signed.is_empty() {
            return Err(BfhError::Authentication(
                "certificate authority returned an empty certificate".to_string(),
            ));
        }
        Ok(signed)
    }
}

/// Bearer token lookup in order: `VAULT_TOKEN`, the CLI's cached token if
/// it still has at least `min_ttl_secs` left, then an interactive OIDC login.
#[derive(Debug, Clone)]
pub struct VaultTokenProvider {
    pub min_ttl_secs: u64,
}

impl Default for VaultTokenProvider {
    fn default() -> Self {
        Self { min_ttl_secs: 1800 }
    }
}

impl VaultTokenProvider {
    async fn cached_token(&self, authority: &str) -> Option<String> {
        let token = match ExternalCommand::new("vault")
            .args(["print", "token"])
            .env("VAULT_ADDR", authority)
            .run()
            .await
        {
            Ok(token) if !token.is_empty() => token,
            Ok(_) => return None,
            Err(e) => {
                debug!(error = %e, "No cached vault token");
                return None;
            }
        };

        let lookup = ExternalCommand::new("vault")
            .args(["token", "lookup", "-format=json"])
            .env("VAULT_ADDR", authority)
            .env("VAULT_TOKEN", token.as_str())
            .run()
            .await;
        match lookup.ok().as_deref().and_then(parse_ttl) {
            Some(ttl) if ttl >= self.min_ttl_secs => Some(token),
            Some(ttl) => {
                debug!(ttl, min = self.min_ttl_secs, "Cached vault token expires too soon");
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl TokenProvider for VaultTokenProvider {
    async fn bearer_token(&self, authority: &str) -> Result<String> {
        if let Some(token) = std::env::var("VAULT_TOKEN").ok().filter(|t| !t.is_empty()) {
            debug!("Using VAULT_TOKEN from environment");
            return Ok(token);
        }

        if let Some(token) = self.cached_token(authority).await {
            debug!("Reusing cached vault token");
            return Ok(token);
        }

        info!(authority, "Logging in to vault");
        let token = ExternalCommand::new("vault")
            .args(["login", "-method=oidc", "-field=token"])
            .env("VAULT_ADDR", authority)
            .run()
            .await
            .map_err(|e| BfhError::Authentication(format!("vault login failed: {e}")))?;
        if token.is_empty() {
            return Err(BfhError::Authentication(
                "vault login returned no token".to_string(),
            ));
        }
        Ok(token)
    }
}

/// Remaining TTL in seconds from `vault token lookup -format=json`.
fn parse_ttl(lookup: &str) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_str(lookup).ok()?;
    value.get("data")?.get("ttl")?.as_u64()
}
