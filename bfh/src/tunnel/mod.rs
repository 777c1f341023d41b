//! Authenticated port-forwarding tunnels to build engines.
//!
//! [`TunnelEstablisher::open`] goes through an SSH bastion with a freshly
//! signed certificate; [`TunnelEstablisher::open_direct`] port-forwards
//! straight to an instance when already running inside the cluster. Both
//! register the forwarding process with the shared [`ProcessRegistry`] and
//! hand back a [`TunnelHandle`] whose `close` tears it down.

pub mod bastion;
pub mod keys;

pub use bastion::resolve_bastion;
pub use keys::SignedKeyMaterial;

use crate::collaborators::{Collaborators, SpawnSpec};
use bfh_common::{
    BackgroundProcess, BastionEndpoint, BfhConfig, BfhError, ProcessRegistry, Result,
    TerminationOutcome, TerminationPolicy,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// An open tunnel. Dropping the handle does not close it.
#[derive(Debug)]
pub struct TunnelHandle {
    pub pid: u32,
    pub local_port: u16,
    pub remote_address: String,
    /// `None` for direct port-forwards.
    pub bastion_name: Option<String>,
    registry: Arc<ProcessRegistry>,
    closed: AtomicBool,
}

impl TunnelHandle {
    /// Terminate the forwarding process and its children. Later calls are
    /// no-ops.
    pub async fn close(&self) -> Option<TerminationOutcome> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return None;
        }
        info!(
            pid = self.pid,
            local_port = self.local_port,
            remote = %self.remote_address,
            "Closing tunnel"
        );
        let policy = TerminationPolicy {
            kill_children: true,
            ..self.registry.policy()
        };
        Some(self.registry.terminate_with(self.pid, &policy).await)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct TunnelEstablisher {
    collaborators: Collaborators,
    registry: Arc<ProcessRegistry>,
    settings: BfhConfig,
    kube_context: Option<String>,
    /// Serializes key provisioning between tunnels opened concurrently.
    key_lock: Mutex<()>,
}

impl TunnelEstablisher {
    pub fn new(
        collaborators: Collaborators,
        registry: Arc<ProcessRegistry>,
        settings: BfhConfig,
    ) -> Self {
        Self {
            collaborators,
            registry,
            settings,
            kube_context: None,
            key_lock: Mutex::new(()),
        }
    }

    /// Kubernetes context used by direct port-forwards.
    #[must_use]
    pub fn with_kube_context(mut self, context: Option<String>) -> Self {
        self.kube_context = context;
        self
    }

    /// Open `127.0.0.1:<local_port>` → `remote_address` through `bastion_name`.
    ///
    /// Freshly generated keys are left on disk if signing fails; the next
    /// call signs them again.
    pub async fn open(
        &self,
        bastion_name: &str,
        remote_address: &str,
        local_port: u16,
        authority: &str,
    ) -> Result<TunnelHandle> {
        validate_port(local_port)?;
        validate_remote_address(remote_address)?;

        let ssh_dir = &self.settings.general.ssh_dir;
        let bastion = resolve_bastion(ssh_dir, bastion_name)?;

        let keys = SignedKeyMaterial::for_bastion(ssh_dir, bastion_name);
        let provisioning = self.key_lock.lock().await;
        if !keys.is_complete() {
            info!(bastion = bastion_name, "Generating SSH keys");
            keys.reset().await?;
            self.collaborators
                .keygen
                .generate(&keys.private_key, bastion_name)
                .await?;
        }

        let token = self
            .collaborators
            .tokens
            .bearer_token(authority)
            .await
            .map_err(into_authentication)?;
        let certificate = self
            .collaborators
            .authority
            .sign_public_key(authority, &keys.public_key, &token)
            .await
            .map_err(into_authentication)?;
        keys.write_certificate(&certificate).await?;
        drop(provisioning);
        debug!(bastion = bastion_name, "SSH key signed");

        let spec = self.bastion_spec(&bastion, &keys, remote_address, local_port);
        let pid = self.collaborators.transport.spawn(&spec).await?;
        self.registry.register(
            BackgroundProcess::new(pid, spec.program.clone()).with_description(&spec.description),
        );

        info!(
            pid,
            "Tunnel established: 127.0.0.1:{} -> {} via {}", local_port, remote_address, bastion_name
        );
        Ok(TunnelHandle {
            pid,
            local_port,
            remote_address: remote_address.to_string(),
            bastion_name: Some(bastion_name.to_string()),
            registry: self.registry.clone(),
            closed: AtomicBool::new(false),
        })
    }

    /// Forward `127.0.0.1:<local_port>` straight to `instance`'s build port.
    pub async fn open_direct(&self, instance: &str, local_port: u16) -> Result<TunnelHandle> {
        validate_port(local_port)?;
        if instance.is_empty() {
            return Err(BfhError::InvalidArgument("empty instance name".to_string()));
        }

        let spec = self.direct_spec(instance, local_port);
        let pid = self.collaborators.transport.spawn(&spec).await?;
        self.registry.register(
            BackgroundProcess::new(pid, spec.program.clone()).with_description(&spec.description),
        );

        info!(pid, local_port, instance, "Port-forward established");
        Ok(TunnelHandle {
            pid,
            local_port,
            remote_address: format!("{instance}:{}", self.settings.capacity.buildkit_port),
            bastion_name: None,
            registry: self.registry.clone(),
            closed: AtomicBool::new(false),
        })
    }

    fn bastion_spec(
        &self,
        bastion: &BastionEndpoint,
        keys: &SignedKeyMaterial,
        remote_address: &str,
        local_port: u16,
    ) -> SpawnSpec {
        let tunnel = &self.settings.tunnel;
        let known_hosts = self.settings.general.ssh_dir.join("known_hosts");
        let options = [
            format!("UserKnownHostsFile={}", known_hosts.display()),
            "IdentitiesOnly=yes".to_string(),
            "IdentityAgent=none".to_string(),
            format!("ServerAliveInterval={}", tunnel.server_alive_interval),
            format!("ServerAliveCountMax={}", tunnel.server_alive_count_max),
            format!("ConnectTimeout={}", tunnel.connect_timeout),
        ];

        let mut args = vec!["-M".to_string(), "0".to_string()];
        for option in options {
            args.push("-o".to_string());
            args.push(option);
        }
        args.extend([
            "-N".to_string(),
            "-i".to_string(),
            keys.private_key.display().to_string(),
            "-i".to_string(),
            keys.signed_certificate.display().to_string(),
            "-L".to_string(),
            format!("127.0.0.1:{local_port}:{remote_address}"),
            "-p".to_string(),
            bastion.port.to_string(),
            format!("{}@{}", tunnel.bastion_user, bastion.domain),
        ]);

        SpawnSpec {
            program: "autossh".to_string(),
            args,
            env: vec![("AUTOSSH_GATETIME".to_string(), "0".to_string())],
            description: format!("SSH tunnel to {remote_address} via {}", bastion.name),
            local_port,
        }
    }

    fn direct_spec(&self, instance: &str, local_port: u16) -> SpawnSpec {
        let mut args = Vec::new();
        if let Some(ctx) = &self.kube_context {
            args.extend(["--context".to_string(), ctx.clone()]);
        }
        args.extend([
            "-n".to_string(),
            self.settings.capacity.namespace.clone(),
            "port-forward".to_string(),
            format!("pod/{instance}"),
            format!("{local_port}:{}", self.settings.capacity.buildkit_port),
            "--address".to_string(),
            "127.0.0.1".to_string(),
        ]);
        SpawnSpec {
            program: "kubectl".to_string(),
            args,
            env: Vec::new(),
            description: format!("port-forward to {instance}"),
            local_port,
        }
    }
}

fn into_authentication(err: BfhError) -> BfhError {
    match err {
        BfhError::Authentication(_) => err,
        other => BfhError::Authentication(other.to_string()),
    }
}

fn validate_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(BfhError::InvalidArgument(
            "local port must be between 1 and 65535".to_string(),
        ));
    }
    Ok(())
}

/// `host:port` with a non-empty host and a port in 1..=65535.
pub fn validate_remote_address(address: &str) -> Result<()> {
    let invalid = || BfhError::InvalidArgument(format!("invalid remote address '{address}' (expected host:port)"));
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || host.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(invalid());
    }
    match port.parse::<u16>() {
        Ok(p) if p > 0 => Ok(()),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::mock::{MockAuthority, MockFleet, MockSpawner};
    use bfh_common::ErrorCode;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    const REMOTE: &str = "10-0-1-5.buildkit.pod.cluster.local:1234";

    struct Fixture {
        _dir: TempDir,
        fleet: MockFleet,
        registry: Arc<ProcessRegistry>,
        establisher: TunnelEstablisher,
    }

    fn fixture_with(fleet: MockFleet, connection_info: Option<&str>) -> Fixture {
        let dir = TempDir::new().unwrap();
        if let Some(info) = connection_info {
            std::fs::write(dir.path().join("connection_info"), info).unwrap();
        }
        let mut settings = BfhConfig::default();
        settings.general.ssh_dir = dir.path().to_path_buf();
        let registry = Arc::new(ProcessRegistry::new());
        let establisher = TunnelEstablisher::new(fleet.collaborators(), registry.clone(), settings);
        Fixture {
            _dir: dir,
            fleet,
            registry,
            establisher,
        }
    }

    fn fixture() -> Fixture {
        let fleet = MockFleet {
            transport: Arc::new(MockSpawner::silent()),
            ..MockFleet::default()
        };
        fixture_with(fleet, Some("prod-bastion bastion.example.com 45459\n"))
    }

    #[tokio::test]
    async fn test_open_spawns_autossh_and_close_is_idempotent() {
        let _guard = bfh_common::test_guard!();
        let fx = fixture();
        let handle = fx
            .establisher
            .open("prod-bastion", REMOTE, 30001, "https://vault.example.com")
            .await
            .unwrap();

        assert_eq!(fx.fleet.keygen.generated.load(Ordering::SeqCst), 1);
        assert_eq!(fx.fleet.authority.signed.load(Ordering::SeqCst), 1);
        assert_eq!(fx.registry.len(), 1);
        assert_eq!(handle.bastion_name.as_deref(), Some("prod-bastion"));

        let specs = fx.fleet.transport.specs();
        assert_eq!(specs.len(), 1);
        let spec = &specs[0];
        assert_eq!(spec.program, "autossh");
        assert_eq!(spec.env, vec![("AUTOSSH_GATETIME".to_string(), "0".to_string())]);
        assert!(spec.args.contains(&"127.0.0.1:30001:10-0-1-5.buildkit.pod.cluster.local:1234".to_string()));
        assert!(spec.args.contains(&"ServerAliveInterval=2".to_string()));
        assert!(spec.args.ends_with(&[
            "-p".to_string(),
            "45459".to_string(),
            "panfactum@bastion.example.com".to_string()
        ]));

        assert!(handle.close().await.is_some());
        assert!(fx.registry.is_empty());
        assert!(handle.close().await.is_none());
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_complete_keys_are_reused_but_resigned() {
        let fx = fixture();
        let keys = SignedKeyMaterial::for_bastion(&fx.establisher.settings.general.ssh_dir, "prod-bastion");
        std::fs::write(&keys.private_key, "k").unwrap();
        std::fs::write(&keys.public_key, "p").unwrap();
        std::fs::write(&keys.signed_certificate, "old").unwrap();

        let handle = fx
            .establisher
            .open("prod-bastion", REMOTE, 30002, "https://vault")
            .await
            .unwrap();
        assert_eq!(fx.fleet.keygen.generated.load(Ordering::SeqCst), 0);
        assert_eq!(fx.fleet.authority.signed.load(Ordering::SeqCst), 1);
        assert_ne!(std::fs::read_to_string(&keys.signed_certificate).unwrap(), "old");
        handle.close().await;
    }

    #[tokio::test]
    async fn test_partial_keys_are_regenerated() {
        let fx = fixture();
        let keys = SignedKeyMaterial::for_bastion(&fx.establisher.settings.general.ssh_dir, "prod-bastion");
        std::fs::write(&keys.public_key, "orphan").unwrap();

        let handle = fx
            .establisher
            .open("prod-bastion", REMOTE, 30003, "https://vault")
            .await
            .unwrap();
        assert_eq!(fx.fleet.keygen.generated.load(Ordering::SeqCst), 1);
        assert!(keys.is_complete());
        assert_ne!(std::fs::read_to_string(&keys.public_key).unwrap(), "orphan");
        handle.close().await;
    }

    #[tokio::test]
    async fn test_missing_connection_info_spawns_nothing() {
        let fleet = MockFleet {
            transport: Arc::new(MockSpawner::silent()),
            ..MockFleet::default()
        };
        let fx = fixture_with(fleet, None);
        let err = fx
            .establisher
            .open("prod-bastion", REMOTE, 30004, "https://vault")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BastionNotConfigured);
        assert!(fx.fleet.transport.specs().is_empty());
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_signing_failure_leaves_keys_without_certificate() {
        let fleet = MockFleet {
            authority: Arc::new(MockAuthority {
                fail: true,
                ..MockAuthority::default()
            }),
            transport: Arc::new(MockSpawner::silent()),
            ..MockFleet::default()
        };
        let fx = fixture_with(fleet, Some("prod-bastion bastion.example.com 22\n"));
        let err = fx
            .establisher
            .open("prod-bastion", REMOTE, 30005, "https://vault")
            .await
            .unwrap_err();
        assert!(matches!(err, BfhError::Authentication(_)));

        let keys = SignedKeyMaterial::for_bastion(&fx.establisher.settings.general.ssh_dir, "prod-bastion");
        assert!(keys.private_key.exists());
        assert!(!keys.signed_certificate.exists());
        assert!(fx.fleet.transport.specs().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_transport_error() {
        let fleet = MockFleet {
            transport: Arc::new(MockSpawner::failing()),
            ..MockFleet::default()
        };
        let fx = fixture_with(fleet, Some("prod-bastion bastion.example.com 22\n"));
        let err = fx
            .establisher
            .open("prod-bastion", REMOTE, 30006, "https://vault")
            .await
            .unwrap_err();
        assert!(matches!(err, BfhError::Transport(_)));
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let fx = fixture();
        for (remote, port) in [(REMOTE, 0), ("no-port", 30007), (":1234", 30007), ("host:0", 30007), ("host:http", 30007)] {
            let err = fx
                .establisher
                .open("prod-bastion", remote, port, "https://vault")
                .await
                .unwrap_err();
            assert!(matches!(err, BfhError::InvalidArgument(_)), "{remote} {port}");
        }
        assert!(fx.fleet.transport.specs().is_empty());
    }

    #[tokio::test]
    async fn test_open_direct_uses_port_forward() {
        let fx = fixture();
        let establisher = fx.establisher.with_kube_context(Some("prod".to_string()));
        let handle = establisher
            .open_direct("buildkit-arm64-0", 30008)
            .await
            .unwrap();
        assert!(handle.bastion_name.is_none());
        assert_eq!(handle.remote_address, "buildkit-arm64-0:1234");

        let spec = &fx.fleet.transport.specs()[0];
        assert_eq!(spec.program, "kubectl");
        assert_eq!(
            spec.args,
            [
                "--context",
                "prod",
                "-n",
                "buildkit",
                "port-forward",
                "pod/buildkit-arm64-0",
                "30008:1234",
                "--address",
                "127.0.0.1"
            ]
        );
        handle.close().await;
        assert!(fx.registry.is_empty());
    }
}
