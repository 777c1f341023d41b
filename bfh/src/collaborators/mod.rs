//! Interfaces to the external systems BFH drives.
//!
//! Each trait has one production adapter that shells out to the usual CLI
//! tool and, under `cfg(test)`, an in-memory double in [`mock`].

pub mod buildctl;
pub mod keygen;
pub mod kubectl;
pub mod manifest;
pub mod transport;
pub mod vault;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use bfh_common::{Architecture, BfhConfig, Result};
use std::path::Path;
use std::sync::Arc;

pub use buildctl::BuildctlEngine;
pub use keygen::SshKeygen;
pub use kubectl::KubectlControlPlane;
pub use manifest::ManifestTool;
pub use transport::ProcessSpawner;
pub use vault::{VaultAuthority, VaultTokenProvider};

/// A running workload instance as seen by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningInstance {
    pub name: String,
    /// Cluster-internal IP address.
    pub ip: String,
    /// Current CPU usage in millicores; 0 when metrics are unavailable.
    pub cpu_millis: u64,
}

/// Container orchestrator control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Desired replica count of `workload`.
    async fn replica_count(&self, workload: &str) -> Result<u32>;

    async fn set_replica_count(&self, workload: &str, replicas: u32) -> Result<()>;

    /// Replicas currently available. An empty reading counts as 0.
    async fn available_replica_count(&self, workload: &str) -> Result<u32>;

    /// Running instances whose name contains `filter`.
    async fn list_running_instances(&self, filter: &str) -> Result<Vec<RunningInstance>>;

    async fn annotation(&self, workload: &str, key: &str) -> Result<Option<String>>;

    /// Set (overwrite) an annotation on `workload`.
    async fn set_annotation(&self, workload: &str, key: &str, value: &str) -> Result<()>;
}

/// Signs SSH public keys.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Returns the signed certificate for the key at `public_key`.
    async fn sign_public_key(&self, authority: &str, public_key: &Path, token: &str)
    -> Result<String>;
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self, authority: &str) -> Result<String>;
}

#[async_trait]
pub trait KeyGenerator: Send + Sync {
    /// Write a fresh key pair to `private_key` and `<private_key>.pub`.
    async fn generate(&self, private_key: &Path, comment: &str) -> Result<()>;
}

/// A long-lived forwarding process to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Short human description used in the process registry.
    pub description: String,
    /// Local port the process is expected to listen on.
    pub local_port: u16,
}

#[async_trait]
pub trait TransportSpawner: Send + Sync {
    /// Start the process in the background and return its pid.
    async fn spawn(&self, spec: &SpawnSpec) -> Result<u32>;
}

/// One architecture's build request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInvocation {
    pub architecture: Architecture,
    /// `tcp://127.0.0.1:<port>` of the tunnel to this architecture's engine.
    pub buildkit_host: String,
    /// Arguments after `build`.
    pub args: Vec<String>,
}

#[async_trait]
pub trait BuildEngine: Send + Sync {
    /// Run the build, streaming its output, and return the exit status.
    async fn build(&self, invocation: &BuildInvocation) -> Result<i32>;
}

/// A pushed per-architecture image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub architecture: Architecture,
    pub reference: String,
}

#[async_trait]
pub trait ManifestAggregator: Send + Sync {
    /// Publish one manifest at `target` covering every image in `images`.
    async fn publish(&self, images: &[ImageReference], target: &str) -> Result<()>;
}

/// The full set of collaborators a command may need.
#[derive(Clone)]
pub struct Collaborators {
    pub control_plane: Arc<dyn ControlPlane>,
    pub authority: Arc<dyn CertificateAuthority>,
    pub tokens: Arc<dyn TokenProvider>,
    pub keygen: Arc<dyn KeyGenerator>,
    pub transport: Arc<dyn TransportSpawner>,
    pub engine: Arc<dyn BuildEngine>,
    pub manifests: Arc<dyn ManifestAggregator>,
}

impl Collaborators {
    /// CLI-backed adapters. `kube_context` selects the cluster.
    pub fn production(kube_context: Option<String>, settings: &BfhConfig) -> Self {
        Self {
            control_plane: Arc::new(KubectlControlPlane::new(
                kube_context,
                settings.capacity.namespace.clone(),
            )),
            authority: Arc::new(VaultAuthority),
            tokens: Arc::new(VaultTokenProvider::default()),
            keygen: Arc::new(SshKeygen),
            transport: Arc::new(ProcessSpawner),
            engine: Arc::new(BuildctlEngine),
            manifests: Arc::new(ManifestTool),
        }
    }
}
