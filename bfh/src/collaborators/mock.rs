//! In-memory collaborators for unit tests.

use super::*;
use bfh_common::BfhError;
use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// Fake pids sit above the Linux `pid_max` ceiling so they never name a
/// real process.
const FAKE_PID_BASE: u32 = 4_194_500;

#[derive(Debug, Default)]
pub struct ClusterState {
    pub replicas: HashMap<String, u32>,
    pub available: HashMap<String, u32>,
    /// Raw replica readings that override `replicas`.
    pub raw_replicas: HashMap<String, String>,
    pub annotations: HashMap<(String, String), String>,
    pub instances: Vec<RunningInstance>,
    pub scale_calls: Vec<(String, u32)>,
}

#[derive(Debug, Default)]
pub struct MockControlPlane {
    pub state: Mutex<ClusterState>,
    /// Mark scaled replicas available immediately.
    pub auto_ready: bool,
}

impl MockControlPlane {
    pub fn ready() -> Self {
        Self {
            auto_ready: true,
            ..Self::default()
        }
    }

    pub fn with_instance(self, name: &str, ip: &str, cpu_millis: u64) -> Self {
        self.lock().instances.push(RunningInstance {
            name: name.to_string(),
            ip: ip.to_string(),
            cpu_millis,
        });
        self
    }

    pub fn with_replicas(self, workload: &str, replicas: u32) -> Self {
        self.lock().replicas.insert(workload.to_string(), replicas);
        self
    }

    pub fn with_annotation(self, workload: &str, key: &str, value: &str) -> Self {
        self.lock()
            .annotations
            .insert((workload.to_string(), key.to_string()), value.to_string());
        self
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn replica_count(&self, workload: &str) -> Result<u32> {
        let state = self.lock();
        if let Some(raw) = state.raw_replicas.get(workload) {
            return super::kubectl::parse_count("replica count", raw);
        }
        Ok(state.replicas.get(workload).copied().unwrap_or(0))
    }

    async fn set_replica_count(&self, workload: &str, replicas: u32) -> Result<()> {
        let mut state = self.lock();
        state.scale_calls.push((workload.to_string(), replicas));
        state.replicas.insert(workload.to_string(), replicas);
        if self.auto_ready {
            state.available.insert(workload.to_string(), replicas);
        }
        Ok(())
    }

    async fn available_replica_count(&self, workload: &str) -> Result<u32> {
        Ok(self.lock().available.get(workload).copied().unwrap_or(0))
    }

    async fn list_running_instances(&self, filter: &str) -> Result<Vec<RunningInstance>> {
        Ok(self
            .lock()
            .instances
            .iter()
            .filter(|i| i.name.contains(filter))
            .cloned()
            .collect())
    }

    async fn annotation(&self, workload: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .lock()
            .annotations
            .get(&(workload.to_string(), key.to_string()))
            .cloned())
    }

    async fn set_annotation(&self, workload: &str, key: &str, value: &str) -> Result<()> {
        self.lock()
            .annotations
            .insert((workload.to_string(), key.to_string()), value.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MockAuthority {
    pub fail: bool,
    pub signed: AtomicU32,
}

#[async_trait]
impl CertificateAuthority for MockAuthority {
    async fn sign_public_key(&self, _authority: &str, public_key: &Path, token: &str) -> Result<String> {
        if self.fail {
            return Err(BfhError::Authentication("permission denied".to_string()));
        }
        assert!(public_key.exists(), "public key missing at signing time");
        assert!(!token.is_empty());
        self.signed.fetch_add(1, Ordering::SeqCst);
        Ok("ssh-ed25519-cert-v01@openssh.com AAAAtest".to_string())
    }
}

#[derive(Debug, Default)]
pub struct MockTokens;

#[async_trait]
impl TokenProvider for MockTokens {
    async fn bearer_token(&self, _authority: &str) -> Result<String> {
        Ok("hvs.test-token".to_string())
    }
}

/// Writes placeholder key files.
#[derive(Debug, Default)]
pub struct MockKeygen {
    pub generated: AtomicU32,
}

#[async_trait]
impl KeyGenerator for MockKeygen {
    async fn generate(&self, private_key: &Path, comment: &str) -> Result<()> {
        tokio::fs::write(private_key, "PRIVATE").await?;
        let mut public = private_key.as_os_str().to_owned();
        public.push(".pub");
        tokio::fs::write(public, format!("ssh-ed25519 AAAA {comment}")).await?;
        self.generated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records spawn requests and listens on the requested local port so
/// readiness checks succeed.
#[derive(Debug, Default)]
pub struct MockSpawner {
    pub fail: bool,
    /// Fail only spawns with an argument containing this text.
    pub fail_when: Option<String>,
    /// Skip listening, leaving the local port closed.
    pub silent: bool,
    pub spawned: Mutex<Vec<SpawnSpec>>,
    listeners: Mutex<Vec<TcpListener>>,
}

impl MockSpawner {
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn failing_when(needle: &str) -> Self {
        Self {
            fail_when: Some(needle.to_string()),
            ..Self::default()
        }
    }

    pub fn specs(&self) -> Vec<SpawnSpec> {
        self.spawned.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportSpawner for MockSpawner {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<u32> {
        let matched = self
            .fail_when
            .as_ref()
            .is_some_and(|needle| spec.args.iter().any(|a| a.contains(needle.as_str())));
        if self.fail || matched {
            return Err(BfhError::Transport(format!("{} not found on PATH", spec.program)));
        }
        if !self.silent {
            let listener = TcpListener::bind(("127.0.0.1", spec.local_port))?;
            self.listeners.lock().unwrap().push(listener);
        }
        let mut spawned = self.spawned.lock().unwrap();
        spawned.push(spec.clone());
        Ok(FAKE_PID_BASE + spawned.len() as u32)
    }
}

#[derive(Debug, Default)]
pub struct MockEngine {
    pub exit_codes: HashMap<Architecture, i32>,
    pub invocations: Mutex<Vec<BuildInvocation>>,
}

impl MockEngine {
    pub fn failing(arch: Architecture, code: i32) -> Self {
        Self {
            exit_codes: HashMap::from([(arch, code)]),
            ..Self::default()
        }
    }
}

#[async_trait]
impl BuildEngine for MockEngine {
    async fn build(&self, invocation: &BuildInvocation) -> Result<i32> {
        self.invocations.lock().unwrap().push(invocation.clone());
        Ok(self
            .exit_codes
            .get(&invocation.architecture)
            .copied()
            .unwrap_or(0))
    }
}

#[derive(Debug, Default)]
pub struct MockManifests {
    pub fail: bool,
    pub published: Mutex<Vec<(Vec<ImageReference>, String)>>,
}

#[async_trait]
impl ManifestAggregator for MockManifests {
    async fn publish(&self, images: &[ImageReference], target: &str) -> Result<()> {
        if self.fail {
            return Err(BfhError::PublishFailed("registry unavailable".to_string()));
        }
        self.published
            .lock()
            .unwrap()
            .push((images.to_vec(), target.to_string()));
        Ok(())
    }
}

/// Typed handles on every double, plus the trait-object bundle.
#[derive(Default)]
pub struct MockFleet {
    pub control_plane: Arc<MockControlPlane>,
    pub authority: Arc<MockAuthority>,
    pub keygen: Arc<MockKeygen>,
    pub transport: Arc<MockSpawner>,
    pub engine: Arc<MockEngine>,
    pub manifests: Arc<MockManifests>,
}

impl MockFleet {
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            control_plane: self.control_plane.clone(),
            authority: self.authority.clone(),
            tokens: Arc::new(MockTokens),
            keygen: self.keygen.clone(),
            transport: self.transport.clone(),
            engine: self.engine.clone(),
            manifests: self.manifests.clone(),
        }
    }
}
