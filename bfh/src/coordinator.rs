//! One multi-architecture image build, end to end.
//!
//! ```text
//! Validating → ProvisioningPorts → ScalingCapacity → EstablishingTunnels
//!   → AwaitingReadiness → Building → Publishing → Cleanup → Succeeded | Failed
//! ```
//!
//! Every tunnel is recorded the moment it opens, and Cleanup closes all of
//! them on success, failure and interrupt. If the run future itself is
//! dropped before Cleanup, a `Drop` guard sends SIGTERM to whatever is
//! still open.

use crate::capacity::CapacityController;
use crate::collaborators::{BuildInvocation, Collaborators, ImageReference};
use crate::shutdown::ShutdownSignal;
use crate::tunnel::{TunnelEstablisher, TunnelHandle};
use bfh_common::process::{Signal, signal_tree};
use bfh_common::{
    ArchFailure, Architecture, BfhConfig, BfhError, BuildEndpoint, BuildKitConfig, PortAllocator,
    ProcessRegistry, Result, wait_for_port,
};
use futures::future::join_all;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BuildPhase {
    Validating,
    ProvisioningPorts,
    ScalingCapacity,
    EstablishingTunnels,
    AwaitingReadiness,
    Building,
    Publishing,
    Cleanup,
    Succeeded,
    Failed,
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub repository: String,
    pub tag: String,
    pub dockerfile: PathBuf,
    pub context: PathBuf,
    /// Architectures to build; duplicates are ignored.
    pub architectures: Vec<Architecture>,
    /// Passed through to every build after the generated arguments.
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub run_id: Uuid,
    pub phases: Vec<BuildPhase>,
    pub images: Vec<ImageReference>,
    /// Manifest reference covering every image.
    pub target: String,
}

#[derive(Debug, Error)]
#[error("build failed during {failed_in}: {error}")]
pub struct BuildFailure {
    pub run_id: Uuid,
    /// Last phase entered before the failure.
    pub failed_in: BuildPhase,
    pub phases: Vec<BuildPhase>,
    #[source]
    pub error: BfhError,
}

/// Phase log and open tunnels of a single run.
struct RunState {
    phases: Mutex<Vec<BuildPhase>>,
    tunnels: Mutex<Vec<Arc<TunnelHandle>>>,
    registry: Arc<ProcessRegistry>,
    cleaned: AtomicBool,
}

impl RunState {
    fn new(registry: Arc<ProcessRegistry>) -> Self {
        Self {
            phases: Mutex::new(Vec::new()),
            tunnels: Mutex::new(Vec::new()),
            registry,
            cleaned: AtomicBool::new(false),
        }
    }

    fn phase_log(&self) -> MutexGuard<'_, Vec<BuildPhase>> {
        self.phases.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn open_tunnels(&self) -> MutexGuard<'_, Vec<Arc<TunnelHandle>>> {
        self.tunnels.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn enter(&self, phase: BuildPhase) {
        debug!(%phase, "Entering phase");
        self.phase_log().push(phase);
    }

    fn current(&self) -> BuildPhase {
        self.phase_log()
            .last()
            .copied()
            .unwrap_or(BuildPhase::Validating)
    }

    fn phases(&self) -> Vec<BuildPhase> {
        self.phase_log().clone()
    }

    fn track(&self, handle: TunnelHandle) -> Arc<TunnelHandle> {
        let handle = Arc::new(handle);
        self.open_tunnels().push(handle.clone());
        handle
    }

    /// Close every tracked tunnel. Only the first call does anything.
    async fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        self.enter(BuildPhase::Cleanup);
        let tunnels = std::mem::take(&mut *self.open_tunnels());
        if !tunnels.is_empty() {
            info!(count = tunnels.len(), "Closing tunnels");
        }
        join_all(tunnels.iter().map(|t| t.close())).await;
    }
}

impl Drop for RunState {
    fn drop(&mut self) {
        let tunnels = std::mem::take(&mut *self.open_tunnels());
        for tunnel in tunnels.iter().filter(|t| !t.is_closed()) {
            warn!(pid = tunnel.pid, "Run ended without cleanup; signalling tunnel");
            signal_tree(tunnel.pid, Signal::Term);
            self.registry.remove(tunnel.pid);
        }
    }
}

/// Per-architecture resources planned for a run.
struct Lane {
    architecture: Architecture,
    local_port: u16,
    endpoint: BuildEndpoint,
}

pub struct BuildCoordinator {
    collaborators: Collaborators,
    registry: Arc<ProcessRegistry>,
    settings: BfhConfig,
    buildkit: BuildKitConfig,
    ports: PortAllocator,
    capacity: CapacityController,
    tunnels: TunnelEstablisher,
}

impl BuildCoordinator {
    pub fn new(
        collaborators: Collaborators,
        registry: Arc<ProcessRegistry>,
        settings: BfhConfig,
        buildkit: BuildKitConfig,
    ) -> Self {
        let capacity = CapacityController::new(
            collaborators.control_plane.clone(),
            settings.capacity.clone(),
        );
        let tunnels =
            TunnelEstablisher::new(collaborators.clone(), registry.clone(), settings.clone())
                .with_kube_context(Some(buildkit.cluster.clone()));
        Self {
            ports: PortAllocator::new(settings.ports),
            collaborators,
            registry,
            settings,
            buildkit,
            capacity,
            tunnels,
        }
    }

    /// `<registry>/<repository>:<tag>`.
    pub fn target(&self, request: &BuildRequest) -> String {
        format!(
            "{}/{}:{}",
            self.buildkit.registry, request.repository, request.tag
        )
    }

    /// Execute the build. Cleanup runs before this returns, whatever the
    /// outcome, including when `shutdown` fires mid-run.
    pub async fn run(
        &self,
        request: &BuildRequest,
        shutdown: &ShutdownSignal,
    ) -> std::result::Result<BuildReport, BuildFailure> {
        let run_id = Uuid::new_v4();
        let span = info_span!("build", %run_id, repo = %request.repository, tag = %request.tag);

        async {
            let state = RunState::new(self.registry.clone());
            let outcome = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    warn!(phase = %state.current(), "Interrupted; cleaning up");
                    Err(BfhError::Cancelled)
                }
                result = self.pipeline(request, &state) => result,
            };

            let failed_in = state.current();
            state.cleanup().await;

            match outcome {
                Ok(images) => {
                    state.enter(BuildPhase::Succeeded);
                    info!(manifest = %self.target(request), "Build succeeded");
                    Ok(BuildReport {
                        run_id,
                        phases: state.phases(),
                        images,
                        target: self.target(request),
                    })
                }
                Err(error) => {
                    state.enter(BuildPhase::Failed);
                    warn!(phase = %failed_in, error = %error, "Build failed");
                    Err(BuildFailure {
                        run_id,
                        failed_in,
                        phases: state.phases(),
                        error,
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn pipeline(&self, request: &BuildRequest, state: &RunState) -> Result<Vec<ImageReference>> {
        state.enter(BuildPhase::Validating);
        let architectures = validate(request)?;
        let authority = if self.buildkit.in_cluster {
            None
        } else {
            Some(self.buildkit.authority_address()?)
        };

        state.enter(BuildPhase::ProvisioningPorts);
        let ports = self.ports.allocate(architectures.len())?;
        debug!(?ports, "Allocated local ports");

        state.enter(BuildPhase::ScalingCapacity);
        let timeout = Duration::from_secs(self.settings.capacity.scale_timeout_secs);
        self.capacity.scale_up(&architectures, true, timeout).await?;
        let endpoints = join_all(
            architectures
                .iter()
                .map(|arch| self.capacity.resolve_endpoint(*arch)),
        )
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()?;
        let lanes: Vec<Lane> = architectures
            .iter()
            .zip(ports)
            .zip(endpoints)
            .map(|((architecture, local_port), endpoint)| Lane {
                architecture: *architecture,
                local_port,
                endpoint,
            })
            .collect();

        state.enter(BuildPhase::EstablishingTunnels);
        join_all(lanes.iter().map(|lane| async {
            let handle = match &authority {
                Some(authority) => {
                    self.tunnels
                        .open(
                            &self.buildkit.bastion,
                            &lane.endpoint.address,
                            lane.local_port,
                            authority,
                        )
                        .await?
                }
                None => {
                    self.tunnels
                        .open_direct(&lane.endpoint.instance, lane.local_port)
                        .await?
                }
            };
            state.track(handle);
            Ok::<_, BfhError>(())
        }))
        .await
        .into_iter()
        .collect::<Result<Vec<()>>>()?;

        state.enter(BuildPhase::AwaitingReadiness);
        let readiness = self.settings.readiness_policy();
        join_all(
            lanes
                .iter()
                .map(|lane| wait_for_port("127.0.0.1", lane.local_port, &readiness)),
        )
        .await
        .into_iter()
        .collect::<Result<Vec<()>>>()?;

        state.enter(BuildPhase::Building);
        let invocations: Vec<BuildInvocation> = lanes
            .iter()
            .map(|lane| BuildInvocation {
                architecture: lane.architecture,
                buildkit_host: format!("tcp://127.0.0.1:{}", lane.local_port),
                args: self.build_args(request, lane.architecture),
            })
            .collect();
        let statuses = join_all(
            invocations
                .iter()
                .map(|inv| self.collaborators.engine.build(inv)),
        )
        .await;

        let mut failures = Vec::new();
        for (lane, status) in lanes.iter().zip(statuses) {
            let exit_code = status?;
            if exit_code != 0 {
                failures.push(ArchFailure {
                    architecture: lane.architecture,
                    exit_code,
                });
            }
        }
        if !failures.is_empty() {
            return Err(BfhError::BuildFailed { failures });
        }

        state.enter(BuildPhase::Publishing);
        let target = self.target(request);
        let images: Vec<ImageReference> = architectures
            .iter()
            .map(|arch| ImageReference {
                architecture: *arch,
                reference: format!("{target}-{arch}"),
            })
            .collect();
        self.collaborators
            .manifests
            .publish(&images, &target)
            .await
            .map_err(|e| match e {
                BfhError::PublishFailed(_) => e,
                other => BfhError::PublishFailed(other.to_string()),
            })?;
        Ok(images)
    }

    /// Arguments after `buildctl build` for one architecture.
    fn build_args(&self, request: &BuildRequest, arch: Architecture) -> Vec<String> {
        let repo = format!("{}/{}", self.buildkit.registry, request.repository);
        let cache = format!(
            "type=s3,region={},bucket={},name={repo}",
            self.buildkit.cache_bucket_region, self.buildkit.cache_bucket
        );
        let dockerfile_dir = request
            .dockerfile
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let dockerfile_name = request
            .dockerfile
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Dockerfile".to_string());

        let mut args = vec![
            "--frontend=dockerfile.v0".to_string(),
            "--output".to_string(),
            format!("type=image,name={repo}:{}-{arch},push=true", request.tag),
            "--local".to_string(),
            format!("context={}", request.context.display()),
            "--local".to_string(),
            format!("dockerfile={}", dockerfile_dir.display()),
            "--opt".to_string(),
            format!("filename=./{dockerfile_name}"),
            "--opt".to_string(),
            format!("platform={}", arch.platform()),
            "--export-cache".to_string(),
            cache.clone(),
            "--import-cache".to_string(),
            cache,
            "--progress".to_string(),
            "plain".to_string(),
        ];
        args.extend(request.extra_args.iter().cloned());
        args
    }
}

/// Check the inputs and return the deduplicated architecture list.
fn validate(request: &BuildRequest) -> Result<Vec<Architecture>> {
    if request.repository.is_empty() || request.tag.is_empty() {
        return Err(BfhError::InvalidArgument(
            "repository and tag must not be empty".to_string(),
        ));
    }
    if !request.dockerfile.is_file() {
        return Err(BfhError::NotFound {
            what: "dockerfile".to_string(),
            path: request.dockerfile.clone(),
        });
    }
    if !request.context.is_dir() {
        return Err(BfhError::NotFound {
            what: "build context".to_string(),
            path: request.context.clone(),
        });
    }

    let mut architectures = Vec::new();
    for arch in &request.architectures {
        if !architectures.contains(arch) {
            architectures.push(*arch);
        }
    }
    if architectures.is_empty() {
        return Err(BfhError::InvalidArgument(
            "at least one architecture is required".to_string(),
        ));
    }
    Ok(architectures)
}
