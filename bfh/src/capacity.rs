//! Scaling the per-architecture build engine pools.
//!
//! Each architecture has one workload named `<prefix><arch>`. Scale-up
//! brings it from 0 to 1 and stamps the last-build annotation; scale-down
//! returns it to 0, optionally only once it has been idle long enough.

use crate::collaborators::ControlPlane;
use bfh_common::config::CapacityConfig;
use bfh_common::{Architecture, BfhError, BuildEndpoint, Result};
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Snapshot of one architecture's pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildCapacityState {
    pub workload: String,
    pub current_replicas: u32,
    pub available_replicas: u32,
    /// Unix seconds of the last recorded build.
    pub last_build_timestamp: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDownDecision {
    ScaledDown,
    AlreadyDown,
    /// Built within the idle threshold.
    Skipped { idle_secs: i64 },
}

pub struct CapacityController {
    control_plane: Arc<dyn ControlPlane>,
    settings: CapacityConfig,
}

impl CapacityController {
    pub fn new(control_plane: Arc<dyn ControlPlane>, settings: CapacityConfig) -> Self {
        Self {
            control_plane,
            settings,
        }
    }

    pub fn workload(&self, arch: Architecture) -> String {
        format!("{}{}", self.settings.workload_prefix, arch)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.settings.poll_interval_secs)
    }

    pub async fn state(&self, arch: Architecture) -> Result<BuildCapacityState> {
        let workload = self.workload(arch);
        let current_replicas = self.control_plane.replica_count(&workload).await?;
        let available_replicas = self.control_plane.available_replica_count(&workload).await?;
        let last_build_timestamp = self.last_build_time(arch).await?;
        Ok(BuildCapacityState {
            workload,
            current_replicas,
            available_replicas,
            last_build_timestamp,
        })
    }

    /// Ensure every architecture has at least one replica and record a build.
    /// With `wait`, block until each has an available replica; the deadline
    /// is shared across architectures.
    pub async fn scale_up(
        &self,
        architectures: &[Architecture],
        wait: bool,
        timeout: Duration,
    ) -> Result<()> {
        join_all(architectures.iter().map(|arch| self.scale_up_one(*arch)))
            .await
            .into_iter()
            .collect::<Result<Vec<()>>>()?;

        if wait {
            self.wait_until_available(architectures, timeout).await?;
        }
        Ok(())
    }

    async fn scale_up_one(&self, arch: Architecture) -> Result<()> {
        let workload = self.workload(arch);
        let replicas = self.control_plane.replica_count(&workload).await?;
        if replicas == 0 {
            info!(%workload, "Scaling up from 0 replicas");
            self.control_plane.set_replica_count(&workload, 1).await?;
        } else {
            debug!(%workload, replicas, "Already scaled up");
        }
        self.record_build(arch).await
    }

    async fn wait_until_available(
        &self,
        architectures: &[Architecture],
        timeout: Duration,
    ) -> Result<()> {
        let started = Instant::now();
        for arch in architectures {
            let workload = self.workload(*arch);
            loop {
                let available = self.control_plane.available_replica_count(&workload).await?;
                if available >= 1 {
                    info!(%workload, available, "Build engine available");
                    break;
                }
                let elapsed = started.elapsed();
                if elapsed >= timeout {
                    return Err(BfhError::Timeout {
                        what: format!("{workload} to become available"),
                        after: timeout,
                    });
                }
                debug!(%workload, "Waiting for an available replica");
                tokio::time::sleep(self.poll_interval().min(timeout - elapsed)).await;
            }
        }
        Ok(())
    }

    /// Scale every architecture to 0. With `idle_threshold` (seconds), an
    /// architecture built more recently than that is left alone.
    pub async fn scale_down(
        &self,
        architectures: &[Architecture],
        idle_threshold: Option<u64>,
    ) -> Result<Vec<(Architecture, ScaleDownDecision)>> {
        let decisions = join_all(
            architectures
                .iter()
                .map(|arch| self.scale_down_one(*arch, idle_threshold)),
        )
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()?;
        Ok(architectures.iter().copied().zip(decisions).collect())
    }

    async fn scale_down_one(
        &self,
        arch: Architecture,
        idle_threshold: Option<u64>,
    ) -> Result<ScaleDownDecision> {
        let workload = self.workload(arch);

        // The annotation only matters when there is a threshold to compare with.
        if let Some(threshold) = idle_threshold
            && let Some(last) = self.last_build_time(arch).await?
        {
            // A stamp from the future counts as a build just now.
            let idle_secs = (chrono::Utc::now().timestamp() - last).max(0);
            if idle_secs.unsigned_abs() <= threshold {
                info!(%workload, idle_secs, threshold, "Recent build; not scaling down");
                return Ok(ScaleDownDecision::Skipped { idle_secs });
            }
        }

        // The prior count only labels the outcome; the scale call is made
        // regardless so a racing scale-up is still undone.
        let previous = self.control_plane.replica_count(&workload).await;
        info!(%workload, "Scaling down to 0 replicas");
        self.control_plane.set_replica_count(&workload, 0).await?;
        match previous {
            Ok(0) => Ok(ScaleDownDecision::AlreadyDown),
            Ok(_) => Ok(ScaleDownDecision::ScaledDown),
            Err(e) => {
                debug!(%workload, error = %e, "Could not read prior replica count");
                Ok(ScaleDownDecision::ScaledDown)
            }
        }
    }

    /// Stamp the current time on the workload's last-build annotation.
    pub async fn record_build(&self, arch: Architecture) -> Result<()> {
        let now = chrono::Utc::now().timestamp().to_string();
        self.control_plane
            .set_annotation(&self.workload(arch), &self.settings.annotation_key, &now)
            .await
    }

    pub async fn last_build_time(&self, arch: Architecture) -> Result<Option<i64>> {
        let Some(raw) = self
            .control_plane
            .annotation(&self.workload(arch), &self.settings.annotation_key)
            .await?
        else {
            return Ok(None);
        };
        raw.trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| BfhError::InvalidResponse {
                what: "last build timestamp".to_string(),
                value: raw,
            })
    }

    /// The running instance for `arch` with the lowest CPU usage.
    pub async fn resolve_endpoint(&self, arch: Architecture) -> Result<BuildEndpoint> {
        let instances = self.control_plane.list_running_instances(arch.as_str()).await?;
        let chosen = instances
            .into_iter()
            .min_by_key(|i| i.cpu_millis)
            .ok_or(BfhError::CapacityUnavailable { architecture: arch })?;
        debug!(instance = %chosen.name, cpu_millis = chosen.cpu_millis, "Selected build engine");
        Ok(BuildEndpoint {
            address: format!(
                "{}.{}.pod.cluster.local:{}",
                chosen.ip.replace('.', "-"),
                self.settings.namespace,
                self.settings.buildkit_port
            ),
            instance: chosen.name,
        })
    }
}
