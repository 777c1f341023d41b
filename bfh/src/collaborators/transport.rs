//! Detached forwarding processes (autossh, kubectl port-forward).

use super::{SpawnSpec, TransportSpawner};
use async_trait::async_trait;
use bfh_common::util::render_for_log;
use bfh_common::{BfhError, Result};
use std::process::Stdio;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessSpawner;

#[async_trait]
impl TransportSpawner for ProcessSpawner {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<u32> {
        let program = which::which(&spec.program).map_err(|e| {
            BfhError::Transport(format!("{} not found on PATH: {e}", spec.program))
        })?;

        debug!(
            local_port = spec.local_port,
            command = %render_for_log(&spec.env, &spec.program, &spec.args),
            "Spawning background process"
        );
        let mut child = tokio::process::Command::new(&program)
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| BfhError::Transport(format!("failed to start {}: {e}", spec.program)))?;

        let pid = child.id().ok_or_else(|| {
            BfhError::Transport(format!("{} exited before reporting a pid", spec.program))
        })?;

        // Reap the child whenever it exits so it never lingers as a zombie.
        let description = spec.description.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(pid, %description, %status, "Background process exited"),
                Err(e) => debug!(pid, %description, error = %e, "Failed to wait on background process"),
            }
        });

        info!(pid, description = %spec.description, "Started background process");
        Ok(pid)
    }
}
