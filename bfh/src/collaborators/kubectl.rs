//! Control plane adapter backed by `kubectl`.

use super::{ControlPlane, RunningInstance};
use async_trait::async_trait;
use bfh_common::{BfhError, ExternalCommand, Result};
use futures::future::join_all;
use std::collections::HashMap;
use tracing::{debug, trace};

const RUNNING_PODS_JSONPATH: &str = r#"-o=jsonpath={range .items[?(@.status.phase=="Running")]}{.metadata.name}{" "}{.status.podIP}{"\n"}{end}"#;

#[derive(Debug, Clone)]
pub struct KubectlControlPlane {
    context: Option<String>,
    namespace: String,
}

impl KubectlControlPlane {
    pub fn new(context: Option<String>, namespace: impl Into<String>) -> Self {
        Self {
            context,
            namespace: namespace.into(),
        }
    }

    fn command(&self, args: &[&str]) -> ExternalCommand {
        let mut cmd = ExternalCommand::new("kubectl");
        if let Some(ctx) = &self.context {
            cmd = cmd.args(["--context", ctx.as_str()]);
        }
        cmd.args(args.iter().copied())
            .args(["-n", self.namespace.as_str()])
    }

    async fn cpu_millis(&self, pod: &str) -> u64 {
        let result = self
            .command(&[
                "get",
                "pods.metrics.k8s.io",
                pod,
                "-o=jsonpath={.containers[*].usage.cpu}",
            ])
            .run()
            .await;
        match result {
            Ok(raw) => parse_cpu_millis(&raw),
            Err(e) => {
                debug!(pod, error = %e, "No metrics for pod; treating usage as 0");
                0
            }
        }
    }
}

#[async_trait]
impl ControlPlane for KubectlControlPlane {
    async fn replica_count(&self, workload: &str) -> Result<u32> {
        let raw = self
            .command(&["get", "statefulset", workload, "-o=jsonpath={.spec.replicas}"])
            .run()
            .await?;
        parse_count("replica count", &raw)
    }

    async fn set_replica_count(&self, workload: &str, replicas: u32) -> Result<()> {
        let flag = format!("--replicas={replicas}");
        self.command(&["scale", "statefulset", workload, &flag])
            .run()
            .await?;
        Ok(())
    }

    async fn available_replica_count(&self, workload: &str) -> Result<u32> {
        let raw = self
            .command(&[
                "get",
                "statefulset",
                workload,
                "-o=jsonpath={.status.availableReplicas}",
            ])
            .run()
            .await?;
        if raw.is_empty() {
            return Ok(0);
        }
        parse_count("available replica count", &raw)
    }

    async fn list_running_instances(&self, filter: &str) -> Result<Vec<RunningInstance>> {
        let raw = self
            .command(&["get", "pods", RUNNING_PODS_JSONPATH])
            .run()
            .await?;
        let pods: Vec<(String, String)> = parse_running_pods(&raw)
            .into_iter()
            .filter(|(name, _)| name.contains(filter))
            .collect();
        trace!(filter, count = pods.len(), "Running pods matched");

        let usage = join_all(pods.iter().map(|(name, _)| self.cpu_millis(name))).await;
        Ok(pods
            .into_iter()
            .zip(usage)
            .map(|((name, ip), cpu_millis)| RunningInstance {
                name,
                ip,
                cpu_millis,
            })
            .collect())
    }

    async fn annotation(&self, workload: &str, key: &str) -> Result<Option<String>> {
        let raw = self
            .command(&[
                "get",
                "statefulset",
                workload,
                "-o=jsonpath={.metadata.annotations}",
            ])
            .run()
            .await?;
        Ok(parse_annotations(&raw)?.remove(key))
    }

    async fn set_annotation(&self, workload: &str, key: &str, value: &str) -> Result<()> {
        let pair = format!("{key}={value}");
        self.command(&["annotate", "statefulset", workload, &pair, "--overwrite"])
            .run()
            .await?;
        Ok(())
    }
}

/// Strictly decimal, non-negative count.
pub(crate) fn parse_count(what: &str, raw: &str) -> Result<u32> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BfhError::InvalidResponse {
            what: what.to_string(),
            value: raw.to_string(),
        });
    }
    trimmed.parse().map_err(|_| BfhError::InvalidResponse {
        what: what.to_string(),
        value: raw.to_string(),
    })
}

/// Total CPU across containers in millicores. Quantities are `250m`,
/// `1` (cores), `1500u` or `123456n`; anything unreadable counts as 0.
fn parse_cpu_millis(raw: &str) -> u64 {
    raw.split_whitespace()
        .map(|q| {
            let parse = |s: &str| s.parse::<u64>().unwrap_or(0);
            if let Some(n) = q.strip_suffix('n') {
                parse(n) / 1_000_000
            } else if let Some(u) = q.strip_suffix('u') {
                parse(u) / 1_000
            } else if let Some(m) = q.strip_suffix('m') {
                parse(m)
            } else {
                parse(q).saturating_mul(1000)
            }
        })
        .sum()
}

/// `<name> <ip>` per line. Pods without an IP yet are skipped.
fn parse_running_pods(raw: &str) -> Vec<(String, String)> {
    raw.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next()?;
            let ip = parts.next()?;
            Some((name.to_string(), ip.to_string()))
        })
        .collect()
}

fn parse_annotations(raw: &str) -> Result<HashMap<String, String>> {
    if raw.trim().is_empty() {
        return Ok(HashMap::new());
    }
    serde_json::from_str(raw).map_err(|_| BfhError::InvalidResponse {
        what: "annotations".to_string(),
        value: raw.to_string(),
    })
}
