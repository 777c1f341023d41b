//! Table of background processes spawned by this invocation.
//!
//! Every long-lived child (tunnel transports, port-forwards) is registered
//! here so that it can be torn down on success, failure, interrupt, or a
//! panic unwinding through a `Drop` guard.

use super::signal::{Signal, is_process_alive, is_protected, send_signal, signal_tree};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A tracked OS process. Identity is the pid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackgroundProcess {
    pub pid: u32,
    pub command: String,
    pub description: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl BackgroundProcess {
    pub fn new(pid: u32, command: impl Into<String>) -> Self {
        Self {
            pid,
            command: command.into(),
            description: None,
            registered_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn label(&self) -> String {
        match &self.description {
            Some(desc) => format!("{} ({})", self.command, desc),
            None => self.command.clone(),
        }
    }
}

/// How [`ProcessRegistry::terminate`] escalates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    /// SIGKILL is sent once this much time has passed after SIGTERM.
    pub graceful_timeout: Duration,
    /// Signal the whole process tree rather than just the pid.
    pub kill_children: bool,
    pub poll_interval: Duration,
    /// Extra wait after the graceful timeout before the entry is dropped
    /// regardless of what the OS reports.
    pub safety_margin: Duration,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            graceful_timeout: Duration::from_secs(5),
            kill_children: true,
            poll_interval: Duration::from_millis(100),
            safety_margin: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// The process was already gone before any signal was sent.
    AlreadyExited,
    /// The process exited after SIGTERM, or after SIGKILL when `forced`.
    Exited { forced: bool },
    /// Still reported alive at the safety deadline; entry dropped anyway.
    Abandoned,
    /// Protected pid; never signalled.
    Refused,
}

/// Registry of background processes, shared by `Arc`.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    processes: Mutex<Vec<BackgroundProcess>>,
    policy: TerminationPolicy,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: TerminationPolicy) -> Self {
        Self {
            processes: Mutex::new(Vec::new()),
            policy,
        }
    }

    pub fn policy(&self) -> TerminationPolicy {
        self.policy
    }

    fn table(&self) -> MutexGuard<'_, Vec<BackgroundProcess>> {
        self.processes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track a process. `pid == 0` is ignored.
    pub fn register(&self, process: BackgroundProcess) {
        if process.pid == 0 {
            warn!(command = %process.command, "Ignoring background process with pid 0");
            return;
        }
        debug!(pid = process.pid, process = %process.label(), "Tracking background process");
        let mut table = self.table();
        table.retain(|p| p.pid != process.pid);
        table.push(process);
    }

    /// Stop tracking `pid` without signalling it.
    pub fn remove(&self, pid: u32) -> Option<BackgroundProcess> {
        let mut table = self.table();
        let idx = table.iter().position(|p| p.pid == pid)?;
        let removed = table.remove(idx);
        debug!(pid, process = %removed.label(), "Stopped tracking background process");
        Some(removed)
    }

    pub fn find(&self, pid: u32) -> Option<BackgroundProcess> {
        self.table().iter().find(|p| p.pid == pid).cloned()
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    pub fn snapshot(&self) -> Vec<BackgroundProcess> {
        self.table().clone()
    }

    /// Forget every entry without signalling anything.
    pub fn clear(&self) {
        self.table().clear();
        debug!("Cleared background process registry");
    }

    fn deliver(pid: u32, signal: Signal, tree: bool) {
        if tree {
            let reached = signal_tree(pid, signal);
            debug!(pid, %signal, reached, "Signalled process tree");
        } else {
            send_signal(pid, signal);
        }
    }

    /// Terminate `pid` with the registry's default policy.
    pub async fn terminate(&self, pid: u32) -> TerminationOutcome {
        self.terminate_with(pid, &self.policy).await
    }

    /// SIGTERM, then SIGKILL after `graceful_timeout`, polling liveness
    /// every `poll_interval`. The entry is removed as soon as the process
    /// is gone, or at `graceful_timeout + safety_margin` at the latest.
    pub async fn terminate_with(&self, pid: u32, policy: &TerminationPolicy) -> TerminationOutcome {
        let label = self
            .find(pid)
            .map(|p| p.label())
            .unwrap_or_else(|| format!("pid {pid}"));

        if is_protected(pid) {
            warn!(pid, "Refusing to terminate protected pid");
            self.remove(pid);
            return TerminationOutcome::Refused;
        }

        if !is_process_alive(pid) {
            self.remove(pid);
            return TerminationOutcome::AlreadyExited;
        }

        Self::deliver(pid, Signal::Term, policy.kill_children);
        debug!(pid, process = %label, "Sent SIGTERM");

        let started = Instant::now();
        let deadline = policy.graceful_timeout + policy.safety_margin;
        let mut forced = false;
        loop {
            tokio::time::sleep(policy.poll_interval).await;

            if !is_process_alive(pid) {
                self.remove(pid);
                return TerminationOutcome::Exited { forced };
            }

            let elapsed = started.elapsed();
            if !forced && elapsed >= policy.graceful_timeout {
                Self::deliver(pid, Signal::Kill, policy.kill_children);
                debug!(pid, process = %label, "Sent SIGKILL after graceful timeout");
                forced = true;
            }
            if elapsed >= deadline {
                warn!(pid, process = %label, "Process still alive after SIGKILL; no longer tracking it");
                self.remove(pid);
                return TerminationOutcome::Abandoned;
            }
        }
    }

    /// Terminate every tracked process concurrently.
    pub async fn terminate_all(&self) {
        let processes = self.snapshot();
        if processes.is_empty() {
            debug!("No background processes to terminate");
            return;
        }

        info!(count = processes.len(), "Terminating background processes");
        for p in &processes {
            debug!(pid = p.pid, process = %p.label(), "  pending termination");
        }

        let policy = self.policy;
        join_all(
            processes
                .iter()
                .map(|p| self.terminate_with(p.pid, &policy)),
        )
        .await;
    }

    /// Synchronous best-effort teardown for `Drop` paths: SIGTERM to every
    /// tracked tree, then forget the entries. Returns how many were signalled.
    pub fn signal_all_blocking(&self) -> usize {
        let processes = std::mem::take(&mut *self.table());
        for p in &processes {
            if is_process_alive(p.pid) {
                Self::deliver(p.pid, Signal::Term, self.policy.kill_children);
            }
        }
        processes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Child, Command};
    use std::sync::Arc;

    fn fast_policy() -> TerminationPolicy {
        TerminationPolicy {
            graceful_timeout: Duration::from_millis(300),
            kill_children: true,
            poll_interval: Duration::from_millis(20),
            safety_margin: Duration::from_millis(500),
        }
    }

    fn spawn_sleep() -> Child {
        Command::new("sleep").arg("30").spawn().unwrap()
    }

    #[test]
    fn test_register_rejects_pid_zero() {
        let registry = ProcessRegistry::new();
        registry.register(BackgroundProcess::new(0, "bogus"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_find_remove_clear() {
        let registry = ProcessRegistry::new();
        registry.register(BackgroundProcess::new(4_194_401, "autossh").with_description("tunnel"));
        registry.register(BackgroundProcess::new(4_194_402, "kubectl"));
        registry.register(BackgroundProcess::new(4_194_401, "autossh"));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find(4_194_402).unwrap().command, "kubectl");
        assert!(registry.find(4_194_401).unwrap().description.is_none());

        assert!(registry.remove(4_194_402).is_some());
        assert!(registry.remove(4_194_402).is_none());
        assert_eq!(registry.snapshot().len(), 1);

        registry.clear();
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_loses_nothing() {
        let registry = Arc::new(ProcessRegistry::new());
        let tasks: Vec<_> = (0..8u32)
            .map(|task| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    for n in 0..25u32 {
                        let pid = 4_195_000 + task * 100 + n;
                        registry.register(BackgroundProcess::new(pid, "autossh"));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.len(), 200);
        assert!(registry.find(4_195_000).is_some());
        assert!(registry.find(4_195_724).is_some());
    }

    #[tokio::test]
    async fn test_terminate_running_process() {
        let _guard = crate::test_guard!();
        let registry = ProcessRegistry::with_policy(fast_policy());
        let mut child = spawn_sleep();
        registry.register(BackgroundProcess::new(child.id(), "sleep 30"));

        let outcome = registry.terminate(child.id()).await;
        assert_eq!(outcome, TerminationOutcome::Exited { forced: false });
        assert!(registry.is_empty());
        child.wait().unwrap();
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let _guard = crate::test_guard!();
        let registry = ProcessRegistry::with_policy(fast_policy());
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30; sleep 30"])
            .spawn()
            .unwrap();
        registry.register(BackgroundProcess::new(child.id(), "stubborn"));
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let outcome = registry.terminate(child.id()).await;
        assert_eq!(outcome, TerminationOutcome::Exited { forced: true });
        assert!(registry.is_empty());
        child.wait().unwrap();
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent_for_exited_process() {
        let registry = ProcessRegistry::with_policy(fast_policy());
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        registry.register(BackgroundProcess::new(pid, "true"));

        assert_eq!(registry.terminate(pid).await, TerminationOutcome::AlreadyExited);
        assert_eq!(registry.terminate(pid).await, TerminationOutcome::AlreadyExited);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_terminate_refuses_protected_pid() {
        let registry = ProcessRegistry::new();
        registry.register(BackgroundProcess::new(1, "init"));
        assert_eq!(registry.terminate(1).await, TerminationOutcome::Refused);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_terminate_all_empties_registry() {
        let _guard = crate::test_guard!();
        let registry = ProcessRegistry::with_policy(fast_policy());
        let mut children = vec![spawn_sleep(), spawn_sleep()];
        for child in &children {
            registry.register(BackgroundProcess::new(child.id(), "sleep 30"));
        }

        registry.terminate_all().await;
        assert!(registry.is_empty());
        for child in &mut children {
            child.wait().unwrap();
        }
    }

    #[test]
    fn test_signal_all_blocking_clears_and_signals() {
        let registry = ProcessRegistry::with_policy(fast_policy());
        let mut child = spawn_sleep();
        registry.register(BackgroundProcess::new(child.id(), "sleep 30"));
        registry.register(BackgroundProcess::new(4_194_403, "already gone"));

        assert_eq!(registry.signal_all_blocking(), 2);
        assert!(registry.is_empty());
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
