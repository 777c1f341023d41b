//! Signalling, liveness and process-tree discovery.
//!
//! Signals go through the `kill` utility so this crate stays free of
//! `unsafe` libc calls.

use std::fmt;
use std::process::{Command, Stdio};
use tracing::{debug, trace};

/// PIDs that are never signalled (scheduler, init, kthreadd).
pub const PROTECTED_PIDS: [u32; 3] = [0, 1, 2];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    fn as_flag(&self) -> &'static str {
        match self {
            Self::Term => "-TERM",
            Self::Kill => "-KILL",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Term => write!(f, "SIGTERM"),
            Self::Kill => write!(f, "SIGKILL"),
        }
    }
}

pub fn is_protected(pid: u32) -> bool {
    PROTECTED_PIDS.contains(&pid)
}

/// Send `signal` to a single process. Returns whether delivery succeeded;
/// a process that already exited simply yields `false`.
pub fn send_signal(pid: u32, signal: Signal) -> bool {
    if is_protected(pid) {
        debug!(pid, "Refusing to signal protected pid");
        return false;
    }

    match Command::new("kill")
        .arg(signal.as_flag())
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) => {
            trace!(pid, %signal, delivered = status.success(), "Signal sent");
            status.success()
        }
        Err(e) => {
            debug!("Failed to send {} to process {}: {}", signal, pid, e);
            false
        }
    }
}

/// Whether `pid` refers to a running (non-zombie) process.
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    if cfg!(target_os = "linux") {
        return match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => !matches!(stat_state(&stat), Some('Z' | 'X')),
            Err(_) => false,
        };
    }

    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// State letter from a `/proc/<pid>/stat` line. The command name is wrapped
/// in parentheses and may itself contain spaces or `)`.
fn stat_state(stat: &str) -> Option<char> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.trim_start().chars().next()
}

/// Parent pid from a `/proc/<pid>/stat` line.
fn stat_ppid(stat: &str) -> Option<u32> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().nth(1)?.parse().ok()
}

/// Direct children of `pid`.
pub fn child_pids(pid: u32) -> Vec<u32> {
    if cfg!(target_os = "linux") {
        return linux_children(pid);
    }

    Command::new("pgrep")
        .arg("-P")
        .arg(pid.to_string())
        .stderr(Stdio::null())
        .output()
        .map(|out| parse_pid_list(&String::from_utf8_lossy(&out.stdout)))
        .unwrap_or_default()
}

fn linux_children(pid: u32) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut children: Vec<u32> = entries
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<u32>().ok())
        .filter(|candidate| {
            std::fs::read_to_string(format!("/proc/{candidate}/stat"))
                .ok()
                .and_then(|stat| stat_ppid(&stat))
                == Some(pid)
        })
        .collect();
    children.sort_unstable();
    children
}

fn parse_pid_list(output: &str) -> Vec<u32> {
    output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

/// `pid` followed by all of its descendants, breadth first.
pub fn process_tree(pid: u32) -> Vec<u32> {
    let mut tree = vec![pid];
    let mut idx = 0;
    while idx < tree.len() {
        for child in child_pids(tree[idx]) {
            if !tree.contains(&child) {
                tree.push(child);
            }
        }
        idx += 1;
    }
    tree
}

/// Signal a whole tree, deepest descendants first and `pid` last.
///
/// Returns the number of processes the signal reached.
pub fn signal_tree(pid: u32, signal: Signal) -> usize {
    if is_protected(pid) {
        debug!(pid, "Refusing to signal protected process tree");
        return 0;
    }
    process_tree(pid)
        .into_iter()
        .rev()
        .filter(|p| !is_protected(*p))
        .filter(|p| send_signal(*p, signal))
        .count()
}
