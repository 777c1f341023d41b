//! Short-lived external commands (kubectl, vault, ssh-keygen, ...).

use crate::errors::{BfhError, Result};
use crate::util::render_for_log;
use std::process::Stdio;
use tracing::{debug, trace};

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Builder for a command that runs to completion with captured output.
#[derive(Debug, Clone, Default)]
pub struct ExternalCommand {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl ExternalCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Masked, shell-quoted rendering for logs and error messages.
    pub fn display(&self) -> String {
        render_for_log(&self.env, &self.program, &self.args)
    }

    /// Run the command and capture its output, whatever the exit status.
    pub async fn output(&self) -> Result<CommandOutput> {
        debug!(command = %self.display(), "Running command");

        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BfhError::Subprocess {
                command: self.display(),
                exit_code: None,
                stderr: format!("failed to start {}: {e}", self.program),
            })?;

        let result = CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        trace!(
            program = %self.program,
            exit_code = ?result.exit_code,
            stdout_len = result.stdout.len(),
            "Command finished"
        );
        Ok(result)
    }

    /// Run the command and return trimmed stdout, failing on a non-zero exit.
    pub async fn run(&self) -> Result<String> {
        let output = self.output().await?;
        if !output.success() {
            return Err(BfhError::Subprocess {
                command: self.display(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout.trim().to_string())
    }
}
