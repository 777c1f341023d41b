//! `buildctl build` with output relayed line by line.

use super::{BuildEngine, BuildInvocation};
use async_trait::async_trait;
use bfh_common::util::render_for_log;
use bfh_common::{Architecture, BfhError, Result};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildctlEngine;

#[async_trait]
impl BuildEngine for BuildctlEngine {
    async fn build(&self, invocation: &BuildInvocation) -> Result<i32> {
        let mut args = vec!["build".to_string()];
        args.extend(invocation.args.iter().cloned());
        let env = [(
            "BUILDKIT_HOST".to_string(),
            invocation.buildkit_host.clone(),
        )];
        run_prefixed(invocation.architecture, "buildctl", &args, &env).await
    }
}

/// Run `program`, writing every stdout and stderr line to stderr as
/// `<arch>: <line>`. Returns the exit code, or -1 when killed by a signal.
async fn run_prefixed(
    arch: Architecture,
    program: &str,
    args: &[String],
    env: &[(String, String)],
) -> Result<i32> {
    debug!(%arch, command = %render_for_log(env, program, args), "Starting build");
    let mut child = tokio::process::Command::new(program)
        .args(args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| BfhError::Subprocess {
            command: render_for_log(env, program, args),
            exit_code: None,
            stderr: format!("failed to start {program}: {e}"),
        })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (_, _, status) = tokio::join!(relay(arch, stdout), relay(arch, stderr), child.wait());
    let code = status?.code().unwrap_or(-1);
    debug!(%arch, code, "Build finished");
    Ok(code)
}

async fn relay<R: AsyncRead + Unpin>(arch: Architecture, stream: Option<R>) -> usize {
    let Some(stream) = stream else {
        return 0;
    };
    // Raw bytes: a line that is not UTF-8 must not stop the drain, or the
    // child dies on a closed pipe.
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    let mut count = 0;
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                eprintln!("{arch}: {}", text.trim_end_matches(['\n', '\r']));
                count += 1;
            }
            Err(e) => {
                debug!(%arch, error = %e, "Output stream closed");
                break;
            }
        }
    }
    count
}
