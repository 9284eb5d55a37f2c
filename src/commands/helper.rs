use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Capability seam for invoking the external credential helper.
///
/// Implement this to replace subprocess execution in tests. `run` returns
/// the helper's stdout on a zero exit status and an error (carrying stderr)
/// otherwise.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<String>;
}

/// Production runner: spawns the helper as a child process and waits for it.
///
/// The helper is trusted local tooling; its stderr is surfaced verbatim in
/// errors so operators can see what the helper complained about.
#[derive(Debug, Clone, Default)]
pub struct ShellHelper;

impl ShellHelper {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ShellHelper {
    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        debug!(program = %program, args = ?args, "invoking credential helper");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run credential helper '{program}'"))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

        if output.status.success() {
            debug!(
                program = %program,
                exit_code = ?output.status.code(),
                "credential helper succeeded"
            );
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(anyhow::anyhow!(
                "credential helper '{}' exited with {:?}: {}",
                program,
                output.status.code(),
                stderr.trim()
            ))
        }
    }
}
