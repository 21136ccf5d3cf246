use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command as TokioCommand;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("{program} reported: {stderr}")]
    Diagnostics { program: String, stderr: String },
}

/// Runs an external program to completion and hands back its stdout.
///
/// Output on stderr counts as failure even when the exit status is zero; the
/// container runtime reports pull and naming problems that way.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<String, ProcessError>;
}

/// Runs commands directly (no shell) through `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String, ProcessError> {
        debug!(program, ?args, "running external command");
        let mut command = TokioCommand::new(program);
        command.args(args);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);

        let output = command.output().await.map_err(|source| ProcessError::Spawn {
            program: program.to_string(),
            source,
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            return Err(ProcessError::Exit {
                program: program.to_string(),
                status: describe_exit_status(output.status),
                stderr,
            });
        }
        if !stderr.is_empty() {
            return Err(ProcessError::Diagnostics {
                program: program.to_string(),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn describe_exit_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "signal".to_string(),
    }
}
