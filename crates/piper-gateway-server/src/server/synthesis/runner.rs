//! The process-spawning capability.
//!
//! [`ProcessRunner`] is the only place the pipeline touches the operating
//! system's process API. The invoker describes a run as an [`Invocation`]
//! and gets back a [`ProcessOutput`]; tests substitute their own runner to
//! exercise every outcome without a real executable.

use std::{ffi::OsString, future::Future, io, path::PathBuf, process::Stdio, time::Duration};
use tokio::{io::AsyncWriteExt, process::Command};

/// Everything needed to launch one process.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Variables set on top of the inherited environment.
    pub envs: Vec<(OsString, OsString)>,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Vec<u8>,
    /// Kill the child if it runs longer than this.
    pub timeout: Option<Duration>,
}

/// What a finished process left behind.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Set when feeding stdin failed, typically because the child exited
    /// before reading it.
    pub stdin_error: Option<String>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The process never started.
    #[error("cannot launch {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The process started but could not be waited on.
    #[error("waiting for process failed: {0}")]
    Wait(#[source] io::Error),

    /// The process outlived its timeout and was killed.
    #[error("process killed after exceeding {0:?}")]
    TimedOut(Duration),
}

/// Launches a process, feeds it stdin and waits for it to exit.
pub trait ProcessRunner: Send + Sync + 'static {
    fn run(
        &self,
        invocation: Invocation,
    ) -> impl Future<Output = Result<ProcessOutput, RunError>> + Send;
}

/// Runs real processes on the tokio runtime.
///
/// Stdin is fed while stdout and stderr are drained, so a child that writes
/// a lot of diagnostics before reading its input cannot deadlock the run.
/// Children are killed only when their timeout fires; a caller going away
/// does not stop a run that is already underway.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, invocation: Invocation) -> Result<ProcessOutput, RunError> {
        let Invocation {
            program,
            args,
            envs,
            stdin,
            timeout,
        } = invocation;

        let mut command = Command::new(&program);
        command
            .args(&args)
            .envs(envs)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Only reached when the timeout below drops the future.
            .kill_on_drop(true);

        tracing::debug!(command = ?command.as_std(), "Running piper");

        let mut child = command
            .spawn()
            .map_err(|source| RunError::Spawn { program, source })?;

        let child_stdin = child.stdin.take();
        let feed = async move {
            let Some(mut pipe) = child_stdin else {
                return Some("stdin was not captured".to_string());
            };
            let written = async {
                pipe.write_all(&stdin).await?;
                pipe.shutdown().await
            }
            .await;
            // Dropping the pipe closes it, which is the child's end-of-input.
            drop(pipe);
            written.err().map(|e| e.to_string())
        };

        let run = async move {
            let (stdin_error, output) = tokio::join!(feed, child.wait_with_output());
            let output = output.map_err(RunError::Wait)?;
            Ok::<_, RunError>(ProcessOutput {
                exit_code: output.status.code(),
                stdout: output.stdout,
                stderr: output.stderr,
                stdin_error,
            })
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| RunError::TimedOut(limit))?,
            None => run.await,
        }
    }
}
