//! Request lifecycle for one synthesis.
//!
//! A request moves through [`Stage`]s:
//!
//! ```text
//! Validating -> Allocating -> Synthesizing -> Delivering -> Done
//!      \             \              \              \
//!       +-------------+--------------+--------------+--> Failed
//! ```
//!
//! [`SynthesisService`] owns everything from `Allocating` to the point where
//! a finished [`Artifact`] is handed to the HTTP layer for delivery. The
//! pipeline runs in its own task, so a caller that disconnects does not
//! interrupt a running Piper process. When nobody is left to collect the
//! artifact, dropping it removes the file.

use crate::server::{
    config::SynthesisConfig,
    synthesis::{
        invoker::ProcessInvoker,
        runner::ProcessRunner,
        workspace::{Workspace, WorkspaceAllocator},
    },
    telemetry::increment_request_errors,
};
use core::fmt;
use piper_gateway_core::{Error, Result};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::Semaphore;
use tracing::Instrument;

/// Where a request is in its lifecycle. Recorded on log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    Allocating,
    Synthesizing,
    Delivering,
    Done,
    Failed,
}

impl Stage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::Allocating => "allocating",
            Self::Synthesizing => "synthesizing",
            Self::Delivering => "delivering",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated input for one synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisRequest {
    text: String,
}

impl SynthesisRequest {
    /// Accepts any text with at least one non-whitespace character. The text
    /// itself is passed on untrimmed.
    pub fn new(text: Option<String>) -> Result<Self> {
        match text {
            Some(text) if !text.trim().is_empty() => Ok(Self { text }),
            _ => Err(Error::text_required()),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// A synthesized audio file, ready to be delivered.
#[derive(Debug)]
pub struct Artifact {
    pub workspace: Workspace,
    /// Size of the audio file in bytes.
    pub len: u64,
}

/// Short label for an error, used as a metric attribute.
pub const fn error_kind(error: &Error) -> &'static str {
    match error {
        Error::Validation { .. } => "validation",
        Error::StorageUnavailable { .. } => "storage_unavailable",
        Error::SynthesisUnavailable { .. } => "synthesis_unavailable",
        Error::SynthesisFailed { .. } => "synthesis_failed",
        Error::PayloadTooLarge { .. } => "payload_too_large",
        Error::Delivery { .. } => "delivery",
        Error::ServiceShutdown => "shutdown",
    }
}

/// Logs a request that ended in [`Stage::Failed`], naming the stage it
/// failed in, and counts it.
pub fn report_failure(stage: Stage, error: &Error) {
    increment_request_errors(error_kind(error));
    let outcome = Stage::Failed;
    match error {
        Error::Validation { reason } => {
            tracing::debug!(%stage, %outcome, %reason, "Rejected synthesis request");
        }
        Error::PayloadTooLarge { limit } => {
            tracing::debug!(%stage, %outcome, limit, "Rejected oversized request body");
        }
        Error::SynthesisFailed { context, stderr } => {
            tracing::error!(%stage, %outcome, %context, %stderr, "TTS synthesis failed");
        }
        Error::Delivery { context } => {
            tracing::warn!(%stage, %outcome, %context, "Error sending file");
        }
        other => {
            tracing::error!(%stage, %outcome, error = %other, "Synthesis request failed");
        }
    }
}

struct Inner<R> {
    allocator: WorkspaceAllocator,
    invoker: ProcessInvoker<R>,
    permits: Option<Semaphore>,
    shutting_down: AtomicBool,
}

impl<R: ProcessRunner> Inner<R> {
    async fn run_pipeline(&self, request: SynthesisRequest) -> Result<Artifact> {
        let _permit = match &self.permits {
            Some(permits) => Some(
                permits
                    .acquire()
                    .await
                    .map_err(|_| Error::ServiceShutdown)?,
            ),
            None => None,
        };
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ServiceShutdown);
        }

        let workspace = self.allocator.allocate().await.inspect_err(|e| {
            report_failure(Stage::Allocating, e);
        })?;

        tracing::debug!(
            stage = %Stage::Synthesizing,
            workspace = %workspace.id(),
            chars = request.text().chars().count(),
            "Starting synthesis"
        );

        match self.invoker.invoke(request.text(), &workspace).await {
            Ok(len) => Ok(Artifact { workspace, len }),
            Err(e) => {
                workspace.release().await;
                report_failure(Stage::Synthesizing, &e);
                Err(e)
            }
        }
    }
}

/// Turns validated requests into audio files on disk.
pub struct SynthesisService<R> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for SynthesisService<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: ProcessRunner> SynthesisService<R> {
    pub fn new(config: Arc<SynthesisConfig>, runner: R) -> Self {
        let allocator = WorkspaceAllocator::new(config.output_dir.clone());
        let permits = config
            .max_concurrent
            .map(|n| Semaphore::new(n.min(Semaphore::MAX_PERMITS)));
        let invoker = ProcessInvoker::new(config, runner);

        Self {
            inner: Arc::new(Inner {
                allocator,
                invoker,
                permits,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Creates the output directory. Called once at startup; allocation
    /// repeats it, so a failure here is not fatal.
    pub async fn prepare(&self) -> Result<()> {
        self.inner.allocator.prepare().await
    }

    /// Stops admitting new syntheses. Runs already underway finish normally.
    pub fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        if let Some(permits) = &self.inner.permits {
            permits.close();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Runs Piper for `request` and returns the finished artifact.
    ///
    /// Failures have already been logged and their workspace released by the
    /// time this returns.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceShutdown`] once [`shutdown`](Self::shutdown) was called.
    /// - [`Error::StorageUnavailable`] if no workspace could be allocated.
    /// - [`Error::SynthesisUnavailable`] or [`Error::SynthesisFailed`] if the
    ///   run did not produce audio.
    pub async fn synthesize(&self, request: SynthesisRequest) -> Result<Artifact> {
        if self.is_shutting_down() {
            return Err(Error::ServiceShutdown);
        }

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(
            async move { inner.run_pipeline(request).await }.in_current_span(),
        );

        match task.await {
            Ok(result) => result,
            Err(e) => {
                let error = Error::SynthesisFailed {
                    context: format!("synthesis task ended abnormally: {e}"),
                    stderr: String::new(),
                };
                report_failure(Stage::Synthesizing, &error);
                Err(error)
            }
        }
    }
}
