//! Hands a finished artifact to the caller and cleans up after it.
//!
//! [`deliver`] copies the workspace file into any [`AsyncWrite`] sink and
//! then releases the workspace, whether or not the copy succeeded. If the
//! delivering future is dropped or panics part way, the workspace guard's
//! `Drop` performs the same removal.
//!
//! For HTTP responses, [`stream_body`] runs `deliver` in a background task
//! writing into an in-memory pipe whose other end is the response body. A
//! client that disconnects closes that end, the copy fails with a broken
//! pipe, and the file is still removed. The outcome is handed to a caller
//! supplied callback once the task finishes.

use crate::server::{synthesis::workspace::Workspace, telemetry::increment_audio_bytes};
use axum::body::Body;
use piper_gateway_core::{Error, Result, WorkspaceId};
use std::{io, path::Path};
use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::Instrument;

/// Capacity of the in-memory pipe between the file and the response body.
const DELIVERY_BUFFER: usize = 64 * 1024;

/// Streams the workspace file into `sink`, then removes it.
///
/// Returns the number of bytes written. Removal failures are logged and
/// never change the result.
///
/// # Errors
///
/// Returns [`Error::Delivery`] if the file cannot be read or the sink stops
/// accepting data.
pub async fn deliver<W>(workspace: Workspace, sink: &mut W) -> Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let copied = copy_artifact(workspace.path(), sink).await;
    let age = workspace.created_at().elapsed().unwrap_or_default();
    tracing::trace!(
        workspace = %workspace.id(),
        age_ms = u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
        "Releasing workspace"
    );
    workspace.release().await;

    match copied {
        Ok(bytes) => {
            increment_audio_bytes(bytes);
            Ok(bytes)
        }
        Err(e) => Err(Error::Delivery {
            context: e.to_string(),
        }),
    }
}

async fn copy_artifact<W>(path: &Path, sink: &mut W) -> io::Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut file = File::open(path).await?;
    let bytes = tokio::io::copy(&mut file, sink).await?;
    sink.shutdown().await?;
    Ok(bytes)
}

/// Builds a response body that streams the workspace file and removes it
/// once streaming ends, successfully or not. `on_finish` receives the
/// outcome of the copy.
pub fn stream_body<F>(workspace: Workspace, on_finish: F) -> Body
where
    F: FnOnce(WorkspaceId, Result<u64>) + Send + 'static,
{
    let (mut writer, reader) = tokio::io::duplex(DELIVERY_BUFFER);
    let id = workspace.id();

    let task = async move {
        let outcome = deliver(workspace, &mut writer).await;
        on_finish(id, outcome);
    };
    tokio::spawn(task.in_current_span());

    Body::from_stream(ReaderStream::new(reader))
}
