//! Per-request transient files.
//!
//! [`WorkspaceAllocator`] hands out [`Workspace`]s: each one owns a freshly
//! created, uniquely named file in the output directory. Uniqueness comes
//! from [`WorkspaceId`] (timestamp + 80 random bits) and is enforced by
//! creating the file with `create_new`, so no lock or shared counter is
//! needed between concurrent requests.
//!
//! A `Workspace` is a guard. Its file is removed exactly once, either by an
//! explicit [`Workspace::release`] or, if the guard is dropped unreleased
//! (error paths, cancelled tasks, panics), by `Drop`.

use piper_gateway_core::{
    Error, RandSource, Result, SystemClock, ThreadRandom, TimeSource, WorkspaceId,
};
use std::{
    io,
    path::{Path, PathBuf},
    time::SystemTime,
};
use tokio::fs;

/// Name collisions are a 1-in-2^80 event; a handful of redraws is plenty.
const MAX_ALLOCATION_ATTEMPTS: usize = 4;

/// A transient output file owned by exactly one request.
#[derive(Debug)]
pub struct Workspace {
    id: WorkspaceId,
    path: PathBuf,
    created_at: SystemTime,
    released: bool,
}

impl Workspace {
    pub const fn id(&self) -> WorkspaceId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Removes the file. Failures are logged and swallowed: by the time a
    /// workspace is released the request outcome is already decided.
    pub async fn release(mut self) {
        self.released = true;
        log_removal(&self.path, fs::remove_file(&self.path).await);
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            log_removal(&self.path, std::fs::remove_file(&self.path));
        }
    }
}

fn log_removal(path: &Path, result: io::Result<()>) {
    match result {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed workspace file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "Workspace file already gone");
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Error deleting temp file");
        }
    }
}

/// Issues collision-free [`Workspace`]s inside one output directory.
#[derive(Debug, Clone)]
pub struct WorkspaceAllocator<T = SystemClock, R = ThreadRandom> {
    dir: PathBuf,
    time: T,
    rng: R,
}

impl WorkspaceAllocator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_sources(dir, SystemClock, ThreadRandom)
    }
}

impl<T, R> WorkspaceAllocator<T, R>
where
    T: TimeSource<u128>,
    R: RandSource<u128>,
{
    pub fn with_sources(dir: impl Into<PathBuf>, time: T, rng: R) -> Self {
        Self {
            dir: dir.into(),
            time,
            rng,
        }
    }

    /// Creates the output directory if it does not exist yet. Idempotent.
    pub async fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::StorageUnavailable {
                context: format!("cannot create {}: {e}", self.dir.display()),
            })
    }

    /// Reserves a new uniquely named file in the output directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageUnavailable`] if the directory cannot be
    /// created or the file cannot be created in it.
    pub async fn allocate(&self) -> Result<Workspace> {
        // The directory may have been removed from under a running service.
        self.prepare().await?;

        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let id = WorkspaceId::generate_with(&self.time, &self.rng);
            let path = self.dir.join(format!("output_{id}.wav"));

            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => {
                    tracing::trace!(path = %path.display(), "Allocated workspace");
                    return Ok(Workspace {
                        id,
                        path,
                        created_at: SystemTime::now(),
                        released: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    tracing::warn!(path = %path.display(), "Workspace name collision, redrawing");
                }
                Err(e) => {
                    return Err(Error::StorageUnavailable {
                        context: format!("cannot create {}: {e}", path.display()),
                    });
                }
            }
        }

        Err(Error::StorageUnavailable {
            context: format!(
                "no free workspace name in {} after {MAX_ALLOCATION_ATTEMPTS} attempts",
                self.dir.display()
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::HashSet,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    struct FixedTime;
    impl TimeSource<u128> for FixedTime {
        fn current_millis(&self) -> u128 {
            1_700_000_000_000
        }
    }

    /// Replays a fixed sequence of values, repeating the last one.
    struct Scripted {
        values: Vec<u128>,
        next: AtomicUsize,
    }

    impl RandSource<u128> for Scripted {
        fn rand(&self) -> u128 {
            let i = self.next.fetch_add(1, Ordering::Relaxed);
            self.values[i.min(self.values.len() - 1)]
        }
    }

    fn scripted(values: &[u128]) -> Scripted {
        Scripted {
            values: values.to_vec(),
            next: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn creates_missing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested").join("temp");
        let allocator = WorkspaceAllocator::new(&dir);

        let workspace = allocator.allocate().await.unwrap();
        assert!(dir.is_dir());
        assert!(workspace.path().starts_with(&dir));
        assert!(workspace.path().exists());

        // Second call on an existing directory must not fail.
        allocator.prepare().await.unwrap();
    }

    #[tokio::test]
    async fn file_name_embeds_the_id() {
        let tmp = tempfile::tempdir().unwrap();
        let allocator = WorkspaceAllocator::with_sources(tmp.path(), FixedTime, scripted(&[5]));

        let workspace = allocator.allocate().await.unwrap();
        let name = workspace.path().file_name().unwrap().to_str().unwrap();
        assert_eq!(name, "output_01HF7YAT000000000000000005.wav");
        assert_eq!(workspace.id().random(), 5);
    }

    #[tokio::test]
    async fn redraws_on_collision() {
        let tmp = tempfile::tempdir().unwrap();
        let allocator =
            WorkspaceAllocator::with_sources(tmp.path(), FixedTime, scripted(&[7, 7, 8]));

        let first = allocator.allocate().await.unwrap();
        let second = allocator.allocate().await.unwrap();
        assert_eq!(first.id().random(), 7);
        assert_eq!(second.id().random(), 8);
        assert_ne!(first.path(), second.path());
    }

    #[tokio::test]
    async fn gives_up_when_every_draw_collides() {
        let tmp = tempfile::tempdir().unwrap();
        let allocator = WorkspaceAllocator::with_sources(tmp.path(), FixedTime, scripted(&[1]));

        let _held = allocator.allocate().await.unwrap();
        let err = allocator.allocate().await.unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable { .. }));
    }

    #[tokio::test]
    async fn directory_blocked_by_a_file_is_storage_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("temp");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let err = WorkspaceAllocator::new(&blocker)
            .allocate()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable { .. }));
    }

    #[tokio::test]
    async fn concurrent_allocations_are_distinct() {
        const N: usize = 50;
        let tmp = tempfile::tempdir().unwrap();
        let allocator = Arc::new(WorkspaceAllocator::new(tmp.path()));

        let handles: Vec<_> = (0..N)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                tokio::spawn(async move { allocator.allocate().await })
            })
            .collect();

        let mut workspaces = Vec::with_capacity(N);
        for handle in handles {
            workspaces.push(handle.await.unwrap().unwrap());
        }

        let paths: HashSet<_> = workspaces.iter().map(|w| w.path().to_owned()).collect();
        assert_eq!(paths.len(), N);
    }

    #[tokio::test]
    async fn release_removes_the_file() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = WorkspaceAllocator::new(tmp.path())
            .allocate()
            .await
            .unwrap();
        let path = workspace.path().to_owned();

        workspace.release().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn drop_removes_the_file() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = WorkspaceAllocator::new(tmp.path())
            .allocate()
            .await
            .unwrap();
        let path = workspace.path().to_owned();

        drop(workspace);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn release_tolerates_a_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = WorkspaceAllocator::new(tmp.path())
            .allocate()
            .await
            .unwrap();
        std::fs::remove_file(workspace.path()).unwrap();

        workspace.release().await;
    }
}
