use std::io;
use std::path::{Path, PathBuf};

use tboard_core::types::RunId;

/// Files produced by a run (result logs, screenshots) outside the run store.
pub trait ArtifactStore: Send + Sync + 'static {
    /// Removes every artifact of `run_id`. Missing artifacts are not an error.
    fn remove_run_artifacts(&self, run_id: RunId) -> io::Result<()>;
}

/// For deployments that keep no artifacts on this host.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoArtifacts;

impl ArtifactStore for NoArtifacts {
    fn remove_run_artifacts(&self, _run_id: RunId) -> io::Result<()> {
        Ok(())
    }
}

/// Artifacts of run `N` live in `<root>/tboard_N/`.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.root.join(format!("tboard_{run_id}"))
    }
}

impl ArtifactStore for FsArtifactStore {
    fn remove_run_artifacts(&self, run_id: RunId) -> io::Result<()> {
        match std::fs::remove_dir_all(self.run_dir(run_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}
