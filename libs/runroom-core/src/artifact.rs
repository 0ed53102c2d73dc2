use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

/// Source file for exactly one execution attempt.
///
/// Call [`Artifact::release`] on every normal path. `Drop` is the fallback
/// for cancellation and panics, where an async removal cannot run.
#[derive(Debug)]
pub struct Artifact {
    path: PathBuf,
    removed: bool,
}

impl Artifact {
    /// Write `code` to a fresh `temp-code-<uuid>.<ext>` under `dir`,
    /// creating `dir` if needed. A partially written file is removed before
    /// the error is returned.
    pub async fn create(dir: &Path, extension: &str, code: &str) -> io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;

        let path = dir.join(format!("temp-code-{}.{}", Uuid::new_v4(), extension));
        if let Err(e) = tokio::fs::write(&path, code).await {
            remove_if_present(&path).await;
            return Err(e);
        }

        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file. Already-missing files count as removed. On failure
    /// the `Drop` fallback still gets its attempt.
    pub async fn release(mut self) -> io::Result<()> {
        self.remove().await
    }

    async fn remove(&mut self) -> io::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        self.removed = true;
        Ok(())
    }
}

impl Drop for Artifact {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove artifact");
            }
        }
    }
}

async fn remove_if_present(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove partial artifact");
        }
    }
}
