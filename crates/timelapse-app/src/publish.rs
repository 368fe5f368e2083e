use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Local;
use timelapse_core::errors::PublishError;
use timelapse_pipeline::Publisher;
use tracing::{debug, info};

/// Moves finished videos into an output folder as `Timelapse_YYYYMMDD_HHMMSS.mp4`.
pub struct DirectoryPublisher {
    dir: PathBuf,
    extension: String,
}

impl DirectoryPublisher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), extension: "mp4".into() }
    }

    /// Name published files `Timelapse_*.{extension}` instead of `.mp4`.
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// First free name for this instant; `_1`, `_2`, ... on collision.
    fn target_path(&self) -> PathBuf {
        let stem = format!("Timelapse_{}", Local::now().format("%Y%m%d_%H%M%S"));
        let ext = &self.extension;
        let mut path = self.dir.join(format!("{stem}.{ext}"));
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!("{stem}_{n}.{ext}"));
            n += 1;
        }
        path
    }
}

#[async_trait]
impl Publisher for DirectoryPublisher {
    async fn publish(&self, artifact: &Path) -> Result<PathBuf, PublishError> {
        if !artifact.is_file() {
            return Err(PublishError::Failed {
                reason: format!("{} does not exist", artifact.display()),
            });
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        let target = self.target_path();

        if let Err(e) = tokio::fs::rename(artifact, &target).await {
            // Rename fails across filesystems.
            debug!("rename failed ({}), copying instead", e);
            tokio::fs::copy(artifact, &target).await?;
            tokio::fs::remove_file(artifact).await?;
        }
        info!("Published {}", target.display());
        Ok(target)
    }
}
