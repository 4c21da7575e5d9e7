use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::command::exec;

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("overlay already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("overlay creation failed: {0}")]
    Create(String),
}

/// Path of the overlay image for an environment instance name.
pub fn overlay_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.qcow2"))
}

/// Creates and deletes copy-on-write disk images.
///
/// Abstracted as a trait so tests can inject a lightweight manager
/// instead of calling `qemu-img`.
#[async_trait]
pub trait OverlayManager: Send + Sync {
    /// Create a copy-on-write image at `overlay` backed by `base`.
    /// Fails if the target already exists.
    async fn create(&self, base: &Path, overlay: &Path) -> Result<(), OverlayError>;

    /// Delete an overlay image. A missing file counts as success; an I/O
    /// failure is logged and reported as `false`.
    async fn remove(&self, overlay: &Path) -> bool;
}

/// Production manager shelling out to `qemu-img`.
pub struct QemuImg;

#[async_trait]
impl OverlayManager for QemuImg {
    async fn create(&self, base: &Path, overlay: &Path) -> Result<(), OverlayError> {
        if tokio::fs::try_exists(overlay).await.unwrap_or(false) {
            return Err(OverlayError::AlreadyExists(overlay.to_path_buf()));
        }

        let base = base.to_string_lossy();
        let overlay_str = overlay.to_string_lossy();
        exec(
            "qemu-img",
            &[
                "create",
                "-f",
                "qcow2",
                "-F",
                "qcow2",
                "-b",
                &base,
                &overlay_str,
            ],
        )
        .await
        .map_err(|e| OverlayError::Create(e.to_string()))?;

        info!(overlay = %overlay.display(), base = %base, "created overlay");
        Ok(())
    }

    async fn remove(&self, overlay: &Path) -> bool {
        match tokio::fs::remove_file(overlay).await {
            Ok(()) => {
                info!(overlay = %overlay.display(), "removed overlay");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(overlay = %overlay.display(), "tried to remove non-existing overlay");
                true
            }
            Err(e) => {
                error!(overlay = %overlay.display(), error = %e, "failed to remove overlay");
                false
            }
        }
    }
}
