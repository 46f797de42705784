use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::ChainError;

const BASE_IMAGE: &str = "disk.img";
const EXPORT_SOCKET: &str = "vhost.sock";

/// Where image files and export sockets live on disk.
#[derive(Debug, Clone)]
pub struct Layout {
    images_dir: PathBuf,
    sockets_dir: PathBuf,
}

impl Layout {
    pub fn new(images_dir: impl Into<PathBuf>, sockets_dir: impl Into<PathBuf>) -> Self {
        Self {
            images_dir: images_dir.into(),
            sockets_dir: sockets_dir.into(),
        }
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    pub fn volume_dir(&self, volume: &str) -> PathBuf {
        self.images_dir.join(volume)
    }

    /// Image of a base or cloned volume.
    pub fn volume_image(&self, volume: &str) -> PathBuf {
        self.volume_dir(volume).join(BASE_IMAGE)
    }

    /// Overlay created by snapshotting `source_volume`.
    pub fn snapshot_image(&self, source_volume: &str, snapshot_id: &str) -> PathBuf {
        self.volume_dir(source_volume)
            .join(format!("snap-{}", snapshot_id))
    }

    pub fn socket_dir(&self, volume: &str) -> PathBuf {
        self.sockets_dir.join(volume)
    }

    pub fn socket_path(&self, volume: &str) -> PathBuf {
        self.socket_dir(volume).join(EXPORT_SOCKET)
    }

    pub async fn ensure_dir(&self, dir: &Path) -> Result<(), ChainError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(ChainError::filesystem(dir))
    }

    /// Remove a file, succeeding when it is already gone. Returns whether a
    /// file was removed.
    pub async fn remove_file(&self, path: &Path) -> Result<bool, ChainError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                debug!(path = %path.display(), "removed file");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(ChainError::filesystem(path)(err)),
        }
    }

    /// Remove a directory tree, succeeding when it is already gone.
    pub async fn remove_dir_all(&self, dir: &Path) -> Result<(), ChainError> {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ChainError::filesystem(dir)(err)),
        }
    }

    /// Drop the per-volume image directory holding `file` once it is empty.
    /// Never fails; a leftover empty directory is harmless.
    pub async fn prune_parent_dir(&self, file: &Path) {
        let Some(dir) = file.parent() else {
            return;
        };
        if dir == self.images_dir || !dir.starts_with(&self.images_dir) {
            return;
        }
        match tokio::fs::remove_dir(dir).await {
            Ok(()) => debug!(dir = %dir.display(), "removed empty image directory"),
            // Not empty, still holding other images of the chain.
            Err(err) if err.kind() == std::io::ErrorKind::DirectoryNotEmpty => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(dir = %dir.display(), error = %err, "failed to remove image directory"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let layout = Layout::new("/var/run/qsd/images", "/var/run/qsd/sockets");
        assert_eq!(
            layout.volume_image("pvc-a"),
            PathBuf::from("/var/run/qsd/images/pvc-a/disk.img")
        );
        assert_eq!(
            layout.snapshot_image("pvc-a", "77aa01bc"),
            PathBuf::from("/var/run/qsd/images/pvc-a/snap-77aa01bc")
        );
        assert_eq!(
            layout.socket_path("pvc-a"),
            PathBuf::from("/var/run/qsd/sockets/pvc-a/vhost.sock")
        );
    }

    #[tokio::test]
    async fn test_remove_file_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path().join("images"), dir.path().join("sockets"));
        let vol_dir = layout.volume_dir("pvc-a");
        layout.ensure_dir(&vol_dir).await.unwrap();
        let image = layout.volume_image("pvc-a");
        std::fs::write(&image, b"qcow").unwrap();

        assert!(layout.remove_file(&image).await.unwrap());
        assert!(!layout.remove_file(&image).await.unwrap());

        layout.prune_parent_dir(&image).await;
        assert!(!vol_dir.exists());
        assert!(layout.images_dir().exists());
    }

    #[tokio::test]
    async fn test_prune_keeps_non_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path().join("images"), dir.path().join("sockets"));
        let vol_dir = layout.volume_dir("pvc-a");
        layout.ensure_dir(&vol_dir).await.unwrap();
        std::fs::write(layout.snapshot_image("pvc-a", "s1"), b"qcow").unwrap();

        layout.prune_parent_dir(&layout.volume_image("pvc-a")).await;
        assert!(vol_dir.exists());
    }
}
