use data_model::{short_id, Image};
use tracing::{debug, info, warn};

use crate::{validate_name, ChainError, ChainManager, DeletionPolicy};

impl ChainManager {
    /// Snapshot `source_volume`: a new overlay on top of its active layer
    /// takes over as the layer the volume writes to.
    pub async fn create_snapshot(
        &self,
        snapshot: &str,
        source_volume: &str,
    ) -> Result<(), ChainError> {
        validate_name("snapshot", snapshot)?;
        validate_name("source volume", source_volume)?;
        // Lock the layer being snapshotted, a clone may be attaching to it.
        let _guard = self
            .lock_resolved(&[snapshot, source_volume], |registry| {
                registry
                    .active_layer(source_volume)
                    .map(|image| image.name.clone())
            })
            .await;

        let id = short_id(snapshot);
        let active = {
            let registry = self.registry.read().await;
            if registry.image(snapshot).is_some() {
                if registry.is_live_snapshot_of(snapshot, source_volume) {
                    info!(snapshot = %snapshot, "snapshot already exists");
                    return Ok(());
                }
                return Err(ChainError::Validation(format!(
                    "{} is already in use and is not a snapshot of {}",
                    snapshot, source_volume
                )));
            }
            if let Some(owner) = registry.id_owner(&id) {
                return Err(ChainError::Validation(format!(
                    "snapshot {} maps to node id {} already used by {}",
                    snapshot, id, owner
                )));
            }
            registry
                .active_layer(source_volume)
                .cloned()
                .ok_or_else(|| ChainError::not_found("source volume", source_volume))?
        };

        let path = self.layout.snapshot_image(source_volume, &id);
        self.layout
            .ensure_dir(&self.layout.volume_dir(source_volume))
            .await?;
        if self.layout.remove_file(&path).await? {
            warn!(snapshot = %snapshot, path = %path.display(), "removed stale overlay file");
        }

        if active.ref_count < 1 {
            self.block
                .create_snapshot_from_root(
                    &active.id,
                    &id,
                    &active.file_path,
                    &path,
                    active.size_bytes,
                )
                .await?;
        } else {
            self.block
                .create_snapshot_with_backing_node(
                    &active.id,
                    &id,
                    &active.file_path,
                    &path,
                    &active.id,
                    active.size_bytes,
                )
                .await?;
        }

        let image = Image::new_overlay(&active, snapshot, path, active.size_bytes);
        if let Err(err) = self
            .registry
            .write()
            .await
            .insert_snapshot(image.clone(), source_volume)
        {
            warn!(snapshot = %snapshot, error = %err, "registering snapshot failed, rolling back");
            if let Err(err) = self.block.delete_node(&id).await {
                warn!(node = %image.node_name(), error = %err, "failed to remove unregistered node");
            }
            return Err(err);
        }
        info!(
            snapshot = %snapshot,
            volume = %source_volume,
            node = %image.node_name(),
            backing = %active.name,
            depth = image.depth,
            "created snapshot"
        );
        Ok(())
    }

    /// Delete `snapshot`. A node nothing reads from is destroyed right away;
    /// otherwise the name is unbound and the node stays in the chain (or is
    /// flattened into its child under [`DeletionPolicy::Flatten`]). Deleting
    /// an unknown snapshot succeeds.
    pub async fn delete_snapshot(
        &self,
        snapshot: &str,
        source_volume: &str,
    ) -> Result<(), ChainError> {
        validate_name("snapshot", snapshot)?;
        // The child a flatten would touch has to be locked with the rest, so
        // look it up first and re-check once all locks are held.
        let flatten_child = if self.policy == DeletionPolicy::Flatten {
            let registry = self.registry.read().await;
            match registry.children(snapshot).as_slice() {
                [only] => Some(only.name.clone()),
                _ => None,
            }
        } else {
            None
        };
        let _guard = self
            .locks
            .lock(&[
                snapshot,
                source_volume,
                flatten_child.as_deref().unwrap_or_default(),
            ])
            .await;

        let (image, active, child) = {
            let registry = self.registry.read().await;
            let Some(image) = registry.image(snapshot).cloned() else {
                info!(snapshot = %snapshot, "snapshot not found, nothing to delete");
                return Ok(());
            };
            let child = match registry.children(snapshot).as_slice() {
                [only] if Some(&only.name) == flatten_child.as_ref() => Some((*only).clone()),
                _ => None,
            };
            (image, registry.is_active(snapshot), child)
        };

        if image.ref_count < 1 && !active {
            self.destroy(&image).await?;
        } else if let (Some(child), false) = (child, active) {
            self.flatten(&image, &child).await?;
        } else {
            self.registry.write().await.detach(snapshot);
            debug!(snapshot = %snapshot, refs = image.ref_count, active, "snapshot retained in chain");
        }
        self.collect_from(image.backing_image_id.clone()).await?;
        info!(snapshot = %snapshot, volume = %source_volume, "deleted snapshot");
        Ok(())
    }

    /// Fold `image` into its only child and destroy it.
    async fn flatten(&self, image: &Image, child: &Image) -> Result<(), ChainError> {
        let base_id = {
            let registry = self.registry.read().await;
            match image.backing_image_id.as_deref() {
                Some(parent) => Some(
                    registry
                        .image(parent)
                        .map(|parent| parent.id.clone())
                        .ok_or_else(|| ChainError::not_found("backing image", parent))?,
                ),
                None => None,
            }
        };
        self.block
            .stream_image(base_id.as_deref(), &child.id)
            .await?;
        self.registry
            .write()
            .await
            .reparent(&child.name, image.backing_image_id.as_deref())?;
        info!(snapshot = %image.name, child = %child.name, "flattened snapshot into its child");

        let detached = {
            let mut registry = self.registry.write().await;
            registry.detach(&image.name);
            registry.image(&image.name).cloned()
        };
        match detached {
            Some(detached) => self.destroy(&detached).await,
            None => Ok(()),
        }
    }
}
