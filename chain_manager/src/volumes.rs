use block_commands::BlockError;
use data_model::{short_id, Image};
use tracing::{info, warn};

use crate::{registry::ExportRecord, validate_name, ChainError, ChainManager};

impl ChainManager {
    /// Create volume `name`, empty or as a copy-on-write clone of `source`.
    /// Creating a volume that already exists succeeds without changes.
    pub async fn create_volume(
        &self,
        name: &str,
        size_bytes: u64,
        source: Option<&str>,
    ) -> Result<(), ChainError> {
        validate_name("volume", name)?;
        if let Some(source) = source {
            validate_name("source volume", source)?;
        }
        if source.is_none() && size_bytes == 0 {
            return Err(ChainError::Validation(format!(
                "volume {} needs a size",
                name
            )));
        }
        // The image a clone reads from is locked too, so a concurrent
        // snapshot cannot re-point it while the clone is being attached.
        let _guard = self
            .lock_resolved(&[name, source.unwrap_or_default()], |registry| {
                source
                    .and_then(|source| registry.resolve_source(source))
                    .map(|image| image.name.clone())
            })
            .await;

        let id = short_id(name);
        let source_image = {
            let registry = self.registry.read().await;
            if registry.is_volume(name) {
                info!(volume = %name, "volume already exists");
                return Ok(());
            }
            if registry.image(name).is_some() {
                return Err(ChainError::Validation(format!(
                    "{} is still held by a snapshot chain and cannot be created as a volume",
                    name
                )));
            }
            if let Some(owner) = registry.id_owner(&id) {
                return Err(ChainError::Validation(format!(
                    "volume {} maps to node id {} already used by {}",
                    name, id, owner
                )));
            }
            match source {
                Some(source) => Some(
                    registry
                        .resolve_source(source)
                        .cloned()
                        .ok_or_else(|| ChainError::not_found("source volume", source))?,
                ),
                None => None,
            }
        };

        let path = self.layout.volume_image(name);
        self.layout.ensure_dir(&self.layout.volume_dir(name)).await?;
        if self.layout.remove_file(&path).await? {
            warn!(volume = %name, path = %path.display(), "removed stale image file");
        }

        let image = match &source_image {
            None => {
                self.block.create_base_image(&path, &id, size_bytes).await?;
                Image::new_root(name, path, size_bytes)
            }
            Some(parent) => {
                self.block
                    .create_snapshot_with_backing_node(
                        &parent.id,
                        &id,
                        &parent.file_path,
                        &path,
                        &parent.id,
                        size_bytes.max(parent.size_bytes),
                    )
                    .await?;
                Image::new_overlay(parent, name, path, size_bytes)
            }
        };

        let inserted = self.registry.write().await.insert_volume(image.clone());
        if let Err(err) = inserted {
            warn!(volume = %name, error = %err, "registering volume failed, rolling back");
            self.discard_unregistered(&image).await;
            return Err(err);
        }
        info!(
            volume = %name,
            node = %image.node_name(),
            backing = image.backing_image_id.as_deref().unwrap_or("-"),
            size_bytes = image.size_bytes,
            "created volume"
        );
        Ok(())
    }

    /// Export the volume's active layer as a vhost-user-blk socket.
    pub async fn expose_volume(&self, name: &str) -> Result<(), ChainError> {
        validate_name("volume", name)?;
        let _guard = self.locks.lock(&[name]).await;

        let active = {
            let registry = self.registry.read().await;
            if registry.export(name).is_some() {
                info!(volume = %name, "volume already exported");
                return Ok(());
            }
            registry
                .active_layer(name)
                .cloned()
                .ok_or_else(|| ChainError::not_found("volume", name))?
        };

        let socket_dir = self.layout.socket_dir(name);
        self.layout.ensure_dir(&socket_dir).await?;
        let socket = self.layout.socket_path(name);
        if self.layout.remove_file(&socket).await? {
            warn!(volume = %name, socket = %socket.display(), "removed stale export socket");
        }

        self.block.expose_export(&active.id, &socket).await?;
        self.registry.write().await.insert_export(
            name,
            ExportRecord {
                node_id: active.id.clone(),
                socket: socket.clone(),
            },
        );
        info!(volume = %name, node = %active.node_name(), socket = %socket.display(), "exposed volume");
        Ok(())
    }

    /// Remove the volume's export and its socket directory. Removing an
    /// export that does not exist succeeds.
    pub async fn delete_exporter(&self, name: &str) -> Result<(), ChainError> {
        validate_name("volume", name)?;
        let _guard = self.locks.lock(&[name]).await;

        let node_id = {
            let registry = self.registry.read().await;
            match registry.export(name) {
                Some(record) => record.node_id.clone(),
                None => registry
                    .active_layer(name)
                    .map(|image| image.id.clone())
                    .unwrap_or_else(|| short_id(name)),
            }
        };
        self.unexport(name, &node_id).await?;
        self.layout
            .remove_dir_all(&self.layout.socket_dir(name))
            .await?;
        info!(volume = %name, "deleted exporter");
        Ok(())
    }

    /// Delete volume `name`. Its head node goes away right away when nothing
    /// depends on it, otherwise it is unbound and left to cleanup. Deleting
    /// an unknown volume succeeds.
    pub async fn delete_volume(&self, name: &str) -> Result<(), ChainError> {
        validate_name("volume", name)?;
        let _guard = self.locks.lock(&[name]).await;

        let (active, export) = {
            let registry = self.registry.read().await;
            (
                registry.active_layer(name).cloned(),
                registry.export(name).cloned(),
            )
        };
        let Some(active) = active else {
            info!(volume = %name, "volume not found, nothing to delete");
            return Ok(());
        };

        if let Some(export) = export {
            self.unexport(name, &export.node_id).await?;
            self.layout
                .remove_dir_all(&self.layout.socket_dir(name))
                .await?;
        }

        if active.ref_count < 1 && active.name == name {
            self.destroy(&active).await?;
            self.collect_from(active.backing_image_id.clone()).await?;
        } else {
            {
                let mut registry = self.registry.write().await;
                registry.detach(name);
                registry.remove_active(name);
            }
            self.collect_from(Some(active.name.clone())).await?;
        }
        info!(volume = %name, active = %active.name, "deleted volume");
        Ok(())
    }

    async fn unexport(&self, name: &str, node_id: &str) -> Result<(), ChainError> {
        match self.block.remove_export(node_id).await {
            Ok(()) => {}
            Err(BlockError::NotFound(export)) => {
                info!(volume = %name, export = %export, "export already removed");
            }
            Err(err) => return Err(err.into()),
        }
        self.registry.write().await.remove_export(name);
        Ok(())
    }

    /// Undo a daemon-side create whose registration failed.
    async fn discard_unregistered(&self, image: &Image) {
        if let Err(err) = self.block.delete_node(&image.id).await {
            warn!(node = %image.node_name(), error = %err, "failed to remove unregistered node");
        }
        if let Err(err) = self.layout.remove_file(&image.file_path).await {
            warn!(error = %err, "failed to remove unregistered image file");
        }
    }
}
