use block_commands::BlockError;
use data_model::Image;
use tracing::{debug, info};

use crate::{ChainError, ChainManager};

impl ChainManager {
    /// Remove `image` from the daemon, the disk and the registry. The parent's
    /// reference count drops with it.
    pub(crate) async fn destroy(&self, image: &Image) -> Result<(), ChainError> {
        match self.block.delete_node(&image.id).await {
            Ok(()) => {}
            Err(BlockError::NotFound(node)) => {
                debug!(node = %node, "block node already gone");
            }
            Err(err) => return Err(err.into()),
        }
        self.layout.remove_file(&image.file_path).await?;
        self.registry.write().await.remove_image(&image.name)?;
        self.layout.prune_parent_dir(&image.file_path).await;
        info!(image = %image.name, node = %image.node_name(), "destroyed chain node");
        Ok(())
    }

    /// Walk up from `start`, destroying every node nothing depends on any
    /// more. Stops at the first node that is missing, referenced, bound to a
    /// name or written to by a volume.
    pub(crate) async fn collect_from(&self, start: Option<String>) -> Result<usize, ChainError> {
        let _collector = self.collector.lock().await;
        let mut destroyed = 0;
        let mut next = start;
        while let Some(name) = next.take() {
            let candidate = {
                let registry = self.registry.read().await;
                match registry.image(&name) {
                    Some(image) if registry.collectible(image) => image.clone(),
                    Some(image) => {
                        debug!(image = %image, "cleanup stops at node still in use");
                        break;
                    }
                    None => break,
                }
            };
            self.destroy(&candidate).await?;
            destroyed += 1;
            next = candidate.backing_image_id;
        }
        if destroyed > 0 {
            info!(destroyed, "zero-reference cleanup finished");
        }
        Ok(destroyed)
    }
}
