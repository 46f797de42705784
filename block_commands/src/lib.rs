//! The storage daemon's object model: protocol and format nodes, block jobs
//! and vhost-user exports.
//!
//! Every image `<id>` is a qcow2 format node `node-<id>` stacked on a file
//! protocol node `file-<id>`. Nothing here keeps state; the backing chain
//! bookkeeping lives in the chain manager.

mod error;
mod jobs;
pub mod size;

use std::{path::Path, sync::Arc, time::Duration};

pub use error::BlockError;
use qmp::{
    command::{BlockdevOptions, CreateOptions, ExportType, SocketAddress},
    query::NamedBlockNode,
    Command, Transport,
};
pub use size::{parse_size, parse_size_to_byte_string};
use tracing::{debug, info, warn};

use data_model::{export_id, file_node_name, format_node_name};

pub const QCOW2: &str = "qcow2";

pub struct BlockCommands {
    transport: Arc<dyn Transport>,
    job_timeout: Duration,
}

impl BlockCommands {
    pub fn new(transport: Arc<dyn Transport>, job_timeout: Duration) -> Self {
        Self {
            transport,
            job_timeout,
        }
    }

    /// Create a standalone qcow2 image at `path` and open it as `node-<id>`.
    pub async fn create_base_image(
        &self,
        path: &Path,
        id: &str,
        size_bytes: u64,
    ) -> Result<(), BlockError> {
        let result = async {
            self.create_image_file(path, id, size_bytes, None).await?;
            self.add_format_node(id, None).await
        }
        .await;
        if result.is_err() {
            self.discard(id, path).await;
        } else {
            info!(node = %format_node_name(id), path = %path.display(), size_bytes, "created base image");
        }
        result
    }

    /// Remove `node-<id>` and the protocol node below it.
    pub async fn delete_node(&self, id: &str) -> Result<(), BlockError> {
        let node = format_node_name(id);
        self.transport
            .execute(&Command::BlockdevDel {
                node_name: node.clone(),
            })
            .await
            .map_err(|err| {
                if err.is_not_found() {
                    BlockError::NotFound(node.clone())
                } else {
                    BlockError::wrap(format!("delete node {}", node))(err)
                }
            })?;

        let file = file_node_name(id);
        match self
            .transport
            .execute(&Command::BlockdevDel {
                node_name: file.clone(),
            })
            .await
        {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                debug!(node = %file, "protocol node already gone");
            }
            Err(err) => return Err(BlockError::wrap(format!("delete node {}", file))(err)),
        }
        debug!(node = %node, "deleted block node");
        Ok(())
    }

    /// Create an overlay over `base_file` and make it the new top of the live
    /// `node-<base_id>`. Used when nothing else reads from the base node yet.
    pub async fn create_snapshot_from_root(
        &self,
        base_id: &str,
        snapshot_id: &str,
        base_file: &Path,
        snapshot_file: &Path,
        size_bytes: u64,
    ) -> Result<(), BlockError> {
        let result = async {
            self.create_image_file(snapshot_file, snapshot_id, size_bytes, Some(base_file))
                .await?;
            // Opened without a backing node, `blockdev-snapshot` attaches it.
            self.add_format_node(snapshot_id, Some(None)).await?;
            let node = format_node_name(base_id);
            let overlay = format_node_name(snapshot_id);
            self.transport
                .execute(&Command::BlockdevSnapshot {
                    node: node.clone(),
                    overlay: overlay.clone(),
                })
                .await
                .map_err(BlockError::wrap(format!(
                    "snapshot {} onto {}",
                    node, overlay
                )))?;
            Ok(())
        }
        .await;
        if result.is_err() {
            self.discard(snapshot_id, snapshot_file).await;
        } else {
            info!(base = %base_id, snapshot = %snapshot_id, "created live snapshot");
        }
        result
    }

    /// Create an overlay over `base_file` and open it bound to the existing
    /// `node-<backing_node_id>`.
    pub async fn create_snapshot_with_backing_node(
        &self,
        base_id: &str,
        snapshot_id: &str,
        base_file: &Path,
        snapshot_file: &Path,
        backing_node_id: &str,
        size_bytes: u64,
    ) -> Result<(), BlockError> {
        let result = async {
            self.create_image_file(snapshot_file, snapshot_id, size_bytes, Some(base_file))
                .await?;
            self.add_format_node(snapshot_id, Some(Some(format_node_name(backing_node_id))))
                .await
        }
        .await;
        if result.is_err() {
            self.discard(snapshot_id, snapshot_file).await;
        } else {
            info!(
                base = %base_id,
                snapshot = %snapshot_id,
                backing = %format_node_name(backing_node_id),
                "created overlay on existing node"
            );
        }
        result
    }

    pub async fn expose_export(&self, id: &str, socket_path: &Path) -> Result<(), BlockError> {
        let export = export_id(id);
        self.transport
            .execute(&Command::BlockExportAdd {
                kind: ExportType::VhostUserBlk,
                id: export.clone(),
                node_name: format_node_name(id),
                writable: true,
                addr: SocketAddress::Unix {
                    path: socket_path.to_string_lossy().to_string(),
                },
            })
            .await
            .map_err(|err| {
                if err.is_not_found() {
                    BlockError::NotFound(format_node_name(id))
                } else {
                    BlockError::wrap(format!("add export {}", export))(err)
                }
            })?;
        info!(export = %export, socket = %socket_path.display(), "exported block node");
        Ok(())
    }

    pub async fn remove_export(&self, id: &str) -> Result<(), BlockError> {
        let export = export_id(id);
        self.transport
            .execute(&Command::BlockExportDel { id: export.clone() })
            .await
            .map_err(|err| {
                if err.is_not_found() {
                    BlockError::NotFound(export.clone())
                } else {
                    BlockError::wrap(format!("remove export {}", export))(err)
                }
            })?;
        info!(export = %export, "removed export");
        Ok(())
    }

    /// Commit the data of `top_file` down into `base_file` through the
    /// active node `node-<active_id>`.
    ///
    /// The chain manager flattens by streaming into the child instead, which
    /// keeps the child's node; this is the merge in the other direction for
    /// callers that drive the daemon directly.
    pub async fn commit_and_flatten(
        &self,
        active_id: &str,
        top_file: &Path,
        base_file: &Path,
    ) -> Result<(), BlockError> {
        let job_id = format!("commit-{}", active_id);
        self.run_job(
            Command::BlockCommit {
                job_id: job_id.clone(),
                device: format_node_name(active_id),
                top: top_file.to_string_lossy().to_string(),
                base: base_file.to_string_lossy().to_string(),
                auto_dismiss: false,
            },
            &job_id,
        )
        .await
    }

    /// Copy everything above `node-<base_id>` into `node-<overlay_id>`, or the
    /// whole chain when there is no base. The overlay is re-parented onto the
    /// base once the job concludes.
    pub async fn stream_image(
        &self,
        base_id: Option<&str>,
        overlay_id: &str,
    ) -> Result<(), BlockError> {
        let job_id = format!("stream-{}", overlay_id);
        self.run_job(
            Command::BlockStream {
                job_id: job_id.clone(),
                device: format_node_name(overlay_id),
                base_node: base_id.map(format_node_name),
                auto_dismiss: false,
            },
            &job_id,
        )
        .await
    }

    pub async fn list_nodes(&self) -> Result<Vec<NamedBlockNode>, BlockError> {
        let command = Command::QueryNamedBlockNodes;
        let reply = self
            .transport
            .execute(&command)
            .await
            .map_err(BlockError::wrap("list block nodes"))?;
        serde_json::from_value(reply).map_err(|source| BlockError::Decode {
            command: command.as_ref().to_string(),
            source,
        })
    }

    /// Create the file and format it as qcow2, optionally recording
    /// `backing_file` in the image header. Leaves `file-<id>` open.
    async fn create_image_file(
        &self,
        path: &Path,
        id: &str,
        size_bytes: u64,
        backing_file: Option<&Path>,
    ) -> Result<(), BlockError> {
        let filename = path.to_string_lossy().to_string();
        let file_job = format!("create-file-{}", id);
        self.run_job(
            Command::BlockdevCreate {
                job_id: file_job.clone(),
                options: CreateOptions::File {
                    filename: filename.clone(),
                    size: 0,
                },
            },
            &file_job,
        )
        .await?;

        let file_node = file_node_name(id);
        self.transport
            .execute(&Command::BlockdevAdd(BlockdevOptions::File {
                node_name: file_node.clone(),
                filename,
            }))
            .await
            .map_err(BlockError::wrap(format!("open {}", path.display())))?;

        let format_job = format!("create-{}", id);
        self.run_job(
            Command::BlockdevCreate {
                job_id: format_job.clone(),
                options: CreateOptions::Qcow2 {
                    file: file_node,
                    size: size_bytes,
                    backing_file: backing_file.map(|p| p.to_string_lossy().to_string()),
                    backing_fmt: backing_file.map(|_| QCOW2.to_string()),
                },
            },
            &format_job,
        )
        .await
    }

    async fn add_format_node(
        &self,
        id: &str,
        backing: Option<Option<String>>,
    ) -> Result<(), BlockError> {
        let node = format_node_name(id);
        self.transport
            .execute(&Command::BlockdevAdd(BlockdevOptions::Qcow2 {
                node_name: node.clone(),
                file: file_node_name(id),
                backing,
            }))
            .await
            .map_err(BlockError::wrap(format!("add node {}", node)))?;
        Ok(())
    }

    /// Best-effort cleanup of a half-created image.
    async fn discard(&self, id: &str, path: &Path) {
        for node in [format_node_name(id), file_node_name(id)] {
            match self
                .transport
                .execute(&Command::BlockdevDel {
                    node_name: node.clone(),
                })
                .await
            {
                Ok(_) => debug!(node = %node, "rolled back block node"),
                Err(err) if err.is_not_found() => {}
                Err(err) => warn!(node = %node, error = %err, "failed to roll back block node"),
            }
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "rolled back image file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "failed to roll back image file"),
        }
    }
}

#[cfg(test)]
mod tests;
