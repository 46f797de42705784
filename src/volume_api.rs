use std::{future::Future, sync::Arc, time::Duration};

use block_commands::parse_size;
use chain_manager::{ChainError, ChainManager};
use data_model::VolumeInfo;
use metrics::chain_ops;
use qmp::query::NamedBlockNode;
use tonic::{Request, Response, Status};
use tracing::{error, info, info_span, Instrument};

use crate::proto::qsd_pb::{
    qsd_service_server::QsdService,
    BlockNode,
    CreateVolumeRequest,
    ListNodesRequest,
    ListNodesResponse,
    ListVolumesRequest,
    ListVolumesResponse,
    OperationResponse,
    SnapshotRequest,
    Volume,
    VolumeRequest,
};

/// gRPC face of the chain manager. Every mutating call is answered with
/// `success` and a human readable message; only malformed requests are
/// rejected with a status.
pub struct VolumeApi {
    manager: Arc<ChainManager>,
    metrics: chain_ops::Metrics,
    request_timeout: Duration,
}

impl VolumeApi {
    pub fn new(manager: Arc<ChainManager>, request_timeout: Duration) -> Self {
        Self {
            manager,
            metrics: chain_ops::Metrics::new(),
            request_timeout,
        }
    }

    /// Runs `work` on its own task so a client that goes away cannot abandon
    /// a chain change halfway through.
    async fn run<F>(
        &self,
        operation: &'static str,
        id: &str,
        work: F,
    ) -> Result<Response<OperationResponse>, Status>
    where
        F: Future<Output = Result<(), ChainError>> + Send + 'static,
    {
        let span = info_span!("rpc", operation, id = %id);
        let task = tokio::spawn(self.metrics.timed(operation, work).instrument(span.clone()));

        let outcome = match tokio::time::timeout(self.request_timeout, task).await {
            Ok(Ok(result)) => result.map_err(|err| err.to_string()),
            Ok(Err(join_err)) => Err(format!("{} task failed: {}", operation, join_err)),
            Err(_) => Err(format!(
                "{} did not finish within {:?}",
                operation, self.request_timeout
            )),
        };

        let _entered = span.enter();
        let response = match outcome {
            Ok(()) => {
                info!("{} succeeded", operation);
                OperationResponse {
                    success: true,
                    message: format!("{} {} succeeded", operation, id),
                }
            }
            Err(message) => {
                error!(error = %message, "{} failed", operation);
                OperationResponse {
                    success: false,
                    message,
                }
            }
        };
        Ok(Response::new(response))
    }
}

fn require_id<'a>(field: &str, id: &'a str) -> Result<&'a str, Status> {
    if id.trim().is_empty() {
        return Err(Status::invalid_argument(format!("{} is required", field)));
    }
    Ok(id)
}

fn requested_size(req: &CreateVolumeRequest) -> Result<u64, Status> {
    if req.size_bytes > 0 {
        return Ok(req.size_bytes);
    }
    match req.size.as_deref().filter(|size| !size.trim().is_empty()) {
        Some(size) => parse_size(size).map_err(|err| Status::invalid_argument(err.to_string())),
        None => Ok(0),
    }
}

impl From<VolumeInfo> for Volume {
    fn from(info: VolumeInfo) -> Self {
        Volume {
            id: info.id,
            node_id: info.node_id,
            backing_image_id: info.backing_image_id,
            file: info.file,
            ref_count: info.ref_count,
            depth: info.depth,
            volume_ref: info.volume_ref,
        }
    }
}

impl From<NamedBlockNode> for BlockNode {
    fn from(node: NamedBlockNode) -> Self {
        BlockNode {
            backing_file: node.image.and_then(|image| image.backing_filename),
            node_name: node.node_name,
            driver: node.drv,
            file: node.file,
            backing_file_depth: node.backing_file_depth,
            read_only: node.ro,
        }
    }
}

#[tonic::async_trait]
impl QsdService for VolumeApi {
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<OperationResponse>, Status> {
        let req = request.into_inner();
        let id = require_id("id", &req.id)?.to_string();
        let size_bytes = requested_size(&req)?;
        let source = req.source_volume_id.filter(|source| !source.is_empty());

        let manager = self.manager.clone();
        let name = id.clone();
        self.run("create_volume", &id, async move {
            manager
                .create_volume(&name, size_bytes, source.as_deref())
                .await
        })
        .await
    }

    async fn expose_export(
        &self,
        request: Request<VolumeRequest>,
    ) -> Result<Response<OperationResponse>, Status> {
        let id = require_id("id", &request.get_ref().id)?.to_string();
        let manager = self.manager.clone();
        let name = id.clone();
        self.run("expose_export", &id, async move {
            manager.expose_volume(&name).await
        })
        .await
    }

    async fn delete_exporter(
        &self,
        request: Request<VolumeRequest>,
    ) -> Result<Response<OperationResponse>, Status> {
        let id = require_id("id", &request.get_ref().id)?.to_string();
        let manager = self.manager.clone();
        let name = id.clone();
        self.run("delete_exporter", &id, async move {
            manager.delete_exporter(&name).await
        })
        .await
    }

    async fn delete_volume(
        &self,
        request: Request<VolumeRequest>,
    ) -> Result<Response<OperationResponse>, Status> {
        let id = require_id("id", &request.get_ref().id)?.to_string();
        let manager = self.manager.clone();
        let name = id.clone();
        self.run("delete_volume", &id, async move {
            manager.delete_volume(&name).await
        })
        .await
    }

    async fn create_snapshot(
        &self,
        request: Request<SnapshotRequest>,
    ) -> Result<Response<OperationResponse>, Status> {
        let req = request.into_inner();
        let id = require_id("id", &req.id)?.to_string();
        let source = require_id("source_volume_id", &req.source_volume_id)?.to_string();
        let manager = self.manager.clone();
        let name = id.clone();
        self.run("create_snapshot", &id, async move {
            manager.create_snapshot(&name, &source).await
        })
        .await
    }

    async fn delete_snapshot(
        &self,
        request: Request<SnapshotRequest>,
    ) -> Result<Response<OperationResponse>, Status> {
        let req = request.into_inner();
        let id = require_id("id", &req.id)?.to_string();
        let manager = self.manager.clone();
        let name = id.clone();
        self.run("delete_snapshot", &id, async move {
            manager.delete_snapshot(&name, &req.source_volume_id).await
        })
        .await
    }

    async fn list_volumes(
        &self,
        _request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        let volumes = self
            .manager
            .list_volumes()
            .await
            .into_iter()
            .map(Volume::from)
            .collect();
        Ok(Response::new(ListVolumesResponse { volumes }))
    }

    async fn list_nodes(
        &self,
        _request: Request<ListNodesRequest>,
    ) -> Result<Response<ListNodesResponse>, Status> {
        let nodes = self.manager.list_nodes().await.map_err(|err| {
            error!(error = %err, "list_nodes failed");
            Status::unavailable(err.to_string())
        })?;
        Ok(Response::new(ListNodesResponse {
            nodes: nodes.into_iter().map(BlockNode::from).collect(),
        }))
    }
}
