#[cfg(test)]
mod tests {
    use anyhow::Result;
    use chain_manager::DeletionPolicy;
    use tonic::{Code, Request};

    use crate::{
        proto::qsd_pb::{
            qsd_service_server::QsdService,
            CreateVolumeRequest,
            ListNodesRequest,
            ListVolumesRequest,
            OperationResponse,
            SnapshotRequest,
            Volume,
            VolumeRequest,
        },
        testing::TestService,
    };

    const ROOT: &str = "pvc-11111111-aaaa";
    const CLONE: &str = "pvc-33333333-cccc";
    const SNAP1: &str = "snapshot-22222222-bb";
    const SNAP2: &str = "snapshot-44444444-dd";
    const SIZE: u64 = 10_000_000;

    fn create_request(id: &str, size_bytes: u64) -> Request<CreateVolumeRequest> {
        Request::new(CreateVolumeRequest {
            id: id.to_string(),
            size_bytes,
            source_volume_id: None,
            size: None,
        })
    }

    fn volume_request(id: &str) -> Request<VolumeRequest> {
        Request::new(VolumeRequest { id: id.to_string() })
    }

    fn snapshot_request(id: &str, source: &str) -> Request<SnapshotRequest> {
        Request::new(SnapshotRequest {
            id: id.to_string(),
            source_volume_id: source.to_string(),
        })
    }

    async fn create_root(test: &TestService) -> Result<OperationResponse> {
        Ok(test
            .api
            .create_volume(create_request(ROOT, SIZE))
            .await?
            .into_inner())
    }

    async fn volumes(test: &TestService) -> Result<Vec<Volume>> {
        Ok(test
            .api
            .list_volumes(Request::new(ListVolumesRequest {}))
            .await?
            .into_inner()
            .volumes)
    }

    fn find<'a>(volumes: &'a [Volume], id: &str) -> &'a Volume {
        volumes
            .iter()
            .find(|v| v.id == id)
            .unwrap_or_else(|| panic!("{} not listed in {:?}", id, volumes))
    }

    #[tokio::test]
    async fn test_volume_lifecycle_through_the_api() -> Result<()> {
        let test = TestService::new().await?;

        assert!(create_root(&test).await?.success);
        let exposed = test.api.expose_export(volume_request(ROOT)).await?.into_inner();
        assert!(exposed.success, "{}", exposed.message);
        assert_eq!(
            test.daemon.exports().get("vhost-11111111").map(String::as_str),
            Some("node-11111111")
        );

        let snap = test
            .api
            .create_snapshot(snapshot_request(SNAP1, ROOT))
            .await?
            .into_inner();
        assert!(snap.success, "{}", snap.message);
        // The live snapshot takes over the running export.
        assert_eq!(
            test.daemon.exports().get("vhost-11111111").map(String::as_str),
            Some("node-22222222")
        );

        let listed = volumes(&test).await?;
        assert_eq!(listed.len(), 2);
        let root = find(&listed, ROOT);
        assert_eq!(root.node_id, "11111111");
        assert_eq!(root.ref_count, 1);
        assert_eq!(root.depth, 0);
        let snapshot = find(&listed, SNAP1);
        assert_eq!(snapshot.backing_image_id.as_deref(), Some(ROOT));
        assert_eq!(snapshot.depth, 1);
        assert!(snapshot.file.ends_with("snap-22222222"));

        let unexported = test.api.delete_exporter(volume_request(ROOT)).await?.into_inner();
        assert!(unexported.success, "{}", unexported.message);
        assert!(test.daemon.exports().is_empty());

        // The snapshot is still the layer the volume writes to.
        let deleted = test
            .api
            .delete_snapshot(snapshot_request(SNAP1, ROOT))
            .await?
            .into_inner();
        assert!(deleted.success, "{}", deleted.message);
        assert_eq!(volumes(&test).await?.len(), 2);

        let deleted = test.api.delete_volume(volume_request(ROOT)).await?.into_inner();
        assert!(deleted.success, "{}", deleted.message);
        assert!(volumes(&test).await?.is_empty());
        assert!(test
            .daemon
            .node_names()
            .iter()
            .all(|name| !name.starts_with("node-")));
        Ok(())
    }

    #[tokio::test]
    async fn test_clone_reads_from_source() -> Result<()> {
        let test = TestService::new().await?;
        assert!(create_root(&test).await?.success);

        let clone = test
            .api
            .create_volume(Request::new(CreateVolumeRequest {
                id: CLONE.to_string(),
                size_bytes: 0,
                source_volume_id: Some(ROOT.to_string()),
                size: None,
            }))
            .await?
            .into_inner();
        assert!(clone.success, "{}", clone.message);

        let listed = volumes(&test).await?;
        assert_eq!(find(&listed, ROOT).ref_count, 1);
        let clone = find(&listed, CLONE);
        assert_eq!(clone.backing_image_id.as_deref(), Some(ROOT));
        assert!(clone.file.ends_with("disk.img"));
        Ok(())
    }

    #[tokio::test]
    async fn test_size_string_is_parsed_when_bytes_are_unset() -> Result<()> {
        let test = TestService::new().await?;
        let response = test
            .api
            .create_volume(Request::new(CreateVolumeRequest {
                id: ROOT.to_string(),
                size_bytes: 0,
                source_volume_id: None,
                size: Some("300M".to_string()),
            }))
            .await?
            .into_inner();
        assert!(response.success, "{}", response.message);

        let size = test
            .service
            .manager
            .inspect(|registry| registry.image(ROOT).map(|image| image.size_bytes))
            .await;
        assert_eq!(size, Some(300_000_000));
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_requests_are_rejected() -> Result<()> {
        let test = TestService::new().await?;

        let status = test
            .api
            .create_volume(create_request("", SIZE))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);

        let status = test
            .api
            .create_volume(Request::new(CreateVolumeRequest {
                id: ROOT.to_string(),
                size_bytes: 0,
                source_volume_id: None,
                size: Some("300 Mi".to_string()),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);

        let status = test
            .api
            .create_snapshot(snapshot_request(SNAP1, ""))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);

        let status = test.api.delete_volume(volume_request("  ")).await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);

        assert!(test.daemon.commands().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_failures_are_reported_in_the_response() -> Result<()> {
        let test = TestService::new().await?;

        let missing_size = test
            .api
            .create_volume(create_request(ROOT, 0))
            .await?
            .into_inner();
        assert!(!missing_size.success);
        assert!(missing_size.message.contains("needs a size"), "{}", missing_size.message);

        let unknown_source = test
            .api
            .create_snapshot(snapshot_request(SNAP1, ROOT))
            .await?
            .into_inner();
        assert!(!unknown_source.success);
        assert!(unknown_source.message.contains("not found"), "{}", unknown_source.message);

        test.daemon.fail_next("blockdev-create", "Could not create file");
        let failed = create_root(&test).await?;
        assert!(!failed.success);
        assert!(volumes(&test).await?.is_empty());
        assert!(test.daemon.node_names().is_empty());

        // The daemon recovers, so does the volume.
        assert!(create_root(&test).await?.success);
        assert_eq!(volumes(&test).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_deleting_unknown_names_succeeds() -> Result<()> {
        let test = TestService::new().await?;
        assert!(test.api.delete_volume(volume_request(ROOT)).await?.into_inner().success);
        assert!(
            test.api
                .delete_snapshot(snapshot_request(SNAP1, ROOT))
                .await?
                .into_inner()
                .success
        );
        assert!(test.api.delete_exporter(volume_request(ROOT)).await?.into_inner().success);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_nodes_reports_daemon_view() -> Result<()> {
        let test = TestService::new().await?;
        assert!(create_root(&test).await?.success);
        assert!(
            test.api
                .create_snapshot(snapshot_request(SNAP1, ROOT))
                .await?
                .into_inner()
                .success
        );

        let nodes = test
            .api
            .list_nodes(Request::new(ListNodesRequest {}))
            .await?
            .into_inner()
            .nodes;
        let overlay = nodes
            .iter()
            .find(|node| node.node_name == "node-22222222")
            .expect("overlay node listed");
        assert_eq!(overlay.driver, "qcow2");
        assert_eq!(overlay.backing_file_depth, 1);
        let file = nodes
            .iter()
            .find(|node| node.node_name == "file-11111111")
            .expect("file node listed");
        assert_eq!(file.driver, "file");

        test.daemon.set_disconnected(true);
        let status = test
            .api
            .list_nodes(Request::new(ListNodesRequest {}))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
        Ok(())
    }

    #[tokio::test]
    async fn test_flatten_policy_removes_internal_snapshot() -> Result<()> {
        let test = TestService::with_policy(DeletionPolicy::Flatten).await?;
        assert!(create_root(&test).await?.success);
        for snapshot in [SNAP1, SNAP2] {
            let response = test
                .api
                .create_snapshot(snapshot_request(snapshot, ROOT))
                .await?
                .into_inner();
            assert!(response.success, "{}", response.message);
        }

        let deleted = test
            .api
            .delete_snapshot(snapshot_request(SNAP1, ROOT))
            .await?
            .into_inner();
        assert!(deleted.success, "{}", deleted.message);

        let listed = volumes(&test).await?;
        assert_eq!(listed.len(), 2);
        let top = find(&listed, SNAP2);
        assert_eq!(top.backing_image_id.as_deref(), Some(ROOT));
        assert_eq!(top.depth, 1);
        assert_eq!(test.daemon.count("block-stream"), 1);
        assert!(test.daemon.node("node-22222222").is_none());
        Ok(())
    }
}
