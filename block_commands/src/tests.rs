use std::{sync::Arc, time::Duration};

use qmp::{command::CreateOptions, mock::MockTransport, Command};

use crate::{BlockCommands, BlockError};

const JOB_TIMEOUT: Duration = Duration::from_millis(200);

fn commands_over(mock: &Arc<MockTransport>) -> BlockCommands {
    BlockCommands::new(mock.clone(), JOB_TIMEOUT)
}

#[tokio::test]
async fn test_create_base_image_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    let mock = Arc::new(MockTransport::new());
    let block = commands_over(&mock);

    block.create_base_image(&path, "0f3a9c11", 1_000_000).await.unwrap();

    assert_eq!(
        mock.command_names(),
        vec![
            "blockdev-create",
            "query-jobs",
            "job-dismiss",
            "blockdev-add",
            "blockdev-create",
            "query-jobs",
            "job-dismiss",
            "blockdev-add",
        ]
    );
    let node = mock.node("node-0f3a9c11").unwrap();
    assert_eq!(node.driver, "qcow2");
    assert_eq!(node.file_node.as_deref(), Some("file-0f3a9c11"));
    assert!(node.backing.is_none());
    assert!(mock.jobs().is_empty(), "every job is dismissed");
    assert!(path.exists());

    let sized = mock.commands().into_iter().any(|c| {
        matches!(
            c,
            Command::BlockdevCreate {
                options: CreateOptions::Qcow2 { size: 1_000_000, backing_file: None, .. },
                ..
            }
        )
    });
    assert!(sized);
}

#[tokio::test]
async fn test_snapshot_from_root_takes_over_live_node() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("disk.img");
    let snap = dir.path().join("snap-77aa01bc");
    let mock = Arc::new(MockTransport::new());
    let block = commands_over(&mock);

    block.create_base_image(&base, "0f3a9c11", 1000).await.unwrap();
    block.expose_export("0f3a9c11", &dir.path().join("vhost.sock")).await.unwrap();
    mock.clear_commands();

    block
        .create_snapshot_from_root("0f3a9c11", "77aa01bc", &base, &snap, 1000)
        .await
        .unwrap();

    assert_eq!(mock.count("blockdev-snapshot"), 1);
    let overlay = mock.node("node-77aa01bc").unwrap();
    assert_eq!(overlay.backing.as_deref(), Some("node-0f3a9c11"));
    assert_eq!(mock.exports()["vhost-0f3a9c11"], "node-77aa01bc");

    let header_backing = mock.commands().into_iter().find_map(|c| match c {
        Command::BlockdevCreate {
            options: CreateOptions::Qcow2 { backing_file, backing_fmt, .. },
            ..
        } => Some((backing_file, backing_fmt)),
        _ => None,
    });
    assert_eq!(
        header_backing,
        Some((
            Some(base.to_string_lossy().to_string()),
            Some("qcow2".to_string())
        ))
    );
}

#[tokio::test]
async fn test_snapshot_with_backing_node_binds_directly() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("disk.img");
    let clone = dir.path().join("clone.img");
    let mock = Arc::new(MockTransport::new());
    let block = commands_over(&mock);

    block.create_base_image(&base, "0f3a9c11", 1000).await.unwrap();
    block
        .create_snapshot_with_backing_node("0f3a9c11", "c10ae001", &base, &clone, "0f3a9c11", 1000)
        .await
        .unwrap();

    assert_eq!(mock.count("blockdev-snapshot"), 0);
    assert_eq!(
        mock.node("node-c10ae001").unwrap().backing.as_deref(),
        Some("node-0f3a9c11")
    );
}

#[tokio::test]
async fn test_delete_node_removes_both_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockTransport::new());
    let block = commands_over(&mock);
    block
        .create_base_image(&dir.path().join("disk.img"), "0f3a9c11", 1000)
        .await
        .unwrap();

    block.delete_node("0f3a9c11").await.unwrap();
    assert!(mock.node_names().is_empty());

    let err = block.delete_node("0f3a9c11").await.unwrap_err();
    assert!(matches!(err, BlockError::NotFound(ref node) if node == "node-0f3a9c11"));
}

#[tokio::test]
async fn test_delete_busy_node_is_a_command_error() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("disk.img");
    let mock = Arc::new(MockTransport::new());
    let block = commands_over(&mock);
    block.create_base_image(&base, "0f3a9c11", 1000).await.unwrap();
    block
        .create_snapshot_with_backing_node(
            "0f3a9c11",
            "77aa01bc",
            &base,
            &dir.path().join("snap"),
            "0f3a9c11",
            1000,
        )
        .await
        .unwrap();

    let err = block.delete_node("0f3a9c11").await.unwrap_err();
    assert!(matches!(err, BlockError::Command { .. }), "{err}");
    assert!(mock.node("node-0f3a9c11").is_some());
}

#[tokio::test]
async fn test_job_timeout_when_job_never_concludes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    let mock = Arc::new(MockTransport::new());
    mock.hold_jobs(true);
    let block = commands_over(&mock);

    let err = block
        .create_base_image(&path, "0f3a9c11", 1000)
        .await
        .unwrap_err();
    assert!(
        matches!(err, BlockError::JobTimeout { ref job_id, .. } if job_id == "create-file-0f3a9c11"),
        "{err}"
    );
    assert_eq!(mock.count("job-cancel"), 1);
    assert_eq!(mock.count("job-dismiss"), 1);
    assert!(mock.jobs().is_empty(), "the timed out job is cleared");
    assert!(!path.exists(), "the half-created file is rolled back");
}

#[tokio::test]
async fn test_failed_job_is_reported_dismissed_and_rolled_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    let mock = Arc::new(MockTransport::new());
    mock.fail_job("create-0f3a9c11", "Could not resize image: No space left on device");
    let block = commands_over(&mock);

    let err = block
        .create_base_image(&path, "0f3a9c11", 1000)
        .await
        .unwrap_err();
    match err {
        BlockError::JobFailed { job_id, error } => {
            assert_eq!(job_id, "create-0f3a9c11");
            assert!(error.contains("No space left"));
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(mock.jobs().is_empty());
    assert!(mock.node_names().is_empty(), "file node rolled back");
    assert!(!path.exists());
}

#[tokio::test]
async fn test_export_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockTransport::new());
    let block = commands_over(&mock);
    block
        .create_base_image(&dir.path().join("disk.img"), "0f3a9c11", 1000)
        .await
        .unwrap();

    let socket = dir.path().join("vhost.sock");
    block.expose_export("0f3a9c11", &socket).await.unwrap();
    assert_eq!(mock.exports()["vhost-0f3a9c11"], "node-0f3a9c11");

    block.remove_export("0f3a9c11").await.unwrap();
    assert!(mock.exports().is_empty());
    let err = block.remove_export("0f3a9c11").await.unwrap_err();
    assert!(matches!(err, BlockError::NotFound(_)));

    let err = block.expose_export("missing1", &socket).await.unwrap_err();
    assert!(matches!(err, BlockError::NotFound(_)));
}

#[tokio::test]
async fn test_stream_reparents_overlay() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("disk.img");
    let mock = Arc::new(MockTransport::new());
    let block = commands_over(&mock);
    block.create_base_image(&base, "root0001", 1000).await.unwrap();
    block
        .create_snapshot_with_backing_node("root0001", "mid00001", &base, &dir.path().join("mid"), "root0001", 1000)
        .await
        .unwrap();
    block
        .create_snapshot_with_backing_node("mid00001", "top00001", &dir.path().join("mid"), &dir.path().join("top"), "mid00001", 1000)
        .await
        .unwrap();

    block.stream_image(Some("root0001"), "top00001").await.unwrap();
    assert_eq!(
        mock.node("node-top00001").unwrap().backing.as_deref(),
        Some("node-root0001")
    );
    assert!(mock.jobs().is_empty());

    let nodes = block.list_nodes().await.unwrap();
    let top = nodes.iter().find(|n| n.node_name == "node-top00001").unwrap();
    assert_eq!(top.backing_file_depth, 1);
    assert_eq!(top.drv, "qcow2");
}

#[tokio::test]
async fn test_commit_runs_a_dismissed_job() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("disk.img");
    let mock = Arc::new(MockTransport::new());
    let block = commands_over(&mock);
    block.create_base_image(&base, "0f3a9c11", 1000).await.unwrap();
    mock.clear_commands();

    block
        .commit_and_flatten("0f3a9c11", &dir.path().join("snap"), &base)
        .await
        .unwrap();
    assert_eq!(
        mock.command_names(),
        vec!["block-commit", "query-jobs", "job-dismiss"]
    );
}

#[tokio::test]
async fn test_transport_loss_is_not_a_command_error() {
    let mock = Arc::new(MockTransport::new());
    mock.set_disconnected(true);
    let block = commands_over(&mock);
    let err = block.list_nodes().await.unwrap_err();
    assert!(matches!(err, BlockError::Transport(_)), "{err}");
}
