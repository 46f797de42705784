use std::sync::Arc;

use anyhow::Result;
use chain_manager::DeletionPolicy;
use qmp::mock::MockTransport;
use tempfile::TempDir;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{config::NodeConfig, service::Service, volume_api::VolumeApi};

/// A node service over a scripted daemon and a scratch directory.
pub struct TestService {
    pub service: Service,
    pub daemon: Arc<MockTransport>,
    pub api: VolumeApi,
    // Dropped last, owns the image and socket directories.
    _temp_dir: TempDir,
}

impl TestService {
    pub async fn new() -> Result<Self> {
        Self::with_policy(DeletionPolicy::default()).await
    }

    pub async fn with_policy(deletion_policy: DeletionPolicy) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let temp_dir = tempfile::tempdir()?;
        let config = NodeConfig {
            images_dir: temp_dir.path().join("images"),
            sockets_dir: temp_dir.path().join("sockets"),
            qmp_socket: temp_dir.path().join("qmp.sock"),
            job_timeout_secs: 1,
            request_timeout_secs: 5,
            deletion_policy,
            ..Default::default()
        };
        config.validate()?;

        let daemon = Arc::new(MockTransport::new());
        let service = Service::with_transport(config, daemon.clone()).await?;
        let api = service.volume_api();
        Ok(Self {
            service,
            daemon,
            api,
            _temp_dir: temp_dir,
        })
    }
}
