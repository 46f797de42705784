use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use block_commands::BlockCommands;
use chain_manager::{ChainManager, Layout};
use qmp::{QmpTransport, Transport};
use tokio::{
    signal,
    sync::watch::{self, Receiver, Sender},
};
use tonic::transport::Server;
use tracing::{info, Instrument};

use crate::{
    config::NodeConfig,
    proto::{qsd_pb::qsd_service_server::QsdServiceServer, QSD_FILE_DESCRIPTOR_SET},
    volume_api::VolumeApi,
};

pub struct Service {
    pub config: NodeConfig,
    pub manager: Arc<ChainManager>,
    pub shutdown_tx: Sender<()>,
    pub shutdown_rx: Receiver<()>,
}

impl Service {
    /// Connect to the storage daemon, waiting for its monitor socket to show
    /// up for at most `startup_timeout_secs`.
    pub async fn new(config: NodeConfig) -> Result<Self> {
        let transport = QmpTransport::connect_with_retry(
            &config.qmp_socket,
            config.command_timeout(),
            config.startup_timeout(),
        )
        .await
        .with_context(|| {
            format!(
                "connecting to storage daemon at {}",
                config.qmp_socket.display()
            )
        })?;
        info!(socket = %config.qmp_socket.display(), "connected to storage daemon");
        Self::with_transport(config, Arc::new(transport)).await
    }

    pub async fn with_transport(config: NodeConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        for dir in [&config.images_dir, &config.sockets_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }

        let block = BlockCommands::new(transport, config.job_timeout());
        let layout = Layout::new(config.images_dir.clone(), config.sockets_dir.clone());
        let manager = Arc::new(ChainManager::new(block, layout, config.deletion_policy));

        Ok(Self {
            config,
            manager,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn volume_api(&self) -> VolumeApi {
        VolumeApi::new(self.manager.clone(), self.config.request_timeout())
    }

    pub async fn start(&self) -> Result<()> {
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(
            async move {
                shutdown_signal(shutdown_tx).await;
                info!("graceful shutdown signal received, shutting down server gracefully");
            }
            .in_current_span(),
        );

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        let mut shutdown_rx = self.shutdown_rx.clone();
        let reflection_service = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(QSD_FILE_DESCRIPTOR_SET)
            .build_v1()?;

        info!(
            policy = self.config.deletion_policy.as_ref(),
            "server grpc listening on {}", addr
        );
        Server::builder()
            .add_service(QsdServiceServer::new(self.volume_api()))
            .add_service(reflection_service)
            .serve_with_shutdown(addr, async move {
                shutdown_rx.changed().await.ok();
            })
            .await?;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send(()).ok();
    }
}

async fn shutdown_signal(shutdown_tx: Sender<()>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {:?}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to install SIGTERM handler: {:?}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    shutdown_tx.send(()).ok();
    info!("signal received, shutting down server gracefully");
}
