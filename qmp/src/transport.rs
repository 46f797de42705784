use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{Command, EventStream, QmpError, QmpSession};

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Channel to the storage daemon used by the command layer.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, command: &Command) -> Result<Value, QmpError>;

    /// Subscribe to daemon events. Take the subscription before issuing the
    /// command whose events are awaited.
    async fn subscribe_events(&self) -> Result<EventStream, QmpError>;
}

/// Process-wide QMP transport. Holds one session and replaces it lazily once
/// the daemon has dropped it.
pub struct QmpTransport {
    socket: PathBuf,
    command_timeout: Duration,
    session: Mutex<Option<Arc<QmpSession>>>,
}

impl QmpTransport {
    pub async fn connect(socket: &Path, command_timeout: Duration) -> Result<Self, QmpError> {
        let session = QmpSession::connect(socket, command_timeout).await?;
        Ok(Self {
            socket: socket.to_path_buf(),
            command_timeout,
            session: Mutex::new(Some(Arc::new(session))),
        })
    }

    /// Keep trying to connect until `startup_timeout` has passed. The daemon
    /// usually starts next to this process and may not be listening yet.
    pub async fn connect_with_retry(
        socket: &Path,
        command_timeout: Duration,
        startup_timeout: Duration,
    ) -> Result<Self, QmpError> {
        let deadline = Instant::now() + startup_timeout;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match Self::connect(socket, command_timeout).await {
                Ok(transport) => return Ok(transport),
                Err(err) if Instant::now() + CONNECT_RETRY_INTERVAL < deadline => {
                    warn!(
                        attempt,
                        socket = %socket.display(),
                        error = %err,
                        "storage daemon not reachable yet, retrying"
                    );
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn session(&self) -> Result<Arc<QmpSession>, QmpError> {
        let mut current = self.session.lock().await;
        if let Some(session) = current.as_ref() {
            if !session.is_closed() {
                return Ok(session.clone());
            }
            info!(socket = %self.socket.display(), "QMP session lost, reconnecting");
        }
        *current = None;
        let session = Arc::new(QmpSession::connect(&self.socket, self.command_timeout).await?);
        *current = Some(session.clone());
        Ok(session)
    }
}

#[async_trait]
impl Transport for QmpTransport {
    async fn execute(&self, command: &Command) -> Result<Value, QmpError> {
        self.session().await?.execute(command).await
    }

    async fn subscribe_events(&self) -> Result<EventStream, QmpError> {
        Ok(self.session().await?.subscribe_events())
    }
}
