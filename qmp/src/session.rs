use std::{
    collections::HashMap,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::{
    net::{unix::OwnedWriteHalf, UnixStream},
    sync::{broadcast, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_util::{
    codec::{FramedRead, FramedWrite, LinesCodec},
    sync::CancellationToken,
};
use tracing::{debug, info, trace, warn};

use crate::{Command, Event, EventStream, QmpError, ReplyError};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

enum Reply {
    Return(Value),
    Error(ReplyError),
}

/// Any message the daemon sends after the greeting.
#[derive(Deserialize)]
struct Incoming {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default, rename = "return")]
    ret: Option<Value>,
    #[serde(default)]
    error: Option<ReplyError>,
    #[serde(default)]
    event: Option<String>,
}

/// One negotiated QMP connection.
///
/// A background task reads the socket, completes pending commands by `id`
/// and broadcasts events. The task is aborted when the session is dropped.
pub struct QmpSession {
    writer: Mutex<FramedWrite<OwnedWriteHalf, LinesCodec>>,
    pending: Pending,
    events: broadcast::Sender<Event>,
    next_id: AtomicU64,
    closed: CancellationToken,
    reader: JoinHandle<()>,
    command_timeout: Duration,
}

impl QmpSession {
    /// Connect to the daemon's QMP socket, read the greeting and leave
    /// capabilities negotiation mode.
    pub async fn connect(path: &Path, command_timeout: Duration) -> Result<Self, QmpError> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| QmpError::Connect {
                path: path.to_path_buf(),
                source,
            })?;
        let (read_half, write_half) = stream.into_split();
        let mut lines = FramedRead::new(read_half, LinesCodec::new());

        let greeting = tokio::time::timeout(command_timeout, lines.next())
            .await
            .map_err(|_| QmpError::Handshake("no greeting from the daemon".to_string()))?
            .ok_or_else(|| QmpError::Handshake("connection closed before greeting".to_string()))??;
        let greeting: Value = serde_json::from_str(&greeting)?;
        if greeting.get("QMP").is_none() {
            return Err(QmpError::Handshake(format!(
                "unexpected greeting: {}",
                greeting
            )));
        }
        debug!(greeting = %greeting, "received QMP greeting");

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let closed = CancellationToken::new();
        let reader = tokio::spawn(read_loop(
            lines,
            pending.clone(),
            events.clone(),
            closed.clone(),
        ));

        let session = Self {
            writer: Mutex::new(FramedWrite::new(write_half, LinesCodec::new())),
            pending,
            events,
            next_id: AtomicU64::new(0),
            closed,
            reader,
            command_timeout,
        };
        session
            .execute(&Command::QmpCapabilities)
            .await
            .map_err(|e| QmpError::Handshake(e.to_string()))?;
        info!(socket = %path.display(), "QMP session established");
        Ok(session)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Send `command` and wait for its reply.
    pub async fn execute(&self, command: &Command) -> Result<Value, QmpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::to_string(&command.to_request(id)?)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        // The reader drains `pending` after cancelling, so a command
        // registered after that point would otherwise never complete.
        if self.is_closed() {
            self.pending.lock().await.remove(&id);
            return Err(QmpError::Disconnected);
        }

        trace!(command = command.as_ref(), id, request = %line, "sending QMP command");
        let exchange = async {
            self.writer.lock().await.send(line).await?;
            rx.await.map_err(|_| QmpError::Disconnected)
        };
        let reply = match tokio::time::timeout(self.command_timeout, exchange).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                self.pending.lock().await.remove(&id);
                return Err(err);
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(QmpError::Timeout {
                    command: command.as_ref().to_string(),
                    after: self.command_timeout,
                });
            }
        };

        match reply {
            Reply::Return(value) => Ok(value),
            Reply::Error(err) => {
                debug!(
                    command = command.as_ref(),
                    class = %err.class,
                    desc = %err.desc,
                    "QMP command failed"
                );
                Err(QmpError::command(command, err))
            }
        }
    }

    /// Subscribe to events received from now on. The stream ends when the
    /// connection is lost.
    pub fn subscribe_events(&self) -> EventStream {
        BroadcastStream::new(self.events.subscribe())
            .filter_map(|item| async move {
                match item {
                    Ok(event) => Some(event),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "QMP event subscriber lagged, events dropped");
                        None
                    }
                }
            })
            .take_until(self.closed.clone().cancelled_owned())
            .boxed()
    }

    pub fn disconnect(&self) {
        self.closed.cancel();
        self.reader.abort();
    }
}

impl Drop for QmpSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn read_loop(
    mut lines: FramedRead<tokio::net::unix::OwnedReadHalf, LinesCodec>,
    pending: Pending,
    events: broadcast::Sender<Event>,
    closed: CancellationToken,
) {
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "QMP read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let incoming: Incoming = match serde_json::from_str(&line) {
            Ok(incoming) => incoming,
            Err(err) => {
                warn!(error = %err, line = %line, "ignoring malformed QMP message");
                continue;
            }
        };

        if incoming.event.is_some() {
            match serde_json::from_str::<Event>(&line) {
                Ok(event) => {
                    trace!(event = %event.event, data = %event.data, "QMP event");
                    // No subscribers is fine, nobody is waiting on a job.
                    let _ = events.send(event);
                }
                Err(err) => warn!(error = %err, "ignoring malformed QMP event"),
            }
            continue;
        }

        let Some(id) = incoming.id.as_ref().and_then(Value::as_u64) else {
            warn!(line = %line, "QMP reply without a request id");
            continue;
        };
        let reply = match (incoming.ret, incoming.error) {
            (_, Some(err)) => Reply::Error(err),
            (Some(value), None) => Reply::Return(value),
            (None, None) => Reply::Return(Value::Null),
        };
        match pending.lock().await.remove(&id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(id, "QMP reply for an abandoned command"),
        }
    }

    info!("QMP connection closed");
    closed.cancel();
    pending.lock().await.clear();
}
