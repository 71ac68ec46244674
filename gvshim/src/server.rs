//! Control socket.
//!
//! Newline-delimited JSON: one [`RequestFrame`] per line in, one
//! [`ResponseFrame`] per line out. Every request runs as its own task, so a
//! blocking Wait does not hold up other requests on the same connection.
//! Responses carry the request id and may arrive out of order.

use crate::service::TaskService;
use gvshim_shared::api::{RequestFrame, ResponseFrame, TaskRequest};
use gvshim_shared::errors::{ShimError, ShimResult};
use gvshim_shared::Transport;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Pending responses per connection before request tasks wait for the writer.
const RESPONSE_BUFFER: usize = 64;

/// Run one task-control request against the service.
pub async fn dispatch(service: &TaskService, request: TaskRequest) -> ShimResult<Value> {
    Ok(match request {
        TaskRequest::Create(req) => serde_json::to_value(service.create(req).await?)?,
        TaskRequest::Start(req) => serde_json::to_value(service.start(req).await?)?,
        TaskRequest::Delete => serde_json::to_value(service.delete().await?)?,
        TaskRequest::DeleteProcess(req) => {
            serde_json::to_value(service.delete_process(req).await?)?
        }
        TaskRequest::Exec(req) => serde_json::to_value(service.exec(req).await?)?,
        TaskRequest::ResizePty(req) => serde_json::to_value(service.resize_pty(req).await?)?,
        TaskRequest::State(req) => serde_json::to_value(service.state(req).await?)?,
        TaskRequest::Pause => serde_json::to_value(service.pause().await?)?,
        TaskRequest::Resume => serde_json::to_value(service.resume().await?)?,
        TaskRequest::Kill(req) => serde_json::to_value(service.kill(req).await?)?,
        TaskRequest::ListPids(req) => serde_json::to_value(service.list_pids(req).await?)?,
        TaskRequest::CloseIo(req) => serde_json::to_value(service.close_io(req).await?)?,
        TaskRequest::Checkpoint(req) => serde_json::to_value(service.checkpoint(req).await?)?,
        TaskRequest::ShimInfo => serde_json::to_value(service.shim_info())?,
        TaskRequest::Update(req) => serde_json::to_value(service.update(req).await?)?,
        TaskRequest::Wait(req) => serde_json::to_value(service.wait(req).await?)?,
    })
}

/// Serves the task service on a transport.
pub struct ShimServer {
    service: Arc<TaskService>,
}

impl ShimServer {
    pub fn new(service: Arc<TaskService>) -> Self {
        Self { service }
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn run(
        self,
        transport: Transport,
        shutdown: impl Future<Output = ()>,
    ) -> ShimResult<()> {
        tokio::pin!(shutdown);

        match transport {
            Transport::Unix { socket_path } => {
                if socket_path.exists() {
                    std::fs::remove_file(&socket_path)?;
                }
                if let Some(parent) = socket_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let listener = UnixListener::bind(&socket_path).map_err(|e| {
                    ShimError::Internal(format!(
                        "failed to bind {}: {}",
                        socket_path.display(),
                        e
                    ))
                })?;
                info!(socket = %socket_path.display(), "Listening on unix socket");

                loop {
                    tokio::select! {
                        _ = &mut shutdown => break,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, _)) => {
                                tokio::spawn(handle_connection(stream, "unix".to_string(), self.service.clone()));
                            }
                            Err(e) => error!(error = %e, "Accept failed"),
                        }
                    }
                }

                if let Err(e) = std::fs::remove_file(&socket_path) {
                    warn!(socket = %socket_path.display(), error = %e, "Failed to remove socket");
                }
            }
            Transport::Tcp { port } => {
                let listener = TcpListener::bind(("127.0.0.1", port)).await?;
                info!(port, "Listening on loopback TCP");

                loop {
                    tokio::select! {
                        _ = &mut shutdown => break,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, peer)) => {
                                tokio::spawn(handle_connection(stream, format!("tcp:{}", peer), self.service.clone()));
                            }
                            Err(e) => error!(error = %e, "Accept failed"),
                        }
                    }
                }
            }
        }

        info!("Control socket closed");
        Ok(())
    }
}

/// Write one NDJSON line.
async fn write_ndjson<W: AsyncWrite + Unpin>(writer: &mut W, frame: &ResponseFrame) -> ShimResult<()> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

async fn handle_connection<S>(stream: S, peer: String, service: Arc<TaskService>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    debug!(peer = %peer, "Connection accepted");
    let (reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::channel::<ResponseFrame>(RESPONSE_BUFFER);

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_ndjson(&mut writer, &frame).await {
                debug!(error = %e, "Connection closed while writing");
                break;
            }
        }
    });

    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let frame = match serde_json::from_str::<RequestFrame>(&line) {
            Ok(frame) => frame,
            Err(e) => {
                let err = ShimError::InvalidArgument(format!("malformed request: {}", e));
                let _ = tx.send(ResponseFrame::err(0, &err)).await;
                continue;
            }
        };

        let service = service.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let id = frame.id;
            let result = match frame.request() {
                Ok(request) => {
                    let method = request.method();
                    debug!(id, method, "Request");
                    let result = dispatch(&service, request).await;
                    if let Err(e) = &result {
                        debug!(id, method, error = %e, "Request failed");
                    }
                    result
                }
                Err(e) => Err(e),
            };
            let response = match result {
                Ok(value) => ResponseFrame::ok(id, value),
                Err(e) => ResponseFrame::err(id, &e),
            };
            if tx.send(response).await.is_err() {
                debug!(id, "Connection gone, dropping response");
            }
        });
    }

    // The writer finishes once every in-flight request has answered.
    drop(tx);
    if let Err(e) = writer_task.await {
        error!(peer = %peer, error = %e, "Writer task failed");
    }
    debug!(peer = %peer, "Connection closed");
}
