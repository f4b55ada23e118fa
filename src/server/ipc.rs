//! Async Unix socket server for the operation protocol.
//!
//! One JSON request per connection; `subscribe` keeps the connection open
//! and streams events until either side closes.

use crate::error::{RedubError, Result};
use crate::events::EventStream;
use crate::server::protocol::{Request, Response};
use crate::store::status::TaskStatus;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;

/// Handler trait for processing operation requests.
#[async_trait::async_trait]
pub trait OperationHandler: Send + Sync {
    /// Handle a single request and return a response.
    async fn handle(&self, request: Request) -> Response;

    /// Open a subscription: the snapshot status plus the live stream.
    async fn open_subscription(&self, task_id: &str) -> Result<(TaskStatus, EventStream)>;
}

/// State for managing server shutdown.
#[derive(Debug, Clone)]
struct ServerState {
    shutdown: Arc<Mutex<bool>>,
}

impl ServerState {
    fn new() -> Self {
        Self {
            shutdown: Arc::new(Mutex::new(false)),
        }
    }

    async fn is_shutdown(&self) -> bool {
        *self.shutdown.lock().await
    }

    async fn set_shutdown(&self) {
        *self.shutdown.lock().await = true;
    }
}

/// Operation server bound to a Unix socket.
pub struct IpcServer {
    socket_path: PathBuf,
    state: ServerState,
}

impl IpcServer {
    pub fn new(socket_path: PathBuf) -> Result<Self> {
        Ok(Self {
            socket_path,
            state: ServerState::new(),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Default socket path based on XDG_RUNTIME_DIR or a /tmp fallback.
    pub fn default_socket_path() -> PathBuf {
        if let Ok(xdg_runtime) = std::env::var("XDG_RUNTIME_DIR") {
            PathBuf::from(xdg_runtime).join("redub.sock")
        } else {
            PathBuf::from("/tmp/redub.sock")
        }
    }

    /// Accept and serve connections until `stop` is called.
    pub async fn start<H>(&self, handler: H) -> Result<()>
    where
        H: OperationHandler + 'static,
    {
        // Clean up any existing socket file
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| RedubError::IpcSocket {
                message: format!("Failed to remove existing socket: {e}"),
            })?;
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| RedubError::IpcSocket {
            message: format!("Failed to bind to socket: {e}"),
        })?;

        let handler = Arc::new(handler);

        loop {
            if self.state.is_shutdown().await {
                break;
            }

            // Accept with timeout so the shutdown flag is re-checked.
            let accept_result =
                tokio::time::timeout(tokio::time::Duration::from_millis(100), listener.accept())
                    .await;

            match accept_result {
                Ok(Ok((stream, _))) => {
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, handler).await {
                            tracing::debug!(error = %e, "client connection ended with error");
                        }
                    });
                }
                Ok(Err(e)) => {
                    return Err(RedubError::IpcSocket {
                        message: format!("Failed to accept connection: {e}"),
                    });
                }
                Err(_) => {
                    // Timeout - check shutdown flag again
                    continue;
                }
            }
        }

        Ok(())
    }

    /// Stop the server and clean up the socket file.
    pub async fn stop(&self) -> Result<()> {
        self.state.set_shutdown().await;
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| RedubError::IpcSocket {
                message: format!("Failed to remove socket file: {e}"),
            })?;
        }
        Ok(())
    }
}

/// Handle a single client connection.
async fn handle_client<H>(stream: UnixStream, handler: Arc<H>) -> Result<()>
where
    H: OperationHandler,
{
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    reader
        .read_line(&mut line)
        .await
        .map_err(|e| RedubError::IpcSocket {
            message: format!("Failed to read from client: {e}"),
        })?;

    let request = match Request::from_json(line.trim()) {
        Ok(request) => request,
        Err(e) => {
            let response = Response::Error {
                kind: "InvalidRequest".to_string(),
                message: format!("Failed to parse request: {e}"),
            };
            write_response(&mut writer, &response).await?;
            return Ok(());
        }
    };

    if let Request::Subscribe { task_id } = &request {
        return stream_events(&mut writer, handler, task_id).await;
    }

    let response = handler.handle(request).await;
    write_response(&mut writer, &response).await
}

/// Stream one task's events: current status first, then the live feed
/// until the channel closes or the client goes away.
async fn stream_events<H, W>(writer: &mut W, handler: Arc<H>, task_id: &str) -> Result<()>
where
    H: OperationHandler,
    W: AsyncWriteExt + Unpin,
{
    let (snapshot, mut stream) = match handler.open_subscription(task_id).await {
        Ok(opened) => opened,
        Err(e) => {
            let response = Response::error(&e);
            write_response(writer, &response).await?;
            return Ok(());
        }
    };

    let first = Response::Event {
        event: crate::events::EventEnvelope::status(&snapshot),
    };
    write_response(writer, &first).await?;

    while let Some(event) = stream.next().await {
        let response = Response::Event { event };
        if write_response(writer, &response).await.is_err() {
            // Client disconnected; unsubscribe is implicit.
            break;
        }
    }
    Ok(())
}

async fn write_response<W>(writer: &mut W, response: &Response) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let json = response.to_json().map_err(|e| RedubError::IpcProtocol {
        message: format!("Failed to serialize response: {e}"),
    })?;
    writer
        .write_all(json.as_bytes())
        .await
        .map_err(|e| RedubError::IpcSocket {
            message: format!("Failed to write to client: {e}"),
        })?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| RedubError::IpcSocket {
            message: format!("Failed to write newline to client: {e}"),
        })?;
    writer.flush().await.map_err(|e| RedubError::IpcSocket {
        message: format!("Failed to flush writer: {e}"),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use tempfile::TempDir;

    struct MockHandler {
        bus: Arc<EventBus>,
    }

    #[async_trait::async_trait]
    impl OperationHandler for MockHandler {
        async fn handle(&self, request: Request) -> Response {
            match request {
                Request::ListTasks => Response::Tasks {
                    tasks: vec!["t1".to_string()],
                },
                _ => Response::Ack {
                    message: "ok".to_string(),
                },
            }
        }

        async fn open_subscription(
            &self,
            task_id: &str,
        ) -> Result<(TaskStatus, EventStream)> {
            let status = TaskStatus::new(
                task_id.to_string(),
                "en".to_string(),
                "de".to_string(),
                false,
                None,
            );
            Ok((status, self.bus.subscribe(task_id)))
        }
    }

    async fn start_server(dir: &TempDir) -> (Arc<IpcServer>, Arc<EventBus>, PathBuf) {
        let socket_path = dir.path().join("test.sock");
        let bus = Arc::new(EventBus::new(16));
        let server = Arc::new(IpcServer::new(socket_path.clone()).unwrap());
        let handler = MockHandler {
            bus: Arc::clone(&bus),
        };
        {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.start(handler).await });
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        (server, bus, socket_path)
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let dir = TempDir::new().unwrap();
        let (server, _bus, socket_path) = start_server(&dir).await;

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half
            .write_all(b"{\"op\":\"list_tasks\"}\n")
            .await
            .unwrap();

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let response = Response::from_json(line.trim()).unwrap();
        assert_eq!(
            response,
            Response::Tasks {
                tasks: vec!["t1".to_string()]
            }
        );

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_request_gets_error_response() {
        let dir = TempDir::new().unwrap();
        let (server, _bus, socket_path) = start_server(&dir).await;

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(b"this is not json\n").await.unwrap();

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        match Response::from_json(line.trim()).unwrap() {
            Response::Error { kind, .. } => assert_eq!(kind, "InvalidRequest"),
            other => panic!("expected error, got {other:?}"),
        }

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_streams_snapshot_then_events() {
        let dir = TempDir::new().unwrap();
        let (server, bus, socket_path) = start_server(&dir).await;

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half
            .write_all(b"{\"op\":\"subscribe\",\"task_id\":\"t9\"}\n")
            .await
            .unwrap();

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        match Response::from_json(line.trim()).unwrap() {
            Response::Event { event } => {
                assert_eq!(event.kind, crate::events::EventKind::Status);
                assert_eq!(event.task_id, "t9");
            }
            other => panic!("expected snapshot event, got {other:?}"),
        }

        bus.publish(crate::events::EventEnvelope::new(
            "t9",
            crate::events::EventKind::Progress,
            serde_json::json!({"progress": 50.0}),
        ));
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        match Response::from_json(line.trim()).unwrap() {
            Response::Event { event } => {
                assert_eq!(event.kind, crate::events::EventKind::Progress);
            }
            other => panic!("expected progress event, got {other:?}"),
        }

        server.stop().await.unwrap();
    }
}
