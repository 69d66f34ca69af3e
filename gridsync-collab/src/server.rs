//! WebSocket hub server with path-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  GET /ws/<doc_id>  (upgrade)
//!            ├──────────────────► HubServer ── SessionRegistry
//! Client B ──┘                        │              │
//!                                     │              ├── DocumentSession (doc 1)
//!                                     │              └── DocumentSession (doc 2)
//!                                     │
//!                                     └── PersistenceGateway (RocksDB / memory)
//! ```
//!
//! The upgrade is refused with `404 Not Found` when the path does not match
//! the configured prefix or names a document storage does not know. The
//! storage lookup runs on the blocking pool before the handshake, against
//! the request line peeked off the socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::WebSocketStream;

use crate::config::ServerConfig;
use crate::connection::{attach, ConnectionTasks, WsTransport};
use crate::error::HubError;
use crate::registry::SessionRegistry;
use crate::storage::PersistenceGateway;

/// Longest request line accepted while peeking for the document id.
const PEEK_LIMIT: usize = 2048;
const PEEK_ATTEMPTS: usize = 50;
const PEEK_INTERVAL: Duration = Duration::from_millis(10);

/// The hub server.
pub struct HubServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
}

impl HubServer {
    pub fn new(config: ServerConfig, gateway: Arc<dyn PersistenceGateway>) -> Self {
        let registry = Arc::new(SessionRegistry::new(gateway, config.hub.clone()));
        Self { config, registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), HubError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), HubError> {
        log::info!(
            "Hub listening on {} (documents under {})",
            listener.local_addr()?,
            self.config.path_prefix
        );

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let prefix = self.config.path_prefix.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, registry, prefix).await {
                    log::warn!("Connection from {addr} ended: {e}");
                }
            });
        }
    }
}

/// Document id addressed by `path`, if it sits directly under `prefix`.
pub fn document_id(path: &str, prefix: &str) -> Option<String> {
    let id = path.strip_prefix(prefix)?;
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(id.to_string())
}

fn refusal(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Path of the request-target in an HTTP request line, query stripped.
fn request_path(line: &[u8]) -> Option<String> {
    let line = std::str::from_utf8(line).ok()?;
    let mut parts = line.split_whitespace();
    let _method = parts.next()?;
    let target = parts.next()?;
    let path = target.split_once('?').map_or(target, |(path, _)| path);
    Some(path.to_string())
}

/// Read the request line at the head of `stream` without consuming it.
async fn peek_request_path(stream: &TcpStream) -> Option<String> {
    let mut buf = [0u8; PEEK_LIMIT];
    for _ in 0..PEEK_ATTEMPTS {
        let n = stream.peek(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        if let Some(end) = buf[..n].iter().position(|&b| b == b'\n') {
            return request_path(&buf[..end]);
        }
        if n == buf.len() {
            return None;
        }
        tokio::time::sleep(PEEK_INTERVAL).await;
    }
    None
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    prefix: String,
) -> Result<(), HubError> {
    let lookup = match peek_request_path(&stream)
        .await
        .and_then(|path| document_id(&path, &prefix))
    {
        Some(doc_id) => {
            let exists = registry.document_exists(&doc_id).await;
            Some((doc_id, exists))
        }
        None => None,
    };
    let mut target: Option<String> = None;

    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let path = request.uri().path();
        let Some(doc_id) = document_id(path, &prefix) else {
            log::debug!("Refusing {addr}: no route for {path}");
            return Err(refusal(StatusCode::NOT_FOUND, "unknown path"));
        };
        match &lookup {
            Some((checked, Ok(true))) if *checked == doc_id => {}
            Some((checked, Err(e))) if *checked == doc_id => {
                log::error!("Lookup of {doc_id} failed: {e}");
                return Err(refusal(StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable"));
            }
            _ => {
                log::debug!("Refusing {addr}: unknown document {doc_id}");
                return Err(refusal(StatusCode::NOT_FOUND, "document not found"));
            }
        }
        target = Some(doc_id);
        Ok(response)
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let Some(doc_id) = target else {
        return Ok(());
    };
    log::info!("WebSocket connection from {addr} for {doc_id}");

    on_connect(&registry, &doc_id, ws).await?;
    Ok(())
}

/// Join an upgraded socket to the session of `doc_id` and start its loops.
pub async fn on_connect<S>(
    registry: &SessionRegistry,
    doc_id: &str,
    ws: WebSocketStream<S>,
) -> Result<ConnectionTasks, HubError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let session = registry.get_or_create(doc_id).await?;
    let (sink, inbound) = ws.split();
    let transport = Arc::new(WsTransport::new(sink));
    let joined = session
        .join(transport, registry.next_client_name())
        .await?;
    Ok(attach(session, joined, inbound))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id_routing() {
        assert_eq!(document_id("/ws/abc123", "/ws/"), Some("abc123".into()));
        assert_eq!(document_id("/ws/", "/ws/"), None);
        assert_eq!(document_id("/ws/a/b", "/ws/"), None);
        assert_eq!(document_id("/other/abc", "/ws/"), None);
        assert_eq!(document_id("/docs/x", "/docs/"), Some("x".into()));
    }

    #[test]
    fn test_refusal_carries_status() {
        let response = refusal(StatusCode::NOT_FOUND, "document not found");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.body().as_deref(), Some("document not found"));
    }

    #[test]
    fn test_request_path() {
        assert_eq!(request_path(b"GET /ws/abc HTTP/1.1\r"), Some("/ws/abc".into()));
        assert_eq!(request_path(b"GET /ws/abc?token=1 HTTP/1.1"), Some("/ws/abc".into()));
        assert_eq!(request_path(b"GET"), None);
        assert_eq!(request_path(&[0xff, 0xfe]), None);
    }

    #[tokio::test]
    async fn test_peek_leaves_request_unread() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        // Request line split across two writes.
        client.write_all(b"GET /ws/doc").await.unwrap();
        client.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"-1 HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();

        assert_eq!(peek_request_path(&server).await, Some("/ws/doc-1".into()));

        let mut head = [0u8; 4];
        server.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"GET ");
    }
}
