//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real hub and connect real clients, verifying the
//! join, edit, leave and flush pipeline.

use futures_util::{SinkExt, StreamExt};
use gridsync_collab::config::{HubConfig, ServerConfig};
use gridsync_collab::protocol::{Envelope, EnvelopeKind};
use gridsync_collab::registry::SessionRegistry;
use gridsync_collab::server::HubServer;
use gridsync_collab::storage::MemoryStore;
use gridsync_core::{DocumentKind, WorkbookConfig};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::{http::StatusCode, Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EDIT: &str = r#"{"univerId":"doc-1","actionData":{"actionName":"SetRangeDataAction","operation":1,"sheetId":"sheet-01","cellValue":{"0":{"0":{"v":42}}}}}"#;

struct TestHub {
    port: u16,
    store: Arc<MemoryStore>,
    registry: Arc<SessionRegistry>,
}

/// Start a hub on a free port with one blank sheet stored as `doc-1`.
async fn start_test_hub() -> TestHub {
    let store = Arc::new(MemoryStore::new());
    store.insert(
        "doc-1",
        WorkbookConfig::blank("doc-1", DocumentKind::Sheet)
            .to_json()
            .unwrap(),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        storage_path: None,
        hub: HubConfig {
            send_timeout: Duration::from_millis(500),
            flush_backoff: Duration::from_millis(5),
            ..HubConfig::default()
        },
        ..ServerConfig::default()
    };
    let server = HubServer::new(config, store.clone());
    let registry = server.registry().clone();
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });

    TestHub {
        port,
        store,
        registry,
    }
}

async fn connect(port: u16, doc_id: &str) -> Client {
    let url = format!("ws://127.0.0.1:{port}/ws/{doc_id}");
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws
}

/// Next envelope from the hub, skipping control frames.
async fn recv(ws: &mut Client) -> Envelope {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("envelope within deadline")
            .expect("socket open")
            .expect("valid frame");
        if let Message::Text(text) = msg {
            return Envelope::decode(text.as_str()).unwrap();
        }
    }
}

async fn recv_kind(ws: &mut Client, kind: EnvelopeKind) -> Envelope {
    loop {
        let envelope = recv(ws).await;
        if envelope.kind == kind {
            return envelope;
        }
    }
}

async fn send_edit(ws: &mut Client, payload: &str) {
    let envelope = Envelope::data(0, payload, "", "");
    ws.send(Message::text(envelope.encode().unwrap()))
        .await
        .unwrap();
}

async fn wait_for_saves(store: &MemoryStore, doc_id: &str, count: usize) {
    for _ in 0..200 {
        if store.save_count(doc_id) >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} saves of {doc_id}, got {}", store.save_count(doc_id));
}

#[tokio::test]
async fn test_join_receives_document_then_roster() {
    let hub = start_test_hub().await;
    let mut ws = connect(hub.port, "doc-1").await;

    let document = recv(&mut ws).await;
    assert_eq!(document.kind, EnvelopeKind::Document);
    assert_eq!(document.revision, 0);
    assert!(document.client_id.starts_with("user-"));
    assert_eq!(WorkbookConfig::from_json(&document.data).unwrap().id, "doc-1");

    let roster = recv(&mut ws).await;
    assert_eq!(roster.kind, EnvelopeKind::Clients);
    let clients = roster.clients.unwrap();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].client_id, document.client_id);
}

#[tokio::test]
async fn test_edit_is_relayed_and_applied() {
    let hub = start_test_hub().await;
    let mut a = connect(hub.port, "doc-1").await;
    let a_id = recv_kind(&mut a, EnvelopeKind::Document).await.client_id;
    let mut b = connect(hub.port, "doc-1").await;
    recv_kind(&mut b, EnvelopeKind::Clients).await;

    send_edit(&mut a, EDIT).await;

    for ws in [&mut a, &mut b] {
        let data = recv_kind(ws, EnvelopeKind::Data).await;
        assert_eq!(data.revision, 1);
        assert_eq!(data.client_id, a_id);
        assert_eq!(data.data, EDIT);
    }

    let session = hub.registry.get("doc-1").await.unwrap();
    let workbook = session.config_snapshot().await;
    assert_eq!(workbook.cell("sheet-01", 0, 0).unwrap()["v"], 42);
}

#[tokio::test]
async fn test_late_joiner_sees_latest_state() {
    let hub = start_test_hub().await;
    let mut a = connect(hub.port, "doc-1").await;
    recv_kind(&mut a, EnvelopeKind::Clients).await;
    send_edit(&mut a, EDIT).await;
    recv_kind(&mut a, EnvelopeKind::Data).await;

    let mut b = connect(hub.port, "doc-1").await;
    let document = recv(&mut b).await;
    assert_eq!(document.kind, EnvelopeKind::Document);
    assert_eq!(document.revision, 1);
    assert_eq!(document.data, EDIT);
}

#[tokio::test]
async fn test_leave_announces_offline_without_flush() {
    let hub = start_test_hub().await;
    let mut a = connect(hub.port, "doc-1").await;
    let a_id = recv_kind(&mut a, EnvelopeKind::Document).await.client_id;
    let mut b = connect(hub.port, "doc-1").await;
    recv_kind(&mut b, EnvelopeKind::Clients).await;

    a.close(None).await.unwrap();

    let offline = recv_kind(&mut b, EnvelopeKind::Offline).await;
    assert_eq!(offline.client_id, a_id);
    assert_eq!(hub.store.save_count("doc-1"), 0);
}

#[tokio::test]
async fn test_last_leave_flushes_once() {
    let hub = start_test_hub().await;
    let mut a = connect(hub.port, "doc-1").await;
    recv_kind(&mut a, EnvelopeKind::Clients).await;
    let mut b = connect(hub.port, "doc-1").await;
    recv_kind(&mut b, EnvelopeKind::Clients).await;

    send_edit(&mut a, EDIT).await;
    recv_kind(&mut b, EnvelopeKind::Data).await;

    a.close(None).await.unwrap();
    b.close(None).await.unwrap();

    wait_for_saves(&hub.store, "doc-1", 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hub.store.save_count("doc-1"), 1);

    let saved = WorkbookConfig::from_json(&hub.store.get("doc-1").unwrap()).unwrap();
    assert_eq!(saved.cell("sheet-01", 0, 0).unwrap()["v"], 42);
}

#[tokio::test]
async fn test_unknown_document_is_refused() {
    let hub = start_test_hub().await;
    let url = format!("ws://127.0.0.1:{}/ws/missing", hub.port);

    match tokio_tungstenite::connect_async(&url).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::NOT_FOUND),
        other => panic!("expected 404, got {other:?}"),
    }
    assert_eq!(hub.registry.session_count().await, 0);
}

#[tokio::test]
async fn test_unknown_path_is_refused() {
    let hub = start_test_hub().await;
    let url = format!("ws://127.0.0.1:{}/other/doc-1", hub.port);

    match tokio_tungstenite::connect_async(&url).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::NOT_FOUND),
        other => panic!("expected 404, got {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_frames_do_not_drop_client() {
    let hub = start_test_hub().await;
    let mut a = connect(hub.port, "doc-1").await;
    recv_kind(&mut a, EnvelopeKind::Clients).await;

    a.send(Message::text("{ not an envelope")).await.unwrap();
    send_edit(&mut a, EDIT).await;

    let data = recv_kind(&mut a, EnvelopeKind::Data).await;
    assert_eq!(data.revision, 1);
}
