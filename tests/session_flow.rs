//! End-to-end tests over real TCP connections.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use async_trait::async_trait;
use backup_protocol::config::ServerConfig;
use backup_protocol::core::packet::{write_name_field, ClientId, RequestCode, WireMessage};
use backup_protocol::error::{ProtocolError, Result};
use backup_protocol::protocol::handshake::{ClientKeyPair, SessionKey};
use backup_protocol::protocol::message::{Response, WireResponse, RESPONSE_HEADER_LEN};
use backup_protocol::service::{BackupClient, BackupOutcome};
use backup_protocol::storage::{ClientRecord, FileRecord, FileStore, MemoryStore, Store};
use backup_protocol::transport::Server;
use backup_protocol::utils::checksum::checksum;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

fn keys() -> ClientKeyPair {
    static KEYS: OnceLock<ClientKeyPair> = OnceLock::new();
    KEYS.get_or_init(|| ClientKeyPair::generate().expect("key generation"))
        .clone()
}

struct Running {
    addr: SocketAddr,
    stop: mpsc::Sender<()>,
    handle: JoinHandle<Result<()>>,
}

async fn start_with(store: Arc<dyn Store>, tweak: impl FnOnce(&mut ServerConfig)) -> Running {
    let mut config = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        metrics_interval: Duration::ZERO,
        ..ServerConfig::default()
    };
    tweak(&mut config);

    let server = Server::new(config, store);
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stop_rx) = mpsc::channel(1);
    let handle = tokio::spawn(server.run_with_shutdown(listener, stop_rx));
    Running { addr, stop, handle }
}

async fn start(store: Arc<dyn Store>) -> Running {
    start_with(store, |_| {}).await
}

async fn read_response(stream: &mut TcpStream) -> WireResponse {
    let mut header = [0u8; RESPONSE_HEADER_LEN];
    stream.read_exact(&mut header).await.unwrap();
    let len = u32::from_le_bytes([header[3], header[4], header[5], header[6]]) as usize;
    let mut frame = header.to_vec();
    frame.resize(RESPONSE_HEADER_LEN + len, 0);
    stream
        .read_exact(&mut frame[RESPONSE_HEADER_LEN..])
        .await
        .unwrap();
    WireResponse::decode(&frame).unwrap()
}

async fn expect_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("server did not close")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

// ============================================================================
// HAPPY PATHS
// ============================================================================

#[tokio::test]
async fn test_register_and_backup() {
    let store = Arc::new(MemoryStore::new());
    let server = start(store.clone()).await;

    let mut client = BackupClient::connect(server.addr, keys()).await.unwrap();
    let response = client.sign_up("alice").await.unwrap();
    let id = match response {
        Response::SignUpSucceeded { client_id } => client_id,
        other => panic!("unexpected {other:?}"),
    };
    assert!(matches!(
        client.send_public_key().await.unwrap(),
        Response::PublicKeyReceived { client_id, .. } if client_id == id
    ));

    let outcome = client.backup_file("notes.txt", b"hello").await.unwrap();
    assert_eq!(outcome, BackupOutcome::Validated { attempts: 1 });

    let record = store.find_file(&id, "notes.txt").await.unwrap().unwrap();
    assert!(record.validated);
    assert_eq!(store.contents(&id, "notes.txt").await.unwrap(), b"hello");
}

#[tokio::test]
async fn test_sign_in_after_reconnect() {
    let store = Arc::new(MemoryStore::new());
    let server = start(store.clone()).await;

    let id = {
        let mut client = BackupClient::connect(server.addr, keys()).await.unwrap();
        client.sign_up("bob").await.unwrap();
        client.send_public_key().await.unwrap();
        client.client_id()
    };

    let mut client = BackupClient::connect(server.addr, keys()).await.unwrap();
    assert!(matches!(
        client.sign_in(id, "bob").await.unwrap(),
        Response::SignInAllowed { .. }
    ));
    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let outcome = client.backup_file("data.bin", &data).await.unwrap();
    assert_eq!(outcome, BackupOutcome::Validated { attempts: 1 });
    assert_eq!(store.contents(&id, "data.bin").await.unwrap(), data);
}

#[tokio::test]
async fn test_file_store_backend_writes_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::open(dir.path(), "clients.db").await.unwrap());
    let server = start(store.clone()).await;

    let mut client = BackupClient::connect(server.addr, keys()).await.unwrap();
    client.sign_up("carol").await.unwrap();
    client.send_public_key().await.unwrap();
    client.backup_file("report.txt", b"quarterly numbers").await.unwrap();

    let id = client.client_id();
    let record = store.find_file(&id, "report.txt").await.unwrap().unwrap();
    assert!(record.validated);
    assert_eq!(
        tokio::fs::read(&record.location).await.unwrap(),
        b"quarterly numbers"
    );
}

// ============================================================================
// RETRY PROTOCOL
// ============================================================================

#[tokio::test]
async fn test_wrong_key_exhausts_retries_and_closes() {
    let store = Arc::new(MemoryStore::new());
    let server = start(store.clone()).await;

    let mut client = BackupClient::connect(server.addr, keys()).await.unwrap();
    client.sign_up("dave").await.unwrap();
    client.send_public_key().await.unwrap();
    client.set_session_key(SessionKey::from_bytes([0x5A; 16]));

    let outcome = client.backup_file("broken.txt", b"will not match").await.unwrap();
    assert_eq!(outcome, BackupOutcome::GaveUp);
    assert!(matches!(
        client.recv().await,
        Err(ProtocolError::ConnectionClosed) | Err(ProtocolError::Io(_))
    ));

    let id = client.client_id();
    let record = store.find_file(&id, "broken.txt").await.unwrap().unwrap();
    assert!(!record.validated);
    assert_ne!(
        store.contents(&id, "broken.txt").await.unwrap(),
        b"will not match"
    );
}

// ============================================================================
// FRAMING
// ============================================================================

#[tokio::test]
async fn test_unknown_code_answered_and_connection_kept() {
    let server = start(Arc::new(MemoryStore::new())).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let mut frame = vec![0u8; 16];
    frame.push(3);
    frame.extend_from_slice(&2000u16.to_le_bytes());
    frame.extend_from_slice(&0u32.to_le_bytes());
    stream.write_all(&frame).await.unwrap();
    let reply = read_response(&mut stream).await;
    assert_eq!(reply.response, Response::GeneralError);
    assert_eq!(reply.version, 3);

    let sign_up = WireMessage::new(
        ClientId::UNSET,
        3,
        RequestCode::SignUp,
        write_name_field("erin").unwrap().to_vec(),
    );
    stream.write_all(&sign_up.encode()).await.unwrap();
    assert!(matches!(
        read_response(&mut stream).await.response,
        Response::SignUpSucceeded { .. }
    ));
}

#[tokio::test]
async fn test_wrong_payload_size_is_general_error() {
    let server = start(Arc::new(MemoryStore::new())).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let short = WireMessage::new(ClientId::UNSET, 3, RequestCode::SignUp, b"frank".to_vec());
    stream.write_all(&short.encode()).await.unwrap();
    assert_eq!(
        read_response(&mut stream).await.response,
        Response::GeneralError
    );
}

#[tokio::test]
async fn test_frame_split_across_writes() {
    let server = start(Arc::new(MemoryStore::new())).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.set_nodelay(true).unwrap();

    let bytes = WireMessage::new(
        ClientId::UNSET,
        3,
        RequestCode::SignUp,
        write_name_field("gina").unwrap().to_vec(),
    )
    .encode();
    for chunk in bytes.chunks(7) {
        stream.write_all(chunk).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(matches!(
        read_response(&mut stream).await.response,
        Response::SignUpSucceeded { .. }
    ));
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let server = start_with(Arc::new(MemoryStore::new()), |c| c.max_payload_size = 1024).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let mut header = vec![0u8; 16];
    header.push(3);
    header.extend_from_slice(&1028u16.to_le_bytes());
    header.extend_from_slice(&(1u32 << 20).to_le_bytes());
    stream.write_all(&header).await.unwrap();

    assert_eq!(
        read_response(&mut stream).await.response,
        Response::GeneralError
    );
    expect_closed(&mut stream).await;
}

#[tokio::test]
async fn test_malformed_give_up_still_closes() {
    let server = start(Arc::new(MemoryStore::new())).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let give_up = WireMessage::new(
        ClientId::UNSET,
        3,
        RequestCode::CrcInvalid4thTime,
        vec![0u8; 10],
    );
    stream.write_all(&give_up.encode()).await.unwrap();

    assert_eq!(
        read_response(&mut stream).await.response,
        Response::GeneralError
    );
    expect_closed(&mut stream).await;
}

#[tokio::test]
async fn test_malformed_request_keeps_connection() {
    let server = start(Arc::new(MemoryStore::new())).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let bad = WireMessage::new(ClientId::UNSET, 3, RequestCode::CrcInvalid, vec![0u8; 10]);
    stream.write_all(&bad.encode()).await.unwrap();
    assert_eq!(
        read_response(&mut stream).await.response,
        Response::GeneralError
    );

    let sign_up = WireMessage::new(
        ClientId::UNSET,
        3,
        RequestCode::SignUp,
        write_name_field("kate").unwrap().to_vec(),
    );
    stream.write_all(&sign_up.encode()).await.unwrap();
    assert!(matches!(
        read_response(&mut stream).await.response,
        Response::SignUpSucceeded { .. }
    ));
}

// ============================================================================
// CONCURRENCY
// ============================================================================

#[tokio::test]
async fn test_racing_sign_ups_register_once() {
    let store = Arc::new(MemoryStore::new());
    let server = start(store.clone()).await;

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let addr = server.addr;
        tasks.push(tokio::spawn(async move {
            let mut client = BackupClient::connect(addr, keys()).await.unwrap();
            client.sign_up("same-name").await.unwrap()
        }));
    }

    let mut succeeded = 0;
    for task in tasks {
        match task.await.unwrap() {
            Response::SignUpSucceeded { .. } => succeeded += 1,
            Response::SignUpFailed => {}
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(succeeded, 1);
    assert!(store.find_by_name("same-name").await.unwrap().is_some());
}

#[tokio::test]
async fn test_connections_beyond_limit_wait() {
    let server = start_with(Arc::new(MemoryStore::new()), |c| c.max_connections = 1).await;

    let mut first = BackupClient::connect(server.addr, keys()).await.unwrap();
    first.sign_up("holder").await.unwrap();

    let mut second = BackupClient::connect(server.addr, keys()).await.unwrap();
    let waiting = tokio::time::timeout(Duration::from_millis(200), second.sign_up("waiter")).await;
    assert!(waiting.is_err(), "second connection should not be served yet");

    drop(first);
    let response = tokio::time::timeout(Duration::from_secs(5), second.recv())
        .await
        .expect("served after first left")
        .unwrap();
    assert!(matches!(response, Response::SignUpSucceeded { .. }));
}

// ============================================================================
// SHUTDOWN
// ============================================================================

#[tokio::test]
async fn test_stop_request_closes_everything() {
    let server = start(Arc::new(MemoryStore::new())).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    // make sure the connection task is running
    let sign_up = WireMessage::new(
        ClientId::UNSET,
        3,
        RequestCode::SignUp,
        write_name_field("ivan").unwrap().to_vec(),
    );
    stream.write_all(&sign_up.encode()).await.unwrap();
    read_response(&mut stream).await;

    server.stop.send(()).await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), server.handle)
        .await
        .expect("server stopped")
        .unwrap();
    assert!(result.is_ok());
    expect_closed(&mut stream).await;
}

struct UnavailableStore;

#[async_trait]
impl Store for UnavailableStore {
    async fn create_client(&self, _: &str) -> Result<ClientId> {
        Err(ProtocolError::StorageUnavailable("database offline".into()))
    }
    async fn find_by_name(&self, _: &str) -> Result<Option<ClientRecord>> {
        Ok(None)
    }
    async fn find_by_identity(&self, _: &ClientId) -> Result<Option<ClientRecord>> {
        Ok(None)
    }
    async fn set_public_key(&self, _: &ClientId, _: &[u8]) -> Result<()> {
        Ok(())
    }
    async fn set_session_key(&self, _: &ClientId, _: &SessionKey) -> Result<()> {
        Ok(())
    }
    async fn store_unvalidated_file(&self, _: &ClientId, _: &str, _: &[u8]) -> Result<String> {
        Ok(String::new())
    }
    async fn mark_validated(&self, _: &ClientId, _: &str) -> Result<()> {
        Ok(())
    }
    async fn find_file(&self, _: &ClientId, _: &str) -> Result<Option<FileRecord>> {
        Ok(None)
    }
}

#[tokio::test]
async fn test_storage_loss_aborts_server() {
    let server = start(Arc::new(UnavailableStore)).await;
    let mut client = BackupClient::connect(server.addr, keys()).await.unwrap();
    // the connection is torn down without a reply
    let _ = client.sign_up("judy").await;

    let result = tokio::time::timeout(Duration::from_secs(5), server.handle)
        .await
        .expect("server aborted")
        .unwrap();
    assert!(matches!(result, Err(ProtocolError::StorageUnavailable(_))));
    drop(server.stop);
}

#[test]
fn test_checksum_matches_reference_value() {
    assert_eq!(checksum(b"hello"), 3_287_646_509);
}
