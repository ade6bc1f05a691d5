//! End-to-end integration tests for sessiond.
//!
//! These tests drive a real WebSocket server on an ephemeral port with
//! `tokio-tungstenite` clients:
//! - Joining sessions over the URI path
//! - Fan-out that excludes the sender
//! - Rejection of unknown sessions
//! - Idle eviction and daemon shutdown closing live sockets

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use sessiond::config::Config;
use sessiond::network::WebSocketServer;
use sessiond::orchestrator::{DaemonOrchestrator, OrchestratorState};
use sessiond::session::{SessionError, SessionManager, SessionSettings};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server for `manager` on an ephemeral port.
async fn start_server(manager: Arc<SessionManager>) -> (SocketAddr, CancellationToken) {
    let server = WebSocketServer::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.run(manager, shutdown.clone()));
    (addr, shutdown)
}

async fn connect(addr: SocketAddr, key: &str) -> Client {
    let (client, _) = connect_async(format!("ws://{}/{}", addr, key))
        .await
        .unwrap();
    client
}

/// Poll until the session has `expected` members.
async fn wait_for_members(manager: &SessionManager, key: &str, expected: usize) {
    for _ in 0..100 {
        if manager.get_session(key).await.map(|m| m.len()) == Ok(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {} never reached {} members", key, expected);
}

/// Next text or binary message, skipping control frames.
async fn next_data(client: &mut Client, limit: Duration) -> Option<Message> {
    timeout(limit, async {
        while let Some(msg) = client.next().await {
            match msg {
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(msg) => return Some(msg),
                Err(_) => return None,
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Wait until the server closes the socket.
async fn expect_closed(client: &mut Client) {
    let ended = timeout(Duration::from_secs(2), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "socket was not closed by the server");
}

// =============================================================================
// Broadcast Tests
// =============================================================================

#[tokio::test]
async fn test_three_clients_hello_world() {
    let manager = Arc::new(SessionManager::new(["abcdefgh"], SessionSettings::default()));
    let (addr, shutdown) = start_server(Arc::clone(&manager)).await;

    let mut c1 = connect(addr, "abcdefgh").await;
    let mut c2 = connect(addr, "abcdefgh").await;
    let mut c3 = connect(addr, "abcdefgh").await;
    wait_for_members(&manager, "abcdefgh", 3).await;

    c1.send(Message::Text("hello world".to_string())).await.unwrap();

    let expected = Some(Message::Text("hello world".to_string()));
    assert_eq!(next_data(&mut c2, Duration::from_secs(1)).await, expected);
    assert_eq!(next_data(&mut c3, Duration::from_secs(1)).await, expected);

    // The sender never hears its own message
    assert_eq!(next_data(&mut c1, Duration::from_millis(200)).await, None);

    shutdown.cancel();
}

#[tokio::test]
async fn test_binary_relayed_as_binary() {
    let manager = Arc::new(SessionManager::new(["bin"], SessionSettings::default()));
    let (addr, shutdown) = start_server(Arc::clone(&manager)).await;

    let mut a = connect(addr, "bin").await;
    let mut b = connect(addr, "bin").await;
    wait_for_members(&manager, "bin", 2).await;

    a.send(Message::Binary(vec![0, 159, 146, 150])).await.unwrap();

    assert_eq!(
        next_data(&mut b, Duration::from_secs(1)).await,
        Some(Message::Binary(vec![0, 159, 146, 150]))
    );

    shutdown.cancel();
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let manager = Arc::new(SessionManager::new(["red", "blue"], SessionSettings::default()));
    let (addr, shutdown) = start_server(Arc::clone(&manager)).await;

    let mut red1 = connect(addr, "red").await;
    let mut red2 = connect(addr, "red").await;
    let mut blue = connect(addr, "blue").await;
    wait_for_members(&manager, "red", 2).await;
    wait_for_members(&manager, "blue", 1).await;

    red1.send(Message::Text("only red".to_string())).await.unwrap();

    assert_eq!(
        next_data(&mut red2, Duration::from_secs(1)).await,
        Some(Message::Text("only red".to_string()))
    );
    assert_eq!(next_data(&mut blue, Duration::from_millis(200)).await, None);

    shutdown.cancel();
}

// =============================================================================
// Join Tests
// =============================================================================

#[tokio::test]
async fn test_join_session_registered_at_runtime() {
    let manager = Arc::new(SessionManager::new(Vec::<String>::new(), SessionSettings::default()));
    manager.register_session("abcdefgh").unwrap();
    let (addr, shutdown) = start_server(Arc::clone(&manager)).await;

    let _client = connect(addr, "abcdefgh").await;
    wait_for_members(&manager, "abcdefgh", 1).await;

    assert_eq!(manager.get_session("abcdefgh").await.unwrap().len(), 1);
    shutdown.cancel();
}

#[tokio::test]
async fn test_unregistered_key_is_rejected() {
    let manager = Arc::new(SessionManager::new(["abcdefgh"], SessionSettings::default()));
    let (addr, shutdown) = start_server(Arc::clone(&manager)).await;

    // The handshake completes; the rejection arrives as a close frame
    let mut client = connect(addr, "zzz").await;

    let msg = timeout(Duration::from_secs(1), client.next())
        .await
        .expect("timeout")
        .expect("stream ended")
        .unwrap();
    match msg {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Policy);
            assert_eq!(frame.reason, "Session zzz not found");
        }
        other => panic!("expected close frame, got {:?}", other),
    }

    assert_eq!(manager.count(), 1);
    assert!(!manager.contains("zzz"));
    assert!(manager.get_session("abcdefgh").await.unwrap().is_empty());

    shutdown.cancel();
}

#[tokio::test]
async fn test_disconnect_removes_member() {
    let manager = Arc::new(SessionManager::new(["room"], SessionSettings::default()));
    let (addr, shutdown) = start_server(Arc::clone(&manager)).await;

    let mut a = connect(addr, "room").await;
    let _b = connect(addr, "room").await;
    wait_for_members(&manager, "room", 2).await;

    a.close(None).await.unwrap();
    wait_for_members(&manager, "room", 1).await;

    shutdown.cancel();
}

// =============================================================================
// Garbage Collection Tests
// =============================================================================

#[tokio::test]
async fn test_idle_session_evicted_and_socket_closed() {
    let settings = SessionSettings {
        ttl: Duration::from_millis(100),
        gc_interval: Duration::from_millis(50),
        send_timeout: Duration::from_millis(200),
    };
    let manager = Arc::new(SessionManager::new(["idle"], settings));
    let (addr, shutdown) = start_server(Arc::clone(&manager)).await;
    let gc = manager.start_gc_task(shutdown.clone());

    let mut client = connect(addr, "idle").await;
    wait_for_members(&manager, "idle", 1).await;

    expect_closed(&mut client).await;

    assert_eq!(
        manager.get_session("idle").await.err(),
        Some(SessionError::NotFound("idle".to_string()))
    );

    shutdown.cancel();
    timeout(Duration::from_secs(1), gc)
        .await
        .expect("gc task did not stop")
        .unwrap();
}

// =============================================================================
// Orchestrator Lifecycle Tests
// =============================================================================

fn create_test_config() -> Config {
    let mut config = Config::default();
    config.server.bind_addr = "127.0.0.1:0".to_string();
    config.sessions.initial = vec!["abcdefgh".to_string()];
    config
}

#[tokio::test]
async fn test_orchestrator_serves_clients() {
    let mut orchestrator = DaemonOrchestrator::new(create_test_config()).unwrap();
    orchestrator.start().await.unwrap();
    let addr = orchestrator.local_addr().unwrap();
    let manager = Arc::clone(orchestrator.session_manager());

    let mut a = connect(addr, "abcdefgh").await;
    let mut b = connect(addr, "abcdefgh").await;
    wait_for_members(&manager, "abcdefgh", 2).await;

    b.send(Message::Text("from b".to_string())).await.unwrap();
    assert_eq!(
        next_data(&mut a, Duration::from_secs(1)).await,
        Some(Message::Text("from b".to_string()))
    );

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_orchestrator_stop_closes_clients() {
    let mut orchestrator = DaemonOrchestrator::new(create_test_config()).unwrap();
    orchestrator.start().await.unwrap();
    let addr = orchestrator.local_addr().unwrap();
    let manager = Arc::clone(orchestrator.session_manager());

    let mut a = connect(addr, "abcdefgh").await;
    let mut b = connect(addr, "abcdefgh").await;
    wait_for_members(&manager, "abcdefgh", 2).await;

    orchestrator.stop().await.unwrap();
    assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);

    expect_closed(&mut a).await;
    expect_closed(&mut b).await;
    assert_eq!(manager.active_connections(), 0);

    // No longer accepting
    assert!(connect_async(format!("ws://{}/abcdefgh", addr)).await.is_err());
}
