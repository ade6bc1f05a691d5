//! WebSocket accept loop.
//!
//! The server listens on a TCP socket, upgrades every inbound connection and
//! hands it to the [`SessionManager`] under the key named by the first path
//! segment of the request URI (`ws://host:port/<key>`).

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::websocket::WebSocketConnection;
use crate::session::{ConnectionHandle, SessionManager};

/// Upper bound on the WebSocket upgrade of a single connection.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A server that accepts WebSocket clients into sessions.
pub struct WebSocketServer {
    listener: TcpListener,
}

impl WebSocketServer {
    /// Bind the server to `addr`.
    ///
    /// Port 0 picks an ephemeral port; see [`local_addr`](Self::local_addr).
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub async fn bind(addr: SocketAddr) -> Result<Self, io::Error> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Returns the address the server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` is cancelled.
    ///
    /// Each connection is upgraded on its own task. Handshakes still in
    /// flight when the loop stops are abandoned and awaited before returning.
    pub async fn run(self, manager: Arc<SessionManager>, shutdown: CancellationToken) {
        let handshakes = TaskTracker::new();

        match self.listener.local_addr() {
            Ok(addr) => tracing::info!(%addr, "WebSocket server listening"),
            Err(e) => tracing::warn!(error = %e, "WebSocket server listening on unknown address"),
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        handshakes.spawn(handle_connection(
                            stream,
                            peer,
                            Arc::clone(&manager),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        // Usually a transient resource limit; keep accepting.
                        tracing::warn!(error = %e, "Failed to accept TCP connection");
                    }
                },
            }
        }

        handshakes.close();
        handshakes.wait().await;
        tracing::info!("WebSocket server stopped");
    }
}

/// Upgrades one TCP connection and joins it to the session its path names.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    manager: Arc<SessionManager>,
    shutdown: CancellationToken,
) {
    let mut path = String::new();
    let capture_path = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        path = request.uri().path().to_string();
        Ok(response)
    };

    let upgrade = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        tokio_tungstenite::accept_hdr_async(stream, capture_path),
    );
    let ws = tokio::select! {
        _ = shutdown.cancelled() => return,
        upgraded = upgrade => match upgraded {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                tracing::debug!(%peer, error = %e, "WebSocket handshake failed");
                return;
            }
            Err(_) => {
                tracing::debug!(%peer, "WebSocket handshake timed out");
                return;
            }
        },
    };

    let key = session_key_from_path(&path);
    let connection = Arc::new(WebSocketConnection::new(peer.to_string(), ws));
    let handle: Arc<dyn ConnectionHandle> = connection.clone();

    if let Err(e) = manager.join(key, handle).await {
        tracing::info!(%peer, session_key = %key, error = %e, "Rejected connection");
        connection.reject(&e.to_string()).await;
    }
}

/// Extracts the session key from a request path.
///
/// The key is the first non-empty segment; an empty path yields an empty key,
/// which no session can be registered under.
pub fn session_key_from_path(path: &str) -> &str {
    path.split('/').find(|segment| !segment.is_empty()).unwrap_or("")
}
