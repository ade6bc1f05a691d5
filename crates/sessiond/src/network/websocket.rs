//! WebSocket connection handle.
//!
//! Wraps an upgraded `tokio-tungstenite` stream as a [`ConnectionHandle`].
//! The stream is split so the relay loop can wait on reads while broadcasts
//! from other members write concurrently.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::session::{
    ConnectionError, ConnectionHandle, ConnectionId, ConnectionState, ConnectionStatus, Frame,
    HandleFuture,
};

/// Upper bound on sending the close frame during teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<TcpStream>;

/// A joined WebSocket client.
pub struct WebSocketConnection {
    id: ConnectionId,
    status: ConnectionStatus,
    sink: Mutex<SplitSink<WsStream, WsMessage>>,
    stream: Mutex<SplitStream<WsStream>>,
    /// Cancelled on close to wake a pending receive.
    closed: CancellationToken,
}

impl WebSocketConnection {
    /// Wraps an upgraded stream. `id` is usually the peer's socket address.
    pub fn new(id: impl Into<ConnectionId>, ws: WsStream) -> Self {
        let (sink, stream) = ws.split();
        Self {
            id: id.into(),
            status: ConnectionStatus::new(),
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: CancellationToken::new(),
        }
    }

    /// Closes the connection with a policy-violation close frame.
    ///
    /// Used when the connection cannot be admitted to a session.
    pub async fn reject(&self, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::Policy,
            reason: reason.to_string().into(),
        };
        self.shutdown(Some(frame)).await;
    }

    async fn shutdown(&self, frame: Option<CloseFrame<'static>>) {
        if !self.status.begin_close() {
            return;
        }
        self.closed.cancel();

        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(CLOSE_TIMEOUT, sink.send(WsMessage::Close(frame))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::trace!(conn_id = %self.id, error = %e, "Close frame not delivered");
            }
            Err(_) => {
                tracing::trace!(conn_id = %self.id, "Close frame timed out");
            }
        }
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
        drop(sink);

        self.status.finish_close();
        tracing::debug!(conn_id = %self.id, "WebSocket connection closed");
    }
}

impl ConnectionHandle for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn state(&self) -> ConnectionState {
        self.status.get()
    }

    fn send(&self, frame: Frame) -> HandleFuture<'_, Result<(), ConnectionError>> {
        Box::pin(async move {
            if !self.status.is_open() {
                return Err(ConnectionError::Closed);
            }
            let mut sink = self.sink.lock().await;
            sink.send(frame.into()).await.map_err(ConnectionError::from)
        })
    }

    fn receive(&self) -> HandleFuture<'_, Result<Frame, ConnectionError>> {
        Box::pin(async move {
            let mut stream = self.stream.lock().await;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.closed.cancelled() => return Err(ConnectionError::Closed),
                    next = stream.next() => next,
                };

                match next {
                    Some(Ok(WsMessage::Text(text))) => return Ok(Frame::Text(text)),
                    Some(Ok(WsMessage::Binary(data))) => return Ok(Frame::Binary(data)),
                    Some(Ok(WsMessage::Close(_))) | None => return Err(ConnectionError::Closed),
                    // Control frames are answered by the transport.
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {
                        continue
                    }
                    Some(Err(e)) => return Err(ConnectionError::from(e)),
                }
            }
        })
    }

    fn close(&self) -> HandleFuture<'_, ()> {
        Box::pin(self.shutdown(None))
    }
}

impl From<Frame> for WsMessage {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => WsMessage::Text(text),
            Frame::Binary(data) => WsMessage::Binary(data),
        }
    }
}

impl From<WsError> for ConnectionError {
    fn from(err: WsError) -> Self {
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => ConnectionError::Closed,
            other => ConnectionError::Transport(other.to_string()),
        }
    }
}
