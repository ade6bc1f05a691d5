//! In-process connection handles.
//!
//! [`MemoryConnection`] implements [`ConnectionHandle`] over a pair of bounded
//! channels; the [`MemoryPeer`] returned alongside it plays the remote client.
//! Used by tests and by embedders that relay between local tasks.

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::handle::{
    ConnectionError, ConnectionHandle, ConnectionId, ConnectionState, ConnectionStatus, Frame,
    HandleFuture,
};

/// Default channel capacity in each direction.
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Server side of an in-process connection.
pub struct MemoryConnection {
    id: ConnectionId,
    status: ConnectionStatus,
    /// Frames towards the peer.
    outbound: mpsc::Sender<Frame>,
    /// Frames from the peer.
    inbound: Mutex<mpsc::Receiver<Frame>>,
    closed: CancellationToken,
}

/// Client side of an in-process connection.
pub struct MemoryPeer {
    tx: mpsc::Sender<Frame>,
    rx: mpsc::Receiver<Frame>,
    closed: CancellationToken,
}

impl MemoryConnection {
    /// Creates a connected pair with the default capacity.
    pub fn pair(id: impl Into<ConnectionId>) -> (Self, MemoryPeer) {
        Self::pair_with_capacity(id, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a connected pair whose channels hold at most `capacity` frames.
    ///
    /// Once the peer stops reading, sends block after `capacity` frames.
    pub fn pair_with_capacity(id: impl Into<ConnectionId>, capacity: usize) -> (Self, MemoryPeer) {
        let (to_peer_tx, to_peer_rx) = mpsc::channel(capacity);
        let (from_peer_tx, from_peer_rx) = mpsc::channel(capacity);
        let closed = CancellationToken::new();

        let connection = MemoryConnection {
            id: id.into(),
            status: ConnectionStatus::new(),
            outbound: to_peer_tx,
            inbound: Mutex::new(from_peer_rx),
            closed: closed.clone(),
        };
        let peer = MemoryPeer {
            tx: from_peer_tx,
            rx: to_peer_rx,
            closed,
        };
        (connection, peer)
    }
}

impl ConnectionHandle for MemoryConnection {
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
            tokio::select! {
                _ = self.closed.cancelled() => Err(ConnectionError::Closed),
                sent = self.outbound.send(frame) => sent.map_err(|_| ConnectionError::Closed),
            }
        })
    }

    fn receive(&self) -> HandleFuture<'_, Result<Frame, ConnectionError>> {
        Box::pin(async move {
            let mut inbound = self.inbound.lock().await;
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => Err(ConnectionError::Closed),
                frame = inbound.recv() => frame.ok_or(ConnectionError::Closed),
            }
        })
    }

    fn close(&self) -> HandleFuture<'_, ()> {
        Box::pin(async move {
            if self.status.begin_close() {
                self.closed.cancel();
                self.status.finish_close();
                tracing::trace!(conn_id = %self.id, "Memory connection closed");
            }
        })
    }
}

impl MemoryPeer {
    /// Sends a frame to the server side.
    pub async fn send(&self, frame: impl Into<Frame>) -> Result<(), ConnectionError> {
        if self.closed.is_cancelled() {
            return Err(ConnectionError::Closed);
        }
        self.tx
            .send(frame.into())
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    /// Waits for the next frame from the server side.
    ///
    /// Frames already queued are delivered before a close is reported.
    /// Returns `None` once the connection is closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        tokio::select! {
            biased;
            frame = self.rx.recv() => frame,
            _ = self.closed.cancelled() => None,
        }
    }

    /// Returns a queued frame without waiting.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// Returns true once the server side has closed the connection.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Disconnects from the server side, failing its pending receive.
    pub fn disconnect(self) {
        drop(self);
    }
}

/// A handle whose sends never complete and whose close takes `close_delay`,
/// like a peer that stopped reading with a full TCP buffer.
#[cfg(test)]
pub(crate) struct StalledConnection {
    id: ConnectionId,
    status: ConnectionStatus,
    close_delay: std::time::Duration,
}

#[cfg(test)]
impl StalledConnection {
    pub(crate) fn new(id: impl Into<ConnectionId>, close_delay: std::time::Duration) -> Self {
        Self {
            id: id.into(),
            status: ConnectionStatus::new(),
            close_delay,
        }
    }
}

#[cfg(test)]
impl ConnectionHandle for StalledConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn state(&self) -> ConnectionState {
        self.status.get()
    }

    fn send(&self, _frame: Frame) -> HandleFuture<'_, Result<(), ConnectionError>> {
        Box::pin(std::future::pending())
    }

    fn receive(&self) -> HandleFuture<'_, Result<Frame, ConnectionError>> {
        Box::pin(std::future::pending())
    }

    fn close(&self) -> HandleFuture<'_, ()> {
        Box::pin(async move {
            if self.status.begin_close() {
                tokio::time::sleep(self.close_delay).await;
                self.status.finish_close();
            }
        })
    }
}
