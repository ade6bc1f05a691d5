//! Session management module.
//!
//! This module provides the session registry, per-session membership and
//! broadcast, the per-connection relay loop, and idle-session collection.
//! Transports plug in by implementing [`ConnectionHandle`].

pub mod error;
pub mod handle;
pub mod manager;
pub mod memory;
mod relay;
pub mod room;

pub use error::{SessionError, SessionKey};
pub use handle::{
    ConnectionError, ConnectionHandle, ConnectionId, ConnectionState, ConnectionStatus, Frame,
    HandleFuture,
};
pub use manager::{SessionInfo, SessionManager, SessionSettings};
pub use memory::{MemoryConnection, MemoryPeer};
pub use room::Session;
