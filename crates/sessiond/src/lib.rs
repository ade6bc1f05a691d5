//! # Sessiond Library
//!
//! This crate provides a real-time session broadcast service: clients open a
//! WebSocket to `ws://host:port/<session>` and every text or binary message one
//! of them sends is relayed to all other clients in the same session.
//!
//! ## Overview
//!
//! - **Session Registry**: named sessions, each owning its member set
//! - **Fan-out**: concurrent, time-bounded delivery that excludes the sender
//! - **Garbage Collection**: periodic eviction of idle sessions
//! - **WebSocket Adapter**: accept loop and upgrade handoff into the registry
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   Daemon Orchestrator                    │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐        ┌─────────────────────────┐  │
//! │  │ WebSocketServer │ ─join─▶│     SessionManager      │  │
//! │  └─────────────────┘        │  ┌───────┐  ┌───────┐   │  │
//! │                             │  │Session│  │Session│   │  │
//! │  ┌─────────────────┐        │  └───────┘  └───────┘   │  │
//! │  │   GC task       │ ─tick─▶│                         │  │
//! │  └─────────────────┘        └─────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sessiond::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     config.sessions.initial.push("abcdefgh".to_string());
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Clients can now connect to ws://127.0.0.1:4000/abcdefgh
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Session registry, fan-out and connection handles
//! - [`network`]: WebSocket server and connection handle
//! - [`orchestrator`]: Main daemon coordinator

pub mod config;
pub mod network;
pub mod orchestrator;
pub mod session;

// Re-export config types for convenience
pub use config::{Config, ConfigError};

// Re-export session types for convenience
pub use session::{
    ConnectionError, ConnectionHandle, ConnectionId, ConnectionState, Frame, MemoryConnection,
    MemoryPeer, Session, SessionError, SessionInfo, SessionKey, SessionManager, SessionSettings,
};

// Re-export network types for convenience
pub use network::{WebSocketConnection, WebSocketServer};

// Re-export orchestrator types for convenience
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
