//! Network module for WebSocket clients.
//!
//! This module provides:
//! - [`WebSocketServer`]: the TCP accept loop and upgrade handoff
//! - [`WebSocketConnection`]: a [`ConnectionHandle`](crate::session::ConnectionHandle)
//!   over an upgraded WebSocket stream

pub mod server;
pub mod websocket;

pub use server::{session_key_from_path, WebSocketServer};
pub use websocket::WebSocketConnection;
