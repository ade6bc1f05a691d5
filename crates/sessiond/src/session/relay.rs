//! Per-connection read loop.

use std::sync::Arc;

use super::handle::ConnectionHandle;
use super::room::Session;

/// Relays frames received on `handle` to the rest of `session`.
///
/// Runs until the first receive failure, then removes the member and closes
/// the handle. A failed receive is never retried.
pub(crate) async fn run_connection_loop(session: Arc<Session>, handle: Arc<dyn ConnectionHandle>) {
    let conn_id = handle.id().clone();
    tracing::debug!(session_key = %session.key(), conn_id = %conn_id, "Connection loop started");

    let mut relayed: u64 = 0;
    loop {
        match handle.receive().await {
            Ok(frame) => {
                session.touch().await;
                session.broadcast(&conn_id, &frame).await;
                relayed += 1;
            }
            Err(e) => {
                tracing::debug!(
                    session_key = %session.key(),
                    conn_id = %conn_id,
                    error = %e,
                    "Connection receive ended"
                );
                break;
            }
        }
    }

    session.remove_handle(&handle).await;
    handle.close().await;

    tracing::info!(
        session_key = %session.key(),
        conn_id = %conn_id,
        relayed,
        "Connection left session"
    );
}
