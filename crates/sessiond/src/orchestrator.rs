//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that owns the session
//! registry and runs the WebSocket server and the idle-session collector
//! alongside it, with a single shutdown path for all of them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::network::WebSocketServer;
use crate::session::{SessionManager, SessionSettings};

/// How long `stop` waits for connection loops after closing their handles.
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, binding the listener.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// The WebSocket server is listening.
    Listening(SocketAddr),
    /// Members closed during shutdown.
    ConnectionsClosed(usize),
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Session registry shared with the server and the collector.
    session_manager: Arc<SessionManager>,
    /// Address the server bound to, once running.
    local_addr: Option<SocketAddr>,
    /// Accept loop and collector tasks.
    tasks: TaskTracker,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator.
    ///
    /// Every key in `sessions.initial` is registered up front.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let settings = SessionSettings::from(&config);
        let session_manager = Arc::new(SessionManager::new(
            config.sessions.initial.iter().cloned(),
            settings,
        ));
        info!(
            sessions = session_manager.count(),
            ttl_secs = settings.ttl.as_secs(),
            "Initialized session registry"
        );

        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            session_manager,
            local_addr: None,
            tasks: TaskTracker::new(),
            shutdown_token: CancellationToken::new(),
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the daemon orchestrator.
    ///
    /// Binds the WebSocket server and spawns the accept loop and the garbage
    /// collector. On a bind failure the orchestrator returns to `Stopped`.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        // A previous stop leaves the token cancelled and the tracker closed.
        if self.shutdown_token.is_cancelled() {
            self.shutdown_token = CancellationToken::new();
        }
        self.tasks.reopen();

        let (server, addr) = match self.bind_server().await {
            Ok(bound) => bound,
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
                return Err(e);
            }
        };
        self.local_addr = Some(addr);

        self.tasks.spawn(server.run(
            Arc::clone(&self.session_manager),
            self.shutdown_token.clone(),
        ));
        debug!("Started WebSocket accept loop");

        let gc = self
            .session_manager
            .start_gc_task(self.shutdown_token.clone());
        self.tasks.spawn(async move {
            if let Err(e) = gc.await {
                warn!("Garbage collector task failed: {}", e);
            }
        });
        debug!("Started session garbage collector");

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));
        self.emit_event(OrchestratorEvent::Listening(addr));

        info!(%addr, "Daemon orchestrator started successfully");
        Ok(())
    }

    /// Binds the listener and reads back its address. Any failure here leaves
    /// nothing running.
    async fn bind_server(&self) -> Result<(WebSocketServer, SocketAddr)> {
        let addr = self.config.bind_addr()?;
        let server = WebSocketServer::bind(addr)
            .await
            .with_context(|| format!("Failed to bind WebSocket server to {}", addr))?;
        let local = server
            .local_addr()
            .context("Failed to read listener address")?;
        Ok((server, local))
    }

    /// Stops the daemon orchestrator gracefully.
    ///
    /// Stops accepting, stops the collector, closes every member of every
    /// session and waits for their connection loops to finish.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        self.shutdown_token.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        debug!("Accept loop and collector stopped");

        let closed = self.session_manager.close_all().await;
        debug!(closed, "Closed session members");
        self.emit_event(OrchestratorEvent::ConnectionsClosed(closed));

        if !self
            .session_manager
            .wait_for_connections(CONNECTION_DRAIN_TIMEOUT)
            .await
        {
            warn!(
                remaining = self.session_manager.active_connections(),
                "Connection loops still running after shutdown timeout"
            );
        }

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the session manager.
    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.session_manager
    }

    /// Returns the configuration the orchestrator was built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the address the WebSocket server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ConnectionHandle, ConnectionState, MemoryConnection};

    fn create_test_config() -> Config {
        let mut config = Config::default();
        config.server.bind_addr = "127.0.0.1:0".to_string();
        config.sessions.initial = vec!["abcdefgh".to_string()];
        config
    }

    #[tokio::test]
    async fn test_orchestrator_creation() {
        let orchestrator = DaemonOrchestrator::new(create_test_config()).unwrap();

        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(orchestrator.session_manager().contains("abcdefgh"));
        assert!(orchestrator.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = create_test_config();
        config.sessions.ttl_secs = 0;

        let err = DaemonOrchestrator::new(config).err().unwrap();
        assert!(format!("{:#}", err).contains("ttl_secs"));
    }

    #[tokio::test]
    async fn test_orchestrator_state_transitions() {
        let mut orchestrator = DaemonOrchestrator::new(create_test_config()).unwrap();
        let mut events = orchestrator.subscribe();

        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        assert!(orchestrator.local_addr().is_some());

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let OrchestratorEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                OrchestratorState::Starting,
                OrchestratorState::Running,
                OrchestratorState::ShuttingDown,
                OrchestratorState::Stopped,
            ]
        );
    }

    #[tokio::test]
    async fn test_double_start_fails() {
        let mut orchestrator = DaemonOrchestrator::new(create_test_config()).unwrap();
        orchestrator.start().await.unwrap();

        assert!(orchestrator.start().await.is_err());

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let orchestrator = DaemonOrchestrator::new(create_test_config()).unwrap();
        assert!(orchestrator.stop().await.is_ok());
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let mut orchestrator = DaemonOrchestrator::new(create_test_config()).unwrap();

        orchestrator.start().await.unwrap();
        orchestrator.stop().await.unwrap();
        orchestrator.start().await.unwrap();

        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        assert!(!orchestrator.shutdown_token().is_cancelled());

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_closes_members() {
        let mut orchestrator = DaemonOrchestrator::new(create_test_config()).unwrap();
        orchestrator.start().await.unwrap();

        let manager = Arc::clone(orchestrator.session_manager());
        let (a, _pa) = MemoryConnection::pair("a");
        let (b, _pb) = MemoryConnection::pair("b");
        let a = Arc::new(a);
        let b = Arc::new(b);
        manager.join("abcdefgh", a.clone()).await.unwrap();
        manager.join("abcdefgh", b.clone()).await.unwrap();

        orchestrator.stop().await.unwrap();

        assert_eq!(a.state(), ConnectionState::Closed);
        assert_eq!(b.state(), ConnectionState::Closed);
        assert_eq!(manager.active_connections(), 0);
        // Sessions survive shutdown; only their members are closed.
        assert!(manager.get_session("abcdefgh").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bind_failure_returns_to_stopped() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = create_test_config();
        config.server.bind_addr = blocker.local_addr().unwrap().to_string();

        let mut orchestrator = DaemonOrchestrator::new(config).unwrap();
        assert!(orchestrator.start().await.is_err());
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(orchestrator.local_addr().is_none());

        // A retry hits the listener again instead of "already running".
        let err = orchestrator.start().await.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to bind WebSocket server"));
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);

        drop(blocker);
        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        orchestrator.stop().await.unwrap();
    }
}
