//! Core server: accepts WebSocket upgrades and dispatches them to a terminal
//! bridge or the control channel.
//!
//! Owns the session registry and coordinates shutdown of every live
//! connection and session.

use crate::bridge::run_bridge;
use crate::config::ServerConfig;
use crate::control;
use crate::session::{Session, SessionRegistry};
use crate::transport::websocket::{self, query_param, Rejection, WebSocketConnection, WsStream};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use termhub_core::{
    ClientMessage, ControlRequest, ControlResponse, ServerMessage, TermError, TermResult,
};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tracing::{debug, info, warn};

/// Upgrade path for terminal connections (`?session_id=<id>`).
pub const TERMINAL_PATH: &str = "/api/ws";
/// Upgrade path for the JSON control channel.
pub const CONTROL_PATH: &str = "/api/sessions";

/// What an accepted connection was upgraded for.
#[derive(Debug)]
pub enum Route {
    Terminal(Arc<Session>),
    Control,
}

/// Map an upgrade request onto a route.
///
/// Terminal upgrades are resolved to their session here, so a bad id is
/// refused before the handshake completes.
pub fn route(registry: &SessionRegistry, uri: &Uri) -> Result<Route, Rejection> {
    match uri.path() {
        TERMINAL_PATH => {
            let id = query_param(uri, "session_id")
                .filter(|id| !id.is_empty())
                .ok_or_else(|| Rejection::new(StatusCode::BAD_REQUEST, "session_id required"))?;
            registry
                .get_session(&id)
                .map(Route::Terminal)
                .ok_or_else(|| Rejection::new(StatusCode::NOT_FOUND, "session not found"))
        }
        CONTROL_PATH => Ok(Route::Control),
        _ => Err(Rejection::new(StatusCode::NOT_FOUND, "not found")),
    }
}

/// The termhub server instance.
pub struct TermHubServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl TermHubServer {
    pub fn new(config: ServerConfig, registry: Arc<SessionRegistry>) -> Self {
        Self {
            config,
            registry,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    /// Accept connections until `shutdown` resolves, then end every bridge
    /// and close every session.
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) -> TermResult<()> {
        let addr = self.config.listen_addr();
        let registry = self.registry.clone();
        let mut listener =
            websocket::start_listener(addr, move |uri: &Uri| route(&registry, uri)).await?;

        info!(
            addr = %listener.local_addr,
            shell = %self.config.shell,
            buffer_size = self.config.buffer_size,
            "termhub-server ready"
        );

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                conn = listener.connections.recv() => {
                    let Some(conn) = conn else {
                        info!("listener closed, shutting down");
                        break;
                    };
                    let srv = self.clone();
                    let shutdown_rx = self.shutdown_tx.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) = srv.handle_connection(conn, shutdown_rx).await {
                            warn!(error = %e, "WebSocket connection error");
                        }
                    });
                }
            }
        }

        listener.stop().await;
        info!("broadcasting shutdown to connected clients");
        let _ = self.shutdown_tx.send(());
        self.registry.close_all().await;

        Ok(())
    }

    async fn handle_connection(
        &self,
        conn: WebSocketConnection<Route>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> TermResult<()> {
        let remote = conn.remote_addr;
        match conn.route {
            Route::Terminal(session) => {
                info!(remote = %remote, session_id = %session.id(), "terminal attached");
                self.handle_terminal(&session, conn.ws_stream, shutdown_rx).await
            }
            Route::Control => {
                debug!(remote = %remote, "control connection");
                self.handle_control(conn.ws_stream, shutdown_rx).await
            }
        }
    }

    /// Bridge one terminal connection, then tell the client why it ended.
    async fn handle_terminal(
        &self,
        session: &Session,
        ws_stream: WsStream,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> TermResult<()> {
        let (sink, stream) = ws_stream.split();
        let mut tx = websocket::message_sink(sink);
        let mut rx = websocket::message_stream::<ClientMessage>(stream);
        let cancel = async move {
            let _ = shutdown_rx.recv().await;
        };

        let result = run_bridge(session, &mut tx, &mut rx, cancel).await;

        let reason = match &result {
            Ok(end) => end.exit_reason().map(str::to_string),
            Err(TermError::Transport(_)) => None,
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = reason {
            let _ = tx.send(ServerMessage::exit(reason)).await;
        }
        let _ = tx.close().await;

        match result {
            Ok(end) => {
                info!(session_id = %session.id(), ?end, "terminal detached");
                Ok(())
            }
            Err(TermError::Detached) => {
                info!(session_id = %session.id(), "terminal taken over by another client");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Serve control requests until the client closes or the server stops.
    async fn handle_control(
        &self,
        ws_stream: WsStream,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> TermResult<()> {
        let (sink, stream) = ws_stream.split();
        let mut tx = websocket::json_sink::<ControlResponse>(sink);
        let mut rx = websocket::message_stream::<ControlRequest>(stream);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("shutdown signal received, closing control connection");
                    break;
                }
                msg = rx.next() => {
                    match msg {
                        Some(Ok(request)) => {
                            let response = control::dispatch(&self.registry, request).await;
                            tx.send(response).await?;
                        }
                        Some(Err(e @ TermError::InvalidMessage(_))) => {
                            debug!(error = %e, "rejecting control message");
                            tx.send(ControlResponse::failed(e.to_string())).await?;
                        }
                        Some(Err(e)) => return Err(e),
                        None => break,
                    }
                }
            }
        }

        let _ = tx.close().await;
        Ok(())
    }
}
