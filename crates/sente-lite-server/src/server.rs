//! Top-level server lifecycle: bind, serve, and a handle for
//! broadcasting/sending/stopping from application code.

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use sente_lite_wire::EventVector;

use crate::config::ServerConfig;
use crate::connection::ws_handler;
use crate::error::ServerError;
use crate::heartbeat::run_sweeper;
use crate::http;
use crate::state::{ConnId, ServerState, ServerStats};

fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(http::health))
        .route("/stats", get(http::stats))
        .route("/channels", get(http::channels))
        .with_state(state)
}

/// A running server. Dropping this without calling [`ServerHandle::stop`]
/// leaves the listener task running in the background.
pub struct ServerHandle {
    state: ServerState,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    serve_task: JoinHandle<()>,
    sweeper_task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Publish an event to every subscriber of `channel`, returning how
    /// many connections received it.
    pub async fn broadcast(&self, channel: &str, event: EventVector) -> usize {
        self.state.publish(channel, event, None).await
    }

    /// Send an event directly to one connection, bypassing channels.
    pub async fn send_to(&self, conn_id: ConnId, event: EventVector) -> Result<(), ServerError> {
        let conn = self
            .state
            .connection(conn_id)
            .await
            .ok_or(ServerError::UnknownConnection(conn_id))?;
        conn.outbound
            .try_send(sente_lite_wire::Envelope::fire_and_forget(event))
            .map_err(|_| ServerError::QueueFull)
    }

    pub async fn stats(&self) -> ServerStats {
        self.state.stats().await
    }

    pub fn state(&self) -> ServerState {
        self.state.clone()
    }

    /// Signal the serve loop and heartbeat sweeper to stop, and wait for
    /// both to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.serve_task.await;
        let _ = self.sweeper_task.await;
    }
}

/// Bind and start serving. Registering event handlers via
/// [`ServerState::on_event`] on the returned handle's state after this
/// call is safe — the accept loop doesn't start dispatching until the
/// first connection completes its handshake.
pub async fn start_server(config: ServerConfig) -> Result<ServerHandle, ServerError> {
    let state = ServerState::new(config.clone());
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|e| ServerError::Bind(e.to_string()))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| ServerError::Bind(e.to_string()))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let router = build_router(state.clone());

    let serve_shutdown = shutdown_rx.clone();
    let serve_task = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(wait_for_shutdown(serve_shutdown))
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server loop exited with an error");
        }
    });

    let sweeper_task = tokio::spawn(run_sweeper(state.clone(), shutdown_rx));

    info!(%local_addr, "sente-lite server listening");
    Ok(ServerHandle {
        state,
        local_addr,
        shutdown_tx,
        serve_task,
        sweeper_task,
    })
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Waits for Ctrl+C or, on Unix, SIGTERM — intended for binaries that
/// embed a server and want to shut it down on the usual process signals.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
