//! Agent listener
//!
//! Accepts incoming agent connections and spawns a handler for each.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::server::handler;
use crate::state::OrchestratorState;

/// TCP server node agents connect to
pub struct AgentServer {
    /// Shared orchestrator state
    state: Arc<OrchestratorState>,
    /// Cancellation token for graceful shutdown
    cancel: CancellationToken,
}

impl AgentServer {
    pub fn new(state: Arc<OrchestratorState>, cancel: CancellationToken) -> Self {
        Self { state, cancel }
    }

    /// Bind `bind_addr` and serve until cancelled
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("Agent server listening on {}", local_addr);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Agent server shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                        Err(e) => tracing::error!("Failed to accept connection: {}", e),
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        tracing::debug!("New connection from {}", peer_addr);

        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
            }
            handler::handle_connection(state, socket, peer_addr, cancel).await;
        });
    }
}
