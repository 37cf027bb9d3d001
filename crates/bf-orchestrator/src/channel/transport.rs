//! Queue-backed agent transport
//!
//! A [`TunnelTransport`] is the orchestrator's handle on one agent
//! connection. Frames are queued onto an mpsc channel drained by the
//! connection task that owns the socket; closing cancels the token the
//! connection task selects on.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use bf_core::error::TransportError;
use bf_core::traits::Transport;
use bf_protocol::OutboundFrame;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Outbound half of an agent connection
pub struct TunnelTransport {
    id: u64,
    frame_tx: mpsc::Sender<OutboundFrame>,
    cancel: CancellationToken,
}

impl TunnelTransport {
    /// Create a transport and the receiver its connection task drains
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (frame_tx, frame_rx) = mpsc::channel(capacity);
        let transport = Self {
            id: NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed),
            frame_tx,
            cancel: CancellationToken::new(),
        };
        (transport, frame_rx)
    }

    /// Token cancelled when the transport is closed
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[async_trait]
impl Transport for TunnelTransport {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && !self.frame_tx.is_closed()
    }

    async fn send(&self, frame: OutboundFrame) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.frame_tx
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}
