//! Agent transport trait

use async_trait::async_trait;

use bf_protocol::OutboundFrame;

use crate::error::TransportError;

/// One live, bidirectional connection to a node agent.
///
/// Inbound traffic is pushed into the command channel by whoever owns the
/// read half; this trait only covers the outbound direction and lifecycle.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identifier unique to this connection (not to the node)
    fn id(&self) -> u64;

    /// Whether the connection can still carry frames
    fn is_open(&self) -> bool;

    /// Queue a frame for delivery to the agent
    async fn send(&self, frame: OutboundFrame) -> Result<(), TransportError>;

    /// Close the connection; idempotent
    fn close(&self);
}
