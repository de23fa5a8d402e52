//! Message transport abstraction between the match authority and replicas.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{NodeId, PacketEnvelope};

/// Abstraction for message delivery between the authority and replicas.
///
/// The protocol only assumes an ordered, reliable-enough channel. Loss,
/// reordering and silence are tolerated by the authority, so the
/// simulated implementation is free to inject all three.
///
/// # Packet Flow
///
/// ```text
/// Replica                   Channel                  Authority
///   |                          |                          |
///   |-- send(A, report) ------>|                          |
///   |                          |-- [latency/jitter] ----->|
///   |                          |                          |-- recv() -> report
///   |<------------------------ [desync_flag / stop] ------|
/// ```
#[async_trait]
pub trait MessageTransport: Send + Sync + 'static {
    /// Sends an envelope to a target node.
    ///
    /// # Returns
    /// * `Ok(())` - Envelope queued for delivery
    /// * `Err(EnvError::NetworkError)` - Immediate send failure (e.g., channel closed)
    ///
    /// # Note
    /// Success does not guarantee delivery.
    async fn send(&self, target: NodeId, packet: PacketEnvelope) -> Result<(), EnvError>;

    /// Receives the next envelope addressed to this node.
    ///
    /// Blocks until an envelope arrives; `None` means the channel closed.
    async fn recv(&self) -> Option<(NodeId, PacketEnvelope)>;

    /// Returns an already-delivered envelope without waiting.
    ///
    /// Replicas poll with this at generation boundaries so that control
    /// messages never interrupt a generation in progress.
    fn try_recv(&self) -> Option<(NodeId, PacketEnvelope)>;

    /// Returns this node's ID.
    fn local_id(&self) -> NodeId;
}

/// Fault injection interface for simulated channels.
pub trait NetworkController: Send + Sync {
    /// Creates a network partition between two node sets.
    fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]);

    /// Heals all partitions.
    fn heal_all(&self);

    /// Sets latency for a specific link.
    fn set_link_latency(&self, from: NodeId, to: NodeId, latency_ms: u64);

    /// Sets packet loss probability for a link (0.0 - 1.0).
    fn set_link_loss(&self, from: NodeId, to: NodeId, loss_rate: f64);
}
