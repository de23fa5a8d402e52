//! Simulated network transport with fault injection.

use agora_env::{EnvError, MessageTransport, NetworkController, NodeId, PacketEnvelope};
use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Simulated network interface for a replica or the authority.
pub struct SimNetwork {
    /// This node's ID
    local_id: NodeId,

    /// Sender to central router
    tx: mpsc::Sender<NetworkMessage>,

    /// Receiver for delivered envelopes (behind tokio mutex for async)
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<(NodeId, PacketEnvelope)>>>,
}

/// Internal message to the network router.
#[derive(Debug)]
pub struct NetworkMessage {
    pub from: NodeId,
    pub to: NodeId,
    pub packet: PacketEnvelope,
}

impl SimNetwork {
    /// Creates a new simulated network interface.
    pub fn new(
        local_id: NodeId,
        tx: mpsc::Sender<NetworkMessage>,
        rx: mpsc::Receiver<(NodeId, PacketEnvelope)>,
    ) -> Self {
        Self {
            local_id,
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    /// Creates a stub network for testing (doesn't actually send/receive).
    pub fn new_stub(local_id: NodeId) -> Self {
        let (tx, _) = mpsc::channel(1);
        let (_, rx) = mpsc::channel(1);
        Self::new(local_id, tx, rx)
    }
}

#[async_trait]
impl MessageTransport for SimNetwork {
    async fn send(&self, target: NodeId, packet: PacketEnvelope) -> Result<(), EnvError> {
        let msg = NetworkMessage {
            from: self.local_id,
            to: target,
            packet,
        };

        self.tx.send(msg).await.map_err(|_| EnvError::network("Channel closed"))
    }

    async fn recv(&self) -> Option<(NodeId, PacketEnvelope)> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    fn try_recv(&self) -> Option<(NodeId, PacketEnvelope)> {
        let mut rx = self.rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    fn local_id(&self) -> NodeId {
        self.local_id
    }
}

/// Routing decision for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Deliver after this many milliseconds
    Deliver { delay_ms: u64 },
    /// Dropped by an active partition
    Partitioned,
    /// Dropped by link loss
    Lost,
}

/// Network controller for fault injection.
///
/// Loss and jitter decisions come from a seeded RNG, so a run is
/// reproducible as long as messages are routed in the same order.
pub struct SimNetworkController {
    /// Per-link latency in milliseconds
    link_latency: Mutex<HashMap<(NodeId, NodeId), u64>>,

    /// Per-link packet loss rate (0.0 - 1.0)
    link_loss: Mutex<HashMap<(NodeId, NodeId), f64>>,

    /// Latency applied to links without an explicit setting
    default_latency_ms: Mutex<u64>,

    /// Upper bound of the uniform extra delay added to every message
    jitter_ms: Mutex<u64>,

    /// Active partitions (nodes that cannot communicate)
    partitions: Mutex<Vec<(Vec<NodeId>, Vec<NodeId>)>>,

    rng: Mutex<ChaCha8Rng>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SimNetworkController {
    /// Creates a new network controller.
    pub fn new(seed: u64) -> Self {
        Self {
            link_latency: Mutex::new(HashMap::new()),
            link_loss: Mutex::new(HashMap::new()),
            default_latency_ms: Mutex::new(0),
            jitter_ms: Mutex::new(0),
            partitions: Mutex::new(Vec::new()),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    /// Sets the latency used by links without their own setting.
    pub fn set_default_latency(&self, latency_ms: u64) {
        *locked(&self.default_latency_ms) = latency_ms;
    }

    /// Sets the jitter bound applied to every link.
    pub fn set_jitter(&self, jitter_ms: u64) {
        *locked(&self.jitter_ms) = jitter_ms;
    }

    /// Checks if two nodes can communicate (not partitioned).
    pub fn can_communicate(&self, from: NodeId, to: NodeId) -> bool {
        let partitions = locked(&self.partitions);

        for (group_a, group_b) in partitions.iter() {
            let from_in_a = group_a.contains(&from);
            let from_in_b = group_b.contains(&from);
            let to_in_a = group_a.contains(&to);
            let to_in_b = group_b.contains(&to);

            // Partitioned if one is in A and other in B (or vice versa)
            if (from_in_a && to_in_b) || (from_in_b && to_in_a) {
                return false;
            }
        }

        true
    }

    /// Gets the latency for a link.
    pub fn get_latency(&self, from: NodeId, to: NodeId) -> u64 {
        let latencies = locked(&self.link_latency);
        latencies
            .get(&(from, to))
            .copied()
            .unwrap_or_else(|| *locked(&self.default_latency_ms))
    }

    /// Gets the loss rate for a link (default 0.0).
    pub fn get_loss(&self, from: NodeId, to: NodeId) -> f64 {
        let losses = locked(&self.link_loss);
        *losses.get(&(from, to)).unwrap_or(&0.0)
    }

    /// Decides the fate of one message.
    ///
    /// The loss draw is only taken on lossy links and the jitter draw only
    /// when jitter is enabled.
    pub fn route(&self, from: NodeId, to: NodeId) -> Route {
        if !self.can_communicate(from, to) {
            return Route::Partitioned;
        }

        let loss = self.get_loss(from, to);
        let jitter = *locked(&self.jitter_ms);
        let mut rng = locked(&self.rng);

        if loss > 0.0 && rng.gen::<f64>() < loss {
            return Route::Lost;
        }
        let extra = if jitter > 0 { rng.gen_range(0..=jitter) } else { 0 };
        Route::Deliver {
            delay_ms: self.get_latency(from, to) + extra,
        }
    }
}

impl NetworkController for SimNetworkController {
    fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        let mut partitions = locked(&self.partitions);
        partitions.push((group_a.to_vec(), group_b.to_vec()));
    }

    fn heal_all(&self) {
        locked(&self.partitions).clear();
    }

    fn set_link_latency(&self, from: NodeId, to: NodeId, latency_ms: u64) {
        locked(&self.link_latency).insert((from, to), latency_ms);
    }

    fn set_link_loss(&self, from: NodeId, to: NodeId, loss_rate: f64) {
        locked(&self.link_loss).insert((from, to), loss_rate.clamp(0.0, 1.0));
    }
}
