//! SimWorld - the simulation harness container.
//!
//! Owns the virtual clock and the message router. Replicas and the
//! authority are plain nodes registered with [`SimWorld::add_node`]; every
//! envelope they send passes through the router, which applies the
//! controller's partitions, loss, latency and jitter before delivery.

use crate::context::SimContext;
use crate::network::{NetworkMessage, Route, SimNetwork, SimNetworkController};

use agora_env::{AgoraContext, NodeId, PacketEnvelope};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Virtual time per generation in milliseconds
    pub tick_ms: u64,

    /// Latency on every link unless overridden
    pub latency_ms: u64,

    /// Upper bound of the per-message random delay
    pub jitter_ms: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            tick_ms: 10,
            latency_ms: 0,
            jitter_ms: 0,
        }
    }
}

/// Router counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkStats {
    pub sent: u64,
    pub delivered: u64,
    pub partitioned: u64,
    pub lost: u64,
    pub max_delay_ms: u64,
}

/// Handle to a simulated node.
pub struct NodeHandle {
    /// Node ID
    pub id: NodeId,

    /// Network interface for this node
    pub network: Arc<SimNetwork>,

    /// Sender to deliver envelopes to this node
    inbox_tx: mpsc::Sender<(NodeId, PacketEnvelope)>,
}

/// The SimWorld - container for the clock and the network.
pub struct SimWorld {
    /// Configuration
    pub config: SimConfig,

    /// Shared simulation context (virtual clock)
    pub context: Arc<SimContext>,

    /// Network controller for fault injection
    pub controller: Arc<SimNetworkController>,

    /// Registered nodes
    nodes: HashMap<NodeId, NodeHandle>,

    /// Central router sender (cloned into every node)
    router_tx: mpsc::Sender<NetworkMessage>,

    /// Central router receiver
    router_rx: mpsc::Receiver<NetworkMessage>,

    /// Messages in flight, ordered by delivery time then send order
    in_flight: BTreeMap<(u64, u64), NetworkMessage>,
    next_seq: u64,

    stats: NetworkStats,

    /// Current tick count
    tick_count: u64,
}

impl SimWorld {
    /// Creates a new SimWorld with the given configuration.
    pub fn new(config: SimConfig) -> Self {
        let context = SimContext::shared(config.seed);
        let controller = Arc::new(SimNetworkController::new(context.derive_seed(1)));
        controller.set_default_latency(config.latency_ms);
        controller.set_jitter(config.jitter_ms);

        // Create central router channel
        let (router_tx, router_rx) = mpsc::channel::<NetworkMessage>(10000);

        Self {
            config,
            context,
            controller,
            nodes: HashMap::new(),
            router_tx,
            router_rx,
            in_flight: BTreeMap::new(),
            next_seq: 0,
            stats: NetworkStats::default(),
            tick_count: 0,
        }
    }

    /// Registers a node and returns its network interface.
    pub fn add_node(&mut self, id: NodeId) -> Arc<SimNetwork> {
        let (inbox_tx, inbox_rx) = mpsc::channel(10000);
        let network = Arc::new(SimNetwork::new(id, self.router_tx.clone(), inbox_rx));

        self.nodes.insert(
            id,
            NodeHandle {
                id,
                network: network.clone(),
                inbox_tx,
            },
        );
        network
    }

    /// Moves sent messages into flight and delivers the ones that are due.
    pub async fn process_network(&mut self) {
        let now_ms = self.context.now_ms();

        // Drain all pending messages
        while let Ok(msg) = self.router_rx.try_recv() {
            self.stats.sent += 1;
            match self.controller.route(msg.from, msg.to) {
                Route::Deliver { delay_ms } => {
                    self.stats.max_delay_ms = self.stats.max_delay_ms.max(delay_ms);
                    self.in_flight.insert((now_ms + delay_ms, self.next_seq), msg);
                    self.next_seq += 1;
                }
                Route::Partitioned => {
                    self.stats.partitioned += 1;
                    debug!(from = %msg.from, to = %msg.to, "Dropped by partition");
                }
                Route::Lost => {
                    self.stats.lost += 1;
                    debug!(from = %msg.from, to = %msg.to, "Dropped by link loss");
                }
            }
        }

        // Deliver everything due
        let pending = self.in_flight.split_off(&(now_ms + 1, 0));
        let due = std::mem::replace(&mut self.in_flight, pending);
        for (_, msg) in due {
            match self.nodes.get(&msg.to) {
                Some(node) => {
                    if node.inbox_tx.send((msg.from, msg.packet)).await.is_ok() {
                        self.stats.delivered += 1;
                    }
                }
                None => warn!(to = %msg.to, "Message for unknown node dropped"),
            }
        }
    }

    /// Advances virtual time by one generation tick.
    pub fn tick(&mut self) {
        self.context.advance_time(Duration::from_millis(self.config.tick_ms));
        self.tick_count += 1;
    }

    /// Returns the current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.context.now().as_secs_f64()
    }

    pub fn now_ms(&self) -> u64 {
        self.context.now_ms()
    }

    /// Returns the current tick count.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Returns the number of registered nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Messages routed but not yet delivered.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }
}
