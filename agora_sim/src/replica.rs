//! SimReplica - runs a `ReplicaAgent` inside the simulation.
//!
//! Bridges `agora_core::ReplicaAgent` with the harness and adds fault
//! injection: a single resource perturbation applied at a chosen
//! generation boundary, before the next generation is computed.

use crate::context::SimContext;
use crate::network::SimNetwork;

use agora_core::engine::GenerationOutcome;
use agora_core::replica_runtime::{ReplicaAgent, ReplicaConfig, ReplicaError};
use agora_core::{Resource, Termination};
use agora_env::NodeId;
use std::sync::Arc;
use tracing::warn;

/// A one-off resource change applied to the first live cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Perturbation {
    /// Applied at the boundary where the local generation equals this
    pub at_generation: u64,
    pub delta: Resource,
}

/// A replica running in the deterministic environment.
pub struct SimReplica {
    /// The underlying replica
    inner: ReplicaAgent<SimContext, SimNetwork>,

    /// Replica index (for naming and logs)
    index: usize,

    perturbation: Option<Perturbation>,
    perturbed: bool,
}

impl SimReplica {
    /// Creates a new simulated replica reporting to `authority`.
    pub fn new(context: Arc<SimContext>, network: Arc<SimNetwork>, authority: NodeId, index: usize) -> Self {
        let config = ReplicaConfig {
            name: format!("replica-{}", index),
            ..ReplicaConfig::default()
        };

        Self {
            inner: ReplicaAgent::new(context, network, authority, config),
            index,
            perturbation: None,
            perturbed: false,
        }
    }

    /// Schedules a perturbation.
    pub fn with_perturbation(mut self, perturbation: Perturbation) -> Self {
        self.perturbation = Some(perturbation);
        self
    }

    /// Returns the replica's node ID.
    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Processes one generation boundary.
    pub async fn tick(&mut self) -> Result<Option<GenerationOutcome>, ReplicaError> {
        self.maybe_perturb();
        self.inner.tick().await
    }

    fn maybe_perturb(&mut self) {
        let Some(p) = self.perturbation else {
            return;
        };
        if self.perturbed || self.inner.generation() != p.at_generation {
            return;
        }
        let Some(sim) = self.inner.simulation_mut() else {
            return;
        };

        let target = sim.grid().iter().next().map(|(coord, _)| *coord);
        if let Some(coord) = target {
            if let Some(after) = sim.grid_mut().perturb_resource(coord, p.delta) {
                warn!(
                    replica = self.index,
                    generation = p.at_generation,
                    %coord,
                    resource = %after,
                    "Injected resource perturbation"
                );
                self.perturbed = true;
            }
        }
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    pub fn termination(&self) -> Option<Termination> {
        self.inner.termination()
    }

    /// Whether the authority has told this replica it diverged.
    pub fn was_flagged(&self) -> bool {
        self.inner.desync_flag().is_some()
    }

    pub fn was_perturbed(&self) -> bool {
        self.perturbed
    }

    pub fn messages_sent(&self) -> u64 {
        self.inner.messages_sent()
    }
}
