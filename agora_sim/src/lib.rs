//! Agora Deterministic Simulation Harness
//!
//! Runs a whole match (authority, replicas and the network between them)
//! inside one process under a virtual clock, so that fault scenarios can
//! be replayed bit for bit from a single seed.
//!
//! # Core Principle
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: Virtual clock advances one generation tick per loop iteration
//! - **Network**: Channels with configurable latency, jitter, loss and partitions
//! - **Randomness**: Match draws and network faults derive from the seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │          virtual clock + router (latency / jitter)          │
//! │       │                 │                  │                │
//! │  ┌────▼────┐       ┌────▼────┐        ┌────▼──────┐         │
//! │  │ Replica │       │ Replica │  ...   │ Authority │         │
//! │  │   #0    │       │   #1    │        │  workers  │         │
//! │  └─────────┘       └─────────┘        └───────────┘         │
//! │                                                             │
//! │  ┌───────────────────────────────────┐                      │
//! │  │         ReferenceOracle           │                      │
//! │  │  (same match, no network)         │                      │
//! │  └───────────────────────────────────┘                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use agora_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 3).run(ScenarioId::Desync);
//! assert!(result.passed);
//! ```

mod authority;
mod context;
mod exporter;
mod network;
mod oracle;
mod replica;
mod runner;
mod world;
pub mod scenarios;

pub use authority::{AuthorityError, AuthorityNode, AuthorityService, AuthorityStats, SessionStatus};
pub use context::SimContext;
pub use exporter::{MatchEvent, MatchExport, MatchFrame, PolicyFrame};
pub use network::{NetworkMessage, Route, SimNetwork, SimNetworkController};
pub use oracle::{ranking_mismatch, ObservedInjection, ReferenceOracle};
pub use replica::{Perturbation, SimReplica};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{NetworkStats, SimConfig, SimWorld};
