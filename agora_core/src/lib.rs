//! Agora Core - Deterministic Policy-Competition Cellular Automaton
//!
//! Competing economic policies own cells on a bounded grid. Every
//! participant runs the whole match locally from one shared seed, so the
//! library has to solve three problems:
//! 1. **Bit-identical replicas**: fixed-point resources, one portable draw
//!    source, double-buffered generations
//! 2. **Cheap drift detection**: periodic resource sums and state hashes
//!    checked by an authority instead of shipping per-generation state
//! 3. **Comparable outcomes**: snapshot history and four ranking criteria

pub mod fixed;
pub mod draw;
pub mod policy;
pub mod grid;
pub mod engine;
pub mod stats;
pub mod ranking;
pub mod config;
pub mod simulation;
pub mod protocol;
pub mod validation;
pub mod replica_runtime;
pub mod store;

// Re-export key types for convenience
pub use config::{MatchConfig, ReferenceMode};
pub use fixed::{Ratio, Resource};
pub use grid::{Coord, Grid, LineageId};
pub use policy::{PolicyId, PolicyRecord, PolicyTable};
pub use protocol::{MatchId, Message};
pub use ranking::{Criterion, MatchRanking};
pub use replica_runtime::{ReplicaAgent, ReplicaConfig};
pub use simulation::{Simulation, Termination};
pub use stats::{MatchHistory, Snapshot};
pub use store::{MatchStore, SledMatchStore};
pub use validation::{MatchOutcome, MatchStatus, ValidationSession};
