//! Simulation driver - one match's grid, policies and history.
//!
//! A [`Simulation`] owns everything a replica needs to run a match to its
//! end: the validated policy table, the grid (with its draw source), and
//! the append-only snapshot history. Nothing here is shared; two matches
//! never alias state.

use crate::config::MatchConfig;
use crate::engine::{self, GenerationOutcome};
use crate::grid::{Grid, GridError};
use crate::policy::{PolicyError, PolicyTable};
use crate::ranking::MatchRanking;
use crate::stats::{MatchHistory, Snapshot};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Errors that reject a match before it starts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MatchError {
    #[error("Invalid policy table: {0}")]
    Policy(#[from] PolicyError),

    #[error("Invalid initial grid: {0}")]
    Grid(#[from] GridError),
}

/// Why a match stopped advancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Reached the configured generation limit
    GenerationLimit,
    /// No live cells remain
    Extinct,
    /// Stopped from outside at a generation boundary
    Stopped,
}

/// A single match instance.
#[derive(Debug, Clone)]
pub struct Simulation {
    config: MatchConfig,
    policies: PolicyTable,
    grid: Grid,
    history: MatchHistory,
    termination: Option<Termination>,
}

impl Simulation {
    /// Validates the configuration and builds generation 0.
    pub fn new(config: MatchConfig) -> Result<Self, MatchError> {
        let policies = PolicyTable::from_records(&config.policies)?;

        let grid = match &config.placements {
            Some(placements) => Grid::with_placements(
                config.width,
                config.height,
                config.seed,
                &policies,
                placements,
                config.starting_resource,
            )?,
            None => Grid::with_density(
                config.width,
                config.height,
                config.seed,
                &policies,
                config.placement_density,
                config.starting_resource,
            )?,
        };

        let mut sim = Self {
            config,
            policies,
            grid,
            history: MatchHistory::new(),
            termination: None,
        };
        sim.record_snapshot();
        if sim.grid.alive_count() == 0 {
            sim.termination = Some(Termination::Extinct);
        } else if sim.config.generation_limit == 0 {
            sim.termination = Some(Termination::GenerationLimit);
        }
        Ok(sim)
    }

    /// Advances one generation. Returns `None` once the match has ended.
    pub fn step(&mut self) -> Option<GenerationOutcome> {
        if self.termination.is_some() {
            return None;
        }

        let outcome = engine::step(&mut self.grid, &self.policies, &self.config.engine);
        let generation = outcome.generation;

        if outcome.extinct {
            info!(generation, seed = self.config.seed, "Match extinct: no dominant policy");
            self.termination = Some(Termination::Extinct);
        } else if generation >= self.config.generation_limit {
            self.termination = Some(Termination::GenerationLimit);
        }

        if self.termination.is_some() || self.config.stats.is_sample(generation) {
            self.record_snapshot();
        }
        Some(outcome)
    }

    /// Runs until the generation limit or extinction.
    pub fn run_to_end(&mut self) -> Termination {
        while self.step().is_some() {}
        self.termination.unwrap_or(Termination::Stopped)
    }

    /// Ends the match at the current generation boundary.
    pub fn stop(&mut self) {
        if self.termination.is_none() {
            self.termination = Some(Termination::Stopped);
            self.record_snapshot();
        }
    }

    fn record_snapshot(&mut self) {
        let generation = self.grid.generation();
        if self.history.latest().map(|s| s.generation) == Some(generation) {
            return;
        }
        if let Err(e) = self.history.append(Snapshot::capture(&self.grid, &self.policies)) {
            warn!(generation, error = %e, "Snapshot not recorded");
        }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Mutable grid access for fault injection.
    pub fn grid_mut(&mut self) -> &mut Grid {
        &mut self.grid
    }

    pub fn history(&self) -> &MatchHistory {
        &self.history
    }

    pub fn generation(&self) -> u64 {
        self.grid.generation()
    }

    pub fn state_hash(&self) -> [u8; 32] {
        self.grid.state_hash()
    }

    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }

    pub fn is_finished(&self) -> bool {
        self.termination.is_some()
    }

    /// Snapshot of the current generation.
    pub fn current_snapshot(&self) -> Snapshot {
        match self.history.latest() {
            Some(s) if s.generation == self.grid.generation() => s.clone(),
            _ => Snapshot::capture(&self.grid, &self.policies),
        }
    }

    /// Ranking from the current generation.
    pub fn ranking(&self) -> MatchRanking {
        MatchRanking::from_snapshot(&self.current_snapshot())
    }
}
