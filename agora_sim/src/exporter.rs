//! JSON exporter for match playback.
//!
//! Exports the authority's snapshot history as frames, together with the
//! fault events of the run, for offline plotting.

use agora_core::stats::Snapshot;
use agora_core::{MatchHistory, MatchOutcome};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;

/// A single sampled generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchFrame {
    pub generation: u64,
    pub alive_count: usize,
    pub total_resource: f64,
    pub gini: f64,
    pub hhi: f64,

    /// One entry per policy, in policy id order
    pub policies: Vec<PolicyFrame>,
}

/// Per-policy values in a frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyFrame {
    pub policy_id: u32,
    pub alive_cells: usize,
    pub total_resource: f64,
    pub mean_age: f64,
    pub gini: f64,
}

impl From<&Snapshot> for MatchFrame {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            generation: snapshot.generation,
            alive_count: snapshot.alive_count,
            total_resource: snapshot.total_resource.to_f64(),
            gini: snapshot.gini,
            hhi: snapshot.hhi,
            policies: snapshot
                .per_policy
                .iter()
                .map(|(id, stats)| PolicyFrame {
                    policy_id: id.0,
                    alive_cells: stats.alive_cells,
                    total_resource: stats.total_resource.to_f64(),
                    mean_age: stats.mean_age,
                    gini: stats.gini,
                })
                .collect(),
        }
    }
}

/// Something that happened during the run (fault, flag, stop).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchEvent {
    pub generation: u64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

/// Complete match export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    pub generation_count: u64,

    /// All frames
    pub frames: Vec<MatchFrame>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<MatchEvent>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl MatchExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            match_id: None,
            status: None,
            generation_count: 0,
            frames: Vec::new(),
            events: Vec::new(),
            passed: false,
            failure_reason: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: MatchFrame) {
        self.generation_count = self.generation_count.max(frame.generation);
        self.frames.push(frame);
    }

    pub fn add_history(&mut self, history: &MatchHistory) {
        for snapshot in history.snapshots() {
            self.add_frame(MatchFrame::from(snapshot));
        }
    }

    pub fn add_event(&mut self, generation: u64, message: impl Into<String>, level: Option<&str>) {
        self.events.push(MatchEvent {
            generation,
            message: message.into(),
            level: level.map(str::to_string),
        });
    }

    /// Copies the authority's result into the export.
    pub fn record_outcome(&mut self, outcome: &MatchOutcome) {
        self.match_id = Some(outcome.match_id.to_string());
        self.status = Some(format!("{:?}", outcome.status));
        self.add_history(&outcome.history);
        self.generation_count = outcome.generation_count;
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>) {
        self.passed = passed;
        self.failure_reason = failure_reason;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
