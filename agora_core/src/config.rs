//! Match configuration.
//!
//! Every tunable constant lives in one of the structs below, each with a
//! `Default` matching the documented values. A whole [`MatchConfig`] can be
//! loaded from JSON; missing sections fall back to their defaults.

use crate::engine::EngineConfig;
use crate::fixed::Resource;
use crate::grid::CellPlacement;
use crate::policy::PolicyRecord;
use agora_env::NodeId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Snapshot sampling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Generations between snapshots (default: 100)
    pub snapshot_interval: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 100,
        }
    }
}

impl StatsConfig {
    /// True for generation 0 and every multiple of the interval.
    pub fn is_sample(&self, generation: u64) -> bool {
        generation == 0 || (self.snapshot_interval > 0 && generation % self.snapshot_interval == 0)
    }
}

/// How often replicas report to the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportSchedule {
    /// Generations between resource reports (default: 500)
    pub resource_interval: u64,

    /// Generations between hash reports (default: 1000)
    pub hash_interval: u64,

    /// Whether replicas forward each snapshot to the authority
    pub forward_snapshots: bool,
}

impl Default for ReportSchedule {
    fn default() -> Self {
        Self {
            resource_interval: 500,
            hash_interval: 1_000,
            forward_snapshots: true,
        }
    }
}

impl ReportSchedule {
    pub fn resource_due(&self, generation: u64) -> bool {
        generation > 0 && self.resource_interval > 0 && generation % self.resource_interval == 0
    }

    pub fn hash_due(&self, generation: u64) -> bool {
        generation > 0 && self.hash_interval > 0 && generation % self.hash_interval == 0
    }
}

/// What reports are compared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "replica")]
pub enum ReferenceMode {
    /// Strict majority of clean replicas
    Majority,
    /// A single trusted replica
    Designated(NodeId),
}

/// Authority-side validation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub reference: ReferenceMode,

    /// Absolute band for the scalar check (default: 0.01)
    pub scalar_tolerance: Resource,

    /// Silence after which a replica counts as disconnected (default: 15 s)
    pub silence_deadline_ms: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            reference: ReferenceMode::Majority,
            scalar_tolerance: Resource::UNIT,
            silence_deadline_ms: 15_000,
        }
    }
}

/// Everything needed to start a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    pub seed: u32,
    pub width: u32,
    pub height: u32,
    pub policies: Vec<PolicyRecord>,

    /// Probability each coordinate starts occupied (ignored with explicit placements)
    pub placement_density: f64,

    /// Explicit founder placements
    pub placements: Option<Vec<CellPlacement>>,

    pub starting_resource: Resource,

    /// Terminal generation (default: 5000)
    pub generation_limit: u64,

    pub engine: EngineConfig,
    pub stats: StatsConfig,
    pub reports: ReportSchedule,
    pub validation: ValidationConfig,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            width: 50,
            height: 50,
            policies: Vec::new(),
            placement_density: 0.3,
            placements: None,
            starting_resource: Resource::from_units(50),
            generation_limit: 5_000,
            engine: EngineConfig::default(),
            stats: StatsConfig::default(),
            reports: ReportSchedule::default(),
            validation: ValidationConfig::default(),
        }
    }
}

impl MatchConfig {
    /// Parses a configuration from JSON text.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Loads a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn with_seed(mut self, seed: u32) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_generation_limit(mut self, limit: u64) -> Self {
        self.generation_limit = limit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::Ratio;
    use crate::policy::PolicyId;

    #[test]
    fn test_defaults() {
        let config = MatchConfig::default();
        assert_eq!(config.generation_limit, 5_000);
        assert_eq!(config.stats.snapshot_interval, 100);
        assert_eq!(config.reports.resource_interval, 500);
        assert_eq!(config.reports.hash_interval, 1_000);
        assert_eq!(config.engine.decay_rate, Ratio::from_bp(100));
        assert_eq!(config.validation.scalar_tolerance, Resource::from_raw(1));
    }

    #[test]
    fn test_schedules() {
        let stats = StatsConfig::default();
        assert!(stats.is_sample(0));
        assert!(stats.is_sample(300));
        assert!(!stats.is_sample(301));

        let reports = ReportSchedule::default();
        assert!(!reports.resource_due(0));
        assert!(reports.resource_due(500));
        assert!(!reports.hash_due(500));
        assert!(reports.hash_due(2_000));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "seed": 9,
            "width": 10,
            "height": 12,
            "policies": [{
                "id": 1, "name": "hoarder", "creator": "",
                "accumulation_rate": 0.9, "trade_openness": 0.1,
                "redistribution_rate": 0.0, "investment_rate": 0.5,
                "risk_tolerance": 0.3
            }],
            "placements": [{"x": 1, "y": 2, "policy": 1}],
            "engine": {"decay_rate": 200},
            "validation": {"reference": {"mode": "majority"}}
        }"#;

        let config = MatchConfig::from_json(json).unwrap();
        assert_eq!(config.seed, 9);
        assert_eq!(config.policies[0].id, PolicyId(1));
        assert_eq!(config.placements.as_ref().map(|p| p.len()), Some(1));
        assert_eq!(config.engine.decay_rate, Ratio::from_bp(200));
        assert_eq!(config.engine.injection_count, 10);
        assert_eq!(config.generation_limit, 5_000);
        assert_eq!(config.validation.reference, ReferenceMode::Majority);
    }

    #[test]
    fn test_designated_reference_roundtrip() {
        let config = ValidationConfig {
            reference: ReferenceMode::Designated(NodeId::from_seed(3)),
            ..ValidationConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: ValidationConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
