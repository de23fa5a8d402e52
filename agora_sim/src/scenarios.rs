//! Fault scenarios for deterministic match validation.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// AGR-001: clean network, every replica agrees
    Baseline,

    /// AGR-002: idle population decays to extinction
    DecayCollapse,

    /// AGR-003: one replica's state is perturbed mid-match
    Desync,

    /// AGR-004: replicas lose contact with the authority
    Silence,

    /// AGR-005: sparse population triggers the extinction safeguard
    ExtinctionGuard,

    /// AGR-006: heavy jitter reorders and delays reports
    LateReports,

    /// AGR-007: every replica loses the authority
    AllSilent,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Baseline,
            ScenarioId::DecayCollapse,
            ScenarioId::Desync,
            ScenarioId::Silence,
            ScenarioId::ExtinctionGuard,
            ScenarioId::LateReports,
            ScenarioId::AllSilent,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Baseline => "baseline",
            ScenarioId::DecayCollapse => "decay_collapse",
            ScenarioId::Desync => "desync",
            ScenarioId::Silence => "silence",
            ScenarioId::ExtinctionGuard => "extinction_guard",
            ScenarioId::LateReports => "late_reports",
            ScenarioId::AllSilent => "all_silent",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Baseline => "Replicas on a clean network agree with the reference run",
            ScenarioId::DecayCollapse => "Idle cells decay away; match ends extinct with no dominant policy",
            ScenarioId::Desync => "Replica 1 gains 25.00 at generation 499 and gets flagged",
            ScenarioId::Silence => "Two replicas partitioned from the authority; survivor is stopped",
            ScenarioId::ExtinctionGuard => "15 cells on a 20x20 grid trigger the safeguard at generation 1",
            ScenarioId::LateReports => "Up to 2 s of jitter on every link; no replica is falsely flagged",
            ScenarioId::AllSilent => "Every replica partitioned; match aborts and keeps its partial history",
        }
    }

    /// Number of replicas the scenario needs at minimum.
    pub fn min_replicas(&self) -> usize {
        match self {
            ScenarioId::Desync | ScenarioId::Silence => 3,
            _ => 2,
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "baseline" | "agr-001" => Ok(ScenarioId::Baseline),
            "decay_collapse" | "decaycollapse" | "agr-002" => Ok(ScenarioId::DecayCollapse),
            "desync" | "agr-003" => Ok(ScenarioId::Desync),
            "silence" | "agr-004" => Ok(ScenarioId::Silence),
            "extinction_guard" | "extinctionguard" | "agr-005" => Ok(ScenarioId::ExtinctionGuard),
            "late_reports" | "latereports" | "agr-006" => Ok(ScenarioId::LateReports),
            "all_silent" | "allsilent" | "agr-007" => Ok(ScenarioId::AllSilent),
            "all" => Err("Use --scenario all through the CLI to run every scenario".to_string()),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for id in ScenarioId::all() {
            assert_eq!(id.name().parse::<ScenarioId>(), Ok(id));
            assert_eq!(id.to_string(), id.name());
        }
    }

    #[test]
    fn test_aliases() {
        assert_eq!("AGR-003".parse::<ScenarioId>(), Ok(ScenarioId::Desync));
        assert_eq!("LateReports".parse::<ScenarioId>(), Ok(ScenarioId::LateReports));
        assert_eq!("agr-007".parse::<ScenarioId>(), Ok(ScenarioId::AllSilent));
        assert!("chaos".parse::<ScenarioId>().is_err());
    }
}
