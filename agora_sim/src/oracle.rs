//! Reference oracle for simulation.
//!
//! The oracle runs the same match the replicas received, locally and
//! without any network in between. Because every replica must be
//! bit-identical to it, the oracle is the ground truth scenarios check
//! the authority's result against.

use agora_core::engine::InjectionRecord;
use agora_core::protocol::MatchStart;
use agora_core::ranking::{Criterion, MatchRanking};
use agora_core::simulation::MatchError;
use agora_core::{MatchHistory, PolicyId, Simulation, Termination};

/// An injection observed while running, with the generation it happened at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedInjection {
    pub generation: u64,
    pub record: InjectionRecord,
}

/// Local reference run of a match.
pub struct ReferenceOracle {
    simulation: Simulation,
    injections: Vec<ObservedInjection>,
}

impl ReferenceOracle {
    /// Builds the reference run from the decoded start message, exactly as
    /// a replica would.
    pub fn new(start: &MatchStart) -> Result<Self, MatchError> {
        Ok(Self {
            simulation: Simulation::new(start.to_config())?,
            injections: Vec::new(),
        })
    }

    fn step(&mut self) -> bool {
        match self.simulation.step() {
            Some(outcome) => {
                if let Some(record) = outcome.injection {
                    self.injections.push(ObservedInjection {
                        generation: outcome.generation,
                        record,
                    });
                }
                true
            }
            None => false,
        }
    }

    /// Advances until `generation` is reached or the match ends.
    pub fn run_to(&mut self, generation: u64) {
        while self.simulation.generation() < generation && self.step() {}
    }

    pub fn run_to_end(&mut self) -> Termination {
        while self.step() {}
        self.simulation.termination().unwrap_or(Termination::Stopped)
    }

    /// Ends the reference run where a stopped match ended.
    pub fn stop_at(&mut self, generation: u64) {
        self.run_to(generation);
        self.simulation.stop();
    }

    pub fn generation(&self) -> u64 {
        self.simulation.generation()
    }

    pub fn termination(&self) -> Option<Termination> {
        self.simulation.termination()
    }

    pub fn ranking(&self) -> MatchRanking {
        self.simulation.ranking()
    }

    pub fn history(&self) -> &MatchHistory {
        self.simulation.history()
    }

    pub fn state_hash(&self) -> [u8; 32] {
        self.simulation.state_hash()
    }

    pub fn injections(&self) -> &[ObservedInjection] {
        &self.injections
    }

    pub fn simulation(&self) -> &Simulation {
        &self.simulation
    }
}

/// Policy order under every criterion.
pub fn ranking_order(ranking: &MatchRanking) -> Vec<(Criterion, Vec<PolicyId>)> {
    ranking
        .rankings
        .iter()
        .map(|r| (r.criterion, r.entries.iter().map(|e| e.policy).collect()))
        .collect()
}

/// Describes how two rankings differ, or `None` if they agree.
pub fn ranking_mismatch(expected: &MatchRanking, actual: &MatchRanking) -> Option<String> {
    if expected.generation != actual.generation {
        return Some(format!(
            "ranked generation {} but reference ranked {}",
            actual.generation, expected.generation
        ));
    }
    for criterion in Criterion::ALL {
        if expected.winner(criterion) != actual.winner(criterion) {
            return Some(format!(
                "{} winner {:?}, reference {:?}",
                criterion,
                actual.winner(criterion),
                expected.winner(criterion)
            ));
        }
    }
    if ranking_order(expected) != ranking_order(actual) {
        return Some("policy order differs from reference".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::config::MatchConfig;
    use agora_core::protocol::{MatchId, Message};
    use agora_core::PolicyRecord;
    use proptest::prelude::*;

    fn config(seed: u32) -> MatchConfig {
        MatchConfig {
            seed,
            width: 16,
            height: 16,
            policies: vec![
                PolicyRecord::new(1, "growth").with_accumulation(0.8).with_investment(0.9).with_risk(0.7),
                PolicyRecord::new(2, "commons").with_redistribution(0.5).with_openness(0.9).with_risk(0.4),
            ],
            placement_density: 0.25,
            generation_limit: 150,
            ..MatchConfig::default()
        }
    }

    fn decoded_start(seed: u32) -> MatchStart {
        let message = Message::MatchStart(MatchStart::from_config(MatchId::from_seed(seed as u64), &config(seed)));
        match Message::decode(&message.encode().unwrap()).unwrap() {
            Message::MatchStart(start) => start,
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[test]
    fn test_oracle_matches_direct_run() {
        let mut oracle = ReferenceOracle::new(&decoded_start(8)).unwrap();
        let mut direct = Simulation::new(config(8)).unwrap();

        oracle.run_to_end();
        direct.run_to_end();
        assert_eq!(oracle.state_hash(), direct.state_hash());
        assert_eq!(ranking_mismatch(&direct.ranking(), &oracle.ranking()), None);
    }

    #[test]
    fn test_stop_at() {
        let mut oracle = ReferenceOracle::new(&decoded_start(2)).unwrap();
        oracle.stop_at(40);
        assert_eq!(oracle.generation(), 40);
        assert_eq!(oracle.termination(), Some(Termination::Stopped));
        assert_eq!(oracle.ranking().generation, 40);
    }

    #[test]
    fn test_mismatch_reports_generation() {
        let mut a = ReferenceOracle::new(&decoded_start(3)).unwrap();
        let mut b = ReferenceOracle::new(&decoded_start(3)).unwrap();
        a.stop_at(10);
        b.stop_at(20);
        let reason = ranking_mismatch(&a.ranking(), &b.ranking()).unwrap();
        assert!(reason.contains("generation 20"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        /// Two independent runs of one seed agree at every sampled generation.
        #[test]
        fn prop_independent_runs_agree(seed in any::<u32>()) {
            let mut a = ReferenceOracle::new(&decoded_start(seed)).unwrap();
            let mut b = ReferenceOracle::new(&decoded_start(seed)).unwrap();

            for checkpoint in [50u64, 100, 150] {
                a.run_to(checkpoint);
                b.run_to(checkpoint);
                prop_assert_eq!(a.generation(), b.generation());
                prop_assert_eq!(a.state_hash(), b.state_hash());
            }
            prop_assert_eq!(a.history(), b.history());
            prop_assert_eq!(a.injections(), b.injections());
        }
    }
}
