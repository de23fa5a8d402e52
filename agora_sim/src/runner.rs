//! Scenario runner - executes match validation scenarios.
//!
//! Every scenario is one full match: an authority and N replicas on a
//! `SimWorld`, a fault plan applied while it runs, and a reference oracle
//! the authority's result is checked against afterwards.

use crate::authority::{AuthorityNode, AuthorityStats};
use crate::exporter::MatchEvent;
use crate::network::SimNetwork;
use crate::oracle::{ranking_mismatch, ReferenceOracle};
use crate::replica::{Perturbation, SimReplica};
use crate::scenarios::ScenarioId;
use crate::world::{NetworkStats, SimConfig, SimWorld};

use agora_core::config::MatchConfig;
use agora_core::grid::CellPlacement;
use agora_core::protocol::MatchStart;
use agora_core::store::{persist_outcome, RetryPolicy};
use agora_core::validation::{MatchAction, MatchOutcome, MatchStatus};
use agora_core::{MatchId, MatchStore, PolicyId, PolicyRecord, Resource, Termination};
use agora_env::{NetworkController, NodeId};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Authority sweeps run every this many generation ticks.
const SWEEP_EVERY: u64 = 100;

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Generation the authority agreed on
    pub final_generation: u64,

    pub status: Option<MatchStatus>,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,

    /// The authority's result, when the match got that far
    pub outcome: Option<MatchOutcome>,

    /// Fault and validation events, in order
    pub events: Vec<MatchEvent>,
}

impl ScenarioResult {
    fn failed(scenario: ScenarioId, seed: u64, reason: String) -> Self {
        Self {
            scenario,
            seed,
            passed: false,
            total_ticks: 0,
            final_time_secs: 0.0,
            final_generation: 0,
            status: None,
            failure_reason: Some(reason),
            metrics: ScenarioMetrics::default(),
            outcome: None,
            events: Vec::new(),
        }
    }
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default)]
pub struct ScenarioMetrics {
    pub network: NetworkStats,
    pub authority: AuthorityStats,

    /// Messages sent by all replicas
    pub replica_messages: u64,

    /// Snapshots in the authority's history
    pub snapshots: usize,

    /// Whether the outcome was written to the match store
    pub persisted: bool,
}

/// Faults applied during one match.
#[derive(Debug, Clone, Default)]
struct FaultPlan {
    latency_ms: u64,
    jitter_ms: u64,
    perturbation: Option<(usize, Perturbation)>,
    partition: Option<Partition>,
}

/// Cuts the listed replicas off from the authority once the first of
/// them reaches `at_generation`.
#[derive(Debug, Clone)]
struct Partition {
    at_generation: u64,
    replicas: Vec<usize>,
}

/// Everything a finished match left behind.
struct MatchRun {
    outcome: MatchOutcome,
    oracle: ReferenceOracle,
    replica_ids: Vec<NodeId>,
    flag_received: Vec<bool>,
    ticks: u64,
    time_secs: f64,
    metrics: ScenarioMetrics,
    events: Vec<MatchEvent>,
}

/// Runs validation scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of replicas
    num_replicas: usize,

    /// Overrides the scenario's generation limit
    generations: Option<u64>,

    /// Starting point for every scenario's match configuration
    base_config: MatchConfig,

    store: Option<Arc<dyn MatchStore>>,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, num_replicas: usize) -> Self {
        Self {
            seed,
            num_replicas: num_replicas.max(1),
            generations: None,
            base_config: default_match(),
            store: None,
        }
    }

    /// Sets the generation limit.
    pub fn with_generations(mut self, generations: u64) -> Self {
        self.generations = Some(generations);
        self
    }

    /// Uses `config` instead of the built-in policy mix. Grid layout and
    /// seed are still set per scenario.
    pub fn with_config(mut self, config: MatchConfig) -> Self {
        self.base_config = config;
        self
    }

    /// Persists every finalized outcome to `store`, aborted ones included.
    pub fn with_store(mut self, store: Arc<dyn MatchStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let runtime = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
            Ok(rt) => rt,
            Err(e) => return ScenarioResult::failed(scenario, self.seed, format!("Runtime unavailable: {}", e)),
        };

        runtime.block_on(async {
            match scenario {
                ScenarioId::Baseline => self.run_baseline().await,
                ScenarioId::DecayCollapse => self.run_decay_collapse().await,
                ScenarioId::Desync => self.run_desync().await,
                ScenarioId::Silence => self.run_silence().await,
                ScenarioId::ExtinctionGuard => self.run_extinction_guard().await,
                ScenarioId::LateReports => self.run_late_reports().await,
                ScenarioId::AllSilent => self.run_all_silent().await,
            }
        })
    }

    fn config(&self, default_limit: u64) -> MatchConfig {
        let mut config = self.base_config.clone();
        config.seed = self.seed as u32;
        config.generation_limit = self.generations.unwrap_or(default_limit);
        config
    }

    fn replicas_for(&self, scenario: ScenarioId) -> usize {
        self.num_replicas.max(scenario.min_replicas())
    }

    /// AGR-001: Baseline - every replica agrees with the reference.
    async fn run_baseline(&self) -> ScenarioResult {
        info!("AGR-001: Baseline - clean network");
        let config = self.config(1_000);
        let run = self
            .run_match(config, self.replicas_for(ScenarioId::Baseline), FaultPlan::default())
            .await;

        self.conclude(ScenarioId::Baseline, run, |run| {
            expect_status(&run.outcome, MatchStatus::Completed)?;
            expect_clean(&run.outcome)?;
            compare_with_reference(&run.outcome, &run.oracle)
        })
    }

    /// AGR-002: DecayCollapse - idle cells decay to nothing.
    ///
    /// No policy earns anything, so every cell loses 1% (at least 0.01)
    /// per generation and the whole grid dies in the same generation.
    async fn run_decay_collapse(&self) -> ScenarioResult {
        info!("AGR-002: DecayCollapse - idle population");
        let mut config = self.config(1_000);
        config.generation_limit = config.generation_limit.max(1_000);
        config.width = 10;
        config.height = 10;
        config.policies = vec![
            PolicyRecord::new(1, "idle-a").with_threshold(60.0),
            PolicyRecord::new(2, "idle-b").with_threshold(60.0),
        ];
        config.placements = Some(
            (0..30u32)
                .map(|i| CellPlacement {
                    x: i % 10,
                    y: (i / 10) * 3,
                    policy: PolicyId(1 + i % 2),
                })
                .collect(),
        );
        config.starting_resource = Resource::from_units(50);

        let run = self
            .run_match(config, self.replicas_for(ScenarioId::DecayCollapse), FaultPlan::default())
            .await;

        self.conclude(ScenarioId::DecayCollapse, run, |run| {
            expect_status(&run.outcome, MatchStatus::Completed)?;
            if run.outcome.termination != Some(Termination::Extinct) {
                return Err(format!("expected extinction, got {:?}", run.outcome.termination));
            }
            if run.outcome.has_dominant_policy() {
                return Err("extinct match reported a dominant policy".to_string());
            }
            compare_with_reference(&run.outcome, &run.oracle)
        })
    }

    /// AGR-003: Desync - one replica's state is altered mid-match.
    ///
    /// Replica 1 gains 25.00 on its first live cell at generation 499, so
    /// its generation-500 resource report disagrees with the majority.
    async fn run_desync(&self) -> ScenarioResult {
        info!("AGR-003: Desync - perturbed replica");
        let mut config = self.config(1_000);
        config.generation_limit = config.generation_limit.max(1_000);

        let faults = FaultPlan {
            perturbation: Some((
                1,
                Perturbation {
                    at_generation: 499,
                    delta: Resource::from_units(25),
                },
            )),
            ..FaultPlan::default()
        };
        let run = self.run_match(config, self.replicas_for(ScenarioId::Desync), faults).await;

        self.conclude(ScenarioId::Desync, run, |run| {
            expect_status(&run.outcome, MatchStatus::Completed)?;
            let perturbed = run.replica_ids[1];
            if run.outcome.flagged != vec![perturbed] {
                return Err(format!(
                    "expected only {} flagged, got {:?}",
                    perturbed, run.outcome.flagged
                ));
            }
            if !run.flag_received[1] {
                return Err("perturbed replica never received its desync flag".to_string());
            }
            compare_with_reference(&run.outcome, &run.oracle)
        })
    }

    /// AGR-004: Silence - all but one replica lose the authority.
    ///
    /// The cut replicas keep computing but nothing they send arrives. After
    /// the silence deadline the authority disconnects them and stops the
    /// survivor, whose stopped state is the match result.
    async fn run_silence(&self) -> ScenarioResult {
        info!("AGR-004: Silence - partitioned replicas");
        let mut config = self.config(2_500);
        config.generation_limit = config.generation_limit.max(2_500);

        let replicas = self.replicas_for(ScenarioId::Silence);
        let faults = FaultPlan {
            partition: Some(Partition {
                at_generation: 200,
                replicas: (1..replicas).collect(),
            }),
            ..FaultPlan::default()
        };
        let limit = config.generation_limit;
        let run = self.run_match(config, replicas, faults).await;

        self.conclude(ScenarioId::Silence, run, |run| {
            expect_status(&run.outcome, MatchStatus::Completed)?;
            if run.outcome.termination != Some(Termination::Stopped) {
                return Err(format!("expected a stopped match, got {:?}", run.outcome.termination));
            }
            if run.outcome.generation_count >= limit {
                return Err("survivor ran to the limit instead of being stopped".to_string());
            }
            let mut expected: Vec<NodeId> = run.replica_ids[1..].to_vec();
            expected.sort();
            let mut disconnected = run.outcome.disconnected.clone();
            disconnected.sort();
            if disconnected != expected {
                return Err(format!("unexpected disconnected set {:?}", run.outcome.disconnected));
            }
            if !run.outcome.flagged.is_empty() {
                return Err(format!("silence flagged {:?}", run.outcome.flagged));
            }
            compare_with_reference(&run.outcome, &run.oracle)
        })
    }

    /// AGR-005: ExtinctionGuard - sparse start triggers the safeguard.
    ///
    /// 15 live cells on 400 is under the 5% floor, so generation 1 already
    /// injects 50.00 into 10 distinct cells.
    async fn run_extinction_guard(&self) -> ScenarioResult {
        info!("AGR-005: ExtinctionGuard - safeguard injection");
        let mut config = self.config(200);
        config.width = 20;
        config.height = 20;
        config.policies = vec![
            PolicyRecord::new(1, "saver").with_accumulation(1.0).with_investment(1.0),
            PolicyRecord::new(2, "idle"),
        ];
        config.placements = Some(
            (0..15u32)
                .map(|i| CellPlacement {
                    x: (i % 5) * 4,
                    y: (i / 5) * 6,
                    policy: PolicyId(1 + i % 2),
                })
                .collect(),
        );
        let injection_count = config.engine.injection_count;
        let injection_amount = config.engine.injection_amount;

        let run = self
            .run_match(config, self.replicas_for(ScenarioId::ExtinctionGuard), FaultPlan::default())
            .await;

        self.conclude(ScenarioId::ExtinctionGuard, run, |run| {
            expect_status(&run.outcome, MatchStatus::Completed)?;
            let first = run
                .oracle
                .injections()
                .first()
                .ok_or_else(|| "safeguard never triggered".to_string())?;
            if first.generation != 1 {
                return Err(format!("first injection at generation {}", first.generation));
            }
            let expected_cells = injection_count.min(15);
            if first.record.cells.len() != expected_cells {
                return Err(format!(
                    "injected {} cells, expected {}",
                    first.record.cells.len(),
                    expected_cells
                ));
            }
            let added = first.record.total_after - first.record.total_before;
            if added != injection_amount.times(expected_cells) {
                return Err(format!("injection added {}", added));
            }
            compare_with_reference(&run.outcome, &run.oracle)
        })
    }

    /// AGR-006: LateReports - up to 2 s of random delay on every message.
    async fn run_late_reports(&self) -> ScenarioResult {
        info!("AGR-006: LateReports - heavy jitter");
        let config = self.config(1_000);
        let faults = FaultPlan {
            latency_ms: 50,
            jitter_ms: 2_000,
            ..FaultPlan::default()
        };
        let run = self
            .run_match(config, self.replicas_for(ScenarioId::LateReports), faults)
            .await;

        self.conclude(ScenarioId::LateReports, run, |run| {
            expect_status(&run.outcome, MatchStatus::Completed)?;
            expect_clean(&run.outcome)?;
            if run.metrics.network.max_delay_ms <= 50 {
                return Err("jitter was never applied".to_string());
            }
            compare_with_reference(&run.outcome, &run.oracle)
        })
    }

    /// AGR-007: AllSilent - every replica loses the authority.
    ///
    /// Nothing arrives after generation 200, so the deadline disconnects
    /// every replica and the authority aborts with the history it has.
    async fn run_all_silent(&self) -> ScenarioResult {
        info!("AGR-007: AllSilent - every replica partitioned");
        let mut config = self.config(2_500);
        config.generation_limit = config.generation_limit.max(2_500);

        let replicas = self.replicas_for(ScenarioId::AllSilent);
        let faults = FaultPlan {
            partition: Some(Partition {
                at_generation: 200,
                replicas: (0..replicas).collect(),
            }),
            ..FaultPlan::default()
        };
        let run = self.run_match(config, replicas, faults).await;

        self.conclude(ScenarioId::AllSilent, run, |run| {
            expect_status(&run.outcome, MatchStatus::Aborted)?;
            if run.outcome.ranking.is_some() {
                return Err("aborted match was ranked".to_string());
            }
            if run.outcome.disconnected.len() != run.replica_ids.len() {
                return Err(format!("only {:?} disconnected", run.outcome.disconnected));
            }
            if run.outcome.history.is_empty() {
                return Err("aborted match kept no history".to_string());
            }
            compare_history_with_reference(&run.outcome, &run.oracle)
        })
    }

    /// Turns a finished (or failed) run into a result.
    fn conclude<F>(&self, scenario: ScenarioId, run: Result<MatchRun, String>, check: F) -> ScenarioResult
    where
        F: FnOnce(&MatchRun) -> Result<(), String>,
    {
        let run = match run {
            Ok(run) => run,
            Err(reason) => {
                warn!("✗ {} aborted: {}", scenario.name(), reason);
                return ScenarioResult::failed(scenario, self.seed, reason);
            }
        };

        let verdict = check(&run);
        match &verdict {
            Ok(()) => info!(
                "✓ {} complete: generation {}, {} snapshots, {} reports accepted",
                scenario.name(),
                run.outcome.generation_count,
                run.metrics.snapshots,
                run.metrics.authority.reports_accepted
            ),
            Err(reason) => warn!("✗ {} failed: {}", scenario.name(), reason),
        }

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: verdict.is_ok(),
            total_ticks: run.ticks,
            final_time_secs: run.time_secs,
            final_generation: run.outcome.generation_count,
            status: Some(run.outcome.status),
            failure_reason: verdict.err(),
            metrics: run.metrics,
            outcome: Some(run.outcome),
            events: run.events,
        }
    }

    /// Plays one match to completion on a fresh world.
    async fn run_match(&self, config: MatchConfig, replicas: usize, faults: FaultPlan) -> Result<MatchRun, String> {
        let mut world = SimWorld::new(SimConfig {
            seed: self.seed,
            latency_ms: faults.latency_ms,
            jitter_ms: faults.jitter_ms,
            ..SimConfig::default()
        });
        let tick_ms = world.config.tick_ms.max(1);
        let mut events = Vec::new();

        let authority_id = NodeId::from_seed(0);
        let authority_net: Arc<SimNetwork> = world.add_node(authority_id);
        let mut authority = AuthorityNode::new(world.context.clone(), authority_net);

        let mut nodes: Vec<SimReplica> = (0..replicas)
            .map(|i| {
                let id = NodeId::from_seed(i as u64 + 1);
                let net = world.add_node(id);
                let replica = SimReplica::new(world.context.clone(), net, authority_id, i);
                match faults.perturbation {
                    Some((index, perturbation)) if index == i => replica.with_perturbation(perturbation),
                    _ => replica,
                }
            })
            .collect();
        let replica_ids: Vec<NodeId> = nodes.iter().map(|r| r.node_id()).collect();

        let match_id = MatchId::from_seed(self.seed);
        let start: MatchStart = authority
            .start_match(match_id, &config, &replica_ids)
            .await
            .map_err(|e| format!("Match start failed: {}", e))?;
        let mut oracle = ReferenceOracle::new(&start).map_err(|e| format!("Reference run rejected config: {}", e))?;

        let max_ticks = config.generation_limit
            + 2_000
            + (config.validation.silence_deadline_ms + faults.latency_ms + faults.jitter_ms) / tick_ms;
        let mut partitioned = false;
        let mut perturb_logged = false;
        let mut tick: u64 = 0;

        loop {
            if let Some(partition) = &faults.partition {
                let reached = partition
                    .replicas
                    .first()
                    .and_then(|&i| nodes.get(i))
                    .map_or(false, |r| r.generation() >= partition.at_generation);
                if !partitioned && reached {
                    let cut: Vec<NodeId> = partition.replicas.iter().filter_map(|&i| replica_ids.get(i).copied()).collect();
                    world.controller.partition(&[authority_id], &cut);
                    partitioned = true;
                    info!("  ⚡ Partitioned {} replica(s) from the authority at generation {}", cut.len(), partition.at_generation);
                    events.push(event(partition.at_generation, format!("partitioned {} replicas", cut.len()), "warn"));
                }
            }

            world.process_network().await;
            for replica in nodes.iter_mut() {
                replica
                    .tick()
                    .await
                    .map_err(|e| format!("Replica {} failed: {}", replica.index(), e))?;
                if replica.was_perturbed() && !perturb_logged {
                    perturb_logged = true;
                    events.push(event(replica.generation(), format!("perturbed replica {}", replica.index()), "warn"));
                }
            }

            world.process_network().await;
            authority.pump().await.map_err(|e| format!("Authority failed: {}", e))?;
            world.process_network().await;

            if tick % SWEEP_EVERY == 0 {
                let sweep = authority
                    .sweep(match_id)
                    .await
                    .map_err(|e| format!("Sweep failed: {}", e))?;
                let generation = nodes.first().map_or(0, |r| r.generation());
                for id in &sweep.newly_disconnected {
                    events.push(event(generation, format!("replica {} disconnected", id), "warn"));
                }
                match sweep.action {
                    Some(MatchAction::Stop(reason)) => {
                        events.push(event(generation, format!("authority stop: {:?}", reason), "info"));
                    }
                    Some(MatchAction::Abort) => events.push(event(generation, "match aborted", "error")),
                    None => {}
                }
                world.process_network().await;
            }

            let status = authority
                .status(match_id)
                .await
                .map_err(|e| format!("Status failed: {}", e))?;
            if status.complete {
                break;
            }

            if tick % 500 == 0 {
                debug!(
                    "  t={:.1}s | gens={:?} | in_flight={}",
                    world.time(),
                    nodes.iter().map(|r| r.generation()).collect::<Vec<_>>(),
                    world.in_flight()
                );
            }

            world.tick();
            tick += 1;
            if tick > max_ticks {
                return Err(format!("Match did not complete within {} ticks", max_ticks));
            }
        }

        let outcome = authority
            .finalize(match_id)
            .await
            .map_err(|e| format!("Finalize failed: {}", e))?;
        for flagged in &outcome.flagged {
            events.push(event(outcome.generation_count, format!("replica {} flagged", flagged), "warn"));
        }

        match outcome.termination {
            Some(Termination::Stopped) => oracle.stop_at(outcome.generation_count),
            _ => {
                oracle.run_to_end();
            }
        }

        let mut metrics = ScenarioMetrics {
            network: world.stats().clone(),
            authority: authority.stats().clone(),
            replica_messages: nodes.iter().map(|r| r.messages_sent()).sum(),
            snapshots: outcome.history.len(),
            persisted: false,
        };

        if let Some(store) = &self.store {
            persist_outcome(
                world.context.as_ref(),
                store.as_ref(),
                &outcome,
                &config.policies,
                &RetryPolicy::default(),
            )
            .await
            .map_err(|e| format!("Persisting match failed: {}", e))?;
            metrics.persisted = true;
        }

        Ok(MatchRun {
            outcome,
            oracle,
            replica_ids,
            flag_received: nodes.iter().map(|r| r.was_flagged()).collect(),
            ticks: world.tick_count(),
            time_secs: world.time(),
            metrics,
            events,
        })
    }
}

fn event(generation: u64, message: impl Into<String>, level: &str) -> MatchEvent {
    MatchEvent {
        generation,
        message: message.into(),
        level: Some(level.to_string()),
    }
}

/// Policy mix used unless the caller supplies a configuration.
fn default_match() -> MatchConfig {
    MatchConfig {
        width: 20,
        height: 20,
        placement_density: 0.2,
        policies: vec![
            PolicyRecord::new(1, "saver").with_accumulation(1.0).with_investment(1.0),
            PolicyRecord::new(2, "trader")
                .with_accumulation(0.6)
                .with_openness(0.8)
                .with_risk(0.5),
            PolicyRecord::new(3, "commons")
                .with_accumulation(0.7)
                .with_openness(0.5)
                .with_redistribution(0.4)
                .with_risk(0.2),
        ],
        ..MatchConfig::default()
    }
}

fn expect_status(outcome: &MatchOutcome, status: MatchStatus) -> Result<(), String> {
    if outcome.status != status {
        return Err(format!("match ended {:?}, expected {:?}", outcome.status, status));
    }
    Ok(())
}

fn expect_clean(outcome: &MatchOutcome) -> Result<(), String> {
    if !outcome.flagged.is_empty() {
        return Err(format!("replicas falsely flagged: {:?}", outcome.flagged));
    }
    if !outcome.disconnected.is_empty() {
        return Err(format!("replicas falsely disconnected: {:?}", outcome.disconnected));
    }
    Ok(())
}

/// Checks the authority's result against the local reference run.
fn compare_with_reference(outcome: &MatchOutcome, oracle: &ReferenceOracle) -> Result<(), String> {
    if outcome.generation_count != oracle.generation() {
        return Err(format!(
            "agreed on generation {}, reference ended at {}",
            outcome.generation_count,
            oracle.generation()
        ));
    }
    if outcome.termination != oracle.termination() {
        return Err(format!(
            "termination {:?}, reference {:?}",
            outcome.termination,
            oracle.termination()
        ));
    }
    let ranking = outcome
        .ranking
        .as_ref()
        .ok_or_else(|| "authority produced no ranking".to_string())?;
    if let Some(mismatch) = ranking_mismatch(&oracle.ranking(), ranking) {
        return Err(mismatch);
    }
    compare_history_with_reference(outcome, oracle)
}

/// Every snapshot the authority kept must equal the reference run's.
fn compare_history_with_reference(outcome: &MatchOutcome, oracle: &ReferenceOracle) -> Result<(), String> {
    for snapshot in outcome.history.snapshots() {
        if oracle.history().at(snapshot.generation) != Some(snapshot) {
            return Err(format!("snapshot at generation {} differs from reference", snapshot.generation));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::{Criterion, SledMatchStore};

    #[test]
    fn test_baseline_scenario() {
        let result = ScenarioRunner::new(42, 3).with_generations(400).run(ScenarioId::Baseline);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.status, Some(MatchStatus::Completed));
        assert_eq!(result.final_generation, 400);
        assert!(result.metrics.authority.reports_accepted > 0);
        assert_eq!(result.metrics.authority.desync_flags_sent, 0);
    }

    #[test]
    fn test_decay_collapse_goes_extinct() {
        let result = ScenarioRunner::new(7, 2).run(ScenarioId::DecayCollapse);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.final_generation, 496);
        let outcome = result.outcome.unwrap();
        assert_eq!(outcome.termination, Some(Termination::Extinct));
        assert!(!outcome.has_dominant_policy());
    }

    #[test]
    fn test_desync_flags_perturbed_replica() {
        let result = ScenarioRunner::new(11, 3).run(ScenarioId::Desync);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.outcome.as_ref().unwrap().flagged, vec![NodeId::from_seed(2)]);
        assert!(result.metrics.authority.desync_flags_sent >= 1);
        assert!(result.events.iter().any(|e| e.message.contains("perturbed replica 1")));
    }

    #[test]
    fn test_silence_stops_survivor() {
        let result = ScenarioRunner::new(5, 3).run(ScenarioId::Silence);

        assert!(result.passed, "{:?}", result.failure_reason);
        let outcome = result.outcome.unwrap();
        assert_eq!(outcome.termination, Some(Termination::Stopped));
        assert_eq!(outcome.disconnected.len(), 2);
        assert!(result.metrics.network.partitioned > 0);
        assert!(result.metrics.authority.stops_sent > 0);
    }

    #[test]
    fn test_extinction_guard() {
        let result = ScenarioRunner::new(3, 2).run(ScenarioId::ExtinctionGuard);
        assert!(result.passed, "{:?}", result.failure_reason);
    }

    #[test]
    fn test_late_reports_cause_no_flags() {
        let result = ScenarioRunner::new(9, 3).with_generations(500).run(ScenarioId::LateReports);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.network.max_delay_ms > 1_000);
    }

    #[test]
    fn test_same_seed_same_result() {
        let a = ScenarioRunner::new(21, 2).with_generations(300).run(ScenarioId::LateReports);
        let b = ScenarioRunner::new(21, 2).with_generations(300).run(ScenarioId::LateReports);

        assert_eq!(a.total_ticks, b.total_ticks);
        assert_eq!(a.metrics.network, b.metrics.network);
        assert_eq!(a.outcome, b.outcome);
    }

    #[test]
    fn test_completed_outcome_is_persisted() {
        let store = Arc::new(SledMatchStore::open_temp().unwrap());
        let result = ScenarioRunner::new(42, 2)
            .with_generations(200)
            .with_store(store.clone())
            .run(ScenarioId::Baseline);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.persisted);

        let record = store.load_match(MatchId::from_seed(42)).unwrap().unwrap();
        assert_eq!(record.generation_count, 200);
        let outcome = result.outcome.unwrap();
        assert_eq!(
            record.winner(Criterion::Dominance),
            outcome.ranking.as_ref().and_then(|r| r.winner(Criterion::Dominance))
        );
        assert_eq!(store.load_snapshots(MatchId::from_seed(42)).unwrap().len(), outcome.history.len());
        assert_eq!(store.load_policy(PolicyId(1)).unwrap().unwrap().match_count, 1);
    }

    #[test]
    fn test_all_silent_aborts_and_persists_partial_history() {
        let store = Arc::new(SledMatchStore::open_temp().unwrap());
        let result = ScenarioRunner::new(13, 2)
            .with_store(store.clone())
            .run(ScenarioId::AllSilent);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.status, Some(MatchStatus::Aborted));
        assert!(result.metrics.persisted);
        assert!(result.events.iter().any(|e| e.message == "match aborted"));

        let record = store.load_match(MatchId::from_seed(13)).unwrap().unwrap();
        assert_eq!(record.status, MatchStatus::Aborted);
        assert_eq!(record.winner(Criterion::Dominance), None);

        let snapshots = store.load_snapshots(MatchId::from_seed(13)).unwrap();
        assert!(!snapshots.is_empty());
        assert!(snapshots.iter().all(|s| s.generation <= 200));
        assert!(store.load_policy(PolicyId(1)).unwrap().is_none());
    }
}
