//! Validation Session - authority-side divergence detection for one match.
//! ========================================================================
//!
//! The authority never recomputes the grid. It only compares the periodic
//! reports replicas send about their own local runs:
//!
//! - **Scalar check** (resource reports): total resource and every
//!   per-policy total within an absolute tolerance of the reference.
//! - **Checksum check** (hash reports): exact state-hash equality.
//! - **Final check**: exact equality of final hashes at `finalize`.
//!
//! The reference is either a designated replica or the strict majority
//! of clean replicas that reported. A replica that disagrees is flagged:
//! it keeps running, is told so, and is excluded from every later
//! consensus and from the final ranking. Nothing is ever corrected.
//!
//! A session is pure state with no clock of its own: every entry point
//! takes the caller's `now_ms`, so the owner decides what time means.
//!
//! Usage:
//! ```ignore
//! let mut session = ValidationSession::new(match_id, &config, &replicas, now_ms);
//! match session.handle(from, &message, now_ms) {
//!     Ok(verdicts) => { /* send DesyncFlag for each Desync */ }
//!     Err(rejection) => { /* log and keep going */ }
//! }
//! let sweep = session.sweep(now_ms);
//! let outcome = session.finalize(now_ms);
//! ```

use crate::config::{MatchConfig, ReferenceMode, ReportSchedule, StatsConfig};
use crate::fixed::Resource;
use crate::policy::PolicyId;
use crate::protocol::{
    CheckKind, FinalReport, HashReport, MatchId, Message, ResourceReport, SnapshotReport,
    StateHash, StopReason,
};
use crate::ranking::MatchRanking;
use crate::simulation::Termination;
use crate::stats::{MatchHistory, Snapshot};
use agora_env::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{info, warn};

// =============================================================================
// REJECTIONS AND VERDICTS
// =============================================================================

/// Why a single report was refused. Never fatal to the match.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReportRejection {
    #[error("Report for match {got} sent to match {expected}")]
    WrongMatch { expected: MatchId, got: MatchId },

    #[error("Unknown replica {0}")]
    UnknownReplica(NodeId),

    #[error("Replica {0} is disconnected")]
    Disconnected(NodeId),

    #[error("Match is already finalized")]
    MatchClosed,

    #[error("Reports for generation 0 are not accepted")]
    GenerationZero,

    #[error("Generation {generation} is not a multiple of {interval}")]
    Misaligned { generation: u64, interval: u64 },

    #[error("Generation {generation} exceeds the limit {limit}")]
    BeyondLimit { generation: u64, limit: u64 },

    #[error("Duplicate {check} report from {replica} for generation {generation}")]
    Duplicate { replica: NodeId, generation: u64, check: CheckKind },

    #[error("Negative resource total {0}")]
    NegativeTotal(Resource),

    #[error("Report names unknown policy {0}")]
    UnknownPolicy(PolicyId),

    #[error("Per-policy totals sum to {sum}, report says {total}")]
    TotalsMismatch { total: Resource, sum: Resource },

    #[error("Unexpected message type {0}")]
    UnexpectedMessage(&'static str),
}

/// Result of evaluating one check for one generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    /// The replica disagrees with the reference and is now flagged.
    Desync { replica: NodeId, generation: u64, check: CheckKind },
    /// No reference could be established; nobody was flagged.
    Unresolved { generation: u64, check: CheckKind },
}

/// Match-level action requested by a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchAction {
    /// Tell the remaining replica(s) to stop
    Stop(StopReason),
    /// Every replica is gone; the match is incomplete
    Abort,
}

/// Everything a sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub verdicts: Vec<Verdict>,
    pub newly_disconnected: Vec<NodeId>,
    pub action: Option<MatchAction>,
}

// =============================================================================
// REPLICA BOOKKEEPING
// =============================================================================

/// Authority's view of one replica.
#[derive(Debug, Clone, Default)]
pub struct ReplicaState {
    /// First failed check, if any
    pub flagged: Option<(u64, CheckKind)>,
    /// Set when the replica went silent past the deadline
    pub disconnected: bool,
    /// Time of the last accepted message
    pub last_seen_ms: u64,
    /// Final report, once the replica stopped advancing
    pub final_report: Option<FinalReport>,
    /// Generations of snapshot reports received
    snapshot_generations: BTreeSet<u64>,
}

impl ReplicaState {
    fn is_clean(&self) -> bool {
        self.flagged.is_none() && !self.disconnected
    }

    /// Whether a report for `generation` is still expected from this replica.
    fn owes(&self, generation: u64) -> bool {
        self.is_clean()
            && self
                .final_report
                .as_ref()
                .map_or(true, |f| f.generation >= generation)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Resolution<V> {
    Pending,
    Reference(V),
    Unresolved,
}

/// Reports collected for one check at one generation.
#[derive(Debug, Clone)]
struct Check<V> {
    opened_ms: u64,
    reports: BTreeMap<NodeId, V>,
    resolution: Resolution<V>,
}

impl<V: Clone> Check<V> {
    fn new(opened_ms: u64) -> Self {
        Self {
            opened_ms,
            reports: BTreeMap::new(),
            resolution: Resolution::Pending,
        }
    }
}

/// Scalar check input: the grand total and its per-policy split.
#[derive(Debug, Clone, PartialEq)]
struct ResourceTotals {
    total: Resource,
    per_policy: BTreeMap<PolicyId, Resource>,
}

impl From<&ResourceReport> for ResourceTotals {
    fn from(report: &ResourceReport) -> Self {
        Self {
            total: report.total_resource,
            per_policy: report.per_policy_totals.clone(),
        }
    }
}

/// A policy missing from one side counts as zero.
fn totals_agree(a: &ResourceTotals, b: &ResourceTotals, tolerance: Resource) -> bool {
    a.total.abs_diff(b.total) <= tolerance
        && a.per_policy.keys().chain(b.per_policy.keys()).all(|policy| {
            let x = a.per_policy.get(policy).copied().unwrap_or(Resource::ZERO);
            let y = b.per_policy.get(policy).copied().unwrap_or(Resource::ZERO);
            x.abs_diff(y) <= tolerance
        })
}

/// Picks the reference among clean reporters.
fn reference_value<V: Clone>(
    reports: &BTreeMap<NodeId, V>,
    replicas: &BTreeMap<NodeId, ReplicaState>,
    mode: ReferenceMode,
    agree: &dyn Fn(&V, &V) -> bool,
) -> Option<V> {
    match mode {
        ReferenceMode::Designated(reference) => reports.get(&reference).cloned(),
        ReferenceMode::Majority => {
            let clean: Vec<&V> = reports
                .iter()
                .filter(|(id, _)| replicas.get(id).map_or(false, |r| r.is_clean()))
                .map(|(_, v)| v)
                .collect();
            clean
                .iter()
                .find(|&&candidate| {
                    let votes = clean.iter().filter(|&&other| agree(candidate, other)).count();
                    votes * 2 > clean.len()
                })
                .map(|&v| V::clone(v))
        }
    }
}

fn flag(
    replicas: &mut BTreeMap<NodeId, ReplicaState>,
    replica: NodeId,
    generation: u64,
    check: CheckKind,
    verdicts: &mut Vec<Verdict>,
) {
    if let Some(state) = replicas.get_mut(&replica) {
        if state.flagged.is_none() {
            state.flagged = Some((generation, check));
            warn!(replica = %replica, generation, check = %check, "Replica desynchronized");
            verdicts.push(Verdict::Desync { replica, generation, check });
        }
    }
}

/// Resolves a check and flags every clean reporter that disagrees.
fn evaluate<V: Clone>(
    generation: u64,
    kind: CheckKind,
    check: &mut Check<V>,
    replicas: &mut BTreeMap<NodeId, ReplicaState>,
    mode: ReferenceMode,
    agree: &dyn Fn(&V, &V) -> bool,
) -> Vec<Verdict> {
    let mut verdicts = Vec::new();

    let Some(reference) = reference_value(&check.reports, replicas, mode, agree) else {
        check.resolution = Resolution::Unresolved;
        info!(generation, check = %kind, "No reference value; generation unresolved");
        verdicts.push(Verdict::Unresolved { generation, check: kind });
        return verdicts;
    };

    for (replica, value) in &check.reports {
        let clean = replicas.get(replica).map_or(false, |r| r.is_clean());
        if clean && !agree(&reference, value) {
            flag(replicas, *replica, generation, kind, &mut verdicts);
        }
    }
    check.resolution = Resolution::Reference(reference);
    verdicts
}

// =============================================================================
// OUTCOME
// =============================================================================

/// How a match ended from the authority's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// Clean replicas agreed on the final state
    Completed,
    /// All replicas went silent; history is partial
    Aborted,
    /// Replicas finished but no final state could be agreed on
    NoConsensus,
}

/// Authority-computed result of a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchOutcome {
    pub match_id: MatchId,
    pub status: MatchStatus,
    pub started_ms: u64,
    pub duration_ms: u64,
    /// Final generation of the agreed state (or last seen, if aborted)
    pub generation_count: u64,
    pub termination: Option<Termination>,
    pub policy_ids: Vec<PolicyId>,
    /// `None` when there was nothing to rank
    pub ranking: Option<MatchRanking>,
    pub history: MatchHistory,
    pub flagged: Vec<NodeId>,
    pub disconnected: Vec<NodeId>,
    pub rejected_reports: u64,
}

impl MatchOutcome {
    /// True when the match ended with live cells under a ranking.
    pub fn has_dominant_policy(&self) -> bool {
        self.ranking.as_ref().map_or(false, |r| !r.no_dominant_policy())
    }
}

// =============================================================================
// VALIDATION SESSION
// =============================================================================

/// Authority-side state of one match. Single writer: one owner per match id.
#[derive(Debug, Clone)]
pub struct ValidationSession {
    match_id: MatchId,
    policy_ids: BTreeSet<PolicyId>,
    generation_limit: u64,
    stats: StatsConfig,
    schedule: ReportSchedule,
    reference: ReferenceMode,
    tolerance: Resource,
    silence_deadline_ms: u64,
    started_ms: u64,

    replicas: BTreeMap<NodeId, ReplicaState>,
    scalar: BTreeMap<u64, Check<ResourceTotals>>,
    hash: BTreeMap<u64, Check<StateHash>>,
    /// Sampled snapshots per generation, keyed by the replica that sent them
    snapshots: BTreeMap<u64, BTreeMap<NodeId, Snapshot>>,

    rejected: u64,
    stop_issued: bool,
    aborted: bool,
    finalized: bool,
}

impl ValidationSession {
    /// Starts validating a match across the given replicas.
    pub fn new(match_id: MatchId, config: &MatchConfig, replicas: &[NodeId], now_ms: u64) -> Self {
        let replicas = replicas
            .iter()
            .map(|id| {
                (
                    *id,
                    ReplicaState {
                        last_seen_ms: now_ms,
                        ..ReplicaState::default()
                    },
                )
            })
            .collect();

        Self {
            match_id,
            policy_ids: config.policies.iter().map(|p| p.id).collect(),
            generation_limit: config.generation_limit,
            stats: config.stats.clone(),
            schedule: config.reports.clone(),
            reference: config.validation.reference,
            tolerance: config.validation.scalar_tolerance,
            silence_deadline_ms: config.validation.silence_deadline_ms,
            started_ms: now_ms,
            replicas,
            scalar: BTreeMap::new(),
            hash: BTreeMap::new(),
            snapshots: BTreeMap::new(),
            rejected: 0,
            stop_issued: false,
            aborted: false,
            finalized: false,
        }
    }

    pub fn match_id(&self) -> MatchId {
        self.match_id
    }

    /// Dispatches a replica message.
    pub fn handle(
        &mut self,
        from: NodeId,
        message: &Message,
        now_ms: u64,
    ) -> Result<Vec<Verdict>, ReportRejection> {
        match message {
            Message::ResourceReport(r) => self.submit_resource(from, r, now_ms),
            Message::HashReport(r) => self.submit_hash(from, r, now_ms),
            Message::SnapshotReport(r) => self.submit_snapshot(from, r, now_ms).map(|_| Vec::new()),
            Message::FinalReport(r) => self.submit_final(from, r, now_ms).map(|_| Vec::new()),
            other => {
                self.rejected += 1;
                Err(ReportRejection::UnexpectedMessage(other.kind()))
            }
        }
    }

    /// Common admission checks; counts the rejection on failure.
    fn admit(&mut self, from: NodeId, match_id: MatchId) -> Result<(), ReportRejection> {
        let result = if self.finalized {
            Err(ReportRejection::MatchClosed)
        } else if match_id != self.match_id {
            Err(ReportRejection::WrongMatch { expected: self.match_id, got: match_id })
        } else {
            match self.replicas.get(&from) {
                None => Err(ReportRejection::UnknownReplica(from)),
                Some(r) if r.disconnected => Err(ReportRejection::Disconnected(from)),
                Some(_) => Ok(()),
            }
        };
        if result.is_err() {
            self.rejected += 1;
        }
        result
    }

    fn reject<T>(&mut self, rejection: ReportRejection) -> Result<T, ReportRejection> {
        self.rejected += 1;
        Err(rejection)
    }

    fn check_generation(&self, generation: u64, interval: u64) -> Result<(), ReportRejection> {
        if generation == 0 {
            return Err(ReportRejection::GenerationZero);
        }
        if generation > self.generation_limit {
            return Err(ReportRejection::BeyondLimit { generation, limit: self.generation_limit });
        }
        if interval == 0 || generation % interval != 0 {
            return Err(ReportRejection::Misaligned { generation, interval });
        }
        Ok(())
    }

    fn touch(&mut self, from: NodeId, now_ms: u64) {
        if let Some(r) = self.replicas.get_mut(&from) {
            r.last_seen_ms = r.last_seen_ms.max(now_ms);
        }
    }

    /// Accepts a resource report and runs the scalar check when due.
    pub fn submit_resource(
        &mut self,
        from: NodeId,
        report: &ResourceReport,
        now_ms: u64,
    ) -> Result<Vec<Verdict>, ReportRejection> {
        self.admit(from, report.match_id)?;
        let generation = report.generation;
        if let Err(e) = self.check_generation(generation, self.schedule.resource_interval) {
            return self.reject(e);
        }
        if self.scalar.get(&generation).map_or(false, |c| c.reports.contains_key(&from)) {
            return self.reject(ReportRejection::Duplicate { replica: from, generation, check: CheckKind::Scalar });
        }
        if report.total_resource < Resource::ZERO {
            return self.reject(ReportRejection::NegativeTotal(report.total_resource));
        }
        for (policy, total) in &report.per_policy_totals {
            if !self.policy_ids.contains(policy) {
                return self.reject(ReportRejection::UnknownPolicy(*policy));
            }
            if *total < Resource::ZERO {
                return self.reject(ReportRejection::NegativeTotal(*total));
            }
        }
        let sum: Resource = report.per_policy_totals.values().sum();
        if sum != report.total_resource {
            return self.reject(ReportRejection::TotalsMismatch { total: report.total_resource, sum });
        }

        self.touch(from, now_ms);
        let check = self.scalar.entry(generation).or_insert_with(|| Check::new(now_ms));
        check.reports.insert(from, ResourceTotals::from(report));

        let tolerance = self.tolerance;
        let agree = move |a: &ResourceTotals, b: &ResourceTotals| totals_agree(a, b, tolerance);
        Ok(settle(
            generation,
            CheckKind::Scalar,
            from,
            check,
            &mut self.replicas,
            self.reference,
            &agree,
        ))
    }

    /// Accepts a hash report and runs the checksum check when due.
    pub fn submit_hash(
        &mut self,
        from: NodeId,
        report: &HashReport,
        now_ms: u64,
    ) -> Result<Vec<Verdict>, ReportRejection> {
        self.admit(from, report.match_id)?;
        let generation = report.generation;
        if let Err(e) = self.check_generation(generation, self.schedule.hash_interval) {
            return self.reject(e);
        }
        if self.hash.get(&generation).map_or(false, |c| c.reports.contains_key(&from)) {
            return self.reject(ReportRejection::Duplicate { replica: from, generation, check: CheckKind::Checksum });
        }

        self.touch(from, now_ms);
        let check = self.hash.entry(generation).or_insert_with(|| Check::new(now_ms));
        check.reports.insert(from, report.state_hash);

        let agree = |a: &StateHash, b: &StateHash| a == b;
        Ok(settle(
            generation,
            CheckKind::Checksum,
            from,
            check,
            &mut self.replicas,
            self.reference,
            &agree,
        ))
    }

    /// Stores a sampled snapshot for diagnostics.
    pub fn submit_snapshot(
        &mut self,
        from: NodeId,
        report: &SnapshotReport,
        now_ms: u64,
    ) -> Result<(), ReportRejection> {
        self.admit(from, report.match_id)?;
        let generation = report.snapshot.generation;
        if generation > self.generation_limit {
            return self.reject(ReportRejection::BeyondLimit { generation, limit: self.generation_limit });
        }
        if !self.stats.is_sample(generation) {
            return self.reject(ReportRejection::Misaligned { generation, interval: self.stats.snapshot_interval });
        }
        let seen = self
            .replicas
            .get(&from)
            .map_or(false, |r| r.snapshot_generations.contains(&generation));
        if seen {
            return self.reject(ReportRejection::Duplicate { replica: from, generation, check: CheckKind::Scalar });
        }

        self.touch(from, now_ms);
        if let Some(r) = self.replicas.get_mut(&from) {
            r.snapshot_generations.insert(generation);
            if r.flagged.is_none() {
                self.snapshots
                    .entry(generation)
                    .or_default()
                    .insert(from, report.snapshot.clone());
            }
        }
        Ok(())
    }

    /// Records that a replica stopped advancing.
    pub fn submit_final(
        &mut self,
        from: NodeId,
        report: &FinalReport,
        now_ms: u64,
    ) -> Result<(), ReportRejection> {
        self.admit(from, report.match_id)?;
        if report.generation > self.generation_limit {
            return self.reject(ReportRejection::BeyondLimit {
                generation: report.generation,
                limit: self.generation_limit,
            });
        }
        if self.replicas.get(&from).map_or(false, |r| r.final_report.is_some()) {
            return self.reject(ReportRejection::Duplicate {
                replica: from,
                generation: report.generation,
                check: CheckKind::Final,
            });
        }

        self.touch(from, now_ms);
        if let Some(r) = self.replicas.get_mut(&from) {
            r.final_report = Some(report.clone());
        }
        Ok(())
    }

    /// Applies the silence deadline and resolves overdue checks.
    pub fn sweep(&mut self, now_ms: u64) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        if self.finalized {
            return outcome;
        }

        let deadline = self.silence_deadline_ms;
        for (id, r) in self.replicas.iter_mut() {
            let silent = now_ms.saturating_sub(r.last_seen_ms) > deadline;
            if silent && !r.disconnected && r.final_report.is_none() {
                r.disconnected = true;
                warn!(match_id = %self.match_id, replica = %id, "Replica silent past deadline; disconnected");
                outcome.newly_disconnected.push(*id);
            }
        }

        let tolerance = self.tolerance;
        let scalar_agree = move |a: &ResourceTotals, b: &ResourceTotals| totals_agree(a, b, tolerance);
        for (&generation, check) in self.scalar.iter_mut() {
            if overdue(check, generation, &self.replicas, now_ms, deadline) {
                outcome.verdicts.extend(evaluate(
                    generation,
                    CheckKind::Scalar,
                    check,
                    &mut self.replicas,
                    self.reference,
                    &scalar_agree,
                ));
            }
        }
        let hash_agree = |a: &StateHash, b: &StateHash| a == b;
        for (&generation, check) in self.hash.iter_mut() {
            if overdue(check, generation, &self.replicas, now_ms, deadline) {
                outcome.verdicts.extend(evaluate(
                    generation,
                    CheckKind::Checksum,
                    check,
                    &mut self.replicas,
                    self.reference,
                    &hash_agree,
                ));
            }
        }

        let connected = self.replicas.values().filter(|r| !r.disconnected).count();
        if connected == 0 && !self.aborted {
            self.aborted = true;
            warn!(match_id = %self.match_id, "All replicas disconnected; match aborted");
            outcome.action = Some(MatchAction::Abort);
        } else if connected == 1 && self.replicas.len() >= 2 && !self.stop_issued {
            self.stop_issued = true;
            info!(match_id = %self.match_id, "All but one replica disconnected; stopping match");
            outcome.action = Some(MatchAction::Stop(StopReason::AllButOneDisconnected));
        }
        outcome
    }

    /// True once every connected replica has sent its final report (or the match aborted).
    pub fn is_complete(&self) -> bool {
        self.aborted
            || self
                .replicas
                .values()
                .all(|r| r.disconnected || r.final_report.is_some())
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn replica(&self, id: NodeId) -> Option<&ReplicaState> {
        self.replicas.get(&id)
    }

    pub fn replica_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.replicas.keys().copied()
    }

    pub fn flagged(&self) -> Vec<NodeId> {
        self.replicas
            .iter()
            .filter(|(_, r)| r.flagged.is_some())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn disconnected(&self) -> Vec<NodeId> {
        self.replicas
            .iter()
            .filter(|(_, r)| r.disconnected)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected
    }

    /// Snapshot history collected so far, in generation order.
    ///
    /// Each generation's snapshot comes from a replica that is not flagged
    /// now, so a replica flagged after it reported contributes nothing.
    pub fn history(&self) -> MatchHistory {
        let mut history = MatchHistory::new();
        for by_replica in self.snapshots.values() {
            let trusted = by_replica.iter().find(|(id, _)| {
                self.replicas.get(id).map_or(false, |r| r.flagged.is_none())
            });
            let Some((_, snapshot)) = trusted else {
                continue;
            };
            if let Err(e) = history.append(snapshot.clone()) {
                warn!(error = %e, "Skipping snapshot");
            }
        }
        history
    }

    /// Agrees on the final state, ranks, and closes the session.
    pub fn finalize(&mut self, now_ms: u64) -> MatchOutcome {
        let mut finals: Check<StateHash> = Check::new(now_ms);
        for (id, r) in &self.replicas {
            if let Some(f) = &r.final_report {
                finals.reports.insert(*id, f.state_hash);
            }
        }

        let agree = |a: &StateHash, b: &StateHash| a == b;
        let mut agreed: Option<FinalReport> = None;
        if !self.aborted && !finals.reports.is_empty() {
            let generation = self
                .replicas
                .values()
                .filter_map(|r| r.final_report.as_ref())
                .map(|f| f.generation)
                .max()
                .unwrap_or(0);
            evaluate(generation, CheckKind::Final, &mut finals, &mut self.replicas, self.reference, &agree);

            if let Resolution::Reference(hash) = &finals.resolution {
                agreed = self
                    .replicas
                    .values()
                    .filter(|r| r.is_clean())
                    .filter_map(|r| r.final_report.as_ref())
                    .find(|f| f.state_hash == *hash)
                    .cloned();
            }
        }

        let mut history = self.history();
        if let Some(f) = &agreed {
            if history.latest().map_or(true, |s| s.generation < f.final_snapshot.generation) {
                if let Err(e) = history.append(f.final_snapshot.clone()) {
                    warn!(error = %e, "Final snapshot not appended");
                }
            }
        }

        let status = if self.aborted {
            MatchStatus::Aborted
        } else if agreed.is_some() {
            MatchStatus::Completed
        } else {
            MatchStatus::NoConsensus
        };

        let generation_count = match &agreed {
            Some(f) => f.generation,
            None => history.latest().map(|s| s.generation).unwrap_or(0),
        };

        self.finalized = true;
        info!(match_id = %self.match_id, ?status, generation_count, "Match finalized");

        MatchOutcome {
            match_id: self.match_id,
            status,
            started_ms: self.started_ms,
            duration_ms: now_ms.saturating_sub(self.started_ms),
            generation_count,
            termination: agreed.as_ref().map(|f| f.termination),
            policy_ids: self.policy_ids.iter().copied().collect(),
            ranking: agreed.as_ref().map(|f| MatchRanking::from_snapshot(&f.final_snapshot)),
            history,
            flagged: self.flagged(),
            disconnected: self.disconnected(),
            rejected_reports: self.rejected,
        }
    }
}

/// Evaluates a pending check once every owing replica reported, or
/// compares a late report against an already recorded reference.
fn settle<V: Clone>(
    generation: u64,
    kind: CheckKind,
    from: NodeId,
    check: &mut Check<V>,
    replicas: &mut BTreeMap<NodeId, ReplicaState>,
    mode: ReferenceMode,
    agree: &dyn Fn(&V, &V) -> bool,
) -> Vec<Verdict> {
    match &check.resolution {
        Resolution::Pending => {
            let all_in = replicas
                .iter()
                .filter(|(_, r)| r.owes(generation))
                .all(|(id, _)| check.reports.contains_key(id));
            if all_in {
                evaluate(generation, kind, check, replicas, mode, agree)
            } else {
                Vec::new()
            }
        }
        Resolution::Reference(reference) => {
            let mut verdicts = Vec::new();
            let clean = replicas.get(&from).map_or(false, |r| r.is_clean());
            let late = check.reports.get(&from);
            if clean && late.map_or(false, |v| !agree(reference, v)) {
                flag(replicas, from, generation, kind, &mut verdicts);
            }
            verdicts
        }
        Resolution::Unresolved => Vec::new(),
    }
}

fn overdue<V: Clone>(
    check: &Check<V>,
    generation: u64,
    replicas: &BTreeMap<NodeId, ReplicaState>,
    now_ms: u64,
    deadline_ms: u64,
) -> bool {
    if !matches!(check.resolution, Resolution::Pending) {
        return false;
    }
    let expired = now_ms.saturating_sub(check.opened_ms) > deadline_ms;
    let all_in = replicas
        .iter()
        .filter(|(_, r)| r.owes(generation))
        .all(|(id, _)| check.reports.contains_key(id));
    expired || all_in
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationConfig;
    use crate::policy::PolicyRecord;
    use std::collections::BTreeMap;

    const MATCH: u64 = 77;

    fn config() -> MatchConfig {
        MatchConfig {
            policies: vec![PolicyRecord::new(1, "a"), PolicyRecord::new(2, "b")],
            generation_limit: 2_000,
            ..MatchConfig::default()
        }
    }

    fn replicas(n: u64) -> Vec<NodeId> {
        (1..=n).map(NodeId::from_seed).collect()
    }

    fn session(n: u64) -> (ValidationSession, Vec<NodeId>) {
        let ids = replicas(n);
        (ValidationSession::new(MatchId::from_seed(MATCH), &config(), &ids, 0), ids)
    }

    fn resource(generation: u64, a: i64, b: i64) -> ResourceReport {
        let mut totals = BTreeMap::new();
        totals.insert(PolicyId(1), Resource::from_raw(a));
        totals.insert(PolicyId(2), Resource::from_raw(b));
        ResourceReport {
            match_id: MatchId::from_seed(MATCH),
            generation,
            total_resource: Resource::from_raw(a + b),
            per_policy_totals: totals,
        }
    }

    fn hash(generation: u64, byte: u8) -> HashReport {
        HashReport {
            match_id: MatchId::from_seed(MATCH),
            generation,
            state_hash: StateHash([byte; 32]),
        }
    }

    fn final_report(generation: u64, byte: u8, alive: usize) -> FinalReport {
        let mut per_policy = BTreeMap::new();
        per_policy.insert(
            PolicyId(1),
            crate::stats::PolicyStats {
                alive_cells: alive,
                total_resource: Resource::from_units(alive as i64),
                mean_age: 1.0,
                gini: 0.0,
            },
        );
        per_policy.insert(PolicyId(2), crate::stats::PolicyStats::default());
        FinalReport {
            match_id: MatchId::from_seed(MATCH),
            generation,
            state_hash: StateHash([byte; 32]),
            final_snapshot: Snapshot {
                generation,
                alive_count: alive,
                total_resource: Resource::from_units(alive as i64),
                gini: 0.0,
                hhi: if alive > 0 { 10_000.0 } else { 0.0 },
                per_policy,
                lineage_mean_age: BTreeMap::new(),
            },
            termination: if alive > 0 { Termination::GenerationLimit } else { Termination::Extinct },
        }
    }

    #[test]
    fn test_agreeing_reports_flag_nobody() {
        let (mut s, ids) = session(3);
        for id in &ids {
            let verdicts = s.submit_resource(*id, &resource(500, 1_000, 2_000), 10).unwrap();
            assert!(verdicts.is_empty());
        }
        assert!(s.flagged().is_empty());
    }

    #[test]
    fn test_scalar_outlier_flagged_by_majority() {
        let (mut s, ids) = session(3);
        s.submit_resource(ids[0], &resource(500, 1_000, 2_000), 1).unwrap();
        s.submit_resource(ids[1], &resource(500, 1_001, 2_000), 2).unwrap(); // within 0.01
        let verdicts = s.submit_resource(ids[2], &resource(500, 1_050, 2_000), 3).unwrap();

        assert_eq!(
            verdicts,
            vec![Verdict::Desync { replica: ids[2], generation: 500, check: CheckKind::Scalar }]
        );
        assert_eq!(s.flagged(), vec![ids[2]]);
    }

    #[test]
    fn test_policy_split_checked_even_when_total_agrees() {
        let (mut s, ids) = session(3);
        s.submit_resource(ids[0], &resource(500, 6_000, 4_000), 1).unwrap();
        s.submit_resource(ids[1], &resource(500, 6_000, 4_000), 2).unwrap();
        let verdicts = s.submit_resource(ids[2], &resource(500, 4_000, 6_000), 3).unwrap();

        assert_eq!(
            verdicts,
            vec![Verdict::Desync { replica: ids[2], generation: 500, check: CheckKind::Scalar }]
        );
        assert_eq!(s.flagged(), vec![ids[2]]);
    }

    #[test]
    fn test_snapshot_from_replica_flagged_later_is_dropped() {
        let (mut s, ids) = session(3);
        let report = |alive: usize| SnapshotReport {
            match_id: MatchId::from_seed(MATCH),
            snapshot: final_report(500, 0, alive).final_snapshot,
        };
        s.submit_snapshot(ids[2], &report(999), 1).unwrap();
        s.submit_snapshot(ids[0], &report(1), 2).unwrap();
        s.submit_snapshot(ids[1], &report(1), 3).unwrap();

        s.submit_resource(ids[0], &resource(500, 100, 0), 4).unwrap();
        s.submit_resource(ids[1], &resource(500, 100, 0), 5).unwrap();
        s.submit_resource(ids[2], &resource(500, 99_900, 0), 6).unwrap();
        assert_eq!(s.flagged(), vec![ids[2]]);

        assert_eq!(s.history().latest().map(|h| h.alive_count), Some(1));
        let outcome = s.finalize(7);
        assert_eq!(outcome.history.len(), 1);
        assert_eq!(outcome.history.latest().map(|h| h.alive_count), Some(1));
    }

    #[test]
    fn test_checksum_mismatch_is_exact() {
        let (mut s, ids) = session(3);
        s.submit_hash(ids[0], &hash(1_000, 7), 1).unwrap();
        s.submit_hash(ids[1], &hash(1_000, 9), 1).unwrap();
        let verdicts = s.submit_hash(ids[2], &hash(1_000, 7), 1).unwrap();
        assert_eq!(
            verdicts,
            vec![Verdict::Desync { replica: ids[1], generation: 1_000, check: CheckKind::Checksum }]
        );
    }

    #[test]
    fn test_no_majority_is_unresolved() {
        let (mut s, ids) = session(2);
        s.submit_hash(ids[0], &hash(1_000, 1), 1).unwrap();
        let verdicts = s.submit_hash(ids[1], &hash(1_000, 2), 1).unwrap();
        assert_eq!(verdicts, vec![Verdict::Unresolved { generation: 1_000, check: CheckKind::Checksum }]);
        assert!(s.flagged().is_empty());
    }

    #[test]
    fn test_designated_reference() {
        let ids = replicas(3);
        let mut cfg = config();
        cfg.validation = ValidationConfig {
            reference: ReferenceMode::Designated(ids[2]),
            ..ValidationConfig::default()
        };
        let mut s = ValidationSession::new(MatchId::from_seed(MATCH), &cfg, &ids, 0);

        s.submit_hash(ids[0], &hash(1_000, 1), 1).unwrap();
        s.submit_hash(ids[1], &hash(1_000, 1), 1).unwrap();
        let verdicts = s.submit_hash(ids[2], &hash(1_000, 2), 1).unwrap();
        // The majority is overruled by the designated reference
        assert_eq!(verdicts.len(), 2);
        assert_eq!(s.flagged(), vec![ids[0], ids[1]]);
    }

    #[test]
    fn test_late_report_compared_against_reference() {
        let (mut s, ids) = session(3);
        s.submit_resource(ids[0], &resource(500, 10, 10), 2_000).unwrap();
        s.submit_resource(ids[1], &resource(500, 10, 10), 2_000).unwrap();

        // The third replica goes silent past the deadline
        let sweep = s.sweep(16_000);
        assert!(sweep.verdicts.is_empty());
        assert_eq!(sweep.newly_disconnected, vec![ids[2]]);

        // A disconnected replica's report is refused
        assert_eq!(
            s.submit_resource(ids[2], &resource(500, 99, 10), 16_001),
            Err(ReportRejection::Disconnected(ids[2]))
        );
    }

    #[test]
    fn test_late_report_flagged_after_resolution() {
        let (mut s, ids) = session(3);
        s.submit_resource(ids[0], &resource(500, 10, 10), 0).unwrap();
        s.submit_resource(ids[1], &resource(500, 10, 10), 0).unwrap();
        for id in &ids {
            s.submit_resource(*id, &resource(1_000, 10, 10), 9_000).unwrap();
        }

        let sweep = s.sweep(15_500);
        assert!(sweep.newly_disconnected.is_empty());
        assert!(sweep.verdicts.is_empty());

        let verdicts = s.submit_resource(ids[2], &resource(500, 50, 10), 15_600).unwrap();
        assert_eq!(
            verdicts,
            vec![Verdict::Desync { replica: ids[2], generation: 500, check: CheckKind::Scalar }]
        );
    }

    #[test]
    fn test_malformed_reports_rejected_individually() {
        let (mut s, ids) = session(2);

        assert_eq!(s.submit_resource(ids[0], &resource(0, 1, 1), 0), Err(ReportRejection::GenerationZero));
        assert!(matches!(s.submit_resource(ids[0], &resource(250, 1, 1), 0), Err(ReportRejection::Misaligned { .. })));
        assert!(matches!(s.submit_resource(ids[0], &resource(2_500, 1, 1), 0), Err(ReportRejection::BeyondLimit { .. })));
        assert!(matches!(s.submit_resource(ids[0], &resource(500, -5, 1), 0), Err(ReportRejection::NegativeTotal(_))));

        let mut bad_sum = resource(500, 1, 1);
        bad_sum.total_resource = Resource::from_raw(3);
        assert!(matches!(s.submit_resource(ids[0], &bad_sum, 0), Err(ReportRejection::TotalsMismatch { .. })));

        let mut unknown = resource(500, 1, 1);
        unknown.per_policy_totals.insert(PolicyId(9), Resource::ZERO);
        assert_eq!(s.submit_resource(ids[0], &unknown, 0), Err(ReportRejection::UnknownPolicy(PolicyId(9))));

        let mut wrong = resource(500, 1, 1);
        wrong.match_id = MatchId::from_seed(1);
        assert!(matches!(s.submit_resource(ids[0], &wrong, 0), Err(ReportRejection::WrongMatch { .. })));

        let stranger = NodeId::from_seed(999);
        assert_eq!(s.submit_resource(stranger, &resource(500, 1, 1), 0), Err(ReportRejection::UnknownReplica(stranger)));

        s.submit_resource(ids[0], &resource(500, 1, 1), 0).unwrap();
        assert!(matches!(s.submit_resource(ids[0], &resource(500, 1, 1), 0), Err(ReportRejection::Duplicate { .. })));

        assert_eq!(s.rejected_count(), 9);
        assert!(s.flagged().is_empty());
    }

    #[test]
    fn test_all_silent_aborts_with_partial_history() {
        let (mut s, ids) = session(2);
        let snapshot = final_report(100, 0, 4).final_snapshot;
        s.submit_snapshot(ids[0], &SnapshotReport { match_id: MatchId::from_seed(MATCH), snapshot }, 1_000).unwrap();

        let sweep = s.sweep(20_000);
        assert_eq!(sweep.newly_disconnected.len(), 2);
        assert_eq!(sweep.action, Some(MatchAction::Abort));
        assert!(s.is_complete());

        let outcome = s.finalize(20_000);
        assert_eq!(outcome.status, MatchStatus::Aborted);
        assert_eq!(outcome.history.len(), 1);
        assert!(outcome.ranking.is_none());
    }

    #[test]
    fn test_all_but_one_disconnected_stops_once() {
        let (mut s, ids) = session(3);
        s.submit_hash(ids[0], &hash(1_000, 1), 14_000).unwrap();

        let sweep = s.sweep(16_000);
        assert_eq!(sweep.action, Some(MatchAction::Stop(StopReason::AllButOneDisconnected)));
        assert_eq!(s.sweep(16_500).action, None);
    }

    #[test]
    fn test_finalize_ranks_from_agreeing_final_state() {
        let (mut s, ids) = session(3);
        s.submit_final(ids[0], &final_report(2_000, 5, 12), 1).unwrap();
        s.submit_final(ids[1], &final_report(2_000, 5, 12), 1).unwrap();
        s.submit_final(ids[2], &final_report(2_000, 6, 30), 1).unwrap();
        assert!(s.is_complete());

        let outcome = s.finalize(50);
        assert_eq!(outcome.status, MatchStatus::Completed);
        assert_eq!(outcome.flagged, vec![ids[2]]);
        assert_eq!(outcome.generation_count, 2_000);
        assert_eq!(outcome.duration_ms, 50);
        assert!(outcome.has_dominant_policy());
        assert_eq!(outcome.history.latest().map(|h| h.alive_count), Some(12));

        assert_eq!(s.submit_hash(ids[0], &hash(1_000, 1), 60), Err(ReportRejection::MatchClosed));
    }

    #[test]
    fn test_extinct_final_has_no_dominant_policy() {
        let (mut s, ids) = session(2);
        for id in &ids {
            s.submit_final(*id, &final_report(496, 3, 0), 1).unwrap();
        }
        let outcome = s.finalize(2);
        assert_eq!(outcome.status, MatchStatus::Completed);
        assert_eq!(outcome.termination, Some(Termination::Extinct));
        assert!(!outcome.has_dominant_policy());
    }

    #[test]
    fn test_flagged_replica_excluded_from_later_consensus() {
        let (mut s, ids) = session(3);
        s.submit_resource(ids[0], &resource(500, 10, 10), 0).unwrap();
        s.submit_resource(ids[1], &resource(500, 10, 10), 0).unwrap();
        s.submit_resource(ids[2], &resource(500, 90, 10), 0).unwrap();
        assert_eq!(s.flagged(), vec![ids[2]]);

        // Only the two clean replicas are awaited for the next check
        s.submit_hash(ids[0], &hash(1_000, 4), 1).unwrap();
        let verdicts = s.submit_hash(ids[1], &hash(1_000, 4), 1).unwrap();
        assert!(verdicts.is_empty());
        s.submit_hash(ids[2], &hash(1_000, 8), 1).unwrap();
        assert_eq!(s.replica(ids[2]).and_then(|r| r.flagged), Some((500, CheckKind::Scalar)));
    }
}
