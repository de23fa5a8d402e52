//! Match Store - durable sink for finished matches.
//!
//! Three record kinds are kept:
//! - **match**: id, start time, duration, generation count, policy ids,
//!   the winner under every ranking criterion
//! - **snapshot**: the match history, keyed by `(match id, generation)`
//! - **policy**: authored parameters plus lifetime match/win/survival stats
//!
//! The store never influences a running match. Writes happen once the
//! authority has finalized, and failures are retried with backoff through
//! the context's clock.

use crate::policy::{PolicyId, PolicyRecord};
use crate::protocol::MatchId;
use crate::ranking::Criterion;
use crate::simulation::Termination;
use crate::stats::{MatchHistory, Snapshot};
use crate::validation::{MatchOutcome, MatchStatus};
use agora_env::AgoraContext;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};
use thiserror::Error;
use tracing::{info, warn};

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Record encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

// ============================================================================
// RECORDS
// ============================================================================

/// Winner under one criterion; `None` means no dominant policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionWinner {
    pub criterion: Criterion,
    pub winner: Option<PolicyId>,
}

/// Persisted summary of one match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub id: MatchId,
    pub status: MatchStatus,
    /// Wall-clock start, milliseconds since the Unix epoch
    pub start_time_ms: u64,
    pub duration_ms: u64,
    pub generation_count: u64,
    pub termination: Option<Termination>,
    pub policy_ids: Vec<PolicyId>,
    pub winner_per_criterion: Vec<CriterionWinner>,
}

impl MatchRecord {
    pub fn from_outcome(outcome: &MatchOutcome, start_time_ms: u64) -> Self {
        let winner_per_criterion = Criterion::ALL
            .iter()
            .map(|&criterion| CriterionWinner {
                criterion,
                winner: outcome.ranking.as_ref().and_then(|r| r.winner(criterion)),
            })
            .collect();

        Self {
            id: outcome.match_id,
            status: outcome.status,
            start_time_ms,
            duration_ms: outcome.duration_ms,
            generation_count: outcome.generation_count,
            termination: outcome.termination,
            policy_ids: outcome.policy_ids.clone(),
            winner_per_criterion,
        }
    }

    pub fn winner(&self, criterion: Criterion) -> Option<PolicyId> {
        self.winner_per_criterion
            .iter()
            .find(|w| w.criterion == criterion)
            .and_then(|w| w.winner)
    }
}

/// Lifetime record of a policy across matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyLifetime {
    pub parameters: PolicyRecord,
    pub match_count: u64,
    /// Matches where the policy won on dominance
    pub win_count: u64,
    /// Mean last generation with live cells, over completed matches
    pub avg_survival: f64,
}

impl PolicyLifetime {
    pub fn new(parameters: PolicyRecord) -> Self {
        Self {
            parameters,
            match_count: 0,
            win_count: 0,
            avg_survival: 0.0,
        }
    }

    /// Folds one match result into the running averages.
    pub fn record(&mut self, won: bool, survived: u64) {
        self.match_count += 1;
        if won {
            self.win_count += 1;
        }
        let n = self.match_count as f64;
        self.avg_survival += (survived as f64 - self.avg_survival) / n;
    }
}

/// Last sampled generation at which `policy` still had live cells.
pub fn survival(history: &MatchHistory, policy: PolicyId) -> u64 {
    history
        .snapshots()
        .iter()
        .rev()
        .find(|s| s.per_policy.get(&policy).map_or(false, |p| p.alive_cells > 0))
        .map(|s| s.generation)
        .unwrap_or(0)
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Trait for persistent match storage.
///
/// Implementations must be thread-safe and persist data across restarts.
pub trait MatchStore: Send + Sync {
    fn put_match(&self, record: &MatchRecord) -> Result<(), StoreError>;

    /// Stores snapshots in generation order; existing generations are overwritten.
    fn put_snapshots(&self, match_id: MatchId, snapshots: &[Snapshot]) -> Result<(), StoreError>;

    /// Folds one match result into a policy's lifetime record.
    fn record_policy_result(&self, parameters: &PolicyRecord, won: bool, survived: u64) -> Result<(), StoreError>;

    fn load_match(&self, match_id: MatchId) -> Result<Option<MatchRecord>, StoreError>;

    fn load_snapshots(&self, match_id: MatchId) -> Result<Vec<Snapshot>, StoreError>;

    fn load_policy(&self, policy: PolicyId) -> Result<Option<PolicyLifetime>, StoreError>;
}

/// Sled-backed match store.
pub struct SledMatchStore {
    db: sled::Db,
    matches: sled::Tree,
    snapshots: sled::Tree,
    policies: sled::Tree,
}

fn storage(context: &str) -> impl Fn(sled::Error) -> StoreError + '_ {
    move |e| StoreError::Storage(format!("{}: {}", context, e))
}

fn snapshot_key(match_id: MatchId, generation: u64) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..16].copy_from_slice(match_id.0.as_bytes());
    key[16..].copy_from_slice(&generation.to_be_bytes());
    key
}

impl SledMatchStore {
    /// Open a persistent store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(storage("Failed to open sled DB"))?;
        Self::from_db(db)
    }

    /// Create a temporary store, removed on drop.
    pub fn open_temp() -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(storage("Failed to open temp DB"))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            matches: db.open_tree("matches").map_err(storage("Open tree failed"))?,
            snapshots: db.open_tree("snapshots").map_err(storage("Open tree failed"))?,
            policies: db.open_tree("policies").map_err(storage("Open tree failed"))?,
            db,
        })
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(storage("Flush failed"))?;
        Ok(())
    }
}

impl MatchStore for SledMatchStore {
    fn put_match(&self, record: &MatchRecord) -> Result<(), StoreError> {
        let value = serde_json::to_vec(record)?;
        self.matches
            .insert(record.id.0.as_bytes(), value)
            .map_err(storage("Insert failed"))?;
        self.flush()
    }

    fn put_snapshots(&self, match_id: MatchId, snapshots: &[Snapshot]) -> Result<(), StoreError> {
        let mut batch = sled::Batch::default();
        for snapshot in snapshots {
            let value = serde_json::to_vec(snapshot)?;
            batch.insert(&snapshot_key(match_id, snapshot.generation)[..], value);
        }
        self.snapshots.apply_batch(batch).map_err(storage("Batch failed"))?;
        self.flush()
    }

    fn record_policy_result(&self, parameters: &PolicyRecord, won: bool, survived: u64) -> Result<(), StoreError> {
        let key = parameters.id.0.to_be_bytes();
        let mut lifetime = match self.policies.get(key).map_err(storage("Read failed"))? {
            Some(bytes) => serde_json::from_slice::<PolicyLifetime>(&bytes)?,
            None => PolicyLifetime::new(parameters.clone()),
        };
        lifetime.parameters = parameters.clone();
        lifetime.record(won, survived);

        self.policies
            .insert(key, serde_json::to_vec(&lifetime)?)
            .map_err(storage("Insert failed"))?;
        self.flush()
    }

    fn load_match(&self, match_id: MatchId) -> Result<Option<MatchRecord>, StoreError> {
        match self.matches.get(match_id.0.as_bytes()).map_err(storage("Read failed"))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load_snapshots(&self, match_id: MatchId) -> Result<Vec<Snapshot>, StoreError> {
        let mut snapshots = Vec::new();
        for result in self.snapshots.scan_prefix(match_id.0.as_bytes()) {
            let (_, value) = result.map_err(storage("Iteration failed"))?;
            snapshots.push(serde_json::from_slice(&value)?);
        }
        Ok(snapshots)
    }

    fn load_policy(&self, policy: PolicyId) -> Result<Option<PolicyLifetime>, StoreError> {
        match self.policies.get(policy.0.to_be_bytes()).map_err(storage("Read failed"))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

// ============================================================================
// PERSISTENCE WITH BACKOFF
// ============================================================================

/// Retry schedule for persistence writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the second attempt (default: 50 ms)
    pub initial_backoff: Duration,
    /// Backoff multiplier (default: 2)
    pub factor: u32,
    /// Total attempts including the first (default: 5)
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(50),
            factor: 2,
            max_attempts: 5,
        }
    }
}

async fn with_retry<Ctx, T, F>(ctx: &Ctx, retry: &RetryPolicy, what: &str, mut op: F) -> Result<T, StoreError>
where
    Ctx: AgoraContext,
    F: FnMut() -> Result<T, StoreError>,
{
    let mut backoff = retry.initial_backoff;
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= retry.max_attempts => {
                return Err(StoreError::Exhausted {
                    attempts: attempt,
                    last: e.to_string(),
                });
            }
            Err(e) => {
                warn!(what, attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "Persistence failed, retrying");
                ctx.sleep(backoff).await;
                backoff *= retry.factor;
                attempt += 1;
            }
        }
    }
}

/// Writes a finalized match: summary, snapshot history, and policy lifetimes.
///
/// Aborted matches keep their partial history but do not count towards
/// policy lifetime statistics.
pub async fn persist_outcome<Ctx, S>(
    ctx: &Ctx,
    store: &S,
    outcome: &MatchOutcome,
    policies: &[PolicyRecord],
    retry: &RetryPolicy,
) -> Result<MatchRecord, StoreError>
where
    Ctx: AgoraContext,
    S: MatchStore + ?Sized,
{
    let start_time_ms = ctx
        .system_time()
        .checked_sub(Duration::from_millis(outcome.duration_ms))
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_millis() as u64);
    let record = MatchRecord::from_outcome(outcome, start_time_ms);

    with_retry(ctx, retry, "match", || store.put_match(&record)).await?;
    with_retry(ctx, retry, "snapshots", || {
        store.put_snapshots(outcome.match_id, outcome.history.snapshots())
    })
    .await?;

    if outcome.status == MatchStatus::Completed {
        let dominant = record.winner(Criterion::Dominance);
        for parameters in policies {
            let won = dominant == Some(parameters.id);
            let survived = survival(&outcome.history, parameters.id);
            with_retry(ctx, retry, "policy", || store.record_policy_result(parameters, won, survived)).await?;
        }
    }

    info!(
        match_id = %outcome.match_id,
        status = ?outcome.status,
        snapshots = outcome.history.len(),
        "Match persisted"
    );
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatchConfig;
    use crate::engine::EngineConfig;
    use crate::fixed::{Ratio, Resource};
    use crate::grid::CellPlacement;
    use crate::simulation::Simulation;
    use agora_env::TokioContext;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policies() -> Vec<PolicyRecord> {
        vec![
            PolicyRecord::new(1, "grower").with_accumulation(1.0).with_investment(1.0),
            PolicyRecord::new(2, "idle").with_threshold(60.0),
        ]
    }

    fn outcome(status: MatchStatus) -> MatchOutcome {
        let config = MatchConfig {
            seed: 2,
            width: 8,
            height: 8,
            policies: policies(),
            placements: Some(vec![
                CellPlacement { x: 1, y: 1, policy: PolicyId(1) },
                CellPlacement { x: 6, y: 6, policy: PolicyId(2) },
            ]),
            starting_resource: Resource::from_units(50),
            generation_limit: 300,
            engine: EngineConfig {
                extinction_threshold: Ratio::ZERO,
                ..EngineConfig::default()
            },
            ..MatchConfig::default()
        };
        let mut sim = Simulation::new(config).unwrap();
        sim.run_to_end();

        MatchOutcome {
            match_id: MatchId::from_seed(7),
            status,
            started_ms: 0,
            duration_ms: 3_000,
            generation_count: sim.generation(),
            termination: sim.termination(),
            policy_ids: vec![PolicyId(1), PolicyId(2)],
            ranking: Some(sim.ranking()),
            history: sim.history().clone(),
            flagged: Vec::new(),
            disconnected: Vec::new(),
            rejected_reports: 0,
        }
    }

    /// Fails the first `failures` writes of every kind.
    struct FlakyStore {
        inner: SledMatchStore,
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyStore {
        fn trip(&self) -> Result<(), StoreError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(StoreError::Storage("disk unavailable".to_string()));
            }
            Ok(())
        }
    }

    impl MatchStore for FlakyStore {
        fn put_match(&self, record: &MatchRecord) -> Result<(), StoreError> {
            self.trip()?;
            self.inner.put_match(record)
        }
        fn put_snapshots(&self, match_id: MatchId, snapshots: &[Snapshot]) -> Result<(), StoreError> {
            self.inner.put_snapshots(match_id, snapshots)
        }
        fn record_policy_result(&self, parameters: &PolicyRecord, won: bool, survived: u64) -> Result<(), StoreError> {
            self.inner.record_policy_result(parameters, won, survived)
        }
        fn load_match(&self, match_id: MatchId) -> Result<Option<MatchRecord>, StoreError> {
            self.inner.load_match(match_id)
        }
        fn load_snapshots(&self, match_id: MatchId) -> Result<Vec<Snapshot>, StoreError> {
            self.inner.load_snapshots(match_id)
        }
        fn load_policy(&self, policy: PolicyId) -> Result<Option<PolicyLifetime>, StoreError> {
            self.inner.load_policy(policy)
        }
    }

    #[test]
    fn test_lifetime_running_average() {
        let mut lifetime = PolicyLifetime::new(PolicyRecord::new(1, "a"));
        lifetime.record(true, 100);
        lifetime.record(false, 300);
        assert_eq!(lifetime.match_count, 2);
        assert_eq!(lifetime.win_count, 1);
        assert_eq!(lifetime.avg_survival, 200.0);
    }

    #[test]
    fn test_snapshots_load_in_generation_order() {
        let store = SledMatchStore::open_temp().unwrap();
        let outcome = outcome(MatchStatus::Completed);
        let mut reversed = outcome.history.snapshots().to_vec();
        reversed.reverse();

        store.put_snapshots(outcome.match_id, &reversed).unwrap();
        store.put_snapshots(MatchId::from_seed(8), &reversed[..1]).unwrap();

        let loaded: Vec<u64> = store
            .load_snapshots(outcome.match_id)
            .unwrap()
            .iter()
            .map(|s| s.generation)
            .collect();
        assert_eq!(loaded, vec![0, 100, 200, 300]);
        assert!(store.load_snapshots(MatchId::from_seed(9)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persist_completed_match() {
        let store = SledMatchStore::open_temp().unwrap();
        let ctx = TokioContext::new();
        let outcome = outcome(MatchStatus::Completed);

        let record = persist_outcome(&ctx, &store, &outcome, &policies(), &RetryPolicy::default())
            .await
            .unwrap();

        let loaded = store.load_match(outcome.match_id).unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.generation_count, 300);
        assert_eq!(loaded.winner(Criterion::Dominance), Some(PolicyId(1)));
        assert_eq!(loaded.winner_per_criterion.len(), 4);

        let grower = store.load_policy(PolicyId(1)).unwrap().unwrap();
        assert_eq!((grower.match_count, grower.win_count), (1, 1));
        assert_eq!(grower.avg_survival, 300.0);

        // 50.00 under decay alone is gone by generation 496, so still alive at 300
        let idle = store.load_policy(PolicyId(2)).unwrap().unwrap();
        assert_eq!((idle.match_count, idle.win_count), (1, 0));
        assert_eq!(idle.avg_survival, 300.0);
    }

    #[tokio::test]
    async fn test_aborted_match_keeps_history_only() {
        let store = SledMatchStore::open_temp().unwrap();
        let ctx = TokioContext::new();
        let outcome = outcome(MatchStatus::Aborted);

        persist_outcome(&ctx, &store, &outcome, &policies(), &RetryPolicy::default())
            .await
            .unwrap();

        assert_eq!(store.load_snapshots(outcome.match_id).unwrap().len(), outcome.history.len());
        assert!(store.load_policy(PolicyId(1)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_with_backoff() {
        let ctx = TokioContext::new();
        let store = FlakyStore {
            inner: SledMatchStore::open_temp().unwrap(),
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let retry = RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            ..RetryPolicy::default()
        };

        persist_outcome(&ctx, &store, &outcome(MatchStatus::Completed), &policies(), &retry)
            .await
            .unwrap();
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert!(store.load_match(MatchId::from_seed(7)).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let ctx = TokioContext::new();
        let store = FlakyStore {
            inner: SledMatchStore::open_temp().unwrap(),
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let retry = RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            ..RetryPolicy::default()
        };

        let result = persist_outcome(&ctx, &store, &outcome(MatchStatus::Completed), &policies(), &retry).await;
        assert!(matches!(result, Err(StoreError::Exhausted { attempts: 5, .. })));
        assert_eq!(store.calls.load(Ordering::SeqCst), 5);
    }
}
