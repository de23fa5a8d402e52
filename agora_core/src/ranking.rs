//! Match-end ranking over the final snapshot.
//!
//! Four independent criteria, each ranking every policy of the match:
//!
//! | criterion       | order | value                               |
//! |-----------------|-------|-------------------------------------|
//! | dominance       | desc  | share of live cells                 |
//! | total resources | desc  | summed balance                      |
//! | average age     | desc  | mean age of live cells              |
//! | gini            | asc   | per-policy Gini, extinct ranked last|
//!
//! Ties break by ascending policy id.

use crate::policy::PolicyId;
use crate::stats::Snapshot;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// One ranking criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    Dominance,
    TotalResources,
    AverageAge,
    Gini,
}

impl Criterion {
    pub const ALL: [Criterion; 4] = [
        Criterion::Dominance,
        Criterion::TotalResources,
        Criterion::AverageAge,
        Criterion::Gini,
    ];
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Criterion::Dominance => "dominance",
            Criterion::TotalResources => "total_resources",
            Criterion::AverageAge => "average_age",
            Criterion::Gini => "gini",
        };
        f.write_str(name)
    }
}

/// A policy's placement under one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntry {
    pub policy: PolicyId,
    pub value: f64,
    /// Whether the policy had live cells in the ranked snapshot
    pub alive: bool,
}

/// Ordering of all policies under one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ranking {
    pub criterion: Criterion,
    pub entries: Vec<RankedEntry>,
    /// First-ranked policy, `None` means "no dominant policy"
    pub winner: Option<PolicyId>,
}

/// Rankings under all four criteria.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRanking {
    pub generation: u64,
    pub rankings: Vec<Ranking>,
}

impl MatchRanking {
    /// Ranks every policy in the snapshot.
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let rankings = Criterion::ALL
            .iter()
            .map(|&criterion| rank(snapshot, criterion))
            .collect();

        Self {
            generation: snapshot.generation,
            rankings,
        }
    }

    pub fn ranking(&self, criterion: Criterion) -> Option<&Ranking> {
        self.rankings.iter().find(|r| r.criterion == criterion)
    }

    pub fn winner(&self, criterion: Criterion) -> Option<PolicyId> {
        self.ranking(criterion).and_then(|r| r.winner)
    }

    /// True when no criterion has a winner (every policy extinct).
    pub fn no_dominant_policy(&self) -> bool {
        self.rankings.iter().all(|r| r.winner.is_none())
    }
}

fn rank(snapshot: &Snapshot, criterion: Criterion) -> Ranking {
    let mut entries: Vec<RankedEntry> = snapshot
        .per_policy
        .iter()
        .map(|(&policy, stats)| {
            let value = match criterion {
                Criterion::Dominance => snapshot.dominance(policy),
                Criterion::TotalResources => stats.total_resource.to_f64(),
                Criterion::AverageAge => stats.mean_age,
                Criterion::Gini => stats.gini,
            };
            RankedEntry {
                policy,
                value,
                alive: stats.alive_cells > 0,
            }
        })
        .collect();

    entries.sort_by(|a, b| compare(criterion, a, b));

    let winner = entries
        .first()
        .filter(|e| e.alive && snapshot.alive_count > 0)
        .map(|e| e.policy);

    Ranking {
        criterion,
        entries,
        winner,
    }
}

fn compare(criterion: Criterion, a: &RankedEntry, b: &RankedEntry) -> Ordering {
    let by_value = match criterion {
        // Lower is better; policies without cells have no meaningful Gini
        Criterion::Gini => b.alive.cmp(&a.alive).then(a.value.total_cmp(&b.value)),
        _ => b.value.total_cmp(&a.value),
    };
    by_value.then(a.policy.cmp(&b.policy))
}
