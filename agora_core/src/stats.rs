//! Statistics Engine - inequality, concentration and survival metrics.
//!
//! Everything here is a read-only view over a [`Grid`]. Sums are formed
//! exactly in integers; floats only appear in the final ratio, so two
//! replicas with identical grids produce bit-identical snapshots.

use crate::fixed::Resource;
use crate::grid::{Grid, LineageId};
use crate::policy::{PolicyId, PolicyTable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Gini coefficient of a set of balances.
///
/// `G = Σ(2i − n + 1)·rᵢ / (n·Σr)` over balances sorted ascending, `i`
/// from 0. Returns 0 for an empty set or a zero total.
pub fn gini(resources: &[Resource]) -> f64 {
    let n = resources.len() as i128;
    let mut sorted: Vec<i128> = resources.iter().map(|r| r.raw() as i128).collect();
    sorted.sort_unstable();

    let total: i128 = sorted.iter().sum();
    if n == 0 || total == 0 {
        return 0.0;
    }

    let weighted: i128 = sorted
        .iter()
        .enumerate()
        .map(|(i, r)| (2 * i as i128 - n + 1) * r)
        .sum();
    weighted as f64 / (n * total) as f64
}

/// Herfindahl-Hirschman index over per-policy alive-cell counts, in [0, 10000].
pub fn hhi<I>(counts: I) -> f64
where
    I: IntoIterator<Item = usize>,
{
    let (mut n, mut sum_sq) = (0u128, 0u128);
    for c in counts {
        n += c as u128;
        sum_sq += (c as u128) * (c as u128);
    }
    if n == 0 {
        return 0.0;
    }
    (10_000 * sum_sq) as f64 / (n * n) as f64
}

fn mean(sum: u128, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum as f64 / count as f64
    }
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Aggregates for one policy at a sampled generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyStats {
    pub alive_cells: usize,
    pub total_resource: Resource,
    pub mean_age: f64,
    pub gini: f64,
}

/// Immutable statistics record for one sampled generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub generation: u64,
    pub alive_count: usize,
    pub total_resource: Resource,
    pub gini: f64,
    pub hhi: f64,
    /// Every policy of the match, including those with no live cells
    pub per_policy: BTreeMap<PolicyId, PolicyStats>,
    /// Mean age of live cells grouped by founder lineage
    pub lineage_mean_age: BTreeMap<LineageId, f64>,
}

impl Snapshot {
    /// Captures a snapshot of the grid's current generation.
    pub fn capture(grid: &Grid, policies: &PolicyTable) -> Self {
        let mut balances: BTreeMap<PolicyId, Vec<Resource>> =
            policies.ids().map(|id| (id, Vec::new())).collect();
        let mut age_sums: BTreeMap<PolicyId, u128> = BTreeMap::new();
        let mut lineages: BTreeMap<LineageId, (u128, usize)> = BTreeMap::new();
        let mut all = Vec::with_capacity(grid.alive_count());

        for (_, cell) in grid.iter() {
            all.push(cell.resource);
            balances.entry(cell.policy).or_default().push(cell.resource);
            *age_sums.entry(cell.policy).or_insert(0) += cell.age as u128;

            let entry = lineages.entry(cell.founder).or_insert((0, 0));
            entry.0 += cell.age as u128;
            entry.1 += 1;
        }

        let per_policy: BTreeMap<PolicyId, PolicyStats> = balances
            .into_iter()
            .map(|(id, rs)| {
                let stats = PolicyStats {
                    alive_cells: rs.len(),
                    total_resource: rs.iter().sum(),
                    mean_age: mean(age_sums.get(&id).copied().unwrap_or(0), rs.len()),
                    gini: gini(&rs),
                };
                (id, stats)
            })
            .collect();

        let hhi = hhi(per_policy.values().map(|p| p.alive_cells));

        Self {
            generation: grid.generation(),
            alive_count: all.len(),
            total_resource: all.iter().sum(),
            gini: gini(&all),
            hhi,
            per_policy,
            lineage_mean_age: lineages
                .into_iter()
                .map(|(l, (sum, count))| (l, mean(sum, count)))
                .collect(),
        }
    }

    /// Share of live cells held by `policy`, in [0, 1].
    pub fn dominance(&self, policy: PolicyId) -> f64 {
        let cells = self.per_policy.get(&policy).map(|p| p.alive_cells).unwrap_or(0);
        if self.alive_count == 0 {
            0.0
        } else {
            cells as f64 / self.alive_count as f64
        }
    }

    /// Per-policy resource totals, the same shape a replica reports.
    pub fn policy_totals(&self) -> BTreeMap<PolicyId, Resource> {
        self.per_policy
            .iter()
            .map(|(id, p)| (*id, p.total_resource))
            .collect()
    }

    pub fn is_extinct(&self) -> bool {
        self.alive_count == 0
    }
}

// ============================================================================
// MATCH HISTORY
// ============================================================================

/// Errors appending to a history.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("Snapshot for generation {got} does not follow generation {last}")]
    OutOfOrder { last: u64, got: u64 },
}

/// Append-only sequence of snapshots ordered by generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchHistory {
    snapshots: Vec<Snapshot>,
}

impl MatchHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a snapshot. Generations must strictly increase.
    pub fn append(&mut self, snapshot: Snapshot) -> Result<(), HistoryError> {
        if let Some(last) = self.snapshots.last() {
            if snapshot.generation <= last.generation {
                return Err(HistoryError::OutOfOrder {
                    last: last.generation,
                    got: snapshot.generation,
                });
            }
        }
        self.snapshots.push(snapshot);
        Ok(())
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }

    pub fn at(&self, generation: u64) -> Option<&Snapshot> {
        self.snapshots
            .binary_search_by_key(&generation, |s| s.generation)
            .ok()
            .map(|i| &self.snapshots[i])
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{CellPlacement, Coord};
    use crate::policy::PolicyRecord;
    use approx::assert_relative_eq;

    #[test]
    fn test_gini_uniform_is_zero() {
        let rs = vec![Resource::from_units(40); 25];
        assert_relative_eq!(gini(&rs), 0.0);
    }

    #[test]
    fn test_gini_concentrated() {
        for n in [2usize, 5, 10, 100] {
            let mut rs = vec![Resource::ZERO; n - 1];
            rs.push(Resource::from_units(1_000));
            assert_relative_eq!(gini(&rs), (n as f64 - 1.0) / n as f64, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_gini_degenerate() {
        assert_eq!(gini(&[]), 0.0);
        assert_eq!(gini(&[Resource::ZERO, Resource::ZERO]), 0.0);
        assert_eq!(gini(&[Resource::from_units(7)]), 0.0);
    }

    #[test]
    fn test_gini_unsorted_input() {
        let rs = [Resource::from_units(3), Resource::from_units(1), Resource::from_units(2)];
        // Σ(2i-n+1)r = -2*1 + 0*2 + 2*3 = 4; n·Σr = 18
        assert_relative_eq!(gini(&rs), 4.0 / 18.0, epsilon = 1e-12);
    }

    #[test]
    fn test_hhi_bounds() {
        assert_relative_eq!(hhi([42]), 10_000.0);
        assert_relative_eq!(hhi([5, 5, 5, 5]), 2_500.0);
        assert_relative_eq!(hhi([10, 0]), 10_000.0);
        assert_eq!(hhi(Vec::<usize>::new()), 0.0);
    }

    #[test]
    fn test_snapshot_capture() {
        let policies = PolicyTable::from_records(&[
            PolicyRecord::new(1, "a"),
            PolicyRecord::new(2, "b"),
            PolicyRecord::new(3, "extinct"),
        ])
        .unwrap();
        let placements = vec![
            CellPlacement { x: 0, y: 0, policy: PolicyId(1) },
            CellPlacement { x: 1, y: 0, policy: PolicyId(1) },
            CellPlacement { x: 2, y: 0, policy: PolicyId(2) },
        ];
        let mut grid =
            Grid::with_placements(4, 4, 1, &policies, &placements, Resource::from_units(10)).unwrap();
        grid.perturb_resource(Coord::new(2, 0), Resource::from_units(20));

        let snap = Snapshot::capture(&grid, &policies);
        assert_eq!(snap.generation, 0);
        assert_eq!(snap.alive_count, 3);
        assert_eq!(snap.total_resource, Resource::from_units(50));
        assert_eq!(snap.per_policy.len(), 3);
        assert_eq!(snap.per_policy[&PolicyId(1)].alive_cells, 2);
        assert_eq!(snap.per_policy[&PolicyId(2)].total_resource, Resource::from_units(30));
        assert_eq!(snap.per_policy[&PolicyId(3)].alive_cells, 0);
        assert_relative_eq!(snap.per_policy[&PolicyId(1)].gini, 0.0);
        // 2 of 3 and 1 of 3: (4 + 1) / 9
        assert_relative_eq!(snap.hhi, 10_000.0 * 5.0 / 9.0, epsilon = 1e-9);
        assert_relative_eq!(snap.dominance(PolicyId(1)), 2.0 / 3.0);
        assert_eq!(snap.lineage_mean_age.len(), 3);
        assert!(!snap.is_extinct());
    }

    #[test]
    fn test_history_is_append_only_and_ordered() {
        let policies = PolicyTable::from_records(&[PolicyRecord::new(1, "a")]).unwrap();
        let grid = Grid::empty(3, 3, 1).unwrap();
        let mut snap = Snapshot::capture(&grid, &policies);

        let mut history = MatchHistory::new();
        history.append(snap.clone()).unwrap();
        assert_eq!(
            history.append(snap.clone()),
            Err(HistoryError::OutOfOrder { last: 0, got: 0 })
        );

        snap.generation = 100;
        history.append(snap).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.at(100).map(|s| s.generation), Some(100));
        assert!(history.at(50).is_none());
        assert_eq!(history.latest().map(|s| s.generation), Some(100));
    }

    #[test]
    fn test_snapshot_json_roundtrip_keeps_maps() {
        let policies = PolicyTable::from_records(&[PolicyRecord::new(4, "a")]).unwrap();
        let placements = vec![CellPlacement { x: 1, y: 1, policy: PolicyId(4) }];
        let grid = Grid::with_placements(3, 3, 1, &policies, &placements, Resource::from_units(5)).unwrap();
        let snap = Snapshot::capture(&grid, &policies);

        let json = serde_json::to_string(&snap).unwrap();
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
    }
}
