//! The Update Engine - advances a [`Grid`] by exactly one generation.
//!
//! # Pipeline
//!
//! ```text
//!   generation N (read-only)                     generation N+1 (new buffer)
//! ┌──────────────────────────┐   per live cell,   ┌──────────────────────────┐
//! │ cells: BTreeMap<Coord,_> │ ─── row-major ───▶ │ w + credits > 0 ? keep   │
//! └──────────────────────────┘                    │ children (age 0)         │
//!   1. decay        w -= max(0.01, w*decay)       │ safeguard injection      │
//!   2. trade        1 uniform / live neighbor     └──────────────────────────┘
//!   3. redistribute credits to Moore neighbors            │
//!   4. invest       1 normal                              ▼
//!   5. reproduce    1 index if >= 2 free slots       atomic swap, gen += 1
//! ```
//!
//! Each cell acts on its own working balance `w`. Anything it gives to
//! another cell (a partner's trade gain, a redistribution share) is
//! recorded as a credit and merged after every cell has been evaluated,
//! so no cell ever reads a value that was written this generation.

use crate::fixed::{round_div, Ratio, Resource, RATIO_SCALE};
use crate::grid::{Cell, Coord, Grid, LineageId};
use crate::policy::{PolicyId, PolicyTable};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Constants of the update rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fraction of the balance lost every generation (default: 1%)
    pub decay_rate: Ratio,

    /// Fraction of a party's balance put up for one trade (default: 10%)
    pub trade_share: Ratio,

    /// Multiplier on volume x average openness credited to each trader (default: 0.2)
    pub trade_gain: Ratio,

    /// Fraction of `w x redistribution_rate` donated (default: 0.1)
    pub redistribution_share: Ratio,

    /// Base investment yield per unit of accumulation rate (default: 0.02)
    pub investment_yield: Ratio,

    /// Volatility multiplier applied to `normal x risk` (default: 0.5)
    pub investment_volatility: Ratio,

    /// Alive fraction below which the safeguard injects (default: 5%)
    pub extinction_threshold: Ratio,

    /// Number of cells receiving an injection (default: 10)
    pub injection_count: usize,

    /// Amount injected into each chosen cell (default: 50.00)
    pub injection_amount: Resource,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            decay_rate: Ratio::from_bp(100),
            trade_share: Ratio::from_bp(1_000),
            trade_gain: Ratio::from_bp(2_000),
            redistribution_share: Ratio::from_bp(1_000),
            investment_yield: Ratio::from_bp(200),
            investment_volatility: Ratio::from_bp(5_000),
            extinction_threshold: Ratio::from_bp(500),
            injection_count: 10,
            injection_amount: Resource::from_units(50),
        }
    }
}

// ============================================================================
// GENERATION OUTCOME
// ============================================================================

/// A reproduction event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BirthEvent {
    pub parent: Coord,
    pub child: Coord,
    pub parent_lineage: LineageId,
    pub child_lineage: LineageId,
    /// Parent working balance just before halving
    pub parent_before: Resource,
    /// Parent working balance just after halving (also the child's balance)
    pub parent_after: Resource,
}

/// A cell removed because its merged balance reached zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeathEvent {
    pub coord: Coord,
    pub policy: PolicyId,
    pub lineage: LineageId,
    pub age: u64,
}

/// An accepted trade, seen from the initiating cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub initiator: Coord,
    pub partner: Coord,
    pub volume: Resource,
    /// Credited to each party
    pub gain: Resource,
}

/// A redistribution from one donor to its living Moore neighbors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedistributionEvent {
    pub donor: Coord,
    pub recipients: usize,
    pub share: Resource,
}

/// Extinction-safeguard injection for one generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionRecord {
    /// Cells that received the injection, in pick order
    pub cells: Vec<Coord>,
    pub amount: Resource,
    /// Sum over all live cells before injecting
    pub total_before: Resource,
    /// Sum over all live cells after injecting
    pub total_after: Resource,
}

/// Everything that happened during one `N -> N+1` transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationOutcome {
    /// The generation number the grid advanced to
    pub generation: u64,
    pub births: Vec<BirthEvent>,
    pub deaths: Vec<DeathEvent>,
    pub trades: Vec<TradeEvent>,
    pub redistributions: Vec<RedistributionEvent>,
    pub injection: Option<InjectionRecord>,
    /// Live cells after the transition
    pub alive: usize,
    /// True when no live cells remain
    pub extinct: bool,
}

// ============================================================================
// ENGINE
// ============================================================================

/// `value x numerator / denominator`, rounded half to even once.
fn scale(value: Resource, numerator: i128, denominator: i128) -> Resource {
    Resource::from_raw(round_div(value.raw() as i128 * numerator, denominator) as i64)
}

/// Decay charge: `round(w x decay)`, at least one unit while `w > 0`.
fn decay_charge(w: Resource, decay: Ratio) -> Resource {
    if !w.is_positive() || decay.is_zero() {
        return Resource::ZERO;
    }
    w.mul_ratio(decay).max(Resource::UNIT)
}

/// Trade acceptance probability from generation-N balances.
fn acceptance(open_sum_bp: i64, a: Resource, b: Resource) -> f64 {
    let max = a.max(b);
    if !max.is_positive() {
        return 0.0;
    }
    let avg_open = open_sum_bp as f64 / (2 * RATIO_SCALE) as f64;
    avg_open * (a.abs_diff(b).raw() as f64 / max.raw() as f64)
}

/// Advances the grid by one generation.
///
/// Draws are consumed in traversal order (row-major over generation N's
/// live cells), then by the extinction safeguard.
pub fn step(grid: &mut Grid, policies: &PolicyTable, config: &EngineConfig) -> GenerationOutcome {
    let bounds = grid.bounds();
    let area = bounds.area();
    let mut next_lineage = grid.next_lineage;

    let mut outcome = GenerationOutcome {
        generation: grid.generation() + 1,
        ..GenerationOutcome::default()
    };

    let mut working: Vec<(Coord, Resource)> = Vec::with_capacity(grid.cells.len());
    let mut credits: BTreeMap<Coord, Resource> = BTreeMap::new();
    let mut claimed: BTreeSet<Coord> = BTreeSet::new();
    let mut children: BTreeMap<Coord, Cell> = BTreeMap::new();

    {
        let current = &grid.cells;
        let draws = &mut grid.draws;

        for (&coord, cell) in current {
            let Some(policy) = policies.get(cell.policy) else {
                warn!(%coord, policy = %cell.policy, "Cell references unknown policy; carried unchanged");
                working.push((coord, cell.resource));
                continue;
            };

            let mut w = cell.resource;

            // 1. Decay
            w -= decay_charge(w, config.decay_rate);

            // 2. Trade
            for partner in bounds.neighborhood(coord, policy.trade_radius) {
                let Some(other) = current.get(&partner) else {
                    continue;
                };
                let u = draws.uniform();

                let Some(other_policy) = policies.get(other.policy) else {
                    continue;
                };
                let open_sum = policy.trade_openness.bp() + other_policy.trade_openness.bp();
                if u >= acceptance(open_sum, cell.resource, other.resource) {
                    continue;
                }

                // Volume uses both parties' generation-N balances, not the decayed `w`.
                let volume = cell
                    .resource
                    .mul_ratios(&[config.trade_share, policy.risk_tolerance])
                    .min(other.resource.mul_ratios(&[config.trade_share, other_policy.risk_tolerance]));
                let gain = scale(
                    volume,
                    open_sum as i128 * config.trade_gain.bp() as i128,
                    2 * (RATIO_SCALE as i128) * (RATIO_SCALE as i128),
                );
                if !gain.is_positive() {
                    continue;
                }

                w += gain;
                *credits.entry(partner).or_insert(Resource::ZERO) += gain;
                outcome.trades.push(TradeEvent {
                    initiator: coord,
                    partner,
                    volume,
                    gain,
                });
            }

            // 3. Redistribution
            if !policy.redistribution_rate.is_zero() && w.is_positive() {
                let living: Vec<Coord> = bounds
                    .moore(coord)
                    .into_iter()
                    .filter(|c| current.contains_key(c))
                    .collect();

                if !living.is_empty() {
                    let donation = w.mul_ratios(&[policy.redistribution_rate, config.redistribution_share]);
                    let share = donation.share_of(living.len());
                    if share.is_positive() {
                        for &neighbor in &living {
                            *credits.entry(neighbor).or_insert(Resource::ZERO) += share;
                        }
                        w -= share.times(living.len());
                        outcome.redistributions.push(RedistributionEvent {
                            donor: coord,
                            recipients: living.len(),
                            share,
                        });
                    }
                }
            }

            // 4. Investment
            if !policy.investment_rate.is_zero() {
                let z = draws.normal();
                let factor = Ratio::from_f64(
                    1.0 + z * policy.risk_tolerance.to_f64() * config.investment_volatility.to_f64(),
                );
                w += w.mul_ratios(&[policy.accumulation_rate, config.investment_yield, factor]);
            }

            // 5. Reproduction
            if w >= policy.reproduction_threshold {
                let slots: Vec<Coord> = bounds
                    .moore(coord)
                    .into_iter()
                    .filter(|c| !current.contains_key(c) && !claimed.contains(c))
                    .collect();

                if !slots.is_empty() {
                    let pick = if slots.len() >= 2 { draws.index(slots.len()) } else { 0 };
                    let site = slots[pick];
                    let before = w;
                    w = w.halve();

                    let lineage = LineageId(next_lineage);
                    next_lineage += 1;
                    claimed.insert(site);
                    children.insert(
                        site,
                        Cell {
                            resource: w,
                            policy: cell.policy,
                            age: 0,
                            lineage,
                            parent: Some(cell.lineage),
                            founder: cell.founder,
                        },
                    );
                    outcome.births.push(BirthEvent {
                        parent: coord,
                        child: site,
                        parent_lineage: cell.lineage,
                        child_lineage: lineage,
                        parent_before: before,
                        parent_after: w,
                    });
                }
            }

            working.push((coord, w));
        }
    }

    // 6-7. Merge credits, remove the dead, age the survivors
    let mut next: BTreeMap<Coord, Cell> = BTreeMap::new();
    for (coord, w) in working {
        let Some(cell) = grid.cells.get(&coord) else {
            continue;
        };
        let merged = w + credits.get(&coord).copied().unwrap_or(Resource::ZERO);
        if merged.is_positive() {
            next.insert(
                coord,
                Cell {
                    resource: merged,
                    age: cell.age + 1,
                    ..cell.clone()
                },
            );
        } else {
            outcome.deaths.push(DeathEvent {
                coord,
                policy: cell.policy,
                lineage: cell.lineage,
                age: cell.age,
            });
        }
    }
    next.extend(children);

    // Extinction safeguard
    let alive = next.len();
    let below = (alive as u128) * (RATIO_SCALE as u128)
        < config.extinction_threshold.bp().max(0) as u128 * area as u128;
    if alive > 0 && below && config.injection_count > 0 {
        let total_before: Resource = next.values().map(|c| c.resource).sum();
        let mut pool: Vec<Coord> = next.keys().copied().collect();
        let count = config.injection_count.min(pool.len());

        for i in 0..count {
            let j = i + grid.draws.index(pool.len() - i);
            pool.swap(i, j);
        }
        pool.truncate(count);

        for coord in &pool {
            if let Some(cell) = next.get_mut(coord) {
                cell.resource += config.injection_amount;
            }
        }
        let total_after: Resource = next.values().map(|c| c.resource).sum();

        debug!(
            generation = outcome.generation,
            alive,
            injected = count,
            "Extinction safeguard injected resources"
        );
        outcome.injection = Some(InjectionRecord {
            cells: pool,
            amount: config.injection_amount,
            total_before,
            total_after,
        });
    }

    outcome.alive = alive;
    outcome.extinct = alive == 0;
    if outcome.extinct {
        debug!(generation = outcome.generation, "Grid extinct");
    }

    grid.next_lineage = next_lineage;
    grid.commit(next);
    outcome
}
