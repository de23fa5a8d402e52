//! The Policy Table - immutable named parameter vectors.
//!
//! Policies arrive from outside (authoring UI, presets) as [`PolicyRecord`]s
//! with float parameters. At match start they are validated and frozen into
//! [`Policy`] values whose parameters are fixed-point [`Ratio`]s, so no float
//! ever reaches the update engine.

use crate::fixed::{round_div, Ratio, Resource, RATIO_SCALE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Largest trade radius a policy may declare.
pub const MAX_TRADE_RADIUS: u32 = 8;

/// Smallest reproduction threshold: both halves must stay positive.
pub const MIN_REPRODUCTION_THRESHOLD: Resource = Resource::from_raw(2);

/// Identifier of a policy, unique within a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyId(pub u32);

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Errors raised while building the policy table.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("Parameter {name} of policy {policy} out of range [0, 1]: {value}")]
    OutOfRange {
        policy: PolicyId,
        name: &'static str,
        value: f64,
    },

    #[error("Duplicate policy id {0}")]
    DuplicateId(PolicyId),

    #[error("Policy table is empty")]
    Empty,

    #[error("Reproduction threshold of policy {policy} must be at least {min}, got {value}")]
    ThresholdTooLow {
        policy: PolicyId,
        min: Resource,
        value: Resource,
    },

    #[error("Trade radius of policy {policy} exceeds {max}: {radius}")]
    RadiusTooLarge {
        policy: PolicyId,
        max: u32,
        radius: u32,
    },
}

// ============================================================================
// WIRE FORM
// ============================================================================

/// Policy as authored and transmitted in `MatchStart`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub id: PolicyId,
    pub name: String,
    #[serde(default)]
    pub creator: String,
    pub accumulation_rate: f64,
    pub trade_openness: f64,
    pub redistribution_rate: f64,
    pub investment_rate: f64,
    pub risk_tolerance: f64,

    /// Overrides the derived threshold (whole units)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reproduction_threshold: Option<f64>,

    /// Overrides the derived trade radius
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_radius: Option<u32>,
}

impl PolicyRecord {
    /// Creates a record with every rate at zero.
    pub fn new(id: u32, name: &str) -> Self {
        Self {
            id: PolicyId(id),
            name: name.to_string(),
            creator: String::new(),
            accumulation_rate: 0.0,
            trade_openness: 0.0,
            redistribution_rate: 0.0,
            investment_rate: 0.0,
            risk_tolerance: 0.0,
            reproduction_threshold: None,
            trade_radius: None,
        }
    }

    pub fn with_accumulation(mut self, rate: f64) -> Self {
        self.accumulation_rate = rate;
        self
    }

    pub fn with_openness(mut self, openness: f64) -> Self {
        self.trade_openness = openness;
        self
    }

    pub fn with_redistribution(mut self, rate: f64) -> Self {
        self.redistribution_rate = rate;
        self
    }

    pub fn with_investment(mut self, rate: f64) -> Self {
        self.investment_rate = rate;
        self
    }

    pub fn with_risk(mut self, tolerance: f64) -> Self {
        self.risk_tolerance = tolerance;
        self
    }

    pub fn with_threshold(mut self, units: f64) -> Self {
        self.reproduction_threshold = Some(units);
        self
    }

    pub fn with_radius(mut self, radius: u32) -> Self {
        self.trade_radius = Some(radius);
        self
    }
}

// ============================================================================
// VALIDATED POLICY
// ============================================================================

/// A validated, frozen policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub id: PolicyId,
    pub name: String,
    pub creator: String,
    pub accumulation_rate: Ratio,
    pub trade_openness: Ratio,
    pub redistribution_rate: Ratio,
    pub investment_rate: Ratio,
    pub risk_tolerance: Ratio,
    pub reproduction_threshold: Resource,
    pub trade_radius: u32,
}

impl Policy {
    /// Validates a record and derives the threshold and radius if absent.
    ///
    /// Derivations:
    /// - `reproduction_threshold = 100 + 100 * (1 - risk_tolerance)` units
    /// - `trade_radius = 1 + round(2 * trade_openness)`
    pub fn from_record(record: &PolicyRecord) -> Result<Self, PolicyError> {
        let id = record.id;
        let rate = |name: &'static str, value: f64| -> Result<Ratio, PolicyError> {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(PolicyError::OutOfRange { policy: id, name, value });
            }
            Ok(Ratio::from_f64(value))
        };

        let accumulation_rate = rate("accumulation_rate", record.accumulation_rate)?;
        let trade_openness = rate("trade_openness", record.trade_openness)?;
        let redistribution_rate = rate("redistribution_rate", record.redistribution_rate)?;
        let investment_rate = rate("investment_rate", record.investment_rate)?;
        let risk_tolerance = rate("risk_tolerance", record.risk_tolerance)?;

        let reproduction_threshold = match record.reproduction_threshold {
            Some(units) if units.is_finite() => Resource::from_f64(units),
            Some(_) => Resource::ZERO,
            None => {
                let base = Resource::from_units(100);
                base + base.mul_ratio(risk_tolerance.complement())
            }
        };
        if reproduction_threshold < MIN_REPRODUCTION_THRESHOLD {
            return Err(PolicyError::ThresholdTooLow {
                policy: id,
                min: MIN_REPRODUCTION_THRESHOLD,
                value: reproduction_threshold,
            });
        }

        let trade_radius = record.trade_radius.unwrap_or_else(|| {
            1 + round_div(2 * trade_openness.bp() as i128, RATIO_SCALE as i128) as u32
        });
        if trade_radius > MAX_TRADE_RADIUS {
            return Err(PolicyError::RadiusTooLarge {
                policy: id,
                max: MAX_TRADE_RADIUS,
                radius: trade_radius,
            });
        }

        Ok(Self {
            id,
            name: record.name.clone(),
            creator: record.creator.clone(),
            accumulation_rate,
            trade_openness,
            redistribution_rate,
            investment_rate,
            risk_tolerance,
            reproduction_threshold,
            trade_radius,
        })
    }

    /// Converts back to the wire form (with derived values made explicit).
    pub fn to_record(&self) -> PolicyRecord {
        PolicyRecord {
            id: self.id,
            name: self.name.clone(),
            creator: self.creator.clone(),
            accumulation_rate: self.accumulation_rate.to_f64(),
            trade_openness: self.trade_openness.to_f64(),
            redistribution_rate: self.redistribution_rate.to_f64(),
            investment_rate: self.investment_rate.to_f64(),
            risk_tolerance: self.risk_tolerance.to_f64(),
            reproduction_threshold: Some(self.reproduction_threshold.to_f64()),
            trade_radius: Some(self.trade_radius),
        }
    }
}

// ============================================================================
// POLICY TABLE
// ============================================================================

/// Immutable set of policies for one match, ordered by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyTable {
    policies: BTreeMap<PolicyId, Policy>,
}

impl PolicyTable {
    /// Validates all records into a table.
    pub fn from_records(records: &[PolicyRecord]) -> Result<Self, PolicyError> {
        if records.is_empty() {
            return Err(PolicyError::Empty);
        }

        let mut policies = BTreeMap::new();
        for record in records {
            let policy = Policy::from_record(record)?;
            if policies.insert(policy.id, policy).is_some() {
                return Err(PolicyError::DuplicateId(record.id));
            }
        }

        Ok(Self { policies })
    }

    /// Looks up a policy.
    pub fn get(&self, id: PolicyId) -> Option<&Policy> {
        self.policies.get(&id)
    }

    /// True if the id resolves.
    pub fn contains(&self, id: PolicyId) -> bool {
        self.policies.contains_key(&id)
    }

    /// Policy ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = PolicyId> + '_ {
        self.policies.keys().copied()
    }

    /// Policies in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &Policy> {
        self.policies.values()
    }

    /// The `index`-th policy in id order (used by density placement).
    pub fn by_index(&self, index: usize) -> Option<&Policy> {
        self.policies.values().nth(index)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Wire records for `MatchStart`.
    pub fn records(&self) -> Vec<PolicyRecord> {
        self.policies.values().map(Policy::to_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_values() {
        let record = PolicyRecord::new(1, "hoarder").with_risk(0.25).with_openness(0.6);
        let policy = Policy::from_record(&record).unwrap();

        // 100 + 100 * 0.75 = 175
        assert_eq!(policy.reproduction_threshold, Resource::from_units(175));
        // 1 + round(1.2) = 2
        assert_eq!(policy.trade_radius, 2);
        assert_eq!(policy.trade_openness, Ratio::from_bp(6000));
    }

    #[test]
    fn test_explicit_overrides() {
        let record = PolicyRecord::new(1, "fixed").with_threshold(60.0).with_radius(0);
        let policy = Policy::from_record(&record).unwrap();

        assert_eq!(policy.reproduction_threshold, Resource::from_units(60));
        assert_eq!(policy.trade_radius, 0);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let record = PolicyRecord::new(3, "reckless").with_risk(1.5);
        let err = Policy::from_record(&record).unwrap_err();
        assert_eq!(
            err,
            PolicyError::OutOfRange { policy: PolicyId(3), name: "risk_tolerance", value: 1.5 }
        );

        let record = PolicyRecord::new(4, "nan").with_accumulation(f64::NAN);
        assert!(Policy::from_record(&record).is_err());
    }

    #[test]
    fn test_threshold_floor() {
        let record = PolicyRecord::new(5, "tiny").with_threshold(0.01);
        assert!(matches!(
            Policy::from_record(&record),
            Err(PolicyError::ThresholdTooLow { .. })
        ));
    }

    #[test]
    fn test_radius_cap() {
        let record = PolicyRecord::new(6, "far").with_radius(9);
        assert!(matches!(
            Policy::from_record(&record),
            Err(PolicyError::RadiusTooLarge { radius: 9, .. })
        ));
    }

    #[test]
    fn test_table_duplicates_and_order() {
        let records = vec![PolicyRecord::new(2, "b"), PolicyRecord::new(1, "a")];
        let table = PolicyTable::from_records(&records).unwrap();
        assert_eq!(table.ids().collect::<Vec<_>>(), vec![PolicyId(1), PolicyId(2)]);
        assert_eq!(table.by_index(0).unwrap().name, "a");

        let dup = vec![PolicyRecord::new(1, "a"), PolicyRecord::new(1, "again")];
        assert_eq!(PolicyTable::from_records(&dup), Err(PolicyError::DuplicateId(PolicyId(1))));

        assert_eq!(PolicyTable::from_records(&[]), Err(PolicyError::Empty));
    }

    #[test]
    fn test_record_roundtrip_is_stable() {
        let record = PolicyRecord::new(9, "mixed")
            .with_accumulation(0.3)
            .with_investment(0.4)
            .with_risk(0.8);
        let policy = Policy::from_record(&record).unwrap();
        let again = Policy::from_record(&policy.to_record()).unwrap();
        assert_eq!(policy, again);
    }
}
