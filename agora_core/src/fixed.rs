//! Fixed-point arithmetic for resources and rates.
//!
//! Every numeric quantity that influences simulation state lives in the
//! integer domain:
//! - [`Resource`]: balances scaled by 100 (two implied decimal digits)
//! - [`Ratio`]: rates in [0, 1] (and engine factors) scaled by 10 000
//!
//! There is exactly one rounding rule, **round half to even**, applied by
//! [`round_div`] to every operation that would otherwise produce a
//! fractional scaled value. Products of several ratios are formed exactly
//! in `i128` and rounded once.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

/// Scale of [`Resource`]: 1.00 unit = 100 raw.
pub const RESOURCE_SCALE: i64 = 100;

/// Scale of [`Ratio`]: 1.0 = 10 000 basis points.
pub const RATIO_SCALE: i64 = 10_000;

/// Divides with round-half-to-even. `denominator` must be positive.
pub fn round_div(numerator: i128, denominator: i128) -> i128 {
    debug_assert!(denominator > 0, "round_div requires a positive denominator");
    let quotient = numerator.div_euclid(denominator);
    let twice_rem = 2 * numerator.rem_euclid(denominator);

    if twice_rem > denominator || (twice_rem == denominator && quotient % 2 != 0) {
        quotient + 1
    } else {
        quotient
    }
}

/// Converts a float to a scaled integer with round-half-to-even.
fn round_f64_scaled(value: f64, scale: i64) -> i64 {
    (value * scale as f64).round_ties_even() as i64
}

// ============================================================================
// RESOURCE
// ============================================================================

/// A resource balance in hundredths of a unit.
///
/// Serialized as the raw scaled integer so that wire reports carry the
/// exact value replicas computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource(i64);

impl Resource {
    /// Zero balance.
    pub const ZERO: Resource = Resource(0);

    /// Smallest representable positive balance (0.01).
    pub const UNIT: Resource = Resource(1);

    /// Creates a balance from its raw scaled value.
    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    /// Creates a balance of whole units.
    pub const fn from_units(units: i64) -> Self {
        Self(units * RESOURCE_SCALE)
    }

    /// Converts from a float, rounding half to even at the second decimal.
    pub fn from_f64(value: f64) -> Self {
        Self(round_f64_scaled(value, RESOURCE_SCALE))
    }

    /// Returns the raw scaled value.
    pub const fn raw(self) -> i64 {
        self.0
    }

    /// Returns the balance as a float (for statistics and display only).
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / RESOURCE_SCALE as f64
    }

    /// True when the balance is strictly positive.
    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Absolute difference between two balances.
    pub fn abs_diff(self, other: Resource) -> Resource {
        Resource((self.0 - other.0).abs())
    }

    /// Multiplies by one ratio, rounding once.
    pub fn mul_ratio(self, ratio: Ratio) -> Resource {
        self.mul_ratios(&[ratio])
    }

    /// Multiplies by a product of ratios, rounding once at the end.
    pub fn mul_ratios(self, ratios: &[Ratio]) -> Resource {
        let mut numerator = self.0 as i128;
        let mut denominator: i128 = 1;
        for ratio in ratios {
            numerator *= ratio.0 as i128;
            denominator *= RATIO_SCALE as i128;
        }
        Resource(round_div(numerator, denominator) as i64)
    }

    /// Splits into `parts` equal shares, rounding each share.
    pub fn share_of(self, parts: usize) -> Resource {
        if parts == 0 {
            return Resource::ZERO;
        }
        Resource(round_div(self.0 as i128, parts as i128) as i64)
    }

    /// Half of the balance, rounded.
    pub fn halve(self) -> Resource {
        self.share_of(2)
    }

    /// Multiplies by an integer count (exact).
    pub fn times(self, count: usize) -> Resource {
        Resource(self.0 * count as i64)
    }
}

impl Add for Resource {
    type Output = Resource;

    fn add(self, rhs: Resource) -> Resource {
        Resource(self.0 + rhs.0)
    }
}

impl AddAssign for Resource {
    fn add_assign(&mut self, rhs: Resource) {
        self.0 += rhs.0;
    }
}

impl Sub for Resource {
    type Output = Resource;

    fn sub(self, rhs: Resource) -> Resource {
        Resource(self.0 - rhs.0)
    }
}

impl SubAssign for Resource {
    fn sub_assign(&mut self, rhs: Resource) {
        self.0 -= rhs.0;
    }
}

impl Neg for Resource {
    type Output = Resource;

    fn neg(self) -> Resource {
        Resource(-self.0)
    }
}

impl Sum for Resource {
    fn sum<I: Iterator<Item = Resource>>(iter: I) -> Resource {
        iter.fold(Resource::ZERO, |acc, r| acc + r)
    }
}

impl<'a> Sum<&'a Resource> for Resource {
    fn sum<I: Iterator<Item = &'a Resource>>(iter: I) -> Resource {
        iter.fold(Resource::ZERO, |acc, r| acc + *r)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let scale = RESOURCE_SCALE as u64;
        write!(f, "{}{}.{:02}", sign, abs / scale, abs % scale)
    }
}

// ============================================================================
// RATIO
// ============================================================================

/// A rate or factor in basis points (10 000 = 1.0).
///
/// Policy parameters are always within [0, 1]; engine factors such as the
/// investment volatility multiplier may leave that range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ratio(i64);

impl Ratio {
    /// 0.0
    pub const ZERO: Ratio = Ratio(0);

    /// 1.0
    pub const ONE: Ratio = Ratio(RATIO_SCALE);

    /// Creates a ratio from basis points.
    pub const fn from_bp(bp: i64) -> Self {
        Self(bp)
    }

    /// Converts from a float, rounding half to even at the fourth decimal.
    pub fn from_f64(value: f64) -> Self {
        Self(round_f64_scaled(value, RATIO_SCALE))
    }

    /// Returns the value in basis points.
    pub const fn bp(self) -> i64 {
        self.0
    }

    /// Returns the ratio as a float.
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / RATIO_SCALE as f64
    }

    /// True for exactly zero.
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// True when the ratio lies in [0, 1].
    pub fn is_unit_interval(self) -> bool {
        (0..=RATIO_SCALE).contains(&self.0)
    }

    /// `1 - self`.
    pub fn complement(self) -> Ratio {
        Ratio(RATIO_SCALE - self.0)
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.to_f64())
    }
}
