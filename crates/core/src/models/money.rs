//! Fixed-point money amounts.
//!
//! All ledger arithmetic is done in integer cents. Dollar floats only exist at
//! the HTTP boundary and are converted once, with rounding, on the way in.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

/// Basis points in 100%.
pub const BPS_SCALE: i64 = 10_000;

/// Amount of money in integer cents (USD).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    /// Zero cents.
    pub const ZERO: Money = Money(0);

    /// Build from a cent count.
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Build from whole dollars.
    pub const fn from_dollars_whole(dollars: i64) -> Self {
        Self(dollars * 100)
    }

    /// Convert a dollar amount (as sent by clients) to cents, rounding half away
    /// from zero. Returns `None` for NaN, infinities and out-of-range values.
    pub fn from_dollars(dollars: f64) -> Option<Self> {
        if !dollars.is_finite() {
            return None;
        }
        let cents = (dollars * 100.0).round();
        if cents.abs() > i64::MAX as f64 / 2.0 {
            return None;
        }
        Some(Self(cents as i64))
    }

    /// Cent count.
    pub const fn cents(self) -> i64 {
        self.0
    }

    /// Dollar value for JSON responses.
    pub fn as_dollars(self) -> f64 {
        self.0 as f64 / 100.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }

    /// Proportion of this amount in basis points, rounded half-up to the cent.
    ///
    /// `Money::from_cents(500).percent_bps(290)` is 14.5 cents, rounded to 15.
    pub fn percent_bps(self, bps: u32) -> Money {
        let raw = self.0 as i128 * bps as i128;
        let scale = BPS_SCALE as i128;
        let rounded = if raw >= 0 {
            (raw + scale / 2) / scale
        } else {
            (raw - scale / 2) / scale
        };
        Money(rounded as i64)
    }

    /// Split into `parts` equal shares.
    ///
    /// Returns `(share, remainder)` where `share * parts + remainder == self`.
    /// `None` when `parts` is zero or the amount is negative.
    pub fn split_even(self, parts: u32) -> Option<(Money, Money)> {
        if parts == 0 || self.0 < 0 {
            return None;
        }
        let parts = parts as i64;
        Some((Money(self.0 / parts), Money(self.0 % parts)))
    }

    /// Multiply by a count.
    pub fn times(self, count: u32) -> Option<Money> {
        self.0.checked_mul(count as i64).map(Money)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}${}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}
