//! Fixed-point money with two decimal digits.

use serde::{Deserialize, Serialize};

/// Money amount represented in cents to avoid floating point issues.
///
/// Serialized as a bare integer count of cents. Arithmetic is only offered
/// in checked form: balances must never wrap.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money {
    /// Amount in cents (e.g., 2599 = $25.99)
    cents: i64,
}

impl Money {
    /// Zero money.
    pub const ZERO: Money = Money { cents: 0 };

    /// Creates a new Money amount from cents.
    pub const fn from_cents(cents: i64) -> Self {
        Self { cents }
    }

    /// Returns the amount in cents.
    pub fn cents(&self) -> i64 {
        self.cents
    }

    /// Returns the dollar portion (whole number).
    pub fn dollars(&self) -> i64 {
        self.cents / 100
    }

    /// Returns the cents portion (remainder after dollars).
    pub fn cents_part(&self) -> i64 {
        (self.cents % 100).abs()
    }

    pub fn is_positive(&self) -> bool {
        self.cents > 0
    }

    pub fn is_negative(&self) -> bool {
        self.cents < 0
    }

    /// Adds two amounts, returning `None` on overflow.
    pub fn checked_add(&self, other: Money) -> Option<Money> {
        self.cents.checked_add(other.cents).map(Money::from_cents)
    }

    /// Subtracts `other`, returning `None` on overflow.
    pub fn checked_sub(&self, other: Money) -> Option<Money> {
        self.cents.checked_sub(other.cents).map(Money::from_cents)
    }

    /// Sums amounts, returning `None` if any partial sum overflows.
    pub fn checked_sum(amounts: impl IntoIterator<Item = Money>) -> Option<Money> {
        amounts
            .into_iter()
            .try_fold(Money::ZERO, |acc, m| acc.checked_add(m))
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.cents < 0 {
            write!(f, "-${}.{:02}", self.dollars().unsigned_abs(), self.cents_part())
        } else {
            write!(f, "${}.{:02}", self.dollars(), self.cents_part())
        }
    }
}

impl std::ops::Neg for Money {
    type Output = Money;

    /// Saturates at `i64::MAX` for `i64::MIN`.
    fn neg(self) -> Self::Output {
        Money {
            cents: self.cents.saturating_neg(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formats_two_digits() {
        assert_eq!(Money::from_cents(2599).to_string(), "$25.99");
        assert_eq!(Money::from_cents(7401).to_string(), "$74.01");
        assert_eq!(Money::from_cents(5).to_string(), "$0.05");
        assert_eq!(Money::from_cents(-2599).to_string(), "-$25.99");
        assert_eq!(Money::from_cents(i64::MIN).to_string(), "-$92233720368547758.08");
    }

    #[test]
    fn test_reservation_arithmetic_is_exact() {
        let balance = Money::from_cents(10000);
        let price = Money::from_cents(2599);
        let after = balance.checked_sub(price).unwrap();
        assert_eq!(after, Money::from_cents(7401));
        assert_eq!(after.checked_add(price), Some(balance));
        assert_eq!(-price, Money::from_cents(-2599));
    }

    #[test]
    fn test_checked_ops_detect_overflow() {
        assert!(Money::from_cents(i64::MAX).checked_add(Money::from_cents(1)).is_none());
        assert!(Money::from_cents(i64::MIN).checked_sub(Money::from_cents(1)).is_none());
        assert_eq!(-Money::from_cents(i64::MIN), Money::from_cents(i64::MAX));
    }

    #[test]
    fn test_checked_sum() {
        let total = Money::checked_sum([1000, -2599, 2599].into_iter().map(Money::from_cents));
        assert_eq!(total, Some(Money::from_cents(1000)));

        let overflow =
            Money::checked_sum([i64::MAX, 1].into_iter().map(Money::from_cents));
        assert!(overflow.is_none());
    }

    #[test]
    fn test_serializes_as_cents() {
        let json = serde_json::to_string(&Money::from_cents(2599)).unwrap();
        assert_eq!(json, "2599");
        let back: Money = serde_json::from_str("2599").unwrap();
        assert_eq!(back, Money::from_cents(2599));
    }
}
