//! Change detection.
//!
//! Pure predicates deciding whether a freshly computed value differs
//! enough from the last stored one to be worth persisting.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Reference tolerance for exchange rates.
pub const DEFAULT_TOLERANCE: Decimal = dec!(0.01);

/// `true` iff `|new - previous| > tolerance`.
pub fn has_changed(new: Decimal, previous: Decimal, tolerance: Decimal) -> bool {
    (new - previous).abs() > tolerance
}

/// Exact comparison for enumerated values (tolerance zero).
pub fn status_changed<T: PartialEq>(derived: &T, current: &T) -> bool {
    derived != current
}

/// Absolute-difference detector with a fixed tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeDetector {
    tolerance: Decimal,
}

impl ChangeDetector {
    /// Negative tolerances are treated as zero.
    pub fn new(tolerance: Decimal) -> Self {
        Self {
            tolerance: tolerance.max(Decimal::ZERO),
        }
    }

    pub fn tolerance(&self) -> Decimal {
        self.tolerance
    }

    /// With no previous observation everything counts as a change.
    pub fn check(&self, new: Decimal, previous: Option<Decimal>) -> bool {
        match previous {
            Some(prev) => has_changed(new, prev, self.tolerance),
            None => true,
        }
    }
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE)
    }
}
