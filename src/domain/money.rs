use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

pub const PIASTERS_PER_POUND: i64 = 100;
pub const DEFAULT_ROUNDING_STEP: Piasters = Piasters(500);
/// Upper bound for any single rate, charge, cost limit or custom closing amount.
pub const MAX_AMOUNT: Piasters = Piasters(100_000_000_000);

/// Integer minor currency units.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Piasters(pub i64);

impl Piasters {
    pub const ZERO: Piasters = Piasters(0);

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn exceeds_limit(self) -> bool {
        self.0 > MAX_AMOUNT.0
    }
}

impl Add for Piasters {
    type Output = Piasters;

    fn add(self, rhs: Self) -> Self::Output {
        Piasters(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Piasters {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Piasters {
    type Output = Piasters;

    fn sub(self, rhs: Self) -> Self::Output {
        Piasters(self.0.saturating_sub(rhs.0))
    }
}

impl Sum for Piasters {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Piasters::ZERO, Add::add)
    }
}

impl fmt::Display for Piasters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let per = PIASTERS_PER_POUND.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / per, abs % per)
    }
}

/// `numerator / denominator` rounded half away from zero. `denominator` must be positive.
fn div_round_wide(numerator: i128, denominator: i128) -> i128 {
    debug_assert!(denominator > 0);
    let half = denominator / 2;
    if numerator >= 0 {
        (numerator + half) / denominator
    } else {
        -((-numerator + half) / denominator)
    }
}

fn saturate(value: i128) -> i64 {
    i64::try_from(value).unwrap_or(if value < 0 { i64::MIN } else { i64::MAX })
}

/// Rounds to the nearest multiple of `step`, ties away from zero.
/// A non-positive step leaves the amount untouched.
pub fn round_to_nearest(amount: Piasters, step: Piasters) -> Piasters {
    if step.0 <= 0 {
        return amount;
    }
    let step = i128::from(step.0);
    Piasters(saturate(div_round_wide(i128::from(amount.0), step) * step))
}

/// Cost of `minutes` whole minutes at an hourly rate.
pub fn cost_for_minutes(minutes: i64, rate_per_hour: Piasters) -> Piasters {
    let wide = i128::from(minutes) * i128::from(rate_per_hour.0);
    Piasters(saturate(div_round_wide(wide, 60)))
}

#[cfg(test)]
mod tests {
    use super::{
        DEFAULT_ROUNDING_STEP, MAX_AMOUNT, Piasters, cost_for_minutes, round_to_nearest,
    };

    #[test]
    fn rounds_to_nearest_step_with_ties_away_from_zero() {
        let step = DEFAULT_ROUNDING_STEP;
        assert_eq!(round_to_nearest(Piasters(3250), step), Piasters(3500));
        assert_eq!(round_to_nearest(Piasters(3249), step), Piasters(3000));
        assert_eq!(round_to_nearest(Piasters(3000), step), Piasters(3000));
        assert_eq!(round_to_nearest(Piasters(-250), step), Piasters(-500));
        assert_eq!(round_to_nearest(Piasters(0), step), Piasters(0));
    }

    #[test]
    fn rounding_is_idempotent() {
        for raw in [-1_249, -3, 0, 1, 249, 250, 251, 3_250, 9_999, 123_456] {
            let once = round_to_nearest(Piasters(raw), DEFAULT_ROUNDING_STEP);
            assert_eq!(round_to_nearest(once, DEFAULT_ROUNDING_STEP), once);
        }
    }

    #[test]
    fn non_positive_step_is_identity() {
        assert_eq!(round_to_nearest(Piasters(1234), Piasters(0)), Piasters(1234));
    }

    #[test]
    fn minute_cost_rounds_fractional_piasters() {
        assert_eq!(cost_for_minutes(65, Piasters(3000)), Piasters(3250));
        assert_eq!(cost_for_minutes(1, Piasters(2500)), Piasters(42));
        assert_eq!(cost_for_minutes(0, Piasters(2500)), Piasters(0));
    }

    #[test]
    fn arithmetic_saturates_instead_of_overflowing() {
        let huge = Piasters(i64::MAX / 2 + 1);
        assert_eq!(huge + huge, Piasters(i64::MAX));
        assert_eq!(Piasters(i64::MIN) - Piasters(1), Piasters(i64::MIN));
        assert_eq!(
            [huge, huge, Piasters(7)].into_iter().sum::<Piasters>(),
            Piasters(i64::MAX)
        );
        assert_eq!(cost_for_minutes(i64::MAX, Piasters(6000)), Piasters(i64::MAX));
        assert_eq!(
            round_to_nearest(Piasters(i64::MAX), DEFAULT_ROUNDING_STEP),
            Piasters(i64::MAX)
        );
    }

    #[test]
    fn flags_amounts_above_the_limit() {
        assert!(!MAX_AMOUNT.exceeds_limit());
        assert!(Piasters(MAX_AMOUNT.0 + 1).exceeds_limit());
    }

    #[test]
    fn displays_major_and_minor_units() {
        assert_eq!(Piasters(3250).to_string(), "32.50");
        assert_eq!(Piasters(5).to_string(), "0.05");
        assert_eq!(Piasters(-120).to_string(), "-1.20");
    }
}
