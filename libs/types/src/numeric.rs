//! Fixed-point money arithmetic
//!
//! Amounts travel as `f64` (that is how the host hands them over), but every
//! arithmetic step is done on values rescaled to an integral number of
//! 1/10_000 units and then scaled back, so `0.1 + 0.2 == 0.3` holds.
//!
//! Contract:
//! - 4 decimal places. Anything finer than 0.0001 is rounded away.
//! - Rounding is half away from zero (`f64::round`) at every rescale.
//! - NaN and ±Infinity are not trapped; they propagate like plain floats.
//! - Magnitudes up to the hundreds of billions stay exact: 1e11 * 1e4 is
//!   still far below 2^53.
//!
//! Four decimals rather than eight: at 1e8 the scaled value of large
//! balances in low-denomination currencies leaves the exact-integer range.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

/// Number of decimal places kept.
pub const DECIMAL_PLACES: u32 = 4;

/// Scale factor between a value and its integral representation.
pub const PRECISION_FACTOR: f64 = 10_000.0;

/// Rescale `amount` to integral 1/10_000 units.
///
/// The result is an integer-valued `f64` so NaN/Infinity keep propagating.
pub fn to_integer(amount: f64) -> f64 {
    (amount * PRECISION_FACTOR).round()
}

/// Inverse of [`to_integer`].
pub fn from_integer(units: f64) -> f64 {
    units / PRECISION_FACTOR
}

pub fn add(a: f64, b: f64) -> f64 {
    from_integer(to_integer(a) + to_integer(b))
}

pub fn subtract(a: f64, b: f64) -> f64 {
    from_integer(to_integer(a) - to_integer(b))
}

/// Multiply two amounts.
///
/// Both scaled operands carry the factor, so the product is divided by the
/// squared factor once to land back on the value scale.
pub fn multiply(a: f64, b: f64) -> f64 {
    (to_integer(a) * to_integer(b)) / (PRECISION_FACTOR * PRECISION_FACTOR)
}

/// Sum a sequence, accumulating in the integral domain.
pub fn sum<I>(values: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    let total = values.into_iter().fold(0.0, |acc, v| acc + to_integer(v));
    from_integer(total)
}

/// Exact decimal view of an amount, rounded to 4 places.
///
/// Returns `None` for NaN and infinities, which have no decimal form.
pub fn to_decimal(amount: f64) -> Option<Decimal> {
    Decimal::from_f64(amount)
        .map(|d| d.round_dp_with_strategy(DECIMAL_PLACES, RoundingStrategy::MidpointAwayFromZero))
}

/// Convert a decimal back to the float wire representation.
pub fn from_decimal(value: Decimal) -> f64 {
    value
        .round_dp_with_strategy(DECIMAL_PLACES, RoundingStrategy::MidpointAwayFromZero)
        .to_f64()
        .unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_add_avoids_binary_float_error() {
        assert_eq!(add(0.1, 0.2), 0.3);
        assert_ne!(0.1 + 0.2, 0.3);
    }

    #[test]
    fn test_subtract() {
        assert_eq!(subtract(1000.0, 400.0), 600.0);
        assert_eq!(subtract(0.3, 0.1), 0.2);
    }

    #[test]
    fn test_multiply_corrects_double_scale() {
        assert_eq!(multiply(2.5, 4.0), 10.0);
        assert_eq!(multiply(1.1, 1.1), 1.21);
        assert_eq!(multiply(-3.0, 0.5), -1.5);
    }

    #[test]
    fn test_multiply_keeps_product_scale() {
        assert_eq!(multiply(0.0001, 0.0001), 1e-8);
        assert_eq!(multiply(0.0005, 0.5), 0.00025);
    }

    #[test]
    fn test_sum() {
        assert_eq!(sum(vec![0.1; 10]), 1.0);
        assert_eq!(sum(Vec::<f64>::new()), 0.0);
    }

    #[test]
    fn test_sub_precision_values_round() {
        assert_eq!(add(0.00004, 0.0), 0.0);
        assert_eq!(add(0.00006, 0.0), 0.0001);
        assert_eq!(add(-0.00006, 0.0), -0.0001);
    }

    #[test]
    fn test_non_finite_values_propagate() {
        assert!(add(f64::NAN, 1.0).is_nan());
        assert_eq!(add(f64::INFINITY, 1.0), f64::INFINITY);
        assert!(multiply(f64::NAN, 2.0).is_nan());
        assert!(to_decimal(f64::NAN).is_none());
    }

    #[test]
    fn test_large_magnitudes_stay_exact() {
        let big = 450_000_000_000.0;
        assert_eq!(add(big, 0.0001), 450_000_000_000.0001);
        assert_eq!(subtract(big, big), 0.0);
    }

    #[test]
    fn test_decimal_bridge() {
        let d = to_decimal(1234.56789).unwrap();
        assert_eq!(d.to_string(), "1234.5679");
        assert_eq!(from_decimal(d), 1234.5679);
    }

    proptest! {
        #[test]
        fn prop_integer_round_trip(v in -1.0e11f64..1.0e11f64) {
            let units = to_integer(v);
            prop_assert_eq!(to_integer(from_integer(units)), units);
        }

        #[test]
        fn prop_add_then_subtract_restores(a in -1.0e9f64..1.0e9f64, b in -1.0e9f64..1.0e9f64) {
            let a4 = from_integer(to_integer(a));
            prop_assert_eq!(subtract(add(a4, b), b), a4);
        }
    }
}
