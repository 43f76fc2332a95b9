//! Fixed-point arithmetic and wide intermediate mul/div.
//!
//! Every ledger amount, ratio and accumulator is an 18-decimal fixed-point
//! number backed by `u128`. Products of two such numbers do not fit in 128
//! bits, so all multiplications go through a 256-bit intermediate
//! ([`mul_div`], [`mul_div_rem`]) built on `primitive_types::U256`.
//! Accumulators that outgrow 128 bits stay in `U256` and use
//! [`mul_div_wide`]. All divisions truncate toward zero.

use crate::error::{Error, Result};
use crate::utils::constants::DECIMAL_PRECISION;
use num_traits::{CheckedAdd, Zero};
use primitive_types::{U256, U512};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Div, Mul, Sub};

// ═══════════════════════════════════════════════════════════════════════════════
// FIXED POINT TYPE
// ═══════════════════════════════════════════════════════════════════════════════

/// Fixed-point number with 18 decimal places precision
///
/// `FixedPoint::MAX` doubles as "+infinity" for collateral ratios of
/// positions without debt.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct FixedPoint(u128);

impl FixedPoint {
    /// Scale factor: 10^18
    pub const SCALE: u128 = DECIMAL_PRECISION;

    /// Zero value
    pub const ZERO: Self = Self(0);

    /// One (1.0)
    pub const ONE: Self = Self(Self::SCALE);

    /// Largest representable value, used as +infinity for ratios
    pub const MAX: Self = Self(u128::MAX);

    /// Create a new FixedPoint from raw value
    pub const fn from_raw(raw: u128) -> Self {
        Self(raw)
    }

    /// Create from an integer (scales up)
    pub const fn from_integer(value: u64) -> Self {
        Self((value as u128) * Self::SCALE)
    }

    /// Create from percentage (100 = 100%)
    pub const fn from_percentage(pct: u64) -> Self {
        Self((pct as u128) * Self::SCALE / 100)
    }

    /// Get the raw underlying value
    pub const fn raw(&self) -> u128 {
        self.0
    }

    /// Check if value is zero
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// True for the +infinity sentinel
    pub const fn is_infinite(&self) -> bool {
        self.0 == u128::MAX
    }

    /// Integer part, truncated
    pub const fn trunc(&self) -> u128 {
        self.0 / Self::SCALE
    }

    /// Checked addition
    pub fn checked_add(self, rhs: Self) -> Result<Self> {
        self.0.checked_add(rhs.0).map(Self).ok_or_else(|| Error::Overflow {
            operation: format!("{} + {}", self, rhs),
        })
    }

    /// Checked subtraction
    pub fn checked_sub(self, rhs: Self) -> Result<Self> {
        self.0.checked_sub(rhs.0).map(Self).ok_or_else(|| Error::Underflow {
            operation: format!("{} - {}", self, rhs),
        })
    }

    /// Checked fixed-point multiplication, truncating
    pub fn checked_mul(self, rhs: Self) -> Result<Self> {
        mul_div(self.0, rhs.0, Self::SCALE).map(Self)
    }

    /// Checked fixed-point division, truncating
    pub fn checked_div(self, rhs: Self) -> Result<Self> {
        mul_div(self.0, Self::SCALE, rhs.0).map(Self)
    }

    /// `self * num / den` with a 256-bit intermediate, truncating
    pub fn mul_div(self, num: Self, den: Self) -> Result<Self> {
        mul_div(self.0, num.0, den.0).map(Self)
    }

    /// `self * num / den` rounded up
    pub fn mul_div_up(self, num: Self, den: Self) -> Result<Self> {
        mul_div_up(self.0, num.0, den.0).map(Self)
    }

    /// Saturating addition
    pub fn saturating_add(&self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    /// Saturating subtraction
    pub fn saturating_sub(&self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Absolute difference
    pub fn abs_diff(&self, other: Self) -> Self {
        Self(self.0.abs_diff(other.0))
    }

    /// Minimum of two values
    pub fn min(self, other: Self) -> Self {
        Self(self.0.min(other.0))
    }

    /// Maximum of two values
    pub fn max(self, other: Self) -> Self {
        Self(self.0.max(other.0))
    }

    /// Parse from a non-negative decimal, truncating digits past the 18th
    pub fn from_decimal(value: Decimal) -> Result<Self> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(Error::InvalidParameter {
                name: "decimal".into(),
                reason: format!("{} is negative", value),
            });
        }
        let mantissa = value.mantissa().unsigned_abs();
        let scale = value.scale();
        let raw = if scale <= 18 {
            10u128
                .checked_pow(18 - scale)
                .and_then(|factor| mantissa.checked_mul(factor))
                .ok_or_else(|| Error::Overflow {
                    operation: format!("from_decimal({})", value),
                })?
        } else {
            mantissa / 10u128.pow(scale - 18)
        };
        Ok(Self(raw))
    }

    /// Convert to a normalized decimal
    pub fn to_decimal(&self) -> Result<Decimal> {
        let signed = i128::try_from(self.0).map_err(|_| Error::Overflow {
            operation: "to_decimal".into(),
        })?;
        Decimal::try_from_i128_with_scale(signed, 18)
            .map(|d| d.normalize())
            .map_err(|e| Error::Overflow {
                operation: format!("to_decimal: {}", e),
            })
    }
}

impl fmt::Display for FixedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            return write!(f, "inf");
        }
        let int = self.0 / Self::SCALE;
        let frac = self.0 % Self::SCALE;
        if frac == 0 {
            return write!(f, "{}", int);
        }
        let digits = format!("{:018}", frac);
        write!(f, "{}.{}", int, digits.trim_end_matches('0'))
    }
}

impl Add for FixedPoint {
    type Output = Self;

    /// Saturates at `FixedPoint::MAX`; use `checked_add` in ledger code.
    fn add(self, rhs: Self) -> Self::Output {
        self.saturating_add(rhs)
    }
}

impl Sub for FixedPoint {
    type Output = Self;

    /// Floors at zero; use `checked_sub` in ledger code.
    fn sub(self, rhs: Self) -> Self::Output {
        self.saturating_sub(rhs)
    }
}

impl Mul for FixedPoint {
    type Output = Self;

    /// Saturates at `FixedPoint::MAX`; use `checked_mul` in ledger code.
    fn mul(self, rhs: Self) -> Self::Output {
        Self(mul_div(self.0, rhs.0, Self::SCALE).unwrap_or(u128::MAX))
    }
}

impl Div for FixedPoint {
    type Output = Self;

    /// Division by zero yields `FixedPoint::MAX`.
    fn div(self, rhs: Self) -> Self::Output {
        Self(mul_div(self.0, Self::SCALE, rhs.0).unwrap_or(u128::MAX))
    }
}

impl Zero for FixedPoint {
    fn zero() -> Self {
        Self::ZERO
    }

    fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl CheckedAdd for FixedPoint {
    fn checked_add(&self, v: &Self) -> Option<Self> {
        self.0.checked_add(v.0).map(Self)
    }
}

/// Sum any sequence of checked-addable values, failing on overflow
pub fn checked_sum<T, I>(values: I) -> Result<T>
where
    T: Zero + CheckedAdd,
    I: IntoIterator<Item = T>,
{
    values.into_iter().try_fold(T::zero(), |acc, v| {
        acc.checked_add(&v).ok_or_else(|| Error::Overflow {
            operation: "checked_sum".into(),
        })
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// WIDE MULTIPLICATION / DIVISION
// ═══════════════════════════════════════════════════════════════════════════════

/// `(a * b) / c` and `(a * b) % c` with a 256-bit intermediate.
///
/// Returns `None` when `c == 0` or the quotient does not fit in 128 bits.
pub fn mul_div_rem(a: u128, b: u128, c: u128) -> Option<(u128, u128)> {
    if c == 0 {
        return None;
    }
    let (quotient, remainder) = (U256::from(a) * U256::from(b)).div_mod(U256::from(c));
    Some((narrow(quotient)?, remainder.low_u128()))
}

/// `(a * b) / c` over 256-bit operands with a 512-bit intermediate, truncating
pub fn mul_div_wide(a: U256, b: U256, c: U256) -> Result<U256> {
    if c.is_zero() {
        return Err(Error::DivisionByZero {
            operation: format!("({} * {}) / 0", a, b),
        });
    }
    let quotient = a.full_mul(b) / U512::from(c);
    if quotient.bits() > 256 {
        return Err(Error::Overflow {
            operation: format!("({} * {}) / {}", a, b, c),
        });
    }
    let words = quotient.0;
    Ok(U256([words[0], words[1], words[2], words[3]]))
}

/// Narrow a 256-bit value to `u128`, `None` if it does not fit
pub fn narrow(value: U256) -> Option<u128> {
    (value.bits() <= 128).then(|| value.low_u128())
}

/// `(a * b) / c`, truncating
pub fn mul_div(a: u128, b: u128, c: u128) -> Result<u128> {
    if c == 0 {
        return Err(Error::DivisionByZero {
            operation: format!("({} * {}) / 0", a, b),
        });
    }
    mul_div_rem(a, b, c)
        .map(|(q, _)| q)
        .ok_or_else(|| Error::Overflow {
            operation: format!("({} * {}) / {}", a, b, c),
        })
}

/// `(a * b) / c`, rounding up
pub fn mul_div_up(a: u128, b: u128, c: u128) -> Result<u128> {
    if c == 0 {
        return Err(Error::DivisionByZero {
            operation: format!("ceil(({} * {}) / 0)", a, b),
        });
    }
    let (q, r) = mul_div_rem(a, b, c).ok_or_else(|| Error::Overflow {
        operation: format!("ceil(({} * {}) / {})", a, b, c),
    })?;
    if r == 0 {
        Ok(q)
    } else {
        q.checked_add(1).ok_or_else(|| Error::Overflow {
            operation: format!("ceil(({} * {}) / {})", a, b, c),
        })
    }
}

/// `(amount * SCALE + carried) / total` with the new carried remainder.
///
/// Used for per-unit rewards: truncating, with the remainder fed into the
/// next call so repeated divisions lose nothing over time.
pub fn div_with_carry(amount: u128, carried: u128, total: u128) -> Result<(u128, u128)> {
    let (quotient, remainder) =
        mul_div_rem(amount, FixedPoint::SCALE, total).ok_or_else(|| Error::Overflow {
            operation: format!("div_with_carry({}, {})", amount, total),
        })?;
    let sum = safe_add(remainder, carried)?;
    Ok((safe_add(quotient, sum / total)?, sum % total))
}

/// `(amount * SCALE - carried) / total + 1` with the new carried excess.
///
/// Used for per-unit losses: always rounded up, so claimants absorb at
/// least their exact share. The excess over the exact value is fed back
/// into the next call.
pub fn div_up_with_carry(amount: u128, carried: u128, total: u128) -> Result<(u128, u128)> {
    let (quotient, remainder) =
        mul_div_rem(amount, FixedPoint::SCALE, total).ok_or_else(|| Error::Overflow {
            operation: format!("div_up_with_carry({}, {})", amount, total),
        })?;
    let (floor, rem) = if remainder >= carried {
        (quotient, safe_sub(remainder, carried)?)
    } else if quotient == 0 {
        (0, 0)
    } else {
        // Borrow whole multiples of `total` from the quotient.
        let deficit = safe_sub(carried, remainder)?;
        let borrow = deficit / total + u128::from(deficit % total != 0);
        let floor = quotient.saturating_sub(borrow);
        let rem = if floor == 0 && borrow > quotient {
            0
        } else {
            safe_sub(borrow.saturating_mul(total), deficit)?
        };
        (floor, rem)
    };
    Ok((safe_add(floor, 1)?, safe_sub(total, rem)?))
}

/// Safe u128 addition
pub fn safe_add(a: u128, b: u128) -> Result<u128> {
    a.checked_add(b).ok_or_else(|| Error::Overflow {
        operation: format!("{} + {}", a, b),
    })
}

/// Safe u128 subtraction
pub fn safe_sub(a: u128, b: u128) -> Result<u128> {
    a.checked_sub(b).ok_or_else(|| Error::Underflow {
        operation: format!("{} - {}", a, b),
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// COLLATERALIZATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Collateral ratio `collateral * price / debt`; +infinity without debt
pub fn collateral_ratio(
    collateral: FixedPoint,
    debt: FixedPoint,
    price: FixedPoint,
) -> Result<FixedPoint> {
    if debt.is_zero() {
        return Ok(FixedPoint::MAX);
    }
    // Ratios too large to represent are as good as infinite.
    match collateral.mul_div(price, debt) {
        Ok(ratio) => Ok(ratio),
        Err(Error::Overflow { .. }) => Ok(FixedPoint::MAX),
        Err(e) => Err(e),
    }
}

/// Price-independent ratio `collateral / debt` used to order positions
pub fn nominal_ratio(collateral: FixedPoint, debt: FixedPoint) -> FixedPoint {
    if debt.is_zero() {
        return FixedPoint::MAX;
    }
    collateral.checked_div(debt).unwrap_or(FixedPoint::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn fp(s: &str) -> FixedPoint {
        FixedPoint::from_decimal(Decimal::from_str(s).unwrap()).unwrap()
    }

    #[test]
    fn test_fixed_point_basic() {
        let one = FixedPoint::ONE;
        let two = FixedPoint::from_integer(2);

        assert_eq!(one + one, two);
        assert_eq!(two - one, one);
        assert_eq!(one * two, two);
        assert_eq!(two / one, two);
        assert_eq!(FixedPoint::from_percentage(150), fp("1.5"));
    }

    #[test]
    fn test_checked_ops() {
        assert!(FixedPoint::MAX.checked_add(FixedPoint::ONE).is_err());
        assert!(FixedPoint::ZERO.checked_sub(FixedPoint::ONE).is_err());
        assert!(FixedPoint::ONE.checked_div(FixedPoint::ZERO).is_err());
        assert_eq!(
            fp("2.5").checked_mul(fp("4")).unwrap(),
            FixedPoint::from_integer(10)
        );
    }

    #[test]
    fn test_operators_saturate() {
        assert_eq!(FixedPoint::MAX + FixedPoint::ONE, FixedPoint::MAX);
        assert_eq!(FixedPoint::ZERO - FixedPoint::ONE, FixedPoint::ZERO);
        assert_eq!(FixedPoint::MAX * FixedPoint::from_integer(2), FixedPoint::MAX);
        assert_eq!(FixedPoint::ONE / FixedPoint::ZERO, FixedPoint::MAX);
    }

    #[test]
    fn test_mul_div_wide_beyond_u128() {
        // 2000e18 gain per unit times a 1e18 factor is past u128::MAX
        let e18 = U256::from(FixedPoint::SCALE);
        let sum = U256::from(2000u64) * e18 * e18;
        assert!(narrow(sum).is_none());
        let gain = mul_div_wide(U256::from(3u64) * e18, sum, e18 * e18).unwrap();
        assert_eq!(narrow(gain), Some(6000 * FixedPoint::SCALE));
        assert!(mul_div_wide(U256::MAX, U256::MAX, U256::one()).is_err());
        assert!(matches!(
            mul_div_wide(U256::one(), U256::one(), U256::zero()),
            Err(Error::DivisionByZero { .. })
        ));
    }

    #[test]
    fn test_mul_div_wide() {
        // (1e30 * 1e30) / 1e24 = 1e36 needs more than 128 bits in between.
        let e30 = 10u128.pow(30);
        assert_eq!(mul_div(e30, e30, 10u128.pow(24)).unwrap(), 10u128.pow(36));
        assert_eq!(mul_div_rem(u128::MAX, 3, 4), Some((u128::MAX / 4 * 3 + 2, 1)));
        assert!(mul_div(u128::MAX, 2, 1).is_err());
        assert!(matches!(mul_div(1, 1, 0), Err(Error::DivisionByZero { .. })));
    }

    #[test]
    fn test_mul_div_up() {
        assert_eq!(mul_div_up(10, 1, 3).unwrap(), 4);
        assert_eq!(mul_div_up(9, 1, 3).unwrap(), 3);
    }

    #[test]
    fn test_decimal_conversions() {
        let value = fp("1234.5678");
        assert_eq!(value.to_decimal().unwrap(), Decimal::from_str("1234.5678").unwrap());
        assert_eq!(value.to_string(), "1234.5678");
        assert!(FixedPoint::from_decimal(Decimal::from_str("-1").unwrap()).is_err());
        assert_eq!(FixedPoint::MAX.to_string(), "inf");
    }

    #[test]
    fn test_collateral_ratio() {
        // 1 unit at 200 against 100 debt = 200%
        let ratio = collateral_ratio(
            FixedPoint::ONE,
            FixedPoint::from_integer(100),
            FixedPoint::from_integer(200),
        )
        .unwrap();
        assert_eq!(ratio, FixedPoint::from_integer(2));

        let ratio = collateral_ratio(FixedPoint::ONE, FixedPoint::ZERO, FixedPoint::ONE).unwrap();
        assert!(ratio.is_infinite());
    }

    #[test]
    fn test_div_with_carry() {
        let one = FixedPoint::SCALE;
        // 1/3 per unit, remainder carried
        let (q, err) = div_with_carry(one, 0, 3 * one).unwrap();
        assert_eq!(q, 333_333_333_333_333_333);
        assert_eq!(err, one);
        let (q, err) = div_with_carry(one, 2 * one, 3 * one).unwrap();
        assert_eq!(q, 333_333_333_333_333_334);
        assert_eq!(err, 0);
    }

    #[test]
    fn test_div_up_with_carry() {
        let one = FixedPoint::SCALE;
        // Exact division still rounds up by one and carries the excess
        let (q, err) = div_up_with_carry(one, 0, 10 * one).unwrap();
        assert_eq!(q, one / 10 + 1);
        assert_eq!(err, 10 * one);

        // The carried excess is subtracted from the next numerator
        let (q, err) = div_up_with_carry(one, 10 * one, 10 * one).unwrap();
        assert_eq!(q, one / 10);
        assert_eq!(err, 10 * one);

        let (q, err) = div_up_with_carry(one, 0, 3 * one).unwrap();
        assert_eq!(q, 333_333_333_333_333_334);
        assert_eq!(err, 2 * one);
    }

    #[test]
    fn test_checked_sum() {
        let total: FixedPoint = checked_sum(vec![fp("1.5"), fp("2.5")]).unwrap();
        assert_eq!(total, FixedPoint::from_integer(4));
        assert!(checked_sum(vec![FixedPoint::MAX, FixedPoint::ONE]).is_err());
    }
}
