//! Input validation utilities.
//!
//! This module provides validation functions to ensure inputs meet
//! protocol requirements before any state is touched.

use crate::error::{Error, Result};
use crate::utils::math::FixedPoint;

// ═══════════════════════════════════════════════════════════════════════════════
// AMOUNT VALIDATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Validate that an amount is non-zero
pub fn validate_non_zero(amount: FixedPoint) -> Result<()> {
    if amount.is_zero() {
        return Err(Error::ZeroAmount);
    }
    Ok(())
}

/// Validate debt amount meets the configured floor
///
/// Zero debt is always allowed (a pending or closed position); a zero
/// floor disables the check.
pub fn validate_debt_amount(debt: FixedPoint, min_debt: FixedPoint) -> Result<()> {
    if !debt.is_zero() && debt < min_debt {
        return Err(Error::DebtBelowMinimum {
            amount: debt,
            minimum: min_debt,
        });
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// RATIO VALIDATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Validate collateralization ratio
pub fn validate_collateral_ratio(ratio: FixedPoint, minimum: FixedPoint) -> Result<()> {
    if ratio < minimum {
        return Err(Error::CollateralRatioTooLow {
            current: ratio,
            minimum,
        });
    }
    Ok(())
}

/// Validate a configured ratio threshold is strictly above 100%
pub fn validate_ratio_param(ratio: FixedPoint, name: &str) -> Result<()> {
    if ratio <= FixedPoint::ONE {
        return Err(Error::InvalidParameter {
            name: name.into(),
            reason: format!("{} must be above 1.0", ratio),
        });
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// PRICE VALIDATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Validate an oracle price is usable
pub fn validate_price(price: FixedPoint) -> Result<()> {
    if price.is_zero() || price.is_infinite() {
        return Err(Error::Oracle(format!("unusable price {}", price)));
    }
    Ok(())
}
