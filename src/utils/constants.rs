//! Protocol constants and magic numbers.
//!
//! All protocol-wide constants are defined here for easy auditing and modification.

// ═══════════════════════════════════════════════════════════════════════════════
// FIXED-POINT CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Decimal precision of every amount, ratio and accumulator (10^18)
pub const DECIMAL_PRECISION: u128 = 1_000_000_000_000_000_000;

/// Stability pool factor rescaling constant (10^9)
///
/// When the running product would drop below this raw value, the pool
/// moves to the next scale and multiplies the product by this constant.
pub const SCALE_FACTOR: u128 = 1_000_000_000;

// ═══════════════════════════════════════════════════════════════════════════════
// COLLATERALIZATION CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Minimum Collateralization Ratio (MCR) - 110%
/// Below this ratio, a position can be liquidated
pub const MIN_COLLATERAL_RATIO_PCT: u64 = 110;

/// Critical Collateralization Ratio (CCR) for Recovery Mode - 150%
/// When system TCR falls below this, Recovery Mode activates
pub const CRITICAL_COLLATERAL_RATIO_PCT: u64 = 150;

/// Face-value ratio - 100%
/// Below this, the pool is skipped and everything is redistributed
pub const FACE_VALUE_RATIO_PCT: u64 = 100;

// ═══════════════════════════════════════════════════════════════════════════════
// STABILITY POOL CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Compounded deposits below this raw value are zeroed on withdrawal (1e-9)
pub const DEPOSIT_DUST_RAW: u128 = 1_000_000_000;

// ═══════════════════════════════════════════════════════════════════════════════
// OPERATIONAL LIMITS
// ═══════════════════════════════════════════════════════════════════════════════

/// Default maximum number of positions processed by one batch liquidation
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Default number of events retained by bounded histories
pub const DEFAULT_MAX_EVENTS: usize = 1000;

/// Length of a hash in bytes (SHA256)
pub const HASH_LENGTH: usize = 32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratio_constants() {
        assert!(FACE_VALUE_RATIO_PCT < MIN_COLLATERAL_RATIO_PCT);
        assert!(MIN_COLLATERAL_RATIO_PCT < CRITICAL_COLLATERAL_RATIO_PCT);
    }

    #[test]
    fn test_scale_factor_divides_precision() {
        assert_eq!(DECIMAL_PRECISION % SCALE_FACTOR, 0);
        assert!(DEPOSIT_DUST_RAW < DECIMAL_PRECISION);
    }
}
