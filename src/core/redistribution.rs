//! Redistribution accumulator.
//!
//! Liquidated debt and collateral the stability pool cannot absorb is
//! spread over all active positions in proportion to their stake. Rather
//! than touching every position, two running sums (`L_collateral`,
//! `L_debt`, per unit of stake) grow on each redistribution; a position's
//! share is `stake * (L - L_snapshot)` and is applied lazily the next time
//! the position is touched.
//!
//! Division remainders are carried forward in error terms so repeated
//! redistributions lose no value. Until applied, redistributed amounts sit
//! in the default pool totals tracked here.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::math::{div_with_carry, mul_div, FixedPoint};

/// Accumulator values recorded on a position at its last touch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RewardSnapshot {
    /// `L_collateral` at snapshot time
    pub collateral: FixedPoint,
    /// `L_debt` at snapshot time
    pub debt: FixedPoint,
}

/// Rewards owed to a position but not yet applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PendingReward {
    /// Collateral owed
    pub collateral: FixedPoint,
    /// Debt owed
    pub debt: FixedPoint,
}

impl PendingReward {
    /// True if nothing is owed
    pub fn is_zero(&self) -> bool {
        self.collateral.is_zero() && self.debt.is_zero()
    }
}

/// Global per-stake reward totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedistributionAccumulator {
    /// Collateral per unit stake
    l_collateral: FixedPoint,
    /// Debt per unit stake
    l_debt: FixedPoint,
    /// Carried remainder of the collateral division (numerator units)
    collateral_error: u128,
    /// Carried remainder of the debt division (numerator units)
    debt_error: u128,
    /// Redistributed collateral not yet applied to positions
    default_collateral: FixedPoint,
    /// Redistributed debt not yet applied to positions
    default_debt: FixedPoint,
    /// Number of redistribution events
    redistributions: u64,
}

impl RedistributionAccumulator {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Current accumulator values
    pub fn snapshot(&self) -> RewardSnapshot {
        RewardSnapshot {
            collateral: self.l_collateral,
            debt: self.l_debt,
        }
    }

    /// Collateral sitting in the default pool
    pub fn default_collateral(&self) -> FixedPoint {
        self.default_collateral
    }

    /// Debt sitting in the default pool
    pub fn default_debt(&self) -> FixedPoint {
        self.default_debt
    }

    /// Number of redistribution events so far
    pub fn redistributions(&self) -> u64 {
        self.redistributions
    }

    /// Spread `collateral` and `debt` over `total_stakes`
    ///
    /// `total_stakes` must exclude the position being liquidated.
    pub fn redistribute(
        &mut self,
        collateral: FixedPoint,
        debt: FixedPoint,
        total_stakes: FixedPoint,
    ) -> Result<()> {
        if debt.is_zero() && collateral.is_zero() {
            return Ok(());
        }
        if total_stakes.is_zero() {
            return Err(Error::NoRemainingStake);
        }

        let stakes = total_stakes.raw();
        let (coll_per_stake, coll_error) =
            div_with_carry(collateral.raw(), self.collateral_error, stakes)?;
        let (debt_per_stake, debt_error) =
            div_with_carry(debt.raw(), self.debt_error, stakes)?;

        let l_collateral = self.l_collateral.checked_add(FixedPoint::from_raw(coll_per_stake))?;
        let l_debt = self.l_debt.checked_add(FixedPoint::from_raw(debt_per_stake))?;
        let default_collateral = self.default_collateral.checked_add(collateral)?;
        let default_debt = self.default_debt.checked_add(debt)?;

        self.l_collateral = l_collateral;
        self.l_debt = l_debt;
        self.collateral_error = coll_error;
        self.debt_error = debt_error;
        self.default_collateral = default_collateral;
        self.default_debt = default_debt;
        self.redistributions += 1;

        tracing::debug!(
            %collateral, %debt, %total_stakes,
            l_collateral = %self.l_collateral,
            l_debt = %self.l_debt,
            "redistributed"
        );
        Ok(())
    }

    /// Rewards owed to `stake` since `snapshot`, rounded down
    pub fn pending_reward(&self, stake: FixedPoint, snapshot: &RewardSnapshot) -> Result<PendingReward> {
        let coll_delta = self.l_collateral.checked_sub(snapshot.collateral)?;
        let debt_delta = self.l_debt.checked_sub(snapshot.debt)?;
        Ok(PendingReward {
            collateral: FixedPoint::from_raw(mul_div(stake.raw(), coll_delta.raw(), FixedPoint::SCALE)?),
            debt: FixedPoint::from_raw(mul_div(stake.raw(), debt_delta.raw(), FixedPoint::SCALE)?),
        })
    }

    /// Move an applied reward out of the default pool
    ///
    /// Rounded-down shares can never exceed the pool, but a stake changed
    /// by correction can leave a few units of drift; the pool floors at zero.
    pub fn take_from_default_pool(&mut self, reward: &PendingReward) {
        if reward.collateral > self.default_collateral || reward.debt > self.default_debt {
            tracing::warn!(
                reward_collateral = %reward.collateral,
                reward_debt = %reward.debt,
                default_collateral = %self.default_collateral,
                default_debt = %self.default_debt,
                "reward exceeds default pool, clamping"
            );
        }
        self.default_collateral = self.default_collateral.saturating_sub(reward.collateral);
        self.default_debt = self.default_debt.saturating_sub(reward.debt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn units(n: u64) -> FixedPoint {
        FixedPoint::from_integer(n)
    }

    #[test]
    fn test_redistribute_and_pending() {
        let mut acc = RedistributionAccumulator::new();
        let start = acc.snapshot();

        acc.redistribute(units(2), units(300), units(10)).unwrap();
        assert_eq!(acc.default_collateral(), units(2));
        assert_eq!(acc.default_debt(), units(300));

        let reward = acc.pending_reward(units(4), &start).unwrap();
        assert_eq!(reward.collateral, FixedPoint::from_raw(800_000_000_000_000_000));
        assert_eq!(reward.debt, units(120));

        acc.take_from_default_pool(&reward);
        assert_eq!(acc.default_debt(), units(180));
    }

    #[test]
    fn test_requires_remaining_stake() {
        let mut acc = RedistributionAccumulator::new();
        assert_eq!(
            acc.redistribute(units(1), units(1), FixedPoint::ZERO),
            Err(Error::NoRemainingStake)
        );
        assert!(acc.redistribute(FixedPoint::ZERO, FixedPoint::ZERO, FixedPoint::ZERO).is_ok());
    }

    #[test]
    fn test_error_feedback_conserves_value() {
        // 1 unit of debt over 3 stakes, three times: truncation losses are
        // carried so the third round catches up.
        let mut acc = RedistributionAccumulator::new();
        let start = acc.snapshot();
        for _ in 0..3 {
            acc.redistribute(FixedPoint::ZERO, units(1), units(3)).unwrap();
        }
        let reward = acc.pending_reward(units(3), &start).unwrap();
        assert!(reward.debt <= units(3));
        assert!(units(3).checked_sub(reward.debt).unwrap().raw() <= 3);
    }

    #[test]
    fn test_snapshot_excludes_past_rewards() {
        let mut acc = RedistributionAccumulator::new();
        acc.redistribute(units(1), units(100), units(10)).unwrap();
        let late = acc.snapshot();
        acc.redistribute(units(1), units(100), units(10)).unwrap();

        let reward = acc.pending_reward(units(10), &late).unwrap();
        assert_eq!(reward.debt, units(100));
        assert_eq!(acc.redistributions(), 2);
    }
}
