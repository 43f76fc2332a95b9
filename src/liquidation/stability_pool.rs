//! Stability Pool
//!
//! Depositors lock debt tokens here to absorb liquidated debt. In exchange
//! they receive the liquidated collateral, pro rata to their compounded
//! deposit. Deposits are never touched individually during an offset;
//! two global accumulators carry everything:
//!
//! - `P`: running product of `(1 - loss_per_unit)` factors. A deposit's
//!   compounded value is `initial * P / P_snapshot`.
//! - `S[epoch][scale]`: running sum of `gain_per_unit * P`. A deposit's
//!   collateral gain is `initial * (S - S_snapshot) / P_snapshot`.
//!
//! When `P` would drop below `SCALE_FACTOR` it is multiplied by
//! `SCALE_FACTOR` and the scale advances. When an offset empties the pool,
//! the epoch advances and `P` resets to one; every earlier deposit is then
//! worth zero.
//!
//! Losses are rounded up and gains rounded down, with the rounding error
//! fed into the next offset, so depositors never receive more than the
//! pool holds.

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::config::ProtocolParams;
use crate::core::position::AccountId;
use crate::error::{Error, Result};
use crate::liquidation::cohort::{ClearedCohort, OverstayCohortTracker};
use crate::utils::constants::SCALE_FACTOR;
use crate::utils::math::{
    div_up_with_carry, div_with_carry, mul_div, mul_div_wide, narrow, FixedPoint,
};
use crate::utils::validation::validate_non_zero;

// ═══════════════════════════════════════════════════════════════════════════════
// DEPOSIT TYPES
// ═══════════════════════════════════════════════════════════════════════════════

/// Pool accumulators recorded on a deposit at its last touch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositorSnapshot {
    /// Product factor `P` at snapshot time
    pub p: u128,
    /// Sum `S[epoch][scale]` at snapshot time (36 decimals)
    pub s: U256,
    /// Epoch at snapshot time
    pub epoch: u64,
    /// Scale at snapshot time
    pub scale: u64,
}

/// A depositor's stake in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    /// Depositor
    pub owner: AccountId,
    /// Deposit value at the last touch
    pub initial_value: FixedPoint,
    /// Accumulators at the last touch
    pub snapshot: DepositorSnapshot,
    /// Epoch of the latest provide
    pub cohort: u64,
}

/// Outcome of a provide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolDeposit {
    /// Collateral gain paid out on the way in
    pub collateral_gain: FixedPoint,
    /// Compounded deposit before the provide
    pub compounded_before: FixedPoint,
    /// New deposit value
    pub deposit: FixedPoint,
}

/// Outcome of a withdrawal or gain claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolWithdrawal {
    /// Debt tokens returned to the depositor
    pub amount: FixedPoint,
    /// Collateral gain paid out
    pub collateral_gain: FixedPoint,
    /// Dust forfeited to the pool
    pub forfeited: FixedPoint,
    /// Deposit left after the withdrawal
    pub remaining: FixedPoint,
    /// True if an overstay blocked the payout
    pub frozen: bool,
}

/// Outcome of an offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetOutcome {
    /// Debt cancelled
    pub debt: FixedPoint,
    /// Collateral received
    pub collateral: FixedPoint,
    /// Epoch before the offset
    pub epoch_before: u64,
    /// True if the offset emptied the pool
    pub epoch_advanced: bool,
    /// True if `P` was rescaled
    pub scale_advanced: bool,
}

/// Outcome of clearing a stale cohort
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CohortClearance {
    /// Cohort id
    pub cohort: u64,
    /// Gains paid to each former member
    pub payouts: Vec<(AccountId, FixedPoint)>,
    /// Shortfall drained
    pub shortfall: FixedPoint,
}

// ═══════════════════════════════════════════════════════════════════════════════
// STABILITY POOL
// ═══════════════════════════════════════════════════════════════════════════════

/// Compounding deposit pool with overstay protection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StabilityPool {
    /// Deposits indexed by owner
    deposits: BTreeMap<AccountId, Deposit>,
    /// Sum of all compounded deposits
    total_deposits: FixedPoint,
    /// Collateral held for depositors
    collateral: FixedPoint,
    /// Product factor, 18 decimals
    p: u128,
    /// Current epoch
    epoch: u64,
    /// Current scale within the epoch
    scale: u64,
    /// `S` per epoch and scale, 36 decimals. Low prices push it past
    /// 128 bits.
    epoch_to_scale_to_sum: BTreeMap<u64, BTreeMap<u64, U256>>,
    /// Carried remainder of the gain division
    last_gain_error: u128,
    /// Carried excess of the rounded-up loss division
    last_loss_error: u128,
    /// Depositor cohorts
    cohorts: OverstayCohortTracker,
    /// Total debt absorbed
    total_debt_absorbed: FixedPoint,
    /// Total collateral received
    total_collateral_gained: FixedPoint,
    /// Number of offsets
    offset_count: u64,
    /// Remaining deposits below this are forfeited
    dust: FixedPoint,
}

impl Default for StabilityPool {
    fn default() -> Self {
        Self::new(&ProtocolParams::default())
    }
}

impl StabilityPool {
    /// Create an empty pool
    pub fn new(params: &ProtocolParams) -> Self {
        Self {
            deposits: BTreeMap::new(),
            total_deposits: FixedPoint::ZERO,
            collateral: FixedPoint::ZERO,
            p: FixedPoint::SCALE,
            epoch: 0,
            scale: 0,
            epoch_to_scale_to_sum: BTreeMap::new(),
            last_gain_error: 0,
            last_loss_error: 0,
            cohorts: OverstayCohortTracker::new(),
            total_debt_absorbed: FixedPoint::ZERO,
            total_collateral_gained: FixedPoint::ZERO,
            offset_count: 0,
            dust: params.deposit_dust,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // DEPOSITS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Add `amount` to the caller's deposit
    ///
    /// Pending collateral gains are paid out and the deposit is restarted
    /// at `compounded + amount` in the current cohort.
    pub fn provide(&mut self, owner: AccountId, amount: FixedPoint) -> Result<PoolDeposit> {
        validate_non_zero(amount)?;

        let (gain, compounded, old) = match self.deposits.get(&owner) {
            Some(deposit) => (
                self.gain_of(deposit)?,
                self.compounded_of(deposit)?,
                Some((deposit.cohort, deposit.initial_value)),
            ),
            None => (FixedPoint::ZERO, FixedPoint::ZERO, None),
        };
        let new_value = compounded.checked_add(amount)?;
        let total = self.total_deposits.checked_add(amount)?;

        if let Some((cohort, initial)) = old {
            self.cohorts.leave(cohort, owner, initial);
        }
        self.cohorts.join(self.epoch, owner, new_value)?;
        let deposit = Deposit {
            owner,
            initial_value: new_value,
            snapshot: self.current_snapshot(),
            cohort: self.epoch,
        };
        self.deposits.insert(owner, deposit);
        self.total_deposits = total;
        let gain = self.pay_gain(gain);

        tracing::debug!(%owner, %amount, %gain, deposit = %new_value, "stability deposit");
        Ok(PoolDeposit {
            collateral_gain: gain,
            compounded_before: compounded,
            deposit: new_value,
        })
    }

    /// Withdraw up to `amount` of the caller's compounded deposit
    ///
    /// While a stale cohort is overstaying, only its members may withdraw
    /// (receiving their gains and nothing else). Everyone else gets an
    /// empty, frozen result and nothing changes. A deposit that has
    /// compounded to zero exits with its gains.
    pub fn withdraw(&mut self, owner: AccountId, amount: FixedPoint) -> Result<PoolWithdrawal> {
        validate_non_zero(amount)?;
        let deposit = *self
            .deposits
            .get(&owner)
            .ok_or_else(|| Error::DepositNotFound(owner.to_string()))?;

        if self.cohorts.has_overstay() {
            if self.cohorts.is_overstaying(deposit.cohort) {
                return self.exit_drained(&deposit);
            }
            tracing::warn!(%owner, %amount, "withdrawal frozen while a stale cohort overstays");
            return Ok(PoolWithdrawal {
                frozen: true,
                ..PoolWithdrawal::default()
            });
        }

        let compounded = self.compounded_of(&deposit)?;
        if compounded.is_zero() {
            return self.exit_drained(&deposit);
        }
        let gain = self.gain_of(&deposit)?;
        let paid = amount.min(compounded);
        let mut remaining = compounded.checked_sub(paid)?;
        let mut forfeited = FixedPoint::ZERO;
        if !remaining.is_zero() && remaining < self.dust {
            forfeited = remaining;
            remaining = FixedPoint::ZERO;
        }
        let total = self
            .total_deposits
            .saturating_sub(paid.checked_add(forfeited)?);

        self.cohorts.leave(deposit.cohort, owner, deposit.initial_value);
        if remaining.is_zero() {
            self.deposits.remove(&owner);
        } else {
            self.cohorts.join(deposit.cohort, owner, remaining)?;
            self.deposits.insert(
                owner,
                Deposit {
                    initial_value: remaining,
                    snapshot: self.current_snapshot(),
                    ..deposit
                },
            );
        }
        self.total_deposits = total;
        let gain = self.pay_gain(gain);

        tracing::debug!(%owner, amount = %paid, %gain, %remaining, "stability withdrawal");
        Ok(PoolWithdrawal {
            amount: paid,
            collateral_gain: gain,
            forfeited,
            remaining,
            frozen: false,
        })
    }

    /// Pay out pending collateral gains, leaving the deposit in place
    ///
    /// A deposit that has compounded to zero is removed.
    pub fn claim_gain(&mut self, owner: AccountId) -> Result<PoolWithdrawal> {
        let deposit = *self
            .deposits
            .get(&owner)
            .ok_or_else(|| Error::DepositNotFound(owner.to_string()))?;
        let compounded = self.compounded_of(&deposit)?;
        if compounded.is_zero() {
            return self.exit_drained(&deposit);
        }
        let gain = self.gain_of(&deposit)?;

        self.cohorts.leave(deposit.cohort, owner, deposit.initial_value);
        self.cohorts.join(deposit.cohort, owner, compounded)?;
        self.deposits.insert(
            owner,
            Deposit {
                initial_value: compounded,
                snapshot: self.current_snapshot(),
                ..deposit
            },
        );
        let gain = self.pay_gain(gain);

        Ok(PoolWithdrawal {
            collateral_gain: gain,
            remaining: compounded,
            ..PoolWithdrawal::default()
        })
    }

    /// Remove a deposit that is worth nothing, paying its gains
    fn exit_drained(&mut self, deposit: &Deposit) -> Result<PoolWithdrawal> {
        let gain = self.gain_of(deposit)?;
        self.cohorts.leave(deposit.cohort, deposit.owner, deposit.initial_value);
        self.deposits.remove(&deposit.owner);
        let gain = self.pay_gain(gain);
        tracing::debug!(owner = %deposit.owner, %gain, "drained deposit exited");
        Ok(PoolWithdrawal {
            collateral_gain: gain,
            ..PoolWithdrawal::default()
        })
    }

    /// Release `gain` from pool collateral, returning the amount actually paid
    fn pay_gain(&mut self, gain: FixedPoint) -> FixedPoint {
        if gain > self.collateral {
            tracing::warn!(%gain, held = %self.collateral, "gain exceeds pool collateral, clamping");
        }
        let paid = gain.min(self.collateral);
        self.collateral = self.collateral.saturating_sub(paid);
        paid
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // OFFSET
    // ═══════════════════════════════════════════════════════════════════════════

    /// Cancel `debt` against the pool and distribute `collateral` to depositors
    pub fn offset(&mut self, debt: FixedPoint, collateral: FixedPoint) -> Result<OffsetOutcome> {
        let epoch_before = self.epoch;
        if debt.is_zero() && collateral.is_zero() {
            return Ok(OffsetOutcome {
                debt,
                collateral,
                epoch_before,
                epoch_advanced: false,
                scale_advanced: false,
            });
        }
        if self.total_deposits.is_zero() {
            return Err(Error::EmptyStabilityPool);
        }
        if debt > self.total_deposits {
            return Err(Error::InvariantViolation(format!(
                "offset of {} exceeds pool deposits {}",
                debt, self.total_deposits
            )));
        }

        let total = self.total_deposits.raw();
        let (gain_per_unit, gain_error) =
            div_with_carry(collateral.raw(), self.last_gain_error, total)?;
        let (loss_per_unit, loss_error) = if debt == self.total_deposits {
            (FixedPoint::SCALE, 0)
        } else if debt.is_zero() {
            (0, self.last_loss_error)
        } else {
            div_up_with_carry(debt.raw(), self.last_loss_error, total)?
        };
        if loss_per_unit > FixedPoint::SCALE {
            return Err(Error::InvariantViolation(format!(
                "loss per unit {} exceeds one",
                loss_per_unit
            )));
        }

        let marginal_gain = U256::from(gain_per_unit) * U256::from(self.p);
        let new_sum = self
            .sum_at(self.epoch, self.scale)
            .checked_add(marginal_gain)
            .ok_or_else(|| Error::Overflow {
                operation: "stability pool gain sum".into(),
            })?;

        let factor = FixedPoint::SCALE - loss_per_unit;
        let (p, epoch, scale) = if factor == 0 {
            (FixedPoint::SCALE, self.epoch + 1, 0)
        } else {
            let scaled = mul_div(self.p, factor, FixedPoint::SCALE)?;
            if scaled < SCALE_FACTOR {
                (
                    mul_div(self.p, factor, FixedPoint::SCALE / SCALE_FACTOR)?,
                    self.epoch,
                    self.scale + 1,
                )
            } else {
                (scaled, self.epoch, self.scale)
            }
        };
        if p == 0 {
            return Err(Error::InvariantViolation("product factor reached zero".into()));
        }

        let total_after = self.total_deposits.checked_sub(debt)?;
        let held = self.collateral.checked_add(collateral)?;
        let absorbed = self.total_debt_absorbed.checked_add(debt)?;
        let gained = self.total_collateral_gained.checked_add(collateral)?;
        let total_before = self.total_deposits;

        self.cohorts.record_offset(epoch_before, total_before, debt)?;
        self.epoch_to_scale_to_sum
            .entry(self.epoch)
            .or_default()
            .insert(self.scale, new_sum);
        let outcome = OffsetOutcome {
            debt,
            collateral,
            epoch_before,
            epoch_advanced: epoch != self.epoch,
            scale_advanced: scale != self.scale && epoch == self.epoch,
        };
        self.p = p;
        self.epoch = epoch;
        self.scale = scale;
        self.last_gain_error = gain_error;
        self.last_loss_error = loss_error;
        self.total_deposits = total_after;
        self.collateral = held;
        self.total_debt_absorbed = absorbed;
        self.total_collateral_gained = gained;
        self.offset_count += 1;

        if outcome.epoch_advanced {
            tracing::info!(epoch = self.epoch, "stability pool emptied, new epoch");
        } else if outcome.scale_advanced {
            tracing::debug!(scale = self.scale, "product factor rescaled");
        }
        Ok(outcome)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // COHORT CLEARING
    // ═══════════════════════════════════════════════════════════════════════════

    /// Retire the oldest cohort that still has members
    ///
    /// The cohort must predate the current epoch. Members receive their
    /// pending gains; their (zero-valued) deposits are deleted.
    pub fn clear_oldest_active_cohort(&mut self) -> Result<CohortClearance> {
        let cohort = self.cohorts.oldest_active().ok_or(Error::NoActiveCohort)?;
        if cohort >= self.epoch {
            return Err(Error::CohortNotStale {
                cohort,
                epoch: self.epoch,
            });
        }

        let members = self
            .cohorts
            .get(cohort)
            .map(|c| c.members.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        let mut payouts: Vec<(AccountId, FixedPoint)> = Vec::with_capacity(members.len());
        for owner in &members {
            let gain = match self.deposits.get(owner) {
                Some(deposit) => self.gain_of(deposit)?,
                None => FixedPoint::ZERO,
            };
            payouts.push((*owner, gain));
        }

        let ClearedCohort { shortfall, .. } = self.cohorts.take(cohort);
        for (owner, gain) in payouts.iter_mut() {
            self.deposits.remove(owner);
            *gain = self.pay_gain(*gain);
        }

        tracing::info!(cohort, members = payouts.len(), %shortfall, "stale cohort cleared");
        Ok(CohortClearance {
            cohort,
            payouts,
            shortfall,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // QUERIES
    // ═══════════════════════════════════════════════════════════════════════════

    /// Compounded value of a deposit after all offsets since its snapshot
    pub fn compounded_value(&self, owner: AccountId) -> Result<FixedPoint> {
        match self.deposits.get(&owner) {
            Some(deposit) => self.compounded_of(deposit),
            None => Ok(FixedPoint::ZERO),
        }
    }

    /// Collateral gain accrued by a deposit since its snapshot
    pub fn pending_gain(&self, owner: AccountId) -> Result<FixedPoint> {
        match self.deposits.get(&owner) {
            Some(deposit) => self.gain_of(deposit),
            None => Ok(FixedPoint::ZERO),
        }
    }

    fn compounded_of(&self, deposit: &Deposit) -> Result<FixedPoint> {
        let snap = &deposit.snapshot;
        let initial = deposit.initial_value;
        if initial.is_zero() || snap.epoch < self.epoch {
            return Ok(FixedPoint::ZERO);
        }
        let compounded = match self.scale - snap.scale {
            0 => mul_div(initial.raw(), self.p, snap.p)?,
            1 => mul_div(initial.raw(), self.p, snap.p)? / SCALE_FACTOR,
            _ => 0,
        };
        // Below a billionth of the initial value the result is rounding noise
        if compounded < initial.raw() / SCALE_FACTOR {
            return Ok(FixedPoint::ZERO);
        }
        Ok(FixedPoint::from_raw(compounded))
    }

    fn gain_of(&self, deposit: &Deposit) -> Result<FixedPoint> {
        let snap = &deposit.snapshot;
        if deposit.initial_value.is_zero() {
            return Ok(FixedPoint::ZERO);
        }
        let overflow = || Error::Overflow {
            operation: "stability pool gain".into(),
        };
        let first = self.sum_at(snap.epoch, snap.scale).saturating_sub(snap.s);
        let second = self.sum_at(snap.epoch, snap.scale + 1) / U256::from(SCALE_FACTOR);
        let numerator = first.checked_add(second).ok_or_else(overflow)?;
        let denominator = U256::from(snap.p) * U256::from(FixedPoint::SCALE);
        let gain = mul_div_wide(U256::from(deposit.initial_value.raw()), numerator, denominator)?;
        narrow(gain).map(FixedPoint::from_raw).ok_or_else(overflow)
    }

    fn sum_at(&self, epoch: u64, scale: u64) -> U256 {
        self.epoch_to_scale_to_sum
            .get(&epoch)
            .and_then(|scales| scales.get(&scale))
            .copied()
            .unwrap_or_default()
    }

    fn current_snapshot(&self) -> DepositorSnapshot {
        DepositorSnapshot {
            p: self.p,
            s: self.sum_at(self.epoch, self.scale),
            epoch: self.epoch,
            scale: self.scale,
        }
    }

    /// Get deposit for an account
    pub fn get_deposit(&self, owner: AccountId) -> Option<&Deposit> {
        self.deposits.get(&owner)
    }

    /// Sum of compounded deposits
    pub fn total_deposits(&self) -> FixedPoint {
        self.total_deposits
    }

    /// Collateral held for depositors
    pub fn collateral(&self) -> FixedPoint {
        self.collateral
    }

    /// Current product factor as a fixed-point number
    pub fn product_factor(&self) -> FixedPoint {
        FixedPoint::from_raw(self.p)
    }

    /// Gain sum for an epoch and scale, as an 18-decimal number
    ///
    /// Saturates at `FixedPoint::MAX`.
    pub fn gain_sum(&self, epoch: u64, scale: u64) -> FixedPoint {
        narrow(self.sum_at(epoch, scale) / U256::from(FixedPoint::SCALE))
            .map(FixedPoint::from_raw)
            .unwrap_or(FixedPoint::MAX)
    }

    /// Current epoch
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Current scale
    pub fn scale(&self) -> u64 {
        self.scale
    }

    /// Depositor cohorts
    pub fn cohorts(&self) -> &OverstayCohortTracker {
        &self.cohorts
    }

    /// True if withdrawals are frozen by an overstaying cohort
    pub fn is_frozen(&self) -> bool {
        self.cohorts.has_overstay()
    }

    /// Check whether the pool can absorb `debt` in full
    pub fn can_absorb(&self, debt: FixedPoint) -> bool {
        self.total_deposits >= debt
    }

    /// Number of deposits
    pub fn depositor_count(&self) -> usize {
        self.deposits.len()
    }

    /// Get pool statistics
    pub fn statistics(&self) -> Result<StabilityPoolStats> {
        Ok(StabilityPoolStats {
            total_deposits: self.total_deposits,
            collateral: self.collateral,
            depositor_count: self.deposits.len(),
            product_factor: self.product_factor(),
            epoch: self.epoch,
            scale: self.scale,
            offset_count: self.offset_count,
            total_debt_absorbed: self.total_debt_absorbed,
            total_collateral_gained: self.total_collateral_gained,
            overstay_shortfall: self.cohorts.outstanding_shortfall()?,
            cohorts_cleared: self.cohorts.cleared_count(),
            frozen: self.is_frozen(),
        })
    }
}

/// Stability pool statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StabilityPoolStats {
    /// Sum of compounded deposits
    pub total_deposits: FixedPoint,
    /// Collateral held for depositors
    pub collateral: FixedPoint,
    /// Number of depositors
    pub depositor_count: usize,
    /// Current product factor
    pub product_factor: FixedPoint,
    /// Current epoch
    pub epoch: u64,
    /// Current scale
    pub scale: u64,
    /// Number of offsets
    pub offset_count: u64,
    /// Total debt absorbed
    pub total_debt_absorbed: FixedPoint,
    /// Total collateral received
    pub total_collateral_gained: FixedPoint,
    /// Outstanding overstay shortfall
    pub overstay_shortfall: FixedPoint,
    /// Stale cohorts cleared so far
    pub cohorts_cleared: u64,
    /// Withdrawals frozen
    pub frozen: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn units(n: u64) -> FixedPoint {
        FixedPoint::from_integer(n)
    }

    fn pool() -> StabilityPool {
        StabilityPool::new(&ProtocolParams::default())
    }

    fn assert_close(actual: FixedPoint, expected: FixedPoint, tolerance_raw: u128) {
        assert!(
            actual.abs_diff(expected).raw() <= tolerance_raw,
            "{} not within {} of {}",
            actual,
            tolerance_raw,
            expected
        );
    }

    #[test]
    fn test_provide() {
        let mut pool = pool();
        let alice = AccountId(1);

        let result = pool.provide(alice, units(1000)).unwrap();
        assert_eq!(result.deposit, units(1000));
        assert_eq!(pool.total_deposits(), units(1000));
        assert_eq!(pool.compounded_value(alice).unwrap(), units(1000));
        assert_eq!(pool.depositor_count(), 1);
        assert!(pool.provide(alice, FixedPoint::ZERO).is_err());
    }

    #[test]
    fn test_withdraw() {
        let mut pool = pool();
        let alice = AccountId(1);
        pool.provide(alice, units(1000)).unwrap();

        let result = pool.withdraw(alice, units(400)).unwrap();
        assert_eq!(result.amount, units(400));
        assert_eq!(result.remaining, units(600));
        assert_eq!(pool.total_deposits(), units(600));

        // Capped at the compounded value
        let result = pool.withdraw(alice, units(5000)).unwrap();
        assert_eq!(result.amount, units(600));
        assert!(pool.get_deposit(alice).is_none());
        assert_eq!(
            pool.withdraw(alice, units(1)),
            Err(Error::DepositNotFound(alice.to_string()))
        );
    }

    #[test]
    fn test_offset_worked_scenario() {
        let mut pool = pool();
        let alice = AccountId(1);
        pool.provide(alice, units(2000)).unwrap();

        pool.offset(units(180), units(1)).unwrap();
        pool.offset(units(180), units(1)).unwrap();

        assert_close(pool.gain_sum(0, 0), FixedPoint::from_raw(1_000_000_000_000_000), 10);
        assert_close(pool.product_factor(), FixedPoint::from_percentage(82), 10);
        assert_eq!(pool.total_deposits(), units(1640));
        assert_close(pool.compounded_value(alice).unwrap(), units(1640), 10_000);
        assert_close(pool.pending_gain(alice).unwrap(), units(2), 10_000);
        assert!(pool.pending_gain(alice).unwrap() <= pool.collateral());
    }

    #[test]
    fn test_multiple_depositors() {
        let mut pool = pool();
        let (alice, bob) = (AccountId(1), AccountId(2));
        pool.provide(alice, units(1000)).unwrap();
        pool.provide(bob, units(3000)).unwrap();

        pool.offset(units(400), units(4)).unwrap();

        assert_close(pool.compounded_value(alice).unwrap(), units(900), 10_000);
        assert_close(pool.compounded_value(bob).unwrap(), units(2700), 10_000);
        assert_close(pool.pending_gain(alice).unwrap(), units(1), 10_000);
        assert_close(pool.pending_gain(bob).unwrap(), units(3), 10_000);

        let sum = pool.compounded_value(alice).unwrap() + pool.compounded_value(bob).unwrap();
        assert!(sum <= pool.total_deposits());
    }

    #[test]
    fn test_claim_gain() {
        let mut pool = pool();
        let alice = AccountId(1);
        pool.provide(alice, units(1000)).unwrap();
        pool.offset(units(100), units(1)).unwrap();

        let claim = pool.claim_gain(alice).unwrap();
        assert_close(claim.collateral_gain, units(1), 10_000);
        assert_eq!(pool.pending_gain(alice).unwrap(), FixedPoint::ZERO);
        assert_close(pool.compounded_value(alice).unwrap(), units(900), 10_000);
    }

    #[test]
    fn test_late_depositor_gets_no_past_gains() {
        let mut pool = pool();
        let (alice, bob) = (AccountId(1), AccountId(2));
        pool.provide(alice, units(1000)).unwrap();
        pool.offset(units(100), units(1)).unwrap();
        pool.provide(bob, units(900)).unwrap();

        assert_eq!(pool.pending_gain(bob).unwrap(), FixedPoint::ZERO);
        assert_eq!(pool.compounded_value(bob).unwrap(), units(900));
    }

    #[test]
    fn test_offset_empties_pool_and_advances_epoch() {
        let mut pool = pool();
        let alice = AccountId(1);
        pool.provide(alice, units(100)).unwrap();

        let outcome = pool.offset(units(100), units(1)).unwrap();
        assert!(outcome.epoch_advanced);
        assert_eq!(pool.epoch(), 1);
        assert_eq!(pool.product_factor(), FixedPoint::ONE);
        assert_eq!(pool.total_deposits(), FixedPoint::ZERO);
        assert_eq!(pool.compounded_value(alice).unwrap(), FixedPoint::ZERO);
        assert_close(pool.pending_gain(alice).unwrap(), units(1), 10_000);

        // A fresh deposit starts at full value in the new epoch
        let bob = AccountId(2);
        pool.provide(bob, units(50)).unwrap();
        assert_eq!(pool.compounded_value(bob).unwrap(), units(50));
    }

    #[test]
    fn test_offset_rescales_product() {
        let mut pool = pool();
        let (alice, bob) = (AccountId(1), AccountId(2));
        pool.provide(alice, units(1_000_000_000)).unwrap();

        // Leave 100 units: P drops to about 1e-7 but stays above the scale factor
        let outcome = pool.offset(units(999_999_900), units(1)).unwrap();
        assert!(!outcome.scale_advanced);
        assert_eq!(pool.scale(), 0);

        pool.provide(bob, units(100)).unwrap();
        let outcome = pool.offset(units(199), units(1)).unwrap();
        assert!(outcome.scale_advanced);
        assert_eq!(pool.scale(), 1);
        assert!(pool.product_factor().raw() >= SCALE_FACTOR);

        // Bob lost 99.5% of his deposit
        assert_close(
            pool.compounded_value(bob).unwrap(),
            FixedPoint::from_percentage(50),
            10_000_000_000,
        );
        assert!(pool.pending_gain(bob).unwrap() > FixedPoint::ZERO);
    }

    #[test]
    fn test_gain_straddles_scale_change() {
        let mut pool = pool();
        let (alice, bob) = (AccountId(1), AccountId(2));
        pool.provide(alice, units(10_000_000_000)).unwrap();

        // One unit survives: the loss rounds up past the scale threshold
        let outcome = pool.offset(units(9_999_999_999), units(1)).unwrap();
        assert!(outcome.scale_advanced);
        assert_eq!(pool.product_factor(), FixedPoint::from_raw(99_999_999_000_000_000));
        assert_eq!(pool.total_deposits(), units(1));

        pool.provide(bob, units(1)).unwrap();
        pool.offset(units(1), units(2)).unwrap();
        assert_eq!(pool.scale(), 1);

        // Alice: all of the first offset plus her share at the new scale
        assert_eq!(
            pool.pending_gain(alice).unwrap(),
            FixedPoint::from_raw(1_999_999_990_000_000_000)
        );
        assert_eq!(pool.pending_gain(bob).unwrap(), units(1));
        assert_eq!(pool.compounded_value(alice).unwrap(), FixedPoint::ZERO);
        assert_eq!(
            pool.compounded_value(bob).unwrap(),
            FixedPoint::from_raw(500_000_004_999_999_989)
        );
    }

    #[test]
    fn test_deposit_spanning_two_scales_is_zero() {
        let mut pool = pool();
        let (alice, bob) = (AccountId(1), AccountId(2));
        pool.provide(alice, units(10_000_000_000)).unwrap();
        pool.offset(units(9_999_999_900), units(1)).unwrap();
        assert_eq!(pool.scale(), 0);
        assert_eq!(pool.product_factor(), FixedPoint::from_raw(9_999_999_999));

        pool.provide(bob, units(100)).unwrap();
        let outcome = pool.offset(units(190), units(1)).unwrap();
        assert!(outcome.scale_advanced);
        assert_eq!(
            pool.compounded_value(bob).unwrap(),
            FixedPoint::from_raw(5_000_000_004_999_999_890)
        );
        assert_eq!(
            pool.pending_gain(bob).unwrap(),
            FixedPoint::from_raw(500_000_000_000_000_000)
        );

        let dust = FixedPoint::from_raw(10_000_000_000);
        let outcome = pool.offset(units(10).checked_sub(dust).unwrap(), units(1)).unwrap();
        assert!(outcome.scale_advanced);
        assert_eq!(pool.scale(), 2);
        assert_eq!(pool.total_deposits(), dust);
        assert_eq!(pool.compounded_value(bob).unwrap(), FixedPoint::ZERO);
        assert_eq!(
            pool.pending_gain(bob).unwrap(),
            FixedPoint::from_raw(1_000_000_000_499_999_989)
        );

        // Withdrawing the drained deposit pays its gain and removes it
        let result = pool.withdraw(bob, units(1)).unwrap();
        assert_eq!(result.amount, FixedPoint::ZERO);
        assert_eq!(result.collateral_gain, FixedPoint::from_raw(1_000_000_000_499_999_989));
        assert!(pool.get_deposit(bob).is_none());
    }

    #[test]
    fn test_gain_sum_past_u128_at_low_price() {
        let mut pool = pool();
        let alice = AccountId(1);
        pool.provide(alice, units(2)).unwrap();

        // 2000 collateral for 1 debt: S grows by 1e39 in one offset
        pool.offset(units(1), units(2000)).unwrap();
        assert_eq!(pool.gain_sum(0, 0), units(1000));
        assert_eq!(pool.pending_gain(alice).unwrap(), units(2000));
        assert_eq!(
            pool.compounded_value(alice).unwrap(),
            FixedPoint::from_raw(999_999_999_999_999_998)
        );

        let bytes = bincode::serialize(&pool).unwrap();
        let restored: StabilityPool = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored, pool);

        let result = pool.withdraw(alice, units(1)).unwrap();
        assert_eq!(result.collateral_gain, units(2000));
        assert_eq!(pool.collateral(), FixedPoint::ZERO);
    }

    #[test]
    fn test_drained_deposit_withdraws_after_new_epoch() {
        let mut pool = pool();
        let (alice, bob, carol) = (AccountId(1), AccountId(2), AccountId(3));
        pool.provide(alice, units(100)).unwrap();
        pool.offset(units(100), units(1)).unwrap();
        pool.provide(bob, units(100)).unwrap();
        pool.provide(carol, units(100)).unwrap();

        // Alice's deposit is worth nothing but still registered
        assert!(!pool.is_frozen());
        let result = pool.withdraw(alice, units(100)).unwrap();
        assert!(!result.frozen);
        assert_eq!(result.amount, FixedPoint::ZERO);
        assert_close(result.collateral_gain, units(1), 10_000);
        assert!(pool.get_deposit(alice).is_none());
        assert_eq!(
            pool.withdraw(alice, units(1)),
            Err(Error::DepositNotFound(alice.to_string()))
        );

        // With the stale cohort gone a later offset freezes nothing
        pool.offset(units(100), units(2)).unwrap();
        assert!(!pool.is_frozen());
        for who in [bob, carol] {
            let result = pool.withdraw(who, units(50)).unwrap();
            assert_close(result.amount, units(50), 10_000);
            assert_close(result.collateral_gain, units(1), 10_000);
        }
        assert_close(pool.total_deposits(), FixedPoint::ZERO, 10_000);
    }

    #[test]
    fn test_offset_rejects_overdraw() {
        let mut pool = pool();
        assert_eq!(pool.offset(units(1), units(1)), Err(Error::EmptyStabilityPool));
        pool.provide(AccountId(1), units(10)).unwrap();
        assert!(pool.offset(units(11), units(1)).is_err());
        assert!(pool.offset(FixedPoint::ZERO, FixedPoint::ZERO).is_ok());
    }

    #[test]
    fn test_overstay_freezes_withdrawals() {
        let mut pool = pool();
        let alice = AccountId(1);
        pool.provide(alice, units(100)).unwrap();
        pool.offset(units(100), units(1)).unwrap();

        let others: Vec<AccountId> = (2..=6).map(AccountId).collect();
        for who in &others {
            pool.provide(*who, units(100)).unwrap();
        }
        pool.offset(units(100), units(1)).unwrap();
        assert!(pool.is_frozen());

        let before = pool.clone();
        let result = pool.withdraw(others[0], units(100)).unwrap();
        assert!(result.frozen);
        assert_eq!(result.amount, FixedPoint::ZERO);
        assert_eq!(pool, before);

        // The current cohort cannot be cleared, the stale one can
        let clearance = pool.clear_oldest_active_cohort().unwrap();
        assert_eq!(clearance.cohort, 0);
        assert_eq!(clearance.payouts.len(), 1);
        assert_close(clearance.payouts[0].1, units(1), 10_000);
        assert!(!pool.is_frozen());
        assert_eq!(pool.statistics().unwrap().cohorts_cleared, 1);

        for who in &others {
            let result = pool.withdraw(*who, units(100)).unwrap();
            assert_close(result.amount, units(80), 10_000);
        }
        assert_eq!(pool.clear_oldest_active_cohort(), Err(Error::NoActiveCohort));
    }

    #[test]
    fn test_overstayer_may_exit() {
        let mut pool = pool();
        let alice = AccountId(1);
        pool.provide(alice, units(100)).unwrap();
        pool.offset(units(100), units(1)).unwrap();
        pool.provide(AccountId(2), units(100)).unwrap();
        pool.offset(units(10), units(1)).unwrap();
        assert!(pool.is_frozen());

        let result = pool.withdraw(alice, units(100)).unwrap();
        assert!(!result.frozen);
        assert_eq!(result.amount, FixedPoint::ZERO);
        assert_close(result.collateral_gain, units(1), 10_000);
        assert!(!pool.is_frozen());
    }

    #[test]
    fn test_current_cohort_not_stale() {
        let mut pool = pool();
        pool.provide(AccountId(1), units(100)).unwrap();
        assert_eq!(
            pool.clear_oldest_active_cohort(),
            Err(Error::CohortNotStale { cohort: 0, epoch: 0 })
        );
    }

    #[test]
    fn test_dust_remainder_forfeited() {
        let mut pool = pool();
        let alice = AccountId(1);
        pool.provide(alice, units(100)).unwrap();

        let leave = FixedPoint::from_raw(1_000);
        let result = pool.withdraw(alice, units(100).checked_sub(leave).unwrap()).unwrap();
        assert_eq!(result.forfeited, leave);
        assert!(result.remaining.is_zero());
        assert!(pool.get_deposit(alice).is_none());
    }

    #[test]
    fn test_statistics() {
        let mut pool = pool();
        pool.provide(AccountId(1), units(500)).unwrap();
        pool.offset(units(50), units(1)).unwrap();

        let stats = pool.statistics().unwrap();
        assert_eq!(stats.total_deposits, units(450));
        assert_eq!(stats.offset_count, 1);
        assert_eq!(stats.total_debt_absorbed, units(50));
        assert_eq!(stats.collateral, units(1));
        assert!(!stats.frozen);
    }
}
