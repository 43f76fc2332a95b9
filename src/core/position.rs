//! Position ledger.
//!
//! One record per account holding collateral, debt and a redistribution
//! stake. Records live in an arena keyed by [`AccountId`]; active
//! positions are additionally kept in [`SortedPositions`] by nominal
//! ratio. The ledger owns the [`RedistributionAccumulator`] so pending
//! rewards can be applied before any mutation.
//!
//! Lifecycle:
//! - `NonExistent`/`Closed` → `Pending`: collateral deposited, no debt
//! - `NonExistent`/`Closed`/`Pending` → `Active`: debt drawn
//! - `Active`/`Pending` → `Closed`: debt repaid in full, collateral
//!   withdrawn in full, or liquidated
//!
//! Every operation validates against the figures including pending
//! rewards before mutating anything.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::core::config::ProtocolParams;
use crate::core::redistribution::{PendingReward, RedistributionAccumulator, RewardSnapshot};
use crate::core::sorted::{InsertHint, SortedPositions};
use crate::error::{Error, Result};
use crate::liquidation::recovery::{
    AdjustmentCheck, MarketContext, RecoveryModeGovernor, SystemTotals,
};
use crate::utils::math::{collateral_ratio, nominal_ratio, FixedPoint};
use crate::utils::validation::{validate_debt_amount, validate_non_zero};

// ═══════════════════════════════════════════════════════════════════════════════
// ACCOUNT ID
// ═══════════════════════════════════════════════════════════════════════════════

/// Stable integer identity of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(pub u64);

impl AccountId {
    /// Identity of the lending core itself, the only caller collaborators accept
    pub const CORE: Self = Self(u64::MAX);
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::CORE {
            write!(f, "core")
        } else {
            write!(f, "account#{}", self.0)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// POSITION
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle state of a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PositionStatus {
    /// Never opened
    #[default]
    NonExistent,
    /// Collateral deposited, no debt, not indexed
    Pending,
    /// Carries debt and is indexed
    Active,
    /// Closed by repayment, withdrawal or liquidation
    Closed,
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PositionStatus::NonExistent => "non-existent",
            PositionStatus::Pending => "pending",
            PositionStatus::Active => "active",
            PositionStatus::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// A collateralized debt position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Owning account
    pub owner: AccountId,
    /// Collateral, excluding unapplied rewards
    pub collateral: FixedPoint,
    /// Debt, excluding unapplied rewards
    pub debt: FixedPoint,
    /// Share of future redistributions
    pub stake: FixedPoint,
    /// Lifecycle state
    pub status: PositionStatus,
    /// Accumulator values at last touch
    pub reward_snapshot: RewardSnapshot,
}

impl Position {
    fn new(owner: AccountId) -> Self {
        Self {
            owner,
            collateral: FixedPoint::ZERO,
            debt: FixedPoint::ZERO,
            stake: FixedPoint::ZERO,
            status: PositionStatus::NonExistent,
            reward_snapshot: RewardSnapshot::default(),
        }
    }

    /// Nominal (price independent) ratio used as the index key
    pub fn nominal_ratio(&self) -> FixedPoint {
        nominal_ratio(self.collateral, self.debt)
    }
}

/// Requested change to a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PositionAdjustment {
    /// Collateral deposited
    pub collateral_added: FixedPoint,
    /// Collateral withdrawn
    pub collateral_withdrawn: FixedPoint,
    /// Debt drawn (minted to the owner)
    pub debt_drawn: FixedPoint,
    /// Debt repaid (burned from the owner)
    pub debt_repaid: FixedPoint,
}

impl PositionAdjustment {
    /// Deposit collateral
    pub fn deposit(amount: FixedPoint) -> Self {
        Self {
            collateral_added: amount,
            ..Default::default()
        }
    }

    /// Withdraw collateral
    pub fn withdraw(amount: FixedPoint) -> Self {
        Self {
            collateral_withdrawn: amount,
            ..Default::default()
        }
    }

    /// Draw debt
    pub fn borrow(amount: FixedPoint) -> Self {
        Self {
            debt_drawn: amount,
            ..Default::default()
        }
    }

    /// Repay debt
    pub fn repay(amount: FixedPoint) -> Self {
        Self {
            debt_repaid: amount,
            ..Default::default()
        }
    }

    /// Combine with more collateral
    pub fn and_deposit(mut self, amount: FixedPoint) -> Self {
        self.collateral_added = amount;
        self
    }

    /// Combine with more debt
    pub fn and_borrow(mut self, amount: FixedPoint) -> Self {
        self.debt_drawn = amount;
        self
    }

    /// True if every leg is zero
    pub fn is_empty(&self) -> bool {
        self.collateral_added.is_zero()
            && self.collateral_withdrawn.is_zero()
            && self.debt_drawn.is_zero()
            && self.debt_repaid.is_zero()
    }
}

/// Effect of a borrower operation, used to settle external transfers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionChange {
    /// Position owner
    pub owner: AccountId,
    /// Status before the operation
    pub status_before: PositionStatus,
    /// Status after the operation
    pub status: PositionStatus,
    /// Collateral received from the owner
    pub collateral_in: FixedPoint,
    /// Collateral returned to the owner
    pub collateral_out: FixedPoint,
    /// Debt minted to the owner
    pub debt_minted: FixedPoint,
    /// Debt burned from the owner
    pub debt_burned: FixedPoint,
    /// Redistribution rewards moved into the position
    pub reward_applied: PendingReward,
    /// Collateral after the operation
    pub collateral: FixedPoint,
    /// Debt after the operation
    pub debt: FixedPoint,
}

// ═══════════════════════════════════════════════════════════════════════════════
// POSITION LEDGER
// ═══════════════════════════════════════════════════════════════════════════════

/// Arena of positions plus the sorted index and system totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionLedger {
    positions: BTreeMap<AccountId, Position>,
    sorted: SortedPositions,
    rewards: RedistributionAccumulator,
    total_stakes: FixedPoint,
    total_stakes_snapshot: FixedPoint,
    total_collateral_snapshot: FixedPoint,
    active_collateral: FixedPoint,
    active_debt: FixedPoint,
    pending_collateral: FixedPoint,
}

impl PositionLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // QUERIES
    // ═══════════════════════════════════════════════════════════════════════════

    /// Get a position record
    pub fn get(&self, id: AccountId) -> Option<&Position> {
        self.positions.get(&id)
    }

    /// Status of an account's position
    pub fn status(&self, id: AccountId) -> PositionStatus {
        self.positions
            .get(&id)
            .map(|p| p.status)
            .unwrap_or(PositionStatus::NonExistent)
    }

    /// Sorted index of active positions
    pub fn sorted(&self) -> &SortedPositions {
        &self.sorted
    }

    /// Redistribution accumulator
    pub fn rewards(&self) -> &RedistributionAccumulator {
        &self.rewards
    }

    /// Sum of stakes of active positions
    pub fn total_stakes(&self) -> FixedPoint {
        self.total_stakes
    }

    /// `(totalStakesSnapshot, totalCollateralSnapshot)`
    pub fn stake_snapshots(&self) -> (FixedPoint, FixedPoint) {
        (self.total_stakes_snapshot, self.total_collateral_snapshot)
    }

    /// Collateral and debt held by active positions, excluding pending rewards
    pub fn active_totals(&self) -> (FixedPoint, FixedPoint) {
        (self.active_collateral, self.active_debt)
    }

    /// Collateral held by pending positions
    pub fn pending_collateral(&self) -> FixedPoint {
        self.pending_collateral
    }

    /// System totals including the default pool
    pub fn totals(&self) -> Result<SystemTotals> {
        Ok(SystemTotals {
            collateral: self
                .active_collateral
                .checked_add(self.pending_collateral)?
                .checked_add(self.rewards.default_collateral())?,
            debt: self.active_debt.checked_add(self.rewards.default_debt())?,
        })
    }

    /// Rewards owed to an active position
    pub fn pending_reward(&self, id: AccountId) -> Result<PendingReward> {
        match self.positions.get(&id) {
            Some(p) if p.status == PositionStatus::Active => {
                self.rewards.pending_reward(p.stake, &p.reward_snapshot)
            }
            _ => Ok(PendingReward::default()),
        }
    }

    /// Collateral and debt including pending rewards
    pub fn entire_position(&self, id: AccountId) -> Result<(FixedPoint, FixedPoint)> {
        let position = self.live_position(id)?;
        let reward = self.pending_reward(id)?;
        Ok((
            position.collateral.checked_add(reward.collateral)?,
            position.debt.checked_add(reward.debt)?,
        ))
    }

    /// `collateral * price / debt`, +infinity without debt
    pub fn icr(&self, id: AccountId, price: FixedPoint) -> Result<FixedPoint> {
        let (collateral, debt) = self.entire_position(id)?;
        collateral_ratio(collateral, debt, price)
    }

    /// Stake for `collateral` corrected by the latest snapshots
    pub fn compute_stake(&self, collateral: FixedPoint) -> Result<FixedPoint> {
        if self.total_collateral_snapshot.is_zero() || self.total_stakes_snapshot.is_zero() {
            return Ok(collateral);
        }
        collateral.mul_div(self.total_stakes_snapshot, self.total_collateral_snapshot)
    }

    fn live_position(&self, id: AccountId) -> Result<&Position> {
        match self.positions.get(&id) {
            Some(p) if matches!(p.status, PositionStatus::Pending | PositionStatus::Active) => Ok(p),
            Some(p) => Err(Error::InvalidPositionState {
                id: id.to_string(),
                status: p.status.to_string(),
                expected: "pending or active".into(),
            }),
            None => Err(Error::PositionNotFound(id.to_string())),
        }
    }

    fn position_mut(&mut self, id: AccountId) -> Result<&mut Position> {
        self.positions
            .get_mut(&id)
            .ok_or_else(|| Error::PositionNotFound(id.to_string()))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // REWARDS AND STAKES
    // ═══════════════════════════════════════════════════════════════════════════

    /// Move pending redistribution rewards into an active position
    pub fn apply_pending_rewards(&mut self, id: AccountId) -> Result<PendingReward> {
        if self.status(id) != PositionStatus::Active {
            return Ok(PendingReward::default());
        }
        let reward = self.pending_reward(id)?;
        let snapshot = self.rewards.snapshot();

        if !reward.is_zero() {
            let (collateral, debt) = self.entire_position(id)?;
            let active_collateral = self.active_collateral.checked_add(reward.collateral)?;
            let active_debt = self.active_debt.checked_add(reward.debt)?;
            let position = self.position_mut(id)?;
            position.collateral = collateral;
            position.debt = debt;
            self.active_collateral = active_collateral;
            self.active_debt = active_debt;
            self.rewards.take_from_default_pool(&reward);
            tracing::debug!(
                %id,
                collateral = %reward.collateral,
                debt = %reward.debt,
                "applied pending rewards"
            );
        }

        self.position_mut(id)?.reward_snapshot = snapshot;
        Ok(reward)
    }

    /// Recompute an active position's stake from its collateral
    fn update_stake(&mut self, id: AccountId) -> Result<FixedPoint> {
        let position = self.positions.get(&id).ok_or_else(|| Error::PositionNotFound(id.to_string()))?;
        let new_stake = self.compute_stake(position.collateral)?;
        let total_stakes = self
            .total_stakes
            .checked_sub(position.stake)?
            .checked_add(new_stake)?;
        self.total_stakes = total_stakes;
        self.position_mut(id)?.stake = new_stake;
        Ok(new_stake)
    }

    fn remove_stake(&mut self, id: AccountId) -> Result<()> {
        let stake = self.position_mut(id)?.stake;
        self.total_stakes = self.total_stakes.checked_sub(stake)?;
        self.position_mut(id)?.stake = FixedPoint::ZERO;
        Ok(())
    }

    /// Record the stake/collateral ratio after a liquidation
    pub fn update_system_snapshots(&mut self) -> Result<()> {
        self.total_stakes_snapshot = self.total_stakes;
        self.total_collateral_snapshot = self
            .active_collateral
            .checked_add(self.rewards.default_collateral())?;
        tracing::debug!(
            total_stakes_snapshot = %self.total_stakes_snapshot,
            total_collateral_snapshot = %self.total_collateral_snapshot,
            "updated stake snapshots"
        );
        Ok(())
    }

    /// Spread collateral and debt over the remaining stakes
    pub fn redistribute(&mut self, collateral: FixedPoint, debt: FixedPoint) -> Result<()> {
        self.rewards.redistribute(collateral, debt, self.total_stakes)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // BORROWER OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Open a position with `collateral` and optional `debt`
    pub fn open(
        &mut self,
        owner: AccountId,
        collateral: FixedPoint,
        debt: FixedPoint,
        ctx: &MarketContext,
        governor: &RecoveryModeGovernor,
        params: &ProtocolParams,
        hint: Option<InsertHint>,
    ) -> Result<PositionChange> {
        let status_before = self.status(owner);
        if !matches!(status_before, PositionStatus::NonExistent | PositionStatus::Closed) {
            return Err(Error::InvalidPositionState {
                id: owner.to_string(),
                status: status_before.to_string(),
                expected: "non-existent or closed".into(),
            });
        }
        validate_non_zero(collateral)?;
        validate_debt_amount(debt, params.min_debt)?;

        if !debt.is_zero() {
            let icr = collateral_ratio(collateral, debt, ctx.price)?;
            let new_totals =
                self.totals()?
                    .after_change(collateral, FixedPoint::ZERO, debt, FixedPoint::ZERO)?;
            let new_tcr = RecoveryModeGovernor::tcr(&new_totals, ctx.price)?;
            governor.validate_open(ctx.mode, icr, new_tcr)?;
        }

        let mut position = Position::new(owner);
        position.collateral = collateral;
        position.debt = debt;

        if debt.is_zero() {
            let pending_collateral = self.pending_collateral.checked_add(collateral)?;
            position.status = PositionStatus::Pending;
            self.positions.insert(owner, position);
            self.pending_collateral = pending_collateral;
        } else {
            self.activate(position, hint)?;
        }

        tracing::debug!(%owner, %collateral, %debt, "opened position");
        Ok(PositionChange {
            owner,
            status_before,
            status: self.status(owner),
            collateral_in: collateral,
            collateral_out: FixedPoint::ZERO,
            debt_minted: debt,
            debt_burned: FixedPoint::ZERO,
            reward_applied: PendingReward::default(),
            collateral,
            debt,
        })
    }

    /// Index a position that now carries debt and give it a stake
    fn activate(&mut self, mut position: Position, hint: Option<InsertHint>) -> Result<()> {
        let owner = position.owner;
        let stake = self.compute_stake(position.collateral)?;
        let total_stakes = self.total_stakes.checked_add(stake)?;
        let active_collateral = self.active_collateral.checked_add(position.collateral)?;
        let active_debt = self.active_debt.checked_add(position.debt)?;

        self.sorted.insert(owner, position.nominal_ratio(), hint)?;
        position.stake = stake;
        position.status = PositionStatus::Active;
        position.reward_snapshot = self.rewards.snapshot();
        self.positions.insert(owner, position);
        self.total_stakes = total_stakes;
        self.active_collateral = active_collateral;
        self.active_debt = active_debt;
        Ok(())
    }

    /// Adjust collateral and debt of a pending or active position
    pub fn adjust(
        &mut self,
        owner: AccountId,
        adjustment: &PositionAdjustment,
        ctx: &MarketContext,
        governor: &RecoveryModeGovernor,
        params: &ProtocolParams,
        hint: Option<InsertHint>,
    ) -> Result<PositionChange> {
        if adjustment.is_empty() {
            return Err(Error::ZeroAmount);
        }
        let status_before = self.live_position(owner)?.status;
        let (collateral, debt) = self.entire_position(owner)?;

        let new_collateral = collateral
            .checked_add(adjustment.collateral_added)?
            .checked_sub(adjustment.collateral_withdrawn)
            .map_err(|_| {
                Error::InvariantViolation(format!(
                    "withdrawal of {} exceeds collateral {}",
                    adjustment.collateral_withdrawn, collateral
                ))
            })?;
        let new_debt = debt
            .checked_add(adjustment.debt_drawn)?
            .checked_sub(adjustment.debt_repaid)
            .map_err(|_| {
                Error::InvariantViolation(format!(
                    "repayment of {} exceeds debt {}",
                    adjustment.debt_repaid, debt
                ))
            })?;

        // Full repayment of an active position closes it.
        if status_before == PositionStatus::Active && new_debt.is_zero() {
            if adjustment.debt_drawn > FixedPoint::ZERO {
                return Err(Error::InvariantViolation(
                    "cannot draw and repay the whole debt at once".into(),
                ));
            }
            let mut change = self.close(owner, ctx, governor)?;
            change.collateral_in = adjustment.collateral_added;
            change.collateral_out = collateral.checked_add(adjustment.collateral_added)?;
            return Ok(change);
        }

        validate_debt_amount(new_debt, params.min_debt)?;
        let new_totals = self.totals()?.after_change(
            adjustment.collateral_added,
            adjustment.collateral_withdrawn,
            adjustment.debt_drawn,
            adjustment.debt_repaid,
        )?;
        let new_tcr = RecoveryModeGovernor::tcr(&new_totals, ctx.price)?;
        let new_icr = collateral_ratio(new_collateral, new_debt, ctx.price)?;

        if status_before == PositionStatus::Pending && !new_debt.is_zero() {
            governor.validate_open(ctx.mode, new_icr, new_tcr)?;
        } else {
            governor.validate_adjustment(&AdjustmentCheck {
                mode: ctx.mode,
                collateral_decrease: adjustment.collateral_withdrawn > adjustment.collateral_added,
                debt_increase: adjustment.debt_drawn > adjustment.debt_repaid,
                new_icr,
                old_tcr: ctx.tcr,
                new_tcr,
            })?;
        }

        let reward_applied = match status_before {
            PositionStatus::Active => self.apply_active_adjustment(owner, new_collateral, new_debt, hint)?,
            _ => {
                self.apply_pending_adjustment(owner, new_collateral, new_debt, hint)?;
                PendingReward::default()
            }
        };

        tracing::debug!(
            %owner,
            collateral = %new_collateral,
            debt = %new_debt,
            "adjusted position"
        );
        Ok(PositionChange {
            owner,
            status_before,
            status: self.status(owner),
            collateral_in: adjustment.collateral_added,
            collateral_out: adjustment.collateral_withdrawn,
            debt_minted: adjustment.debt_drawn,
            debt_burned: adjustment.debt_repaid,
            reward_applied,
            collateral: new_collateral,
            debt: new_debt,
        })
    }

    fn apply_active_adjustment(
        &mut self,
        owner: AccountId,
        new_collateral: FixedPoint,
        new_debt: FixedPoint,
        hint: Option<InsertHint>,
    ) -> Result<PendingReward> {
        let reward = self.apply_pending_rewards(owner)?;
        let position = self.positions.get(&owner).ok_or_else(|| Error::PositionNotFound(owner.to_string()))?;
        let active_collateral = self
            .active_collateral
            .checked_sub(position.collateral)?
            .checked_add(new_collateral)?;
        let active_debt = self.active_debt.checked_sub(position.debt)?.checked_add(new_debt)?;

        let position = self.position_mut(owner)?;
        position.collateral = new_collateral;
        position.debt = new_debt;
        let key = position.nominal_ratio();
        self.active_collateral = active_collateral;
        self.active_debt = active_debt;
        self.update_stake(owner)?;
        self.sorted.reinsert(owner, key, hint)?;
        Ok(reward)
    }

    fn apply_pending_adjustment(
        &mut self,
        owner: AccountId,
        new_collateral: FixedPoint,
        new_debt: FixedPoint,
        hint: Option<InsertHint>,
    ) -> Result<()> {
        let old_collateral = self.live_position(owner)?.collateral;
        let pending_collateral = self.pending_collateral.checked_sub(old_collateral)?;

        if !new_debt.is_zero() {
            let mut position = self.live_position(owner)?.clone();
            position.collateral = new_collateral;
            position.debt = new_debt;
            self.activate(position, hint)?;
            self.pending_collateral = pending_collateral;
            return Ok(());
        }

        let position = self.position_mut(owner)?;
        position.collateral = new_collateral;
        if new_collateral.is_zero() {
            position.status = PositionStatus::Closed;
        }
        self.pending_collateral = pending_collateral.checked_add(new_collateral)?;
        Ok(())
    }

    /// Close a position, returning all collateral and burning all debt
    pub fn close(
        &mut self,
        owner: AccountId,
        ctx: &MarketContext,
        governor: &RecoveryModeGovernor,
    ) -> Result<PositionChange> {
        let status_before = self.live_position(owner)?.status;
        let (collateral, debt) = self.entire_position(owner)?;
        let new_totals =
            self.totals()?
                .after_change(FixedPoint::ZERO, collateral, FixedPoint::ZERO, debt)?;
        let new_tcr = RecoveryModeGovernor::tcr(&new_totals, ctx.price)?;
        governor.validate_close(ctx.mode, new_tcr)?;

        let reward_applied = self.apply_pending_rewards(owner)?;
        match status_before {
            PositionStatus::Active => {
                self.remove_position(owner)?;
            }
            _ => {
                self.pending_collateral = self.pending_collateral.checked_sub(collateral)?;
                let position = self.position_mut(owner)?;
                position.collateral = FixedPoint::ZERO;
                position.status = PositionStatus::Closed;
            }
        }

        tracing::debug!(%owner, %collateral, %debt, "closed position");
        Ok(PositionChange {
            owner,
            status_before,
            status: PositionStatus::Closed,
            collateral_in: FixedPoint::ZERO,
            collateral_out: collateral,
            debt_minted: FixedPoint::ZERO,
            debt_burned: debt,
            reward_applied,
            collateral: FixedPoint::ZERO,
            debt: FixedPoint::ZERO,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // LIQUIDATION SUPPORT
    // ═══════════════════════════════════════════════════════════════════════════

    /// Zero an active position and drop it from the index and stakes
    ///
    /// Pending rewards must already be applied. Returns the removed
    /// `(collateral, debt)`.
    pub fn remove_position(&mut self, id: AccountId) -> Result<(FixedPoint, FixedPoint)> {
        let position = self.live_position(id)?.clone();
        if position.status != PositionStatus::Active {
            return Err(Error::InvalidPositionState {
                id: id.to_string(),
                status: position.status.to_string(),
                expected: "active".into(),
            });
        }
        let active_collateral = self.active_collateral.checked_sub(position.collateral)?;
        let active_debt = self.active_debt.checked_sub(position.debt)?;

        self.sorted.remove(id)?;
        self.remove_stake(id)?;
        self.active_collateral = active_collateral;
        self.active_debt = active_debt;

        let record = self.position_mut(id)?;
        record.collateral = FixedPoint::ZERO;
        record.debt = FixedPoint::ZERO;
        record.status = PositionStatus::Closed;
        Ok((position.collateral, position.debt))
    }

    /// Partially liquidate: take `collateral` and `debt` out, keep it active
    pub fn shrink_position(
        &mut self,
        id: AccountId,
        collateral: FixedPoint,
        debt: FixedPoint,
    ) -> Result<()> {
        let position = self.live_position(id)?;
        let new_collateral = position.collateral.checked_sub(collateral)?;
        let new_debt = position.debt.checked_sub(debt)?;
        if new_debt.is_zero() {
            return Err(Error::Internal(format!(
                "partial liquidation of {} would leave no debt",
                id
            )));
        }
        let active_collateral = self.active_collateral.checked_sub(collateral)?;
        let active_debt = self.active_debt.checked_sub(debt)?;

        let record = self.position_mut(id)?;
        record.collateral = new_collateral;
        record.debt = new_debt;
        let key = record.nominal_ratio();
        self.active_collateral = active_collateral;
        self.active_debt = active_debt;
        self.update_stake(id)?;
        self.sorted.reinsert(id, key, None)?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // STATISTICS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Counts and totals across all positions
    pub fn statistics(&self) -> PositionStatistics {
        let mut stats = PositionStatistics {
            total_stakes: self.total_stakes,
            active_collateral: self.active_collateral,
            active_debt: self.active_debt,
            pending_collateral: self.pending_collateral,
            default_collateral: self.rewards.default_collateral(),
            default_debt: self.rewards.default_debt(),
            lowest_nominal_ratio: self.sorted.lowest().map(|(_, key)| key),
            ..Default::default()
        };
        for position in self.positions.values() {
            match position.status {
                PositionStatus::Active => stats.active_count += 1,
                PositionStatus::Pending => stats.pending_count += 1,
                PositionStatus::Closed => stats.closed_count += 1,
                PositionStatus::NonExistent => {}
            }
        }
        stats
    }
}

/// Position ledger statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionStatistics {
    /// Active positions
    pub active_count: u64,
    /// Pending positions
    pub pending_count: u64,
    /// Closed positions
    pub closed_count: u64,
    /// Sum of stakes
    pub total_stakes: FixedPoint,
    /// Collateral in active positions
    pub active_collateral: FixedPoint,
    /// Debt in active positions
    pub active_debt: FixedPoint,
    /// Collateral in pending positions
    pub pending_collateral: FixedPoint,
    /// Undistributed redistribution collateral
    pub default_collateral: FixedPoint,
    /// Undistributed redistribution debt
    pub default_debt: FixedPoint,
    /// Lowest nominal ratio in the index
    pub lowest_nominal_ratio: Option<FixedPoint>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::liquidation::recovery::SystemMode;

    fn units(n: u64) -> FixedPoint {
        FixedPoint::from_integer(n)
    }

    struct Fixture {
        ledger: PositionLedger,
        governor: RecoveryModeGovernor,
        params: ProtocolParams,
        price: FixedPoint,
    }

    impl Fixture {
        fn new() -> Self {
            let params = ProtocolParams::default();
            Self {
                ledger: PositionLedger::new(),
                governor: RecoveryModeGovernor::new(&params),
                params,
                price: units(200),
            }
        }

        fn ctx(&self) -> MarketContext {
            self.governor
                .context(&self.ledger.totals().unwrap(), self.price)
                .unwrap()
        }

        fn open(&mut self, id: u64, collateral: u64, debt: u64) -> Result<PositionChange> {
            let ctx = self.ctx();
            self.ledger.open(
                AccountId(id),
                units(collateral),
                units(debt),
                &ctx,
                &self.governor,
                &self.params,
                None,
            )
        }

        fn adjust(&mut self, id: u64, adjustment: PositionAdjustment) -> Result<PositionChange> {
            let ctx = self.ctx();
            self.ledger
                .adjust(AccountId(id), &adjustment, &ctx, &self.governor, &self.params, None)
        }
    }

    #[test]
    fn test_open_active_and_pending() {
        let mut fx = Fixture::new();
        let change = fx.open(1, 10, 1000).unwrap();
        assert_eq!(change.status, PositionStatus::Active);
        assert!(fx.ledger.sorted().contains(AccountId(1)));
        assert_eq!(fx.ledger.total_stakes(), units(10));

        let change = fx.open(2, 5, 0).unwrap();
        assert_eq!(change.status, PositionStatus::Pending);
        assert!(!fx.ledger.sorted().contains(AccountId(2)));
        assert_eq!(fx.ledger.pending_collateral(), units(5));

        let totals = fx.ledger.totals().unwrap();
        assert_eq!(totals.collateral, units(15));
        assert_eq!(totals.debt, units(1000));
    }

    #[test]
    fn test_open_rejections_leave_ledger_untouched() {
        let mut fx = Fixture::new();
        fx.open(1, 10, 1000).unwrap();
        let before = fx.ledger.clone();

        // Already open
        assert_eq!(fx.open(1, 10, 100).unwrap_err().kind(), ErrorKind::State);
        // Below MCR: 1 * 200 / 190 ≈ 105%
        assert_eq!(fx.open(2, 1, 190).unwrap_err().kind(), ErrorKind::InvariantViolation);
        // Zero collateral
        assert_eq!(fx.open(3, 0, 0).unwrap_err(), Error::ZeroAmount);

        assert_eq!(fx.ledger, before);
    }

    #[test]
    fn test_icr_infinite_without_debt() {
        let mut fx = Fixture::new();
        fx.open(1, 5, 0).unwrap();
        assert!(fx.ledger.icr(AccountId(1), fx.price).unwrap().is_infinite());
        fx.open(2, 1, 100).unwrap();
        assert_eq!(fx.ledger.icr(AccountId(2), fx.price).unwrap(), units(2));
    }

    #[test]
    fn test_adjust_borrow_and_repay() {
        let mut fx = Fixture::new();
        fx.open(1, 10, 1000).unwrap();

        let change = fx.adjust(1, PositionAdjustment::borrow(units(200))).unwrap();
        assert_eq!(change.debt, units(1200));
        assert_eq!(fx.ledger.active_totals().1, units(1200));

        let change = fx.adjust(1, PositionAdjustment::repay(units(1200))).unwrap();
        assert_eq!(change.status, PositionStatus::Closed);
        assert_eq!(change.collateral_out, units(10));
        assert_eq!(change.debt_burned, units(1200));
        assert!(!fx.ledger.sorted().contains(AccountId(1)));
        assert_eq!(fx.ledger.total_stakes(), FixedPoint::ZERO);
    }

    #[test]
    fn test_adjust_over_withdrawal_is_invariant_violation() {
        let mut fx = Fixture::new();
        fx.open(1, 10, 1000).unwrap();
        let err = fx.adjust(1, PositionAdjustment::withdraw(units(11))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);
        let err = fx.adjust(1, PositionAdjustment::repay(units(1001))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);
        assert_eq!(fx.adjust(1, PositionAdjustment::default()).unwrap_err(), Error::ZeroAmount);
    }

    #[test]
    fn test_pending_position_activates_on_borrow() {
        let mut fx = Fixture::new();
        fx.open(1, 10, 0).unwrap();
        let change = fx.adjust(1, PositionAdjustment::borrow(units(500))).unwrap();
        assert_eq!(change.status_before, PositionStatus::Pending);
        assert_eq!(change.status, PositionStatus::Active);
        assert_eq!(fx.ledger.pending_collateral(), FixedPoint::ZERO);
        assert_eq!(fx.ledger.active_totals(), (units(10), units(500)));
    }

    #[test]
    fn test_recovery_mode_blocks_withdrawal() {
        let mut fx = Fixture::new();
        fx.open(1, 10, 1000).unwrap();
        fx.open(2, 10, 1000).unwrap();

        // 20 * 140 / 2000 = 140% < 150%
        fx.price = units(140);
        assert_eq!(fx.ctx().mode, SystemMode::Recovery);

        let err = fx.adjust(1, PositionAdjustment::withdraw(units(1))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModeRestriction);

        // Topping up is still allowed
        assert!(fx.adjust(1, PositionAdjustment::deposit(units(1))).is_ok());

        // Closing is not
        let ctx = fx.ctx();
        let err = fx.ledger.close(AccountId(2), &ctx, &fx.governor).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModeRestriction);
    }

    #[test]
    fn test_min_debt_floor() {
        let mut fx = Fixture::new();
        fx.params = fx.params.clone().with_min_debt(units(100));
        assert!(matches!(fx.open(1, 10, 50), Err(Error::DebtBelowMinimum { .. })));
        fx.open(1, 10, 200).unwrap();
        assert!(matches!(
            fx.adjust(1, PositionAdjustment::repay(units(150))),
            Err(Error::DebtBelowMinimum { .. })
        ));
    }

    #[test]
    fn test_redistribution_rewards_and_stake_correction() {
        let mut fx = Fixture::new();
        fx.open(1, 10, 1000).unwrap();
        fx.open(2, 10, 1000).unwrap();

        // Liquidate position 2 by pure redistribution
        fx.ledger.apply_pending_rewards(AccountId(2)).unwrap();
        let (coll, debt) = fx.ledger.remove_position(AccountId(2)).unwrap();
        fx.ledger.redistribute(coll, debt).unwrap();
        fx.ledger.update_system_snapshots().unwrap();

        // Position 1 owns every stake, so it inherits everything
        assert_eq!(fx.ledger.entire_position(AccountId(1)).unwrap(), (units(20), units(2000)));
        assert_eq!(fx.ledger.stake_snapshots(), (units(10), units(20)));

        // A new position gets a corrected stake: 10 * 10 / 20 = 5
        fx.open(3, 10, 500).unwrap();
        assert_eq!(fx.ledger.get(AccountId(3)).unwrap().stake, units(5));

        // Applying rewards keeps totals intact
        let before = fx.ledger.totals().unwrap();
        let reward = fx.ledger.apply_pending_rewards(AccountId(1)).unwrap();
        assert_eq!(reward.debt, units(1000));
        assert_eq!(fx.ledger.totals().unwrap(), before);
        assert_eq!(fx.ledger.rewards().default_debt(), FixedPoint::ZERO);
    }

    #[test]
    fn test_shrink_position_keeps_it_active() {
        let mut fx = Fixture::new();
        fx.open(1, 10, 1000).unwrap();
        fx.ledger.shrink_position(AccountId(1), units(4), units(400)).unwrap();
        let position = fx.ledger.get(AccountId(1)).unwrap();
        assert_eq!(position.status, PositionStatus::Active);
        assert_eq!((position.collateral, position.debt), (units(6), units(600)));
        assert_eq!(fx.ledger.total_stakes(), units(6));
        assert!(fx.ledger.shrink_position(AccountId(1), units(1), units(600)).is_err());
    }

    #[test]
    fn test_statistics() {
        let mut fx = Fixture::new();
        fx.open(1, 10, 1000).unwrap();
        fx.open(2, 3, 0).unwrap();
        let stats = fx.ledger.statistics();
        assert_eq!(stats.active_count, 1);
        assert_eq!(stats.pending_count, 1);
        assert_eq!(stats.lowest_nominal_ratio, Some(FixedPoint::from_raw(FixedPoint::SCALE / 100)));
    }
}
