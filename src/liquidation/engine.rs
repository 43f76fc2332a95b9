//! Liquidation Engine.
//!
//! Decides whether a position can be liquidated and how its debt and
//! collateral are split between the stability pool (offset) and the
//! other active positions (redistribution):
//!
//! - ratio below 100%: everything is redistributed, since depositors
//!   would otherwise be paid less collateral than the debt they cancel
//! - ratio from 100% up to MCR: offset as much as the pool covers,
//!   redistribute the rest
//! - Recovery Mode, ratio from MCR up to TCR: offset only. If the pool
//!   falls short the position is shrunk by the offset and stays active.
//!
//! Batches walk the sorted index from the lowest ratio and stop at the
//! first healthy position.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::core::config::ProtocolParams;
use crate::core::position::{AccountId, PositionLedger, PositionStatus};
use crate::core::redistribution::PendingReward;
use crate::error::{Error, Result};
use crate::liquidation::recovery::{RecoveryModeGovernor, SystemMode};
use crate::liquidation::stability_pool::StabilityPool;
use crate::utils::constants::FACE_VALUE_RATIO_PCT;
use crate::utils::math::FixedPoint;

// ═══════════════════════════════════════════════════════════════════════════════
// LIQUIDATION PLAN
// ═══════════════════════════════════════════════════════════════════════════════

/// How a liquidation was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiquidationKind {
    /// Fully absorbed by the stability pool
    Offset,
    /// Partly absorbed, remainder redistributed
    OffsetAndRedistribution,
    /// Fully redistributed to other positions
    Redistribution,
    /// Pool covered part of the debt; position shrunk and kept active
    PartialOffset,
}

impl LiquidationKind {
    /// True if the position is closed by this liquidation
    pub fn closes_position(&self) -> bool {
        !matches!(self, LiquidationKind::PartialOffset)
    }
}

/// Split of a position's debt and collateral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationPlan {
    /// Settlement kind
    pub kind: LiquidationKind,
    /// Debt cancelled against the pool
    pub debt_offset: FixedPoint,
    /// Collateral sent to the pool
    pub collateral_offset: FixedPoint,
    /// Debt spread over other positions
    pub debt_redistributed: FixedPoint,
    /// Collateral spread over other positions
    pub collateral_redistributed: FixedPoint,
}

impl LiquidationPlan {
    fn redistribute_all(collateral: FixedPoint, debt: FixedPoint) -> Self {
        Self {
            kind: LiquidationKind::Redistribution,
            debt_offset: FixedPoint::ZERO,
            collateral_offset: FixedPoint::ZERO,
            debt_redistributed: debt,
            collateral_redistributed: collateral,
        }
    }

    /// Decide the split for a position with the given figures
    ///
    /// `collateral` and `debt` must include pending rewards. Fails with
    /// [`Error::NotLiquidatable`] for a healthy position and
    /// [`Error::EmptyStabilityPool`] when a Recovery Mode liquidation above
    /// MCR finds no deposits.
    #[allow(clippy::too_many_arguments)]
    pub fn compute(
        governor: &RecoveryModeGovernor,
        id: AccountId,
        collateral: FixedPoint,
        debt: FixedPoint,
        icr: FixedPoint,
        mode: SystemMode,
        tcr: FixedPoint,
        pool_deposits: FixedPoint,
    ) -> Result<Self> {
        if !governor.is_liquidatable(icr, mode, tcr) {
            return Err(Error::NotLiquidatable {
                id: id.to_string(),
                icr,
            });
        }

        if icr < FixedPoint::from_percentage(FACE_VALUE_RATIO_PCT) {
            return Ok(Self::redistribute_all(collateral, debt));
        }

        if icr < governor.mcr() {
            let debt_offset = debt.min(pool_deposits);
            if debt_offset.is_zero() {
                return Ok(Self::redistribute_all(collateral, debt));
            }
            let collateral_offset = collateral.mul_div(debt_offset, debt)?;
            let debt_redistributed = debt.checked_sub(debt_offset)?;
            let kind = if debt_redistributed.is_zero() {
                LiquidationKind::Offset
            } else {
                LiquidationKind::OffsetAndRedistribution
            };
            return Ok(Self {
                kind,
                debt_offset,
                collateral_offset,
                debt_redistributed,
                collateral_redistributed: collateral.checked_sub(collateral_offset)?,
            });
        }

        // Recovery Mode, MCR <= icr < TCR
        if pool_deposits.is_zero() {
            return Err(Error::EmptyStabilityPool);
        }
        if pool_deposits >= debt {
            return Ok(Self {
                kind: LiquidationKind::Offset,
                debt_offset: debt,
                collateral_offset: collateral,
                debt_redistributed: FixedPoint::ZERO,
                collateral_redistributed: FixedPoint::ZERO,
            });
        }
        Ok(Self {
            kind: LiquidationKind::PartialOffset,
            debt_offset: pool_deposits,
            collateral_offset: collateral.mul_div(pool_deposits, debt)?,
            debt_redistributed: FixedPoint::ZERO,
            collateral_redistributed: FixedPoint::ZERO,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LIQUIDATION RECORD
// ═══════════════════════════════════════════════════════════════════════════════

/// Record of a liquidation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationRecord {
    /// Sequence number
    pub sequence: u64,
    /// Liquidated position
    pub owner: AccountId,
    /// Mode at the time of liquidation
    pub mode: SystemMode,
    /// Price used
    pub price: FixedPoint,
    /// Position ratio at liquidation
    pub icr: FixedPoint,
    /// TCR before the liquidation
    pub tcr: FixedPoint,
    /// Redistribution rewards applied first
    pub reward_applied: PendingReward,
    /// Collateral including applied rewards
    pub collateral: FixedPoint,
    /// Debt including applied rewards
    pub debt: FixedPoint,
    /// Settlement
    pub plan: LiquidationPlan,
}

/// Outcome of a batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLiquidation {
    /// Liquidations performed, in order
    pub records: Vec<LiquidationRecord>,
    /// Positions skipped as ineligible (explicit-list batches only)
    pub skipped: Vec<AccountId>,
}

impl BatchLiquidation {
    /// Number of positions liquidated
    pub fn processed(&self) -> usize {
        self.records.len()
    }

    /// Debt cancelled against the pool
    pub fn debt_offset(&self) -> FixedPoint {
        self.records
            .iter()
            .fold(FixedPoint::ZERO, |acc, r| acc.saturating_add(r.plan.debt_offset))
    }

    /// Debt spread over remaining positions
    pub fn debt_redistributed(&self) -> FixedPoint {
        self.records
            .iter()
            .fold(FixedPoint::ZERO, |acc, r| acc.saturating_add(r.plan.debt_redistributed))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LIQUIDATION ENGINE
// ═══════════════════════════════════════════════════════════════════════════════

/// Liquidation orchestration and history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationEngine {
    /// Recent liquidations
    records: Vec<LiquidationRecord>,
    /// Maximum records to keep
    max_events: usize,
    /// Largest batch processed in one call
    max_batch_size: usize,
    /// Total liquidations performed
    total_liquidations: u64,
    /// Of which partial offsets
    partial_liquidations: u64,
    /// Total debt offset against the pool
    total_debt_offset: FixedPoint,
    /// Total collateral sent to the pool
    total_collateral_offset: FixedPoint,
    /// Total debt redistributed
    total_debt_redistributed: FixedPoint,
    /// Total collateral redistributed
    total_collateral_redistributed: FixedPoint,
}

impl Default for LiquidationEngine {
    fn default() -> Self {
        Self::new(&ProtocolParams::default())
    }
}

impl LiquidationEngine {
    /// Create a new liquidation engine
    pub fn new(params: &ProtocolParams) -> Self {
        Self {
            records: Vec::new(),
            max_events: params.max_events,
            max_batch_size: params.max_batch_size,
            total_liquidations: 0,
            partial_liquidations: 0,
            total_debt_offset: FixedPoint::ZERO,
            total_collateral_offset: FixedPoint::ZERO,
            total_debt_redistributed: FixedPoint::ZERO,
            total_collateral_redistributed: FixedPoint::ZERO,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // LIQUIDATION DETECTION
    // ═══════════════════════════════════════════════════════════════════════════

    /// Check whether a position can be liquidated at `price`
    pub fn is_liquidatable(
        ledger: &PositionLedger,
        governor: &RecoveryModeGovernor,
        id: AccountId,
        price: FixedPoint,
    ) -> Result<bool> {
        if ledger.status(id) != PositionStatus::Active {
            return Ok(false);
        }
        let ctx = governor.context(&ledger.totals()?, price)?;
        let icr = ledger.icr(id, price)?;
        Ok(governor.is_liquidatable(icr, ctx.mode, ctx.tcr))
    }

    /// Liquidatable positions, lowest ratio first, up to `limit`
    pub fn find_liquidatable(
        ledger: &PositionLedger,
        governor: &RecoveryModeGovernor,
        price: FixedPoint,
        limit: usize,
    ) -> Result<Vec<AccountId>> {
        let ctx = governor.context(&ledger.totals()?, price)?;
        let mut found = Vec::new();
        for id in ledger.sorted().iter() {
            if found.len() >= limit {
                break;
            }
            let icr = ledger.icr(id, price)?;
            if !governor.is_liquidatable(icr, ctx.mode, ctx.tcr) {
                break;
            }
            found.push(id);
        }
        Ok(found)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // LIQUIDATION EXECUTION
    // ═══════════════════════════════════════════════════════════════════════════

    /// Liquidate one position
    ///
    /// The mode is computed from the current totals. A failure after the
    /// first mutation restores the ledger, the pool and the engine, so a
    /// call either completes or changes nothing.
    pub fn liquidate(
        &mut self,
        ledger: &mut PositionLedger,
        pool: &mut StabilityPool,
        governor: &RecoveryModeGovernor,
        id: AccountId,
        price: FixedPoint,
    ) -> Result<LiquidationRecord> {
        let status = ledger.status(id);
        if status != PositionStatus::Active {
            return Err(Error::InvalidPositionState {
                id: id.to_string(),
                status: status.to_string(),
                expected: "active".into(),
            });
        }

        let ctx = governor.context(&ledger.totals()?, price)?;
        let (collateral, debt) = ledger.entire_position(id)?;
        let icr = ledger.icr(id, price)?;
        let plan = LiquidationPlan::compute(
            governor,
            id,
            collateral,
            debt,
            icr,
            ctx.mode,
            ctx.tcr,
            pool.total_deposits(),
        )?;

        if !plan.debt_redistributed.is_zero() || !plan.collateral_redistributed.is_zero() {
            let own_stake = ledger.get(id).map(|p| p.stake).unwrap_or(FixedPoint::ZERO);
            if ledger.total_stakes().saturating_sub(own_stake).is_zero() {
                return Err(Error::NoRemainingStake);
            }
        }

        let saved = (ledger.clone(), pool.clone(), self.clone());
        let outcome = Self::apply_plan(ledger, pool, id, &plan).and_then(|reward_applied| {
            let record = LiquidationRecord {
                sequence: self.total_liquidations,
                owner: id,
                mode: ctx.mode,
                price,
                icr,
                tcr: ctx.tcr,
                reward_applied,
                collateral,
                debt,
                plan,
            };
            self.record(record.clone())?;
            Ok(record)
        });
        let record = match outcome {
            Ok(record) => record,
            Err(e) => {
                let (saved_ledger, saved_pool, saved_engine) = saved;
                *ledger = saved_ledger;
                *pool = saved_pool;
                *self = saved_engine;
                tracing::warn!(owner = %id, error = %e, "liquidation failed, state restored");
                return Err(e);
            }
        };

        tracing::info!(
            owner = %id,
            kind = ?plan.kind,
            mode = %ctx.mode,
            %icr,
            debt_offset = %plan.debt_offset,
            debt_redistributed = %plan.debt_redistributed,
            "position liquidated"
        );
        Ok(record)
    }

    /// Move the position's collateral and debt as planned
    fn apply_plan(
        ledger: &mut PositionLedger,
        pool: &mut StabilityPool,
        id: AccountId,
        plan: &LiquidationPlan,
    ) -> Result<PendingReward> {
        let reward_applied = ledger.apply_pending_rewards(id)?;
        if plan.kind.closes_position() {
            ledger.remove_position(id)?;
        } else {
            ledger.shrink_position(id, plan.collateral_offset, plan.debt_offset)?;
        }
        pool.offset(plan.debt_offset, plan.collateral_offset)?;
        ledger.redistribute(plan.collateral_redistributed, plan.debt_redistributed)?;
        ledger.update_system_snapshots()?;
        Ok(reward_applied)
    }

    /// Liquidate up to `max_count` positions from the lowest ratio upwards
    ///
    /// Stops at the first ineligible position or the first failure. The
    /// mode is recomputed before every candidate.
    pub fn liquidate_batch(
        &mut self,
        ledger: &mut PositionLedger,
        pool: &mut StabilityPool,
        governor: &RecoveryModeGovernor,
        price: FixedPoint,
        max_count: usize,
    ) -> BatchLiquidation {
        let limit = max_count.min(self.max_batch_size);
        let mut batch = BatchLiquidation::default();
        let mut visited = BTreeSet::new();

        while batch.records.len() < limit {
            let Some(id) = ledger.sorted().iter().find(|id| !visited.contains(id)) else {
                break;
            };
            visited.insert(id);

            match Self::is_liquidatable(ledger, governor, id, price) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    tracing::warn!(owner = %id, error = %e, "eligibility check failed, stopping batch");
                    break;
                }
            }
            match self.liquidate(ledger, pool, governor, id, price) {
                Ok(record) => batch.records.push(record),
                Err(e) => {
                    tracing::warn!(owner = %id, error = %e, "liquidation failed, stopping batch");
                    break;
                }
            }
        }

        tracing::debug!(processed = batch.processed(), requested = max_count, "batch done");
        batch
    }

    /// Liquidate an explicit list of positions, skipping ineligible ones
    pub fn liquidate_positions(
        &mut self,
        ledger: &mut PositionLedger,
        pool: &mut StabilityPool,
        governor: &RecoveryModeGovernor,
        ids: &[AccountId],
        price: FixedPoint,
    ) -> BatchLiquidation {
        let mut batch = BatchLiquidation::default();
        for &id in ids.iter().take(self.max_batch_size) {
            match self.liquidate(ledger, pool, governor, id, price) {
                Ok(record) => batch.records.push(record),
                Err(e) => {
                    tracing::warn!(owner = %id, error = %e, "skipping position");
                    batch.skipped.push(id);
                }
            }
        }
        batch
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // QUERIES
    // ═══════════════════════════════════════════════════════════════════════════

    /// Get total liquidations count
    pub fn total_liquidations(&self) -> u64 {
        self.total_liquidations
    }

    /// Get recent liquidations
    pub fn recent_records(&self) -> &[LiquidationRecord] {
        &self.records
    }

    /// Records for one position
    pub fn records_for(&self, owner: AccountId) -> Vec<&LiquidationRecord> {
        self.records.iter().filter(|r| r.owner == owner).collect()
    }

    /// Get liquidation statistics
    pub fn statistics(&self) -> LiquidationStats {
        LiquidationStats {
            total_liquidations: self.total_liquidations,
            partial_liquidations: self.partial_liquidations,
            total_debt_offset: self.total_debt_offset,
            total_collateral_offset: self.total_collateral_offset,
            total_debt_redistributed: self.total_debt_redistributed,
            total_collateral_redistributed: self.total_collateral_redistributed,
            recent_records: self.records.len(),
        }
    }

    /// Add a record (with pruning) and update totals
    fn record(&mut self, record: LiquidationRecord) -> Result<()> {
        let plan = &record.plan;
        self.total_debt_offset = self.total_debt_offset.checked_add(plan.debt_offset)?;
        self.total_collateral_offset =
            self.total_collateral_offset.checked_add(plan.collateral_offset)?;
        self.total_debt_redistributed =
            self.total_debt_redistributed.checked_add(plan.debt_redistributed)?;
        self.total_collateral_redistributed = self
            .total_collateral_redistributed
            .checked_add(plan.collateral_redistributed)?;
        if plan.kind == LiquidationKind::PartialOffset {
            self.partial_liquidations += 1;
        }
        self.total_liquidations += 1;

        self.records.push(record);
        if self.records.len() > self.max_events {
            self.records.drain(0..self.records.len() - self.max_events);
        }
        Ok(())
    }
}

/// Liquidation statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationStats {
    /// Liquidations performed
    pub total_liquidations: u64,
    /// Of which partial offsets
    pub partial_liquidations: u64,
    /// Debt offset against the pool
    pub total_debt_offset: FixedPoint,
    /// Collateral sent to the pool
    pub total_collateral_offset: FixedPoint,
    /// Debt redistributed
    pub total_debt_redistributed: FixedPoint,
    /// Collateral redistributed
    pub total_collateral_redistributed: FixedPoint,
    /// Records currently retained
    pub recent_records: usize,
}
