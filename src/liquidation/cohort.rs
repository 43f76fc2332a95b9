//! Overstay cohort tracking for the stability pool.
//!
//! Depositors are grouped by the pool epoch of their latest deposit. When
//! an offset empties the pool the epoch advances and every deposit made
//! before it is worth zero. Depositors who stay registered after that
//! ("overstayers") would, under a plain pro-rata rule, have absorbed part
//! of later losses. That part is booked here as a per-cohort shortfall.
//!
//! While any cohort still has members and an outstanding shortfall, the
//! pool refuses withdrawals from everyone except the overstayers
//! themselves. An operator unblocks it by clearing the oldest stale
//! cohort.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::core::position::AccountId;
use crate::error::Result;
use crate::utils::math::{checked_sum, FixedPoint};

/// Per-cohort bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cohort {
    /// Accounts whose latest deposit was made in this cohort's epoch
    pub members: BTreeSet<AccountId>,
    /// Sum of the members' initial deposit values
    pub initial_total: FixedPoint,
    /// Loss that a pro-rata rule would have charged to these members
    pub shortfall: FixedPoint,
}

impl Cohort {
    /// True if the cohort blocks withdrawals
    pub fn is_overstaying(&self) -> bool {
        !self.members.is_empty() && !self.shortfall.is_zero()
    }
}

/// Result of clearing a cohort
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearedCohort {
    /// Cohort id
    pub cohort: u64,
    /// Former members
    pub members: Vec<AccountId>,
    /// Shortfall drained from the ledger
    pub shortfall: FixedPoint,
}

/// Tracks depositor cohorts and their overstay shortfall
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverstayCohortTracker {
    cohorts: BTreeMap<u64, Cohort>,
    /// Cohorts below this id were cleared or emptied before a clearing
    next_to_clear: u64,
    /// Number of cohorts cleared
    cleared: u64,
}

impl OverstayCohortTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` in `cohort` with `initial` deposit value
    pub fn join(&mut self, cohort: u64, id: AccountId, initial: FixedPoint) -> Result<()> {
        let entry = self.cohorts.entry(cohort).or_default();
        let initial_total = entry.initial_total.checked_add(initial)?;
        entry.members.insert(id);
        entry.initial_total = initial_total;
        Ok(())
    }

    /// Remove `id` from `cohort`, releasing its `initial` deposit value
    pub fn leave(&mut self, cohort: u64, id: AccountId, initial: FixedPoint) {
        if let Some(entry) = self.cohorts.get_mut(&cohort) {
            entry.members.remove(&id);
            entry.initial_total = entry.initial_total.saturating_sub(initial);
            if entry.members.is_empty() && entry.shortfall.is_zero() {
                self.cohorts.remove(&cohort);
            }
        }
    }

    /// Book the share of an offset that stale cohorts would have absorbed
    ///
    /// `epoch_before` and `total_before` are the pool epoch and total
    /// deposits immediately before the offset. A cohort is stale if its id
    /// is below `epoch_before`. Its share is
    /// `debt * stale_initial / (total_before + stale_initial)`.
    pub fn record_offset(
        &mut self,
        epoch_before: u64,
        total_before: FixedPoint,
        debt: FixedPoint,
    ) -> Result<()> {
        if debt.is_zero() {
            return Ok(());
        }
        for (id, cohort) in self.cohorts.range_mut(..epoch_before) {
            if cohort.members.is_empty() || cohort.initial_total.is_zero() {
                continue;
            }
            let denominator = total_before.checked_add(cohort.initial_total)?;
            let share = debt.mul_div(cohort.initial_total, denominator)?;
            cohort.shortfall = cohort.shortfall.checked_add(share)?;
            tracing::warn!(
                cohort = id,
                members = cohort.members.len(),
                %share,
                shortfall = %cohort.shortfall,
                "stale cohort overstaying"
            );
        }
        Ok(())
    }

    /// True if any cohort blocks withdrawals
    pub fn has_overstay(&self) -> bool {
        self.cohorts.values().any(Cohort::is_overstaying)
    }

    /// True if `cohort` itself is overstaying
    pub fn is_overstaying(&self, cohort: u64) -> bool {
        self.cohorts.get(&cohort).is_some_and(Cohort::is_overstaying)
    }

    /// Oldest cohort that still has members
    pub fn oldest_active(&self) -> Option<u64> {
        self.cohorts
            .range(self.next_to_clear..)
            .find(|(_, c)| !c.members.is_empty())
            .map(|(id, _)| *id)
    }

    /// Remove a cohort entirely, returning its members and shortfall
    pub fn take(&mut self, cohort: u64) -> ClearedCohort {
        let entry = self.cohorts.remove(&cohort).unwrap_or_default();
        self.next_to_clear = self.next_to_clear.max(cohort + 1);
        self.cleared += 1;
        ClearedCohort {
            cohort,
            members: entry.members.into_iter().collect(),
            shortfall: entry.shortfall,
        }
    }

    /// Cohort data, if tracked
    pub fn get(&self, cohort: u64) -> Option<&Cohort> {
        self.cohorts.get(&cohort)
    }

    /// Total outstanding shortfall across cohorts with members
    pub fn outstanding_shortfall(&self) -> Result<FixedPoint> {
        checked_sum(
            self.cohorts
                .values()
                .filter(|c| !c.members.is_empty())
                .map(|c| c.shortfall),
        )
    }

    /// Pointer to the next cohort eligible for clearing
    pub fn next_to_clear(&self) -> u64 {
        self.next_to_clear
    }

    /// Number of cohorts cleared so far
    pub fn cleared_count(&self) -> u64 {
        self.cleared
    }

    /// Number of tracked cohorts
    pub fn len(&self) -> usize {
        self.cohorts.len()
    }

    /// Check if no cohort is tracked
    pub fn is_empty(&self) -> bool {
        self.cohorts.is_empty()
    }
}
