//! Recovery Mode governor.
//!
//! Recovery Mode applies when the Total Collateralization Ratio (TCR) is
//! below the Critical Collateralization Ratio (CCR). The mode is never
//! stored: it is a pure function of the current system totals and price,
//! recomputed once at the top of every entry point. In Recovery Mode:
//!
//! 1. **Liquidation threshold raised**: positions with ratio below TCR
//!    (not only below MCR) can be liquidated
//! 2. **Borrowing restricted**: new debt needs ratio >= CCR and must not
//!    lower the TCR
//! 3. **Withdrawal blocked**: collateral cannot leave a position

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::config::ProtocolParams;
use crate::error::{Error, Result};
use crate::utils::math::{collateral_ratio, FixedPoint};
use crate::utils::validation::validate_collateral_ratio;

// ═══════════════════════════════════════════════════════════════════════════════
// SYSTEM MODE
// ═══════════════════════════════════════════════════════════════════════════════

/// System-wide risk mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemMode {
    /// TCR at or above CCR
    Normal,
    /// TCR below CCR
    Recovery,
}

impl SystemMode {
    /// Check for recovery mode
    pub fn is_recovery(&self) -> bool {
        matches!(self, SystemMode::Recovery)
    }
}

impl fmt::Display for SystemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemMode::Normal => write!(f, "normal"),
            SystemMode::Recovery => write!(f, "recovery"),
        }
    }
}

/// Aggregate collateral and debt of the whole system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SystemTotals {
    /// Collateral in positions plus undistributed rewards
    pub collateral: FixedPoint,
    /// Debt of positions plus undistributed rewards
    pub debt: FixedPoint,
}

impl SystemTotals {
    /// Totals after a signed change to one position
    pub fn after_change(
        &self,
        collateral_added: FixedPoint,
        collateral_removed: FixedPoint,
        debt_added: FixedPoint,
        debt_removed: FixedPoint,
    ) -> Result<Self> {
        Ok(Self {
            collateral: self
                .collateral
                .checked_add(collateral_added)?
                .checked_sub(collateral_removed)?,
            debt: self.debt.checked_add(debt_added)?.checked_sub(debt_removed)?,
        })
    }
}

/// Price and mode captured once at the start of an entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketContext {
    /// Oracle price of one unit of collateral in debt units
    pub price: FixedPoint,
    /// Mode computed from the totals at entry
    pub mode: SystemMode,
    /// TCR at entry
    pub tcr: FixedPoint,
}

/// Snapshot of the governor's view of the system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryModeStatus {
    /// Current mode
    pub mode: SystemMode,
    /// Current TCR
    pub tcr: FixedPoint,
    /// Threshold below which recovery mode applies
    pub ccr: FixedPoint,
    /// Totals the TCR was computed from
    pub totals: SystemTotals,
    /// Price the TCR was computed with
    pub price: FixedPoint,
}

// ═══════════════════════════════════════════════════════════════════════════════
// OPERATION VALIDATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of validating a borrower operation against the current mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeValidation {
    /// Operation is allowed
    Allowed,
    /// Operation is blocked with reason
    Blocked(String),
}

impl ModeValidation {
    /// Check if operation is allowed
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Convert into a mode restriction error if blocked
    pub fn to_result(&self) -> Result<()> {
        match self {
            Self::Allowed => Ok(()),
            Self::Blocked(reason) => Err(Error::RecoveryMode(reason.clone())),
        }
    }
}

/// Before/after figures of a position adjustment
#[derive(Debug, Clone, Copy)]
pub struct AdjustmentCheck {
    /// Mode at entry
    pub mode: SystemMode,
    /// Collateral leaves the position
    pub collateral_decrease: bool,
    /// Debt is drawn
    pub debt_increase: bool,
    /// Position ratio after the change
    pub new_icr: FixedPoint,
    /// TCR at entry
    pub old_tcr: FixedPoint,
    /// TCR after the change
    pub new_tcr: FixedPoint,
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECOVERY MODE GOVERNOR
// ═══════════════════════════════════════════════════════════════════════════════

/// Pure mode computation and borrower-operation gating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryModeGovernor {
    mcr: FixedPoint,
    ccr: FixedPoint,
}

impl RecoveryModeGovernor {
    /// Create a governor from protocol parameters
    pub fn new(params: &ProtocolParams) -> Self {
        Self {
            mcr: params.min_collateral_ratio,
            ccr: params.critical_collateral_ratio,
        }
    }

    /// Minimum collateral ratio
    pub fn mcr(&self) -> FixedPoint {
        self.mcr
    }

    /// Critical collateral ratio
    pub fn ccr(&self) -> FixedPoint {
        self.ccr
    }

    /// Calculate Total Collateralization Ratio
    pub fn tcr(totals: &SystemTotals, price: FixedPoint) -> Result<FixedPoint> {
        collateral_ratio(totals.collateral, totals.debt, price)
    }

    /// Recovery if `collateral * price / debt < CCR`
    pub fn mode(&self, totals: &SystemTotals, price: FixedPoint) -> Result<SystemMode> {
        let tcr = Self::tcr(totals, price)?;
        Ok(self.mode_for_tcr(tcr))
    }

    /// Mode for an already computed TCR
    pub fn mode_for_tcr(&self, tcr: FixedPoint) -> SystemMode {
        if tcr < self.ccr {
            SystemMode::Recovery
        } else {
            SystemMode::Normal
        }
    }

    /// Capture price, TCR and mode for one entry point
    pub fn context(&self, totals: &SystemTotals, price: FixedPoint) -> Result<MarketContext> {
        let tcr = Self::tcr(totals, price)?;
        Ok(MarketContext {
            price,
            mode: self.mode_for_tcr(tcr),
            tcr,
        })
    }

    /// Full status report
    pub fn status(&self, totals: &SystemTotals, price: FixedPoint) -> Result<RecoveryModeStatus> {
        let tcr = Self::tcr(totals, price)?;
        Ok(RecoveryModeStatus {
            mode: self.mode_for_tcr(tcr),
            tcr,
            ccr: self.ccr,
            totals: *totals,
            price,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // LIQUIDATION ELIGIBILITY
    // ═══════════════════════════════════════════════════════════════════════════

    /// Below MCR always; below TCR as well while in recovery mode
    pub fn is_liquidatable(&self, icr: FixedPoint, mode: SystemMode, tcr: FixedPoint) -> bool {
        if icr < self.mcr {
            return true;
        }
        mode.is_recovery() && icr < tcr
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // BORROWER OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Validate opening a position with debt
    pub fn validate_open(
        &self,
        mode: SystemMode,
        icr: FixedPoint,
        new_tcr: FixedPoint,
    ) -> Result<()> {
        match mode {
            SystemMode::Recovery => {
                if icr < self.ccr {
                    return ModeValidation::Blocked(format!(
                        "new position ratio {} below CCR {}",
                        icr, self.ccr
                    ))
                    .to_result();
                }
                Ok(())
            }
            SystemMode::Normal => {
                validate_collateral_ratio(icr, self.mcr)?;
                self.require_tcr_above_ccr(new_tcr)
            }
        }
    }

    /// Validate an adjustment of an open position
    pub fn validate_adjustment(&self, check: &AdjustmentCheck) -> Result<()> {
        match check.mode {
            SystemMode::Recovery => self.recovery_adjustment(check).to_result(),
            SystemMode::Normal => {
                validate_collateral_ratio(check.new_icr, self.mcr)?;
                self.require_tcr_above_ccr(check.new_tcr)
            }
        }
    }

    /// Validate closing a position
    pub fn validate_close(&self, mode: SystemMode, new_tcr: FixedPoint) -> Result<()> {
        if mode.is_recovery() {
            return ModeValidation::Blocked("closing positions is disabled".into()).to_result();
        }
        self.require_tcr_above_ccr(new_tcr)
    }

    fn recovery_adjustment(&self, check: &AdjustmentCheck) -> ModeValidation {
        if check.collateral_decrease {
            return ModeValidation::Blocked("collateral withdrawal".into());
        }
        if check.debt_increase {
            if check.new_icr < self.ccr {
                return ModeValidation::Blocked(format!(
                    "borrowing to ratio {} below CCR {}",
                    check.new_icr, self.ccr
                ));
            }
            if check.new_tcr < check.old_tcr {
                return ModeValidation::Blocked(format!(
                    "borrowing lowers TCR from {} to {}",
                    check.old_tcr, check.new_tcr
                ));
            }
        }
        ModeValidation::Allowed
    }

    fn require_tcr_above_ccr(&self, new_tcr: FixedPoint) -> Result<()> {
        if new_tcr < self.ccr {
            return ModeValidation::Blocked(format!(
                "operation would lower TCR to {} below CCR {}",
                new_tcr, self.ccr
            ))
            .to_result();
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
