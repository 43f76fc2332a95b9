//! Error types for the Stabilio lending core.
//!
//! Every failing operation aborts with one of these errors and leaves the
//! ledger untouched. [`Error::kind`] folds the variants into the coarse
//! categories callers branch on.

use thiserror::Error;

use crate::utils::math::FixedPoint;

/// Result type alias for Stabilio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller is not on the allow-list for the entry point
    Authorization,
    /// The operation would break a ledger invariant
    InvariantViolation,
    /// Forbidden while the system is in Recovery Mode
    ModeRestriction,
    /// Position or deposit is in the wrong lifecycle state
    State,
    /// Malformed input
    Validation,
    /// Checked arithmetic failed
    Arithmetic,
    /// An external collaborator refused or failed
    Collaborator,
    /// Encoding or configuration I/O failed
    Serialization,
    /// Bug or broken internal assumption
    Internal,
}

/// Main error type for the Stabilio lending core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // ═══════════════════════════════════════════════════════════════════
    // Authorization Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Not authorized to perform this action
    #[error("Not authorized: {0}")]
    Unauthorized(String),

    // ═══════════════════════════════════════════════════════════════════
    // Invariant Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Invariant violation detected
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Collateral ratio below the required floor
    #[error("Collateral ratio {current} below minimum {minimum}")]
    CollateralRatioTooLow {
        /// Resulting ratio
        current: FixedPoint,
        /// Required ratio
        minimum: FixedPoint,
    },

    /// Debt amount below protocol minimum
    #[error("Debt amount {amount} below minimum {minimum}")]
    DebtBelowMinimum {
        /// Requested debt amount
        amount: FixedPoint,
        /// Protocol minimum debt
        minimum: FixedPoint,
    },

    // ═══════════════════════════════════════════════════════════════════
    // Mode Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Operation forbidden in recovery mode
    #[error("Not allowed in recovery mode: {0}")]
    RecoveryMode(String),

    // ═══════════════════════════════════════════════════════════════════
    // State Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Position not found in the ledger
    #[error("Position not found: {0}")]
    PositionNotFound(String),

    /// Position exists but is in the wrong lifecycle state
    #[error("Position {id} is {status}, expected {expected}")]
    InvalidPositionState {
        /// Position owner
        id: String,
        /// Current status
        status: String,
        /// Status required by the operation
        expected: String,
    },

    /// No stability deposit for this account
    #[error("No stability deposit for {0}")]
    DepositNotFound(String),

    /// Stability pool holds no deposits
    #[error("Stability pool is empty")]
    EmptyStabilityPool,

    /// Redistribution needs at least one other active stake
    #[error("No remaining stake to redistribute to")]
    NoRemainingStake,

    /// The oldest cohort with members has not been drained yet
    #[error("Cohort {cohort} is still current (pool epoch {epoch})")]
    CohortNotStale {
        /// Oldest cohort id with members
        cohort: u64,
        /// Current pool epoch
        epoch: u64,
    },

    /// No cohort has members
    #[error("No active cohort to clear")]
    NoActiveCohort,

    /// Position is healthy under the current mode
    #[error("Position {id} is not liquidatable at ratio {icr}")]
    NotLiquidatable {
        /// Position owner
        id: String,
        /// Ratio at the time of the attempt
        icr: FixedPoint,
    },

    // ═══════════════════════════════════════════════════════════════════
    // Validation Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Invalid input parameter
    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter {
        /// Parameter name
        name: String,
        /// Reason for invalidity
        reason: String,
    },

    /// Amount is zero
    #[error("Amount cannot be zero")]
    ZeroAmount,

    // ═══════════════════════════════════════════════════════════════════
    // Arithmetic Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Overflow in calculation
    #[error("Arithmetic overflow in {operation}")]
    Overflow {
        /// Operation that overflowed
        operation: String,
    },

    /// Underflow in calculation
    #[error("Arithmetic underflow in {operation}")]
    Underflow {
        /// Operation that underflowed
        operation: String,
    },

    /// Division by zero
    #[error("Division by zero in {operation}")]
    DivisionByZero {
        /// Operation that divided by zero
        operation: String,
    },

    // ═══════════════════════════════════════════════════════════════════
    // Collaborator Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Price oracle failure
    #[error("Oracle error: {0}")]
    Oracle(String),

    /// A token or custody balance is too small for a settlement
    #[error("Insufficient balance for {holder}: required {required}, available {available}")]
    InsufficientBalance {
        /// Holder being debited
        holder: String,
        /// Amount required
        required: FixedPoint,
        /// Amount available
        available: FixedPoint,
    },

    // ═══════════════════════════════════════════════════════════════════
    // Serialization Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization failed
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Configuration could not be loaded or saved
    #[error("Configuration error: {0}")]
    Config(String),

    // ═══════════════════════════════════════════════════════════════════
    // Internal Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Internal error (should not happen in production)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Unauthorized(_) => ErrorKind::Authorization,

            Error::InvariantViolation(_)
            | Error::CollateralRatioTooLow { .. }
            | Error::DebtBelowMinimum { .. } => ErrorKind::InvariantViolation,

            Error::RecoveryMode(_) => ErrorKind::ModeRestriction,

            Error::PositionNotFound(_)
            | Error::InvalidPositionState { .. }
            | Error::DepositNotFound(_)
            | Error::EmptyStabilityPool
            | Error::NoRemainingStake
            | Error::CohortNotStale { .. }
            | Error::NoActiveCohort
            | Error::NotLiquidatable { .. } => ErrorKind::State,

            Error::InvalidParameter { .. } | Error::ZeroAmount => ErrorKind::Validation,

            Error::Overflow { .. } | Error::Underflow { .. } | Error::DivisionByZero { .. } => {
                ErrorKind::Arithmetic
            }

            Error::Oracle(_) | Error::InsufficientBalance { .. } => ErrorKind::Collaborator,

            Error::Serialization(_) | Error::Deserialization(_) | Error::Config(_) => {
                ErrorKind::Serialization
            }

            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::CollateralRatioTooLow { .. }
                | Error::DebtBelowMinimum { .. }
                | Error::RecoveryMode(_)
                | Error::EmptyStabilityPool
                | Error::InsufficientBalance { .. }
                | Error::Oracle(_)
        )
    }

    /// Returns true if this is a critical error requiring immediate attention
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Error::Internal(_)
                | Error::Overflow { .. }
                | Error::Underflow { .. }
                | Error::DivisionByZero { .. }
        )
    }

    /// Returns the error code for external systems
    pub fn code(&self) -> u32 {
        match self {
            // Authorization errors: 1xxx
            Error::Unauthorized(_) => 1001,

            // Invariant errors: 2xxx
            Error::InvariantViolation(_) => 2001,
            Error::CollateralRatioTooLow { .. } => 2002,
            Error::DebtBelowMinimum { .. } => 2003,

            // Mode errors: 3xxx
            Error::RecoveryMode(_) => 3001,

            // State errors: 4xxx
            Error::PositionNotFound(_) => 4001,
            Error::InvalidPositionState { .. } => 4002,
            Error::DepositNotFound(_) => 4003,
            Error::EmptyStabilityPool => 4004,
            Error::NoRemainingStake => 4005,
            Error::CohortNotStale { .. } => 4006,
            Error::NoActiveCohort => 4007,
            Error::NotLiquidatable { .. } => 4008,

            // Validation errors: 5xxx
            Error::InvalidParameter { .. } => 5001,
            Error::ZeroAmount => 5002,

            // Arithmetic errors: 6xxx
            Error::Overflow { .. } => 6001,
            Error::Underflow { .. } => 6002,
            Error::DivisionByZero { .. } => 6003,

            // Collaborator errors: 7xxx
            Error::Oracle(_) => 7001,
            Error::InsufficientBalance { .. } => 7002,

            // Serialization errors: 8xxx
            Error::Serialization(_) => 8001,
            Error::Deserialization(_) => 8002,
            Error::Config(_) => 8003,

            // Internal errors: 9xxx
            Error::Internal(_) => 9001,
        }
    }
}
