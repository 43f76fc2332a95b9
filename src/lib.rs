//! # Stabilio
//!
//! The accounting core of an over-collateralized lending protocol: borrowers
//! lock collateral and mint a debt token, and under-collateralized positions
//! are liquidated against a stability pool or redistributed to the remaining
//! borrowers.
//!
//! ## Architecture
//!
//! - **Core**: parameters, the position ledger, its ordered index and the
//!   redistribution accumulator
//! - **Liquidation**: recovery-mode governor, compounding stability pool,
//!   overstay cohort tracker and the liquidation engine
//! - **Protocol**: the owned ledger exposing every entry point, settling
//!   against external oracle, debt-token and custody collaborators
//!
//! All amounts are 18-decimal [`FixedPoint`](utils::math::FixedPoint)
//! values. Per-operation cost is independent of the number of positions
//! and depositors, apart from index maintenance.
//!
//! ## Example
//!
//! ```rust
//! use stabilio::prelude::*;
//!
//! stabilio::utils::logging::init_tracing(tracing::Level::WARN)?;
//! let mut protocol = Protocol::new(
//!     ProtocolParams::default(),
//!     [AccountId(100)],
//!     FixedPriceOracle::new(FixedPoint::from_integer(200)),
//!     InMemoryDebtToken::new(),
//!     InMemoryCustody::new(),
//! )?;
//!
//! let alice = AccountId(1);
//! protocol.open_position(
//!     alice,
//!     FixedPoint::from_integer(10),
//!     FixedPoint::from_integer(1000),
//!     None,
//! )?;
//! protocol.provide_to_pool(alice, FixedPoint::from_integer(500))?;
//! assert_eq!(protocol.deposit_value(alice)?, FixedPoint::from_integer(500));
//! # Ok::<(), stabilio::error::Error>(())
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    trivial_casts,
    unused_lifetimes,
    unused_qualifications
)]

pub mod core;
pub mod error;
pub mod liquidation;
pub mod protocol;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::core::{
        config::ProtocolParams,
        position::{AccountId, Position, PositionAdjustment, PositionLedger, PositionStatus},
        redistribution::RedistributionAccumulator,
        sorted::InsertHint,
    };
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::liquidation::{
        cohort::OverstayCohortTracker,
        engine::{LiquidationEngine, LiquidationKind, LiquidationRecord},
        recovery::{RecoveryModeGovernor, SystemMode},
        stability_pool::StabilityPool,
    };
    pub use crate::protocol::{
        collaborators::{
            CollateralCustody, CustodyPool, DebtToken, FixedPriceOracle, InMemoryCustody,
            InMemoryDebtToken, PriceOracle, TokenHolder,
        },
        events::{EventLog, ProtocolEvent},
        ledger::{LedgerState, Protocol},
    };
    pub use crate::utils::{digest::Hash, math::FixedPoint};
}

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol name
pub const PROTOCOL_NAME: &str = "Stabilio";
