//! Liquidation module for the Stabilio lending core.
//!
//! This module handles liquidations and the stability pool:
//! - Recovery mode governor deciding the system-wide risk mode
//! - Stability pool absorbing liquidated debt through compounding deposits
//! - Cohort tracking for depositors that outlive a drained pool
//! - Liquidation engine splitting debt between pool and redistribution

pub mod cohort;
pub mod engine;
pub mod recovery;
pub mod stability_pool;

pub use cohort::*;
pub use engine::*;
pub use recovery::*;
pub use stability_pool::*;
