//! Core modules for the Stabilio lending core.
//!
//! This module contains the fundamental building blocks:
//! - Configuration and protocol parameters
//! - Position ledger with lifecycle and stake bookkeeping
//! - Redistribution accumulator for un-offset liquidations
//! - Sorted index of active positions

pub mod config;
pub mod position;
pub mod redistribution;
pub mod sorted;

pub use config::*;
pub use position::*;
pub use redistribution::*;
pub use sorted::*;
