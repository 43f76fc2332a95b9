//! Utility modules for the Stabilio core.
//!
//! This module contains shared utilities used across the protocol:
//! - Fixed-point arithmetic
//! - Validation helpers
//! - State digests
//! - Logging setup
//! - Constants

pub mod constants;
pub mod digest;
pub mod logging;
pub mod math;
pub mod validation;

pub use constants::*;
pub use digest::Hash;
pub use math::*;
pub use validation::*;
