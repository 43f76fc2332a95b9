//! Protocol module - the owned ledger and its collaborators.
//!
//! [`ledger::Protocol`] is the only way to mutate the lending core. It
//! settles every operation against the [`collaborators`] after all
//! internal bookkeeping is done and records what happened in the
//! [`events`] log.

pub mod collaborators;
pub mod events;
pub mod ledger;

pub use collaborators::*;
pub use events::*;
pub use ledger::*;
