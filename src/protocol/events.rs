//! Protocol events for state change notifications.
//!
//! Every successful entry point appends one or more events. The log is
//! bounded: once it holds `max_events` entries the oldest are dropped.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::core::position::{AccountId, PositionStatus};
use crate::error::Result;
use crate::liquidation::engine::LiquidationKind;
use crate::liquidation::recovery::SystemMode;
use crate::utils::digest::Hash;
use crate::utils::math::FixedPoint;

// ═══════════════════════════════════════════════════════════════════════════════
// EVENT TYPES
// ═══════════════════════════════════════════════════════════════════════════════

/// All protocol event types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolEvent {
    /// Position opened, adjusted or closed by its owner
    PositionUpdated(PositionUpdatedEvent),
    /// Position liquidated, fully or partially
    PositionLiquidated(PositionLiquidatedEvent),
    /// Debt tokens provided to the stability pool
    PoolDeposit(PoolDepositEvent),
    /// Debt tokens withdrawn from the stability pool
    PoolWithdrawal(PoolWithdrawalEvent),
    /// Collateral gain paid out without changing the deposit
    GainClaimed(GainClaimedEvent),
    /// Overstaying cohort cleared by an operator
    CohortCleared(CohortClearedEvent),
    /// Operator added to the allow-list
    OperatorAdded(OperatorAddedEvent),
}

impl ProtocolEvent {
    /// Get the event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PositionUpdated(_) => "PositionUpdated",
            Self::PositionLiquidated(_) => "PositionLiquidated",
            Self::PoolDeposit(_) => "PoolDeposit",
            Self::PoolWithdrawal(_) => "PoolWithdrawal",
            Self::GainClaimed(_) => "GainClaimed",
            Self::CohortCleared(_) => "CohortCleared",
            Self::OperatorAdded(_) => "OperatorAdded",
        }
    }

    /// Account the event is about
    pub fn account(&self) -> AccountId {
        match self {
            Self::PositionUpdated(e) => e.owner,
            Self::PositionLiquidated(e) => e.owner,
            Self::PoolDeposit(e) => e.depositor,
            Self::PoolWithdrawal(e) => e.depositor,
            Self::GainClaimed(e) => e.depositor,
            Self::CohortCleared(e) => e.operator,
            Self::OperatorAdded(e) => e.operator,
        }
    }

    /// Compute event hash
    pub fn hash(&self) -> Result<Hash> {
        Hash::of_serialized(self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// POSITION EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Emitted after open, adjust and close
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionUpdatedEvent {
    /// Position owner
    pub owner: AccountId,
    /// Status after the operation
    pub status: PositionStatus,
    /// Collateral after the operation
    pub collateral: FixedPoint,
    /// Debt after the operation
    pub debt: FixedPoint,
    /// Stake after the operation
    pub stake: FixedPoint,
    /// System mode the operation ran under
    pub mode: SystemMode,
}

/// Emitted for every liquidated position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionLiquidatedEvent {
    /// Position owner
    pub owner: AccountId,
    /// How the debt was absorbed
    pub kind: LiquidationKind,
    /// Ratio at liquidation
    pub icr: FixedPoint,
    /// Debt absorbed by the stability pool
    pub debt_offset: FixedPoint,
    /// Debt redistributed to remaining positions
    pub debt_redistributed: FixedPoint,
    /// Collateral sent to the stability pool
    pub collateral_offset: FixedPoint,
    /// Collateral redistributed to remaining positions
    pub collateral_redistributed: FixedPoint,
    /// System mode at liquidation
    pub mode: SystemMode,
}

// ═══════════════════════════════════════════════════════════════════════════════
// STABILITY POOL EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Emitted on provide
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDepositEvent {
    /// Depositor
    pub depositor: AccountId,
    /// Amount provided
    pub amount: FixedPoint,
    /// Deposit value after the operation
    pub new_deposit: FixedPoint,
    /// Collateral gain paid out
    pub collateral_gain: FixedPoint,
}

/// Emitted on withdraw, including frozen no-op withdrawals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolWithdrawalEvent {
    /// Depositor
    pub depositor: AccountId,
    /// Debt tokens returned
    pub amount: FixedPoint,
    /// Collateral gain paid out
    pub collateral_gain: FixedPoint,
    /// Deposit value left behind
    pub remaining: FixedPoint,
    /// True if an overstay froze the withdrawal
    pub frozen: bool,
}

/// Emitted on claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GainClaimedEvent {
    /// Depositor
    pub depositor: AccountId,
    /// Collateral gain paid out
    pub collateral_gain: FixedPoint,
}

/// Emitted when an operator clears a stale cohort
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CohortClearedEvent {
    /// Operator that triggered the clearance
    pub operator: AccountId,
    /// Cohort id
    pub cohort: u64,
    /// Number of depositors paid out
    pub members: usize,
    /// Collateral paid out in total
    pub collateral_paid: FixedPoint,
    /// Shortfall drained
    pub shortfall: FixedPoint,
}

// ═══════════════════════════════════════════════════════════════════════════════
// ADMIN EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Emitted when the allow-list grows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorAddedEvent {
    /// Operator that made the change
    pub operator: AccountId,
    /// Newly allowed operator
    pub added: AccountId,
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVENT LOG
// ═══════════════════════════════════════════════════════════════════════════════

/// Sequenced event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedEvent {
    /// Monotonic sequence number, never reused
    pub sequence: u64,
    /// Event payload
    pub event: ProtocolEvent,
}

/// Bounded, sequenced event log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLog {
    events: VecDeque<LoggedEvent>,
    next_sequence: u64,
    max_events: usize,
}

impl EventLog {
    /// Create a new empty event log holding at most `max_events`
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::new(),
            next_sequence: 0,
            max_events,
        }
    }

    /// Add an event to the log, returning its sequence number
    pub fn push(&mut self, event: ProtocolEvent) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.events.push_back(LoggedEvent { sequence, event });
        while self.events.len() > self.max_events {
            self.events.pop_front();
        }
        sequence
    }

    /// Get all retained events, oldest first
    pub fn events(&self) -> impl Iterator<Item = &LoggedEvent> + '_ {
        self.events.iter()
    }

    /// Most recent event
    pub fn last(&self) -> Option<&LoggedEvent> {
        self.events.back()
    }

    /// Get events of a specific type
    pub fn filter_by_type(&self, event_type: &str) -> Vec<&LoggedEvent> {
        self.events
            .iter()
            .filter(|e| e.event.event_type() == event_type)
            .collect()
    }

    /// Get events about one account
    pub fn filter_by_account(&self, account: AccountId) -> Vec<&LoggedEvent> {
        self.events
            .iter()
            .filter(|e| e.event.account() == account)
            .collect()
    }

    /// Total events ever pushed
    pub fn total_pushed(&self) -> u64 {
        self.next_sequence
    }

    /// Get the number of retained events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Clear retained events; sequence numbers keep counting
    pub fn clear(&mut self) {
        self.events.clear();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn deposit_event(id: u64, amount: u64) -> ProtocolEvent {
        ProtocolEvent::PoolDeposit(PoolDepositEvent {
            depositor: AccountId(id),
            amount: FixedPoint::from_integer(amount),
            new_deposit: FixedPoint::from_integer(amount),
            collateral_gain: FixedPoint::ZERO,
        })
    }

    #[test]
    fn test_event_types() {
        let event = deposit_event(1, 100);
        assert_eq!(event.event_type(), "PoolDeposit");
        assert_eq!(event.account(), AccountId(1));

        let added = ProtocolEvent::OperatorAdded(OperatorAddedEvent {
            operator: AccountId(9),
            added: AccountId(10),
        });
        assert_eq!(added.event_type(), "OperatorAdded");
        assert_eq!(added.account(), AccountId(9));
    }

    #[test]
    fn test_event_log() {
        let mut log = EventLog::new(10);
        assert!(log.is_empty());

        log.push(deposit_event(1, 100));
        log.push(ProtocolEvent::GainClaimed(GainClaimedEvent {
            depositor: AccountId(2),
            collateral_gain: FixedPoint::from_integer(1),
        }));

        assert_eq!(log.len(), 2);
        assert_eq!(log.filter_by_type("PoolDeposit").len(), 1);
        assert_eq!(log.filter_by_account(AccountId(2)).len(), 1);
        assert_eq!(log.last().unwrap().sequence, 1);
    }

    #[test]
    fn test_event_log_bounded() {
        let mut log = EventLog::new(3);
        for i in 0..5 {
            log.push(deposit_event(i, 1));
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.total_pushed(), 5);
        assert_eq!(log.events().next().unwrap().sequence, 2);

        log.clear();
        assert!(log.is_empty());
        assert_eq!(log.push(deposit_event(1, 1)), 5);
    }

    #[test]
    fn test_event_hash_distinguishes_payload() {
        let a = deposit_event(1, 100).hash().unwrap();
        let b = deposit_event(1, 101).hash().unwrap();
        assert_ne!(a, b);
        assert_eq!(a, deposit_event(1, 100).hash().unwrap());
    }
}
