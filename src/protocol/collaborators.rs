//! External collaborators of the lending core.
//!
//! The core never moves assets itself. It records what must move as a list
//! of [`Transfer`]s and settles them against three collaborators once all
//! internal bookkeeping is done:
//!
//! - [`PriceOracle`]: pull-based collateral price
//! - [`DebtToken`]: the debt-token ledger; only the core may mint, burn or move
//! - [`CollateralCustody`]: balance bookkeeping for the collateral pools
//!
//! In-memory implementations are provided for tests and embedding.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::core::position::AccountId;
use crate::error::{Error, Result};
use crate::utils::math::FixedPoint;
use crate::utils::validation::validate_price;

// ═══════════════════════════════════════════════════════════════════════════════
// HOLDERS AND POOLS
// ═══════════════════════════════════════════════════════════════════════════════

/// Owner of a debt-token balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TokenHolder {
    /// A user account
    Account(AccountId),
    /// Tokens locked in the stability pool
    StabilityPool,
}

impl fmt::Display for TokenHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenHolder::Account(id) => write!(f, "{}", id),
            TokenHolder::StabilityPool => write!(f, "stability-pool"),
        }
    }
}

/// Collateral custody pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CustodyPool {
    /// Collateral backing open positions
    Active,
    /// Redistributed collateral not yet applied to positions
    Default,
    /// Collateral owed to stability depositors
    Stability,
}

impl fmt::Display for CustodyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CustodyPool::Active => write!(f, "active-pool"),
            CustodyPool::Default => write!(f, "default-pool"),
            CustodyPool::Stability => write!(f, "stability-collateral"),
        }
    }
}

/// Destination of collateral leaving a custody pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    /// Paid out to an account
    Account(AccountId),
    /// Moved into another custody pool
    Pool(CustodyPool),
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSFERS
// ═══════════════════════════════════════════════════════════════════════════════

/// One asset movement owed by a completed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transfer {
    /// Create debt tokens
    Mint {
        /// Credited holder
        to: TokenHolder,
        /// Amount
        amount: FixedPoint,
    },
    /// Destroy debt tokens
    Burn {
        /// Debited holder
        from: TokenHolder,
        /// Amount
        amount: FixedPoint,
    },
    /// Move debt tokens between holders
    MoveDebt {
        /// Debited holder
        from: TokenHolder,
        /// Credited holder
        to: TokenHolder,
        /// Amount
        amount: FixedPoint,
    },
    /// Collateral arriving from outside
    CollateralIn {
        /// Receiving pool
        pool: CustodyPool,
        /// Amount
        amount: FixedPoint,
    },
    /// Collateral leaving a pool
    CollateralOut {
        /// Source pool
        pool: CustodyPool,
        /// Destination
        to: Recipient,
        /// Amount
        amount: FixedPoint,
    },
}

impl Transfer {
    /// Amount carried by the transfer
    pub fn amount(&self) -> FixedPoint {
        match self {
            Transfer::Mint { amount, .. }
            | Transfer::Burn { amount, .. }
            | Transfer::MoveDebt { amount, .. }
            | Transfer::CollateralIn { amount, .. }
            | Transfer::CollateralOut { amount, .. } => *amount,
        }
    }
}

/// Ordered list of transfers, skipping zero amounts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outbox {
    transfers: Vec<Transfer>,
}

impl Outbox {
    /// Create an empty outbox
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a transfer unless its amount is zero
    pub fn push(&mut self, transfer: Transfer) {
        if !transfer.amount().is_zero() {
            self.transfers.push(transfer);
        }
    }

    /// Queued transfers in settlement order
    pub fn transfers(&self) -> &[Transfer] {
        &self.transfers
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COLLABORATOR TRAITS
// ═══════════════════════════════════════════════════════════════════════════════

/// Source of the collateral price
pub trait PriceOracle {
    /// Current price of one unit of collateral in debt-token units
    fn current_price(&self) -> Result<FixedPoint>;
}

/// Debt-token ledger
///
/// Every mutating call names its caller; implementations reject anyone
/// but [`AccountId::CORE`].
pub trait DebtToken {
    /// Create `amount` tokens for `to`
    fn mint(&mut self, caller: AccountId, to: TokenHolder, amount: FixedPoint) -> Result<()>;

    /// Destroy `amount` tokens held by `from`
    fn burn(&mut self, caller: AccountId, from: TokenHolder, amount: FixedPoint) -> Result<()>;

    /// Move `amount` tokens from one holder to another
    fn move_between_pools(
        &mut self,
        caller: AccountId,
        from: TokenHolder,
        to: TokenHolder,
        amount: FixedPoint,
    ) -> Result<()>;

    /// Balance of a holder
    fn balance_of(&self, holder: TokenHolder) -> FixedPoint;

    /// Total tokens in existence
    fn total_supply(&self) -> FixedPoint;
}

/// Collateral custody bookkeeping
pub trait CollateralCustody {
    /// Record collateral arriving into `pool`
    fn record_in(&mut self, pool: CustodyPool, amount: FixedPoint) -> Result<()>;

    /// Record collateral leaving `pool` for `to`
    fn record_out(&mut self, pool: CustodyPool, to: Recipient, amount: FixedPoint) -> Result<()>;

    /// Balance of a pool
    fn balance_of(&self, pool: CustodyPool) -> FixedPoint;
}

// ═══════════════════════════════════════════════════════════════════════════════
// IN-MEMORY IMPLEMENTATIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// Oracle returning a settable price
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedPriceOracle {
    price: FixedPoint,
}

impl FixedPriceOracle {
    /// Create an oracle quoting `price`
    pub fn new(price: FixedPoint) -> Self {
        Self { price }
    }

    /// Change the quoted price
    pub fn set_price(&mut self, price: FixedPoint) {
        self.price = price;
    }
}

impl PriceOracle for FixedPriceOracle {
    fn current_price(&self) -> Result<FixedPoint> {
        validate_price(self.price).map_err(|e| Error::Oracle(e.to_string()))?;
        Ok(self.price)
    }
}

/// Debt token kept in memory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InMemoryDebtToken {
    balances: BTreeMap<TokenHolder, FixedPoint>,
    total_supply: FixedPoint,
}

impl InMemoryDebtToken {
    /// Create an empty token ledger
    pub fn new() -> Self {
        Self::default()
    }

    fn authorize(caller: AccountId) -> Result<()> {
        if caller != AccountId::CORE {
            return Err(Error::Unauthorized(format!("{} may not move debt tokens", caller)));
        }
        Ok(())
    }

    fn debit(&mut self, holder: TokenHolder, amount: FixedPoint) -> Result<()> {
        let available = self.balance_of(holder);
        if available < amount {
            return Err(Error::InsufficientBalance {
                holder: holder.to_string(),
                required: amount,
                available,
            });
        }
        let remaining = available.checked_sub(amount)?;
        if remaining.is_zero() {
            self.balances.remove(&holder);
        } else {
            self.balances.insert(holder, remaining);
        }
        Ok(())
    }

    fn credit(&mut self, holder: TokenHolder, amount: FixedPoint) -> Result<()> {
        let balance = self.balance_of(holder).checked_add(amount)?;
        self.balances.insert(holder, balance);
        Ok(())
    }
}

impl DebtToken for InMemoryDebtToken {
    fn mint(&mut self, caller: AccountId, to: TokenHolder, amount: FixedPoint) -> Result<()> {
        Self::authorize(caller)?;
        let supply = self.total_supply.checked_add(amount)?;
        self.credit(to, amount)?;
        self.total_supply = supply;
        Ok(())
    }

    fn burn(&mut self, caller: AccountId, from: TokenHolder, amount: FixedPoint) -> Result<()> {
        Self::authorize(caller)?;
        self.debit(from, amount)?;
        self.total_supply = self.total_supply.saturating_sub(amount);
        Ok(())
    }

    fn move_between_pools(
        &mut self,
        caller: AccountId,
        from: TokenHolder,
        to: TokenHolder,
        amount: FixedPoint,
    ) -> Result<()> {
        Self::authorize(caller)?;
        if from == to {
            return Ok(());
        }
        self.debit(from, amount)?;
        self.credit(to, amount)
    }

    fn balance_of(&self, holder: TokenHolder) -> FixedPoint {
        self.balances.get(&holder).copied().unwrap_or(FixedPoint::ZERO)
    }

    fn total_supply(&self) -> FixedPoint {
        self.total_supply
    }
}

/// Custody kept in memory, with per-account payout totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InMemoryCustody {
    pools: BTreeMap<CustodyPool, FixedPoint>,
    paid_out: BTreeMap<AccountId, FixedPoint>,
}

impl InMemoryCustody {
    /// Create empty custody
    pub fn new() -> Self {
        Self::default()
    }

    /// Collateral paid out to an account so far
    pub fn paid_to(&self, account: AccountId) -> FixedPoint {
        self.paid_out.get(&account).copied().unwrap_or(FixedPoint::ZERO)
    }

    /// Sum over all pools
    pub fn total_held(&self) -> FixedPoint {
        self.pools
            .values()
            .fold(FixedPoint::ZERO, |acc, v| acc.saturating_add(*v))
    }
}

impl CollateralCustody for InMemoryCustody {
    fn record_in(&mut self, pool: CustodyPool, amount: FixedPoint) -> Result<()> {
        let balance = self.balance_of(pool).checked_add(amount)?;
        self.pools.insert(pool, balance);
        Ok(())
    }

    fn record_out(&mut self, pool: CustodyPool, to: Recipient, amount: FixedPoint) -> Result<()> {
        let available = self.balance_of(pool);
        if available < amount {
            return Err(Error::InsufficientBalance {
                holder: pool.to_string(),
                required: amount,
                available,
            });
        }
        self.pools.insert(pool, available.checked_sub(amount)?);
        match to {
            Recipient::Pool(target) => self.record_in(target, amount),
            Recipient::Account(account) => {
                let paid = self.paid_to(account).checked_add(amount)?;
                self.paid_out.insert(account, paid);
                Ok(())
            }
        }
    }

    fn balance_of(&self, pool: CustodyPool) -> FixedPoint {
        self.pools.get(&pool).copied().unwrap_or(FixedPoint::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn units(n: u64) -> FixedPoint {
        FixedPoint::from_integer(n)
    }

    #[test]
    fn test_token_requires_core_caller() {
        let mut token = InMemoryDebtToken::new();
        let alice = TokenHolder::Account(AccountId(1));

        let err = token.mint(AccountId(1), alice, units(10)).unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));

        token.mint(AccountId::CORE, alice, units(10)).unwrap();
        assert_eq!(token.balance_of(alice), units(10));
        assert_eq!(token.total_supply(), units(10));
    }

    #[test]
    fn test_token_move_and_burn() {
        let mut token = InMemoryDebtToken::new();
        let alice = TokenHolder::Account(AccountId(1));
        token.mint(AccountId::CORE, alice, units(10)).unwrap();

        token
            .move_between_pools(AccountId::CORE, alice, TokenHolder::StabilityPool, units(4))
            .unwrap();
        assert_eq!(token.balance_of(TokenHolder::StabilityPool), units(4));

        token.burn(AccountId::CORE, TokenHolder::StabilityPool, units(4)).unwrap();
        assert_eq!(token.total_supply(), units(6));
        assert!(matches!(
            token.burn(AccountId::CORE, alice, units(7)),
            Err(Error::InsufficientBalance { .. })
        ));
    }

    #[test]
    fn test_custody_moves() {
        let mut custody = InMemoryCustody::new();
        custody.record_in(CustodyPool::Active, units(5)).unwrap();
        custody
            .record_out(CustodyPool::Active, Recipient::Pool(CustodyPool::Stability), units(2))
            .unwrap();
        custody
            .record_out(CustodyPool::Stability, Recipient::Account(AccountId(3)), units(1))
            .unwrap();

        assert_eq!(custody.balance_of(CustodyPool::Active), units(3));
        assert_eq!(custody.balance_of(CustodyPool::Stability), units(1));
        assert_eq!(custody.paid_to(AccountId(3)), units(1));
        assert_eq!(custody.total_held(), units(4));
        assert!(custody
            .record_out(CustodyPool::Default, Recipient::Account(AccountId(3)), units(1))
            .is_err());
    }

    #[test]
    fn test_outbox_skips_zero() {
        let mut outbox = Outbox::new();
        outbox.push(Transfer::CollateralIn {
            pool: CustodyPool::Active,
            amount: FixedPoint::ZERO,
        });
        assert!(outbox.is_empty());
        outbox.push(Transfer::Mint {
            to: TokenHolder::StabilityPool,
            amount: units(1),
        });
        assert_eq!(outbox.transfers().len(), 1);
    }

    #[test]
    fn test_oracle_rejects_zero_price() {
        let mut oracle = FixedPriceOracle::new(units(200));
        assert_eq!(oracle.current_price().unwrap(), units(200));
        oracle.set_price(FixedPoint::ZERO);
        assert!(matches!(oracle.current_price(), Err(Error::Oracle(_))));
    }
}
