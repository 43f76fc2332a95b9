//! Protocol ledger - the single owned entry point to the lending core.
//!
//! [`Protocol`] owns the internal [`LedgerState`] and the three external
//! collaborators. Every entry point runs the same way:
//!
//! 1. read the price once and derive the system mode once
//! 2. snapshot the ledger state
//! 3. mutate the ledger, queueing the asset movements it implies
//! 4. preflight the queued transfers against collaborator balances
//! 5. settle them with the collaborators
//!
//! A failure in any step restores the snapshot, so a rejected call leaves
//! no trace. No collaborator is called before all internal bookkeeping
//! has finished.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::core::config::ProtocolParams;
use crate::core::position::{
    AccountId, Position, PositionAdjustment, PositionChange, PositionLedger, PositionStatistics,
};
use crate::core::redistribution::PendingReward;
use crate::core::sorted::InsertHint;
use crate::error::{Error, Result};
use crate::liquidation::engine::{
    BatchLiquidation, LiquidationEngine, LiquidationRecord, LiquidationStats,
};
use crate::liquidation::recovery::{MarketContext, RecoveryModeGovernor, RecoveryModeStatus, SystemMode};
use crate::liquidation::stability_pool::{
    CohortClearance, PoolDeposit, PoolWithdrawal, StabilityPool, StabilityPoolStats,
};
use crate::protocol::collaborators::{
    CollateralCustody, CustodyPool, DebtToken, Outbox, PriceOracle, Recipient, TokenHolder,
    Transfer,
};
use crate::protocol::events::*;
use crate::utils::digest::Hash;
use crate::utils::math::FixedPoint;
use crate::utils::validation::validate_price;

// ═══════════════════════════════════════════════════════════════════════════════
// LEDGER STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything the core owns, in one serializable value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerState {
    /// Protocol parameters
    pub params: ProtocolParams,
    /// Borrower positions
    pub positions: PositionLedger,
    /// Stability pool
    pub pool: StabilityPool,
    /// Liquidation history
    pub engine: LiquidationEngine,
    /// Event log
    pub events: EventLog,
    /// Identities allowed to call privileged entry points
    pub operators: BTreeSet<AccountId>,
}

impl LedgerState {
    /// Fresh state for `params`
    pub fn new(params: ProtocolParams) -> Self {
        Self {
            positions: PositionLedger::new(),
            pool: StabilityPool::new(&params),
            engine: LiquidationEngine::new(&params),
            events: EventLog::new(params.max_events),
            operators: BTreeSet::new(),
            params,
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }

    /// SHA-256 over the canonical encoding
    pub fn state_hash(&self) -> Result<Hash> {
        Ok(Hash::sha256(&self.to_bytes()?))
    }

    fn emit_position(&mut self, change: &PositionChange, mode: SystemMode) {
        let stake = self
            .positions
            .get(change.owner)
            .map(|p| p.stake)
            .unwrap_or(FixedPoint::ZERO);
        self.events.push(ProtocolEvent::PositionUpdated(PositionUpdatedEvent {
            owner: change.owner,
            status: change.status,
            collateral: change.collateral,
            debt: change.debt,
            stake,
            mode,
        }));
    }

    fn emit_liquidation(&mut self, record: &LiquidationRecord) {
        self.events.push(ProtocolEvent::PositionLiquidated(PositionLiquidatedEvent {
            owner: record.owner,
            kind: record.plan.kind,
            icr: record.icr,
            debt_offset: record.plan.debt_offset,
            debt_redistributed: record.plan.debt_redistributed,
            collateral_offset: record.plan.collateral_offset,
            collateral_redistributed: record.plan.collateral_redistributed,
            mode: record.mode,
        }));
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSFER PLANNING
// ═══════════════════════════════════════════════════════════════════════════════

/// Move redistributed collateral a position just absorbed back into the active pool
fn queue_reward(outbox: &mut Outbox, reward: &PendingReward) {
    outbox.push(Transfer::CollateralOut {
        pool: CustodyPool::Default,
        to: Recipient::Pool(CustodyPool::Active),
        amount: reward.collateral,
    });
}

fn queue_position_change(outbox: &mut Outbox, change: &PositionChange) {
    let account = TokenHolder::Account(change.owner);
    queue_reward(outbox, &change.reward_applied);
    outbox.push(Transfer::CollateralIn {
        pool: CustodyPool::Active,
        amount: change.collateral_in,
    });
    outbox.push(Transfer::Burn {
        from: account,
        amount: change.debt_burned,
    });
    outbox.push(Transfer::Mint {
        to: account,
        amount: change.debt_minted,
    });
    outbox.push(Transfer::CollateralOut {
        pool: CustodyPool::Active,
        to: Recipient::Account(change.owner),
        amount: change.collateral_out,
    });
}

fn queue_liquidation(outbox: &mut Outbox, record: &LiquidationRecord) {
    queue_reward(outbox, &record.reward_applied);
    outbox.push(Transfer::CollateralOut {
        pool: CustodyPool::Active,
        to: Recipient::Pool(CustodyPool::Stability),
        amount: record.plan.collateral_offset,
    });
    outbox.push(Transfer::CollateralOut {
        pool: CustodyPool::Active,
        to: Recipient::Pool(CustodyPool::Default),
        amount: record.plan.collateral_redistributed,
    });
    outbox.push(Transfer::Burn {
        from: TokenHolder::StabilityPool,
        amount: record.plan.debt_offset,
    });
}

fn queue_gain(outbox: &mut Outbox, owner: AccountId, gain: FixedPoint) {
    outbox.push(Transfer::CollateralOut {
        pool: CustodyPool::Stability,
        to: Recipient::Account(owner),
        amount: gain,
    });
}

/// Running balances used to preflight a transfer list
struct Balances<K> {
    balances: BTreeMap<K, FixedPoint>,
}

impl<K: Ord + Copy + fmt::Display> Balances<K> {
    fn new() -> Self {
        Self {
            balances: BTreeMap::new(),
        }
    }

    fn credit(&mut self, key: K, amount: FixedPoint, current: impl Fn(K) -> FixedPoint) -> Result<()> {
        let balance = *self.balances.entry(key).or_insert_with(|| current(key));
        self.balances.insert(key, balance.checked_add(amount)?);
        Ok(())
    }

    fn debit(&mut self, key: K, amount: FixedPoint, current: impl Fn(K) -> FixedPoint) -> Result<()> {
        let available = *self.balances.entry(key).or_insert_with(|| current(key));
        if available < amount {
            return Err(Error::InsufficientBalance {
                holder: key.to_string(),
                required: amount,
                available,
            });
        }
        self.balances.insert(key, available.checked_sub(amount)?);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROTOCOL
// ═══════════════════════════════════════════════════════════════════════════════

/// Aggregate view across the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolStatistics {
    /// Price the view was computed at
    pub price: FixedPoint,
    /// System mode
    pub mode: SystemMode,
    /// Total collateral ratio
    pub tcr: FixedPoint,
    /// Position counts and totals
    pub positions: PositionStatistics,
    /// Stability pool state
    pub pool: StabilityPoolStats,
    /// Liquidation totals
    pub liquidations: LiquidationStats,
    /// Events ever emitted
    pub events_emitted: u64,
}

/// The lending core together with its collaborators
pub struct Protocol<O, T, C> {
    state: LedgerState,
    governor: RecoveryModeGovernor,
    oracle: O,
    token: T,
    custody: C,
}

impl<O, T, C> Protocol<O, T, C>
where
    O: PriceOracle,
    T: DebtToken,
    C: CollateralCustody,
{
    /// Create a protocol with validated `params` and an initial operator set
    pub fn new(
        params: ProtocolParams,
        operators: impl IntoIterator<Item = AccountId>,
        oracle: O,
        token: T,
        custody: C,
    ) -> Result<Self> {
        params.validate()?;
        let mut state = LedgerState::new(params);
        state.operators.extend(operators);
        Self::from_state(state, oracle, token, custody)
    }

    /// Resume from a previously saved state
    pub fn from_state(state: LedgerState, oracle: O, token: T, custody: C) -> Result<Self> {
        state.params.validate()?;
        let governor = RecoveryModeGovernor::new(&state.params);
        tracing::info!(
            version = %state.params.version,
            operators = state.operators.len(),
            positions = state.positions.sorted().len(),
            "protocol ledger ready"
        );
        Ok(Self {
            state,
            governor,
            oracle,
            token,
            custody,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // EXECUTION
    // ═══════════════════════════════════════════════════════════════════════════

    fn price(&self) -> Result<FixedPoint> {
        let price = self.oracle.current_price()?;
        validate_price(price)?;
        Ok(price)
    }

    fn context(&self) -> Result<MarketContext> {
        self.governor.context(&self.state.positions.totals()?, self.price()?)
    }

    fn require_operator(&self, caller: AccountId) -> Result<()> {
        if !self.state.operators.contains(&caller) {
            return Err(Error::Unauthorized(format!("{} is not an operator", caller)));
        }
        Ok(())
    }

    /// Run `op` against the ledger and settle its transfers, or change nothing
    fn execute<R>(
        &mut self,
        name: &'static str,
        op: impl FnOnce(&mut LedgerState, &RecoveryModeGovernor, &MarketContext, &mut Outbox) -> Result<R>,
    ) -> Result<R> {
        let ctx = self.context()?;
        let snapshot = self.state.clone();
        let mut outbox = Outbox::new();

        let result = match op(&mut self.state, &self.governor, &ctx, &mut outbox) {
            Ok(value) => self.settle(&outbox).map(|_| value),
            Err(e) => Err(e),
        };
        match &result {
            Ok(_) => tracing::debug!(
                op = name,
                mode = %ctx.mode,
                transfers = outbox.transfers().len(),
                "operation settled"
            ),
            Err(e) => {
                tracing::debug!(op = name, error = %e, "operation rejected, state restored");
                self.state = snapshot;
            }
        }
        result
    }

    /// Check every transfer against running balances, then apply them all
    fn settle(&mut self, outbox: &Outbox) -> Result<()> {
        self.preflight(outbox)?;
        for transfer in outbox.transfers() {
            match *transfer {
                Transfer::Mint { to, amount } => self.token.mint(AccountId::CORE, to, amount)?,
                Transfer::Burn { from, amount } => self.token.burn(AccountId::CORE, from, amount)?,
                Transfer::MoveDebt { from, to, amount } => {
                    self.token.move_between_pools(AccountId::CORE, from, to, amount)?
                }
                Transfer::CollateralIn { pool, amount } => self.custody.record_in(pool, amount)?,
                Transfer::CollateralOut { pool, to, amount } => {
                    self.custody.record_out(pool, to, amount)?
                }
            }
        }
        Ok(())
    }

    fn preflight(&self, outbox: &Outbox) -> Result<()> {
        let mut tokens = Balances::<TokenHolder>::new();
        let mut pools = Balances::<CustodyPool>::new();
        let token_balance = |h: TokenHolder| self.token.balance_of(h);
        let pool_balance = |p: CustodyPool| self.custody.balance_of(p);

        for transfer in outbox.transfers() {
            match *transfer {
                Transfer::Mint { to, amount } => tokens.credit(to, amount, token_balance)?,
                Transfer::Burn { from, amount } => tokens.debit(from, amount, token_balance)?,
                Transfer::MoveDebt { from, to, amount } => {
                    tokens.debit(from, amount, token_balance)?;
                    tokens.credit(to, amount, token_balance)?;
                }
                Transfer::CollateralIn { pool, amount } => pools.credit(pool, amount, pool_balance)?,
                Transfer::CollateralOut { pool, to, amount } => {
                    pools.debit(pool, amount, pool_balance)?;
                    if let Recipient::Pool(target) = to {
                        pools.credit(target, amount, pool_balance)?;
                    }
                }
            }
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // BORROWER OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Open a position for `caller`
    pub fn open_position(
        &mut self,
        caller: AccountId,
        collateral: FixedPoint,
        debt: FixedPoint,
        hint: Option<InsertHint>,
    ) -> Result<PositionChange> {
        self.execute("open_position", |state, governor, ctx, outbox| {
            let change = state
                .positions
                .open(caller, collateral, debt, ctx, governor, &state.params, hint)?;
            queue_position_change(outbox, &change);
            state.emit_position(&change, ctx.mode);
            Ok(change)
        })
    }

    /// Adjust the caller's position
    pub fn adjust_position(
        &mut self,
        caller: AccountId,
        adjustment: PositionAdjustment,
        hint: Option<InsertHint>,
    ) -> Result<PositionChange> {
        self.execute("adjust_position", |state, governor, ctx, outbox| {
            let change = state
                .positions
                .adjust(caller, &adjustment, ctx, governor, &state.params, hint)?;
            queue_position_change(outbox, &change);
            state.emit_position(&change, ctx.mode);
            Ok(change)
        })
    }

    /// Close the caller's position, burning its debt and returning its collateral
    pub fn close_position(&mut self, caller: AccountId) -> Result<PositionChange> {
        self.execute("close_position", |state, governor, ctx, outbox| {
            let change = state.positions.close(caller, ctx, governor)?;
            queue_position_change(outbox, &change);
            state.emit_position(&change, ctx.mode);
            Ok(change)
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // STABILITY POOL OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Move `amount` debt tokens from the caller into the stability pool
    pub fn provide_to_pool(&mut self, caller: AccountId, amount: FixedPoint) -> Result<PoolDeposit> {
        self.execute("provide_to_pool", |state, _, _, outbox| {
            let deposit = state.pool.provide(caller, amount)?;
            outbox.push(Transfer::MoveDebt {
                from: TokenHolder::Account(caller),
                to: TokenHolder::StabilityPool,
                amount,
            });
            queue_gain(outbox, caller, deposit.collateral_gain);
            state.events.push(ProtocolEvent::PoolDeposit(PoolDepositEvent {
                depositor: caller,
                amount,
                new_deposit: deposit.deposit,
                collateral_gain: deposit.collateral_gain,
            }));
            Ok(deposit)
        })
    }

    /// Withdraw up to `amount` of the caller's compounded deposit
    pub fn withdraw_from_pool(&mut self, caller: AccountId, amount: FixedPoint) -> Result<PoolWithdrawal> {
        self.execute("withdraw_from_pool", |state, _, _, outbox| {
            let withdrawal = state.pool.withdraw(caller, amount)?;
            outbox.push(Transfer::MoveDebt {
                from: TokenHolder::StabilityPool,
                to: TokenHolder::Account(caller),
                amount: withdrawal.amount,
            });
            queue_gain(outbox, caller, withdrawal.collateral_gain);
            state.events.push(ProtocolEvent::PoolWithdrawal(PoolWithdrawalEvent {
                depositor: caller,
                amount: withdrawal.amount,
                collateral_gain: withdrawal.collateral_gain,
                remaining: withdrawal.remaining,
                frozen: withdrawal.frozen,
            }));
            Ok(withdrawal)
        })
    }

    /// Pay out the caller's collateral gain, keeping the deposit
    pub fn claim_pool_gain(&mut self, caller: AccountId) -> Result<PoolWithdrawal> {
        self.execute("claim_pool_gain", |state, _, _, outbox| {
            let claim = state.pool.claim_gain(caller)?;
            queue_gain(outbox, caller, claim.collateral_gain);
            state.events.push(ProtocolEvent::GainClaimed(GainClaimedEvent {
                depositor: caller,
                collateral_gain: claim.collateral_gain,
            }));
            Ok(claim)
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // OPERATOR OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Liquidate one position
    pub fn liquidate(&mut self, caller: AccountId, id: AccountId) -> Result<LiquidationRecord> {
        self.require_operator(caller)?;
        self.execute("liquidate", |state, governor, ctx, outbox| {
            let record =
                state
                    .engine
                    .liquidate(&mut state.positions, &mut state.pool, governor, id, ctx.price)?;
            queue_liquidation(outbox, &record);
            state.emit_liquidation(&record);
            Ok(record)
        })
    }

    /// Liquidate up to `max_count` positions from the lowest ratio upwards
    pub fn liquidate_batch(&mut self, caller: AccountId, max_count: usize) -> Result<BatchLiquidation> {
        self.require_operator(caller)?;
        self.execute("liquidate_batch", |state, governor, ctx, outbox| {
            let batch = state.engine.liquidate_batch(
                &mut state.positions,
                &mut state.pool,
                governor,
                ctx.price,
                max_count,
            );
            for record in &batch.records {
                queue_liquidation(outbox, record);
                state.emit_liquidation(record);
            }
            Ok(batch)
        })
    }

    /// Liquidate the listed positions, skipping those that cannot be
    pub fn liquidate_positions(
        &mut self,
        caller: AccountId,
        ids: &[AccountId],
    ) -> Result<BatchLiquidation> {
        self.require_operator(caller)?;
        self.execute("liquidate_positions", |state, governor, ctx, outbox| {
            let batch = state.engine.liquidate_positions(
                &mut state.positions,
                &mut state.pool,
                governor,
                ids,
                ctx.price,
            );
            for record in &batch.records {
                queue_liquidation(outbox, record);
                state.emit_liquidation(record);
            }
            Ok(batch)
        })
    }

    /// Retire the oldest stale cohort, paying its members their gains
    pub fn clear_oldest_active_cohort(&mut self, caller: AccountId) -> Result<CohortClearance> {
        self.require_operator(caller)?;
        self.execute("clear_oldest_active_cohort", |state, _, _, outbox| {
            let clearance = state.pool.clear_oldest_active_cohort()?;
            let mut collateral_paid = FixedPoint::ZERO;
            for (owner, gain) in &clearance.payouts {
                queue_gain(outbox, *owner, *gain);
                collateral_paid = collateral_paid.checked_add(*gain)?;
            }
            state.events.push(ProtocolEvent::CohortCleared(CohortClearedEvent {
                operator: caller,
                cohort: clearance.cohort,
                members: clearance.payouts.len(),
                collateral_paid,
                shortfall: clearance.shortfall,
            }));
            Ok(clearance)
        })
    }

    /// Extend the operator allow-list
    pub fn add_operator(&mut self, caller: AccountId, operator: AccountId) -> Result<()> {
        self.require_operator(caller)?;
        if self.state.operators.insert(operator) {
            self.state
                .events
                .push(ProtocolEvent::OperatorAdded(OperatorAddedEvent {
                    operator: caller,
                    added: operator,
                }));
            tracing::info!(%caller, %operator, "operator added");
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // QUERIES
    // ═══════════════════════════════════════════════════════════════════════════

    /// Current system mode
    pub fn mode(&self) -> Result<SystemMode> {
        Ok(self.context()?.mode)
    }

    /// Current total collateral ratio
    pub fn tcr(&self) -> Result<FixedPoint> {
        Ok(self.context()?.tcr)
    }

    /// Recovery-mode report at the current price
    pub fn recovery_status(&self) -> Result<RecoveryModeStatus> {
        let price = self.price()?;
        self.governor.status(&self.state.positions.totals()?, price)
    }

    /// Stored position record
    pub fn position(&self, id: AccountId) -> Option<&Position> {
        self.state.positions.get(id)
    }

    /// Collateral and debt including pending redistribution rewards
    pub fn entire_position(&self, id: AccountId) -> Result<(FixedPoint, FixedPoint)> {
        self.state.positions.entire_position(id)
    }

    /// Individual collateral ratio at the current price
    pub fn icr(&self, id: AccountId) -> Result<FixedPoint> {
        let price = self.price()?;
        self.state.positions.icr(id, price)
    }

    /// Positions eligible for liquidation, lowest ratio first
    pub fn find_liquidatable(&self, limit: usize) -> Result<Vec<AccountId>> {
        let price = self.price()?;
        LiquidationEngine::find_liquidatable(&self.state.positions, &self.governor, price, limit)
    }

    /// Compounded stability deposit
    pub fn deposit_value(&self, id: AccountId) -> Result<FixedPoint> {
        self.state.pool.compounded_value(id)
    }

    /// Collateral gain owed to a depositor
    pub fn pending_gain(&self, id: AccountId) -> Result<FixedPoint> {
        self.state.pool.pending_gain(id)
    }

    /// Aggregate statistics at the current price
    pub fn statistics(&self) -> Result<ProtocolStatistics> {
        let ctx = self.context()?;
        Ok(ProtocolStatistics {
            price: ctx.price,
            mode: ctx.mode,
            tcr: ctx.tcr,
            positions: self.state.positions.statistics(),
            pool: self.state.pool.statistics()?,
            liquidations: self.state.engine.statistics(),
            events_emitted: self.state.events.total_pushed(),
        })
    }

    /// Digest of the internal ledger
    pub fn state_hash(&self) -> Result<Hash> {
        self.state.state_hash()
    }

    /// Internal ledger
    pub fn state(&self) -> &LedgerState {
        &self.state
    }

    /// Event log
    pub fn events(&self) -> &EventLog {
        &self.state.events
    }

    /// Operator allow-list
    pub fn is_operator(&self, id: AccountId) -> bool {
        self.state.operators.contains(&id)
    }

    /// Price source
    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    /// Mutable price source, for feeds that are pushed to
    pub fn oracle_mut(&mut self) -> &mut O {
        &mut self.oracle
    }

    /// Debt token
    pub fn token(&self) -> &T {
        &self.token
    }

    /// Collateral custody
    pub fn custody(&self) -> &C {
        &self.custody
    }

    /// Take the ledger state and collaborators apart
    pub fn into_parts(self) -> (LedgerState, O, T, C) {
        (self.state, self.oracle, self.token, self.custody)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::liquidation::engine::LiquidationKind;
    use crate::protocol::collaborators::{FixedPriceOracle, InMemoryCustody, InMemoryDebtToken};

    type TestProtocol = Protocol<FixedPriceOracle, InMemoryDebtToken, InMemoryCustody>;

    const OPERATOR: AccountId = AccountId(100);
    const ALICE: AccountId = AccountId(1);
    const BOB: AccountId = AccountId(2);

    fn units(n: u64) -> FixedPoint {
        FixedPoint::from_integer(n)
    }

    fn protocol() -> TestProtocol {
        Protocol::new(
            ProtocolParams::default(),
            [OPERATOR],
            FixedPriceOracle::new(units(200)),
            InMemoryDebtToken::new(),
            InMemoryCustody::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_open_settles_mint_and_custody() {
        let mut protocol = protocol();
        protocol.open_position(ALICE, units(10), units(1000), None).unwrap();

        assert_eq!(protocol.token().balance_of(TokenHolder::Account(ALICE)), units(1000));
        assert_eq!(protocol.custody().balance_of(CustodyPool::Active), units(10));
        assert_eq!(protocol.icr(ALICE).unwrap(), units(2));
        assert_eq!(protocol.mode().unwrap(), SystemMode::Normal);
        assert_eq!(protocol.events().filter_by_type("PositionUpdated").len(), 1);
    }

    #[test]
    fn test_failed_settlement_restores_state() {
        let mut protocol = protocol();
        protocol.open_position(ALICE, units(10), units(1000), None).unwrap();
        protocol.open_position(BOB, units(20), units(1000), None).unwrap();
        protocol.provide_to_pool(ALICE, units(500)).unwrap();

        let hash_before = protocol.state_hash().unwrap();
        let events_before = protocol.events().len();

        // Alice holds 500 tokens but owes 1000
        let err = protocol.close_position(ALICE).unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance { .. }));
        assert_eq!(protocol.state_hash().unwrap(), hash_before);
        assert_eq!(protocol.events().len(), events_before);
        assert_eq!(protocol.custody().balance_of(CustodyPool::Active), units(30));
    }

    #[test]
    fn test_operator_entry_points_require_allow_list() {
        let mut protocol = protocol();
        protocol.open_position(ALICE, units(10), units(1000), None).unwrap();

        let err = protocol.liquidate(ALICE, ALICE).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
        let err = protocol.clear_oldest_active_cohort(BOB).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
        assert!(protocol.add_operator(BOB, BOB).is_err());

        protocol.add_operator(OPERATOR, BOB).unwrap();
        assert!(protocol.is_operator(BOB));
        assert_eq!(protocol.events().filter_by_type("OperatorAdded").len(), 1);
    }

    #[test]
    fn test_liquidation_moves_collateral_and_burns_pool_debt() {
        let mut protocol = protocol();
        protocol.open_position(ALICE, units(10), units(1000), None).unwrap();
        protocol.open_position(BOB, units(20), units(1000), None).unwrap();
        protocol.provide_to_pool(BOB, units(1000)).unwrap();

        // Alice at 105%, system at 157.5%
        protocol.oracle_mut().set_price(units(105));
        assert_eq!(protocol.mode().unwrap(), SystemMode::Normal);

        let record = protocol.liquidate(OPERATOR, ALICE).unwrap();
        assert_eq!(record.plan.kind, LiquidationKind::Offset);
        assert_eq!(protocol.custody().balance_of(CustodyPool::Active), units(20));
        assert_eq!(protocol.custody().balance_of(CustodyPool::Stability), units(10));
        assert!(protocol.token().balance_of(TokenHolder::StabilityPool).is_zero());
        assert_eq!(protocol.token().total_supply(), units(1000));

        assert_eq!(protocol.pending_gain(BOB).unwrap(), units(10));
        let claim = protocol.claim_pool_gain(BOB).unwrap();
        assert_eq!(claim.collateral_gain, units(10));
        assert_eq!(protocol.custody().paid_to(BOB), units(10));
        assert!(protocol.custody().balance_of(CustodyPool::Stability).is_zero());
    }

    #[test]
    fn test_recovery_mode_blocks_close() {
        let mut protocol = protocol();
        protocol.open_position(ALICE, units(10), units(1000), None).unwrap();
        protocol.open_position(BOB, units(10), units(500), None).unwrap();

        protocol.oracle_mut().set_price(units(100));
        assert_eq!(protocol.mode().unwrap(), SystemMode::Recovery);

        let err = protocol.close_position(BOB).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModeRestriction);
        assert_eq!(protocol.position(BOB).unwrap().debt, units(500));
    }

    #[test]
    fn test_zero_price_rejects_every_entry_point() {
        let mut protocol = protocol();
        protocol.oracle_mut().set_price(FixedPoint::ZERO);
        assert!(protocol.open_position(ALICE, units(10), units(1000), None).is_err());
        assert!(protocol.state().positions.get(ALICE).is_none());
    }

    #[test]
    fn test_state_bytes_roundtrip() {
        let mut protocol = protocol();
        protocol.open_position(ALICE, units(10), units(1000), None).unwrap();
        protocol.provide_to_pool(ALICE, units(400)).unwrap();

        let bytes = protocol.state().to_bytes().unwrap();
        let restored = LedgerState::from_bytes(&bytes).unwrap();
        assert_eq!(&restored, protocol.state());
        assert_eq!(restored.state_hash().unwrap(), protocol.state_hash().unwrap());

        let (state, oracle, token, custody) = protocol.into_parts();
        let resumed = Protocol::from_state(state, oracle, token, custody).unwrap();
        assert_eq!(resumed.deposit_value(ALICE).unwrap(), units(400));
    }

    #[test]
    fn test_statistics() {
        let mut protocol = protocol();
        protocol.open_position(ALICE, units(10), units(1000), None).unwrap();
        protocol.provide_to_pool(ALICE, units(300)).unwrap();

        let stats = protocol.statistics().unwrap();
        assert_eq!(stats.price, units(200));
        assert_eq!(stats.mode, SystemMode::Normal);
        assert_eq!(stats.positions.active_count, 1);
        assert_eq!(stats.pool.total_deposits, units(300));
        assert_eq!(stats.events_emitted, 2);
    }
}
