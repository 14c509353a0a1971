//! Balance Operations
//!
//! Invariant-preserving mutations over one user's balance row. The free
//! functions take a connection (usually an open transaction) so that larger
//! units such as joining a signal or settling one can compose them atomically.
//! [`BalanceOps`] wraps each of them as a one-shot atomic operation.
//!
//! Compartments:
//! - `balance`        spendable / depositable funds
//! - `trade_balance`  staged for signal participation
//! - `frozen_balance` committed to unresolved investments
//! - `earned_balance` lifetime profit, base for the referral bonus

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{info, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::referrals;
use crate::ledger::store::{
    self, with_savepoint, Balance, LedgerStore, TransactionKind, AMOUNT_EPSILON,
};

pub fn validate_amount(amount: f64) -> LedgerResult<()> {
    if !(amount.is_finite() && amount > 0.0) {
        return Err(LedgerError::invalid(format!(
            "amount must be greater than zero (got {})",
            amount
        )));
    }
    Ok(())
}

fn ensure_available(available: f64, needed: f64) -> LedgerResult<()> {
    if available + AMOUNT_EPSILON < needed {
        return Err(LedgerError::InsufficientFunds { needed, available });
    }
    Ok(())
}

/// Remove `amount` from `compartment` and return what was actually removed.
/// A request within float dust of the whole compartment empties it exactly,
/// so the caller can credit and record the same figure.
fn take(compartment: &mut f64, amount: f64) -> LedgerResult<f64> {
    ensure_available(*compartment, amount)?;
    let taken = amount.min(*compartment);
    *compartment -= taken;
    Ok(taken)
}

/// Load, mutate and persist one balance row.
fn mutate<F>(conn: &Connection, user_id: i64, now: DateTime<Utc>, f: F) -> LedgerResult<Balance>
where
    F: FnOnce(&mut Balance) -> LedgerResult<()>,
{
    let mut bal = store::load_balance(conn, user_id)?;
    f(&mut bal)?;
    bal.updated_at = now;
    store::save_balance(conn, &bal)?;
    Ok(bal)
}

pub fn credit(conn: &Connection, user_id: i64, amount: f64, now: DateTime<Utc>) -> LedgerResult<Balance> {
    credit_as(conn, user_id, amount, TransactionKind::BalanceUpdate, now)
}

/// Credit the main balance, tagging the audit row with `kind`.
pub fn credit_as(
    conn: &Connection,
    user_id: i64,
    amount: f64,
    kind: TransactionKind,
    now: DateTime<Utc>,
) -> LedgerResult<Balance> {
    validate_amount(amount)?;
    let bal = mutate(conn, user_id, now, |b| {
        b.balance += amount;
        Ok(())
    })?;
    store::record_transaction(conn, user_id, amount, kind, now)?;
    Ok(bal)
}

pub fn debit(conn: &Connection, user_id: i64, amount: f64, now: DateTime<Utc>) -> LedgerResult<Balance> {
    validate_amount(amount)?;
    let mut taken = 0.0;
    let bal = mutate(conn, user_id, now, |b| {
        taken = take(&mut b.balance, amount)?;
        Ok(())
    })?;
    store::record_transaction(conn, user_id, -taken, TransactionKind::BalanceUpdate, now)?;
    Ok(bal)
}

/// Credit the trading compartment directly (settlement profit).
pub fn credit_trading(
    conn: &Connection,
    user_id: i64,
    amount: f64,
    now: DateTime<Utc>,
) -> LedgerResult<Balance> {
    validate_amount(amount)?;
    let bal = mutate(conn, user_id, now, |b| {
        b.trade_balance += amount;
        Ok(())
    })?;
    store::record_transaction(conn, user_id, amount, TransactionKind::TradeBalanceUpdate, now)?;
    Ok(bal)
}

pub fn move_to_trading(
    conn: &Connection,
    user_id: i64,
    amount: f64,
    now: DateTime<Utc>,
) -> LedgerResult<Balance> {
    validate_amount(amount)?;
    let mut moved = 0.0;
    let bal = mutate(conn, user_id, now, |b| {
        moved = take(&mut b.balance, amount)?;
        b.trade_balance += moved;
        Ok(())
    })?;
    store::record_transaction(conn, user_id, -moved, TransactionKind::BalanceUpdate, now)?;
    store::record_transaction(conn, user_id, moved, TransactionKind::TradeBalanceUpdate, now)?;
    Ok(bal)
}

pub fn move_to_main(
    conn: &Connection,
    user_id: i64,
    amount: f64,
    now: DateTime<Utc>,
) -> LedgerResult<Balance> {
    validate_amount(amount)?;
    let mut moved = 0.0;
    let bal = mutate(conn, user_id, now, |b| {
        moved = take(&mut b.trade_balance, amount)?;
        b.balance += moved;
        Ok(())
    })?;
    store::record_transaction(conn, user_id, -moved, TransactionKind::TradeBalanceUpdate, now)?;
    store::record_transaction(conn, user_id, moved, TransactionKind::BalanceUpdate, now)?;
    Ok(bal)
}

/// Generic freeze: main balance -> frozen.
pub fn freeze(conn: &Connection, user_id: i64, amount: f64, now: DateTime<Utc>) -> LedgerResult<Balance> {
    validate_amount(amount)?;
    let mut moved = 0.0;
    let bal = mutate(conn, user_id, now, |b| {
        moved = take(&mut b.balance, amount)?;
        b.frozen_balance += moved;
        Ok(())
    })?;
    store::record_transaction(conn, user_id, moved, TransactionKind::Freeze, now)?;
    Ok(bal)
}

/// Signal-join freeze: trading balance -> frozen.
pub fn freeze_from_trading(
    conn: &Connection,
    user_id: i64,
    amount: f64,
    now: DateTime<Utc>,
) -> LedgerResult<Balance> {
    validate_amount(amount)?;
    let mut moved = 0.0;
    let bal = mutate(conn, user_id, now, |b| {
        moved = take(&mut b.trade_balance, amount)?;
        b.frozen_balance += moved;
        Ok(())
    })?;
    store::record_transaction(conn, user_id, moved, TransactionKind::Freeze, now)?;
    Ok(bal)
}

/// Frozen funds still backing unresolved signal investments.
pub fn committed_frozen(conn: &Connection, user_id: i64) -> LedgerResult<f64> {
    let committed: f64 = conn.query_row(
        "SELECT COALESCE(SUM(amount), 0.0) FROM signal_investments
         WHERE user_id = ?1 AND profit IS NULL",
        [user_id],
        |row| row.get(0),
    )?;
    Ok(committed)
}

/// Frozen funds the user may release: everything not staked on an open signal.
pub fn free_frozen(conn: &Connection, user_id: i64) -> LedgerResult<f64> {
    let bal = store::load_balance(conn, user_id)?;
    let committed = committed_frozen(conn, user_id)?;
    Ok((bal.frozen_balance - committed).max(0.0))
}

/// Frozen -> trading, limited to the free part of the frozen compartment.
pub fn unfreeze(conn: &Connection, user_id: i64, amount: f64, now: DateTime<Utc>) -> LedgerResult<Balance> {
    validate_amount(amount)?;
    ensure_available(free_frozen(conn, user_id)?, amount)?;
    let (_, bal) = release_frozen(conn, user_id, amount, TransactionKind::Unfreeze, now)?;
    Ok(bal)
}

/// Frozen -> trading for the principal of a settled investment.
pub fn release_stake(
    conn: &Connection,
    user_id: i64,
    amount: f64,
    now: DateTime<Utc>,
) -> LedgerResult<Balance> {
    let (_, bal) = release_frozen(conn, user_id, amount, TransactionKind::Unfreeze, now)?;
    Ok(bal)
}

/// Frozen -> trading, for principal handed back when a signal is withdrawn.
pub fn refund_frozen(
    conn: &Connection,
    user_id: i64,
    amount: f64,
    now: DateTime<Utc>,
) -> LedgerResult<Balance> {
    let (_, bal) = release_frozen(conn, user_id, amount, TransactionKind::SignalRefund, now)?;
    Ok(bal)
}

fn release_frozen(
    conn: &Connection,
    user_id: i64,
    amount: f64,
    kind: TransactionKind,
    now: DateTime<Utc>,
) -> LedgerResult<(f64, Balance)> {
    validate_amount(amount)?;
    let mut moved = 0.0;
    let bal = mutate(conn, user_id, now, |b| {
        moved = take(&mut b.frozen_balance, amount)?;
        b.trade_balance += moved;
        Ok(())
    })?;
    store::record_transaction(conn, user_id, moved, kind, now)?;
    Ok((moved, bal))
}

/// Remove a lost stake from the frozen compartment without crediting it anywhere.
pub fn burn_frozen(
    conn: &Connection,
    user_id: i64,
    amount: f64,
    now: DateTime<Utc>,
) -> LedgerResult<Balance> {
    validate_amount(amount)?;
    let mut burned = 0.0;
    let bal = mutate(conn, user_id, now, |b| {
        burned = take(&mut b.frozen_balance, amount)?;
        Ok(())
    })?;
    store::record_transaction(conn, user_id, -burned, TransactionKind::SignalLoss, now)?;
    Ok(bal)
}

/// Move every free frozen unit back to trading. Stakes on unresolved signals
/// stay frozen until settlement. Returns the amount moved.
pub fn unfreeze_all(
    conn: &Connection,
    user_id: i64,
    now: DateTime<Utc>,
) -> LedgerResult<(f64, Balance)> {
    let free = free_frozen(conn, user_id)?;
    if free <= AMOUNT_EPSILON {
        return Err(LedgerError::NoFrozenFunds);
    }
    release_frozen(conn, user_id, free, TransactionKind::Unfreeze, now)
}

/// Add realized profit to both `earned_balance` and `balance`, append a profit
/// row, then pay the inviter's referral bonus. A bonus that cannot be paid is
/// logged and dropped; it never undoes the earned credit.
pub fn credit_earned(
    conn: &Connection,
    user_id: i64,
    amount: f64,
    signal_id: Option<i64>,
    bonus_rate: f64,
    now: DateTime<Utc>,
) -> LedgerResult<Balance> {
    validate_amount(amount)?;
    let bal = mutate(conn, user_id, now, |b| {
        b.earned_balance += amount;
        b.balance += amount;
        Ok(())
    })?;
    store::record_transaction(conn, user_id, amount, TransactionKind::Profit, now)?;
    store::record_profit(conn, user_id, signal_id, amount, now)?;

    let bonus = with_savepoint(conn, "referral_bonus", |c| {
        referrals::propagate_bonus(c, user_id, bonus_rate, now)
    });
    if let Err(e) = bonus {
        warn!(user_id, "Referral bonus skipped: {}", e);
    }

    Ok(bal)
}

/// Async, one-transaction-per-call access to the balance operations.
#[derive(Clone)]
pub struct BalanceOps {
    store: LedgerStore,
    bonus_rate: f64,
}

impl BalanceOps {
    pub fn new(store: LedgerStore, bonus_rate: f64) -> Self {
        Self { store, bonus_rate }
    }

    pub async fn get(&self, user_id: i64) -> LedgerResult<Balance> {
        self.store.read(|conn| store::load_balance(conn, user_id)).await
    }

    pub async fn credit(&self, user_id: i64, amount: f64) -> LedgerResult<Balance> {
        let bal = self
            .store
            .write(|tx| credit(tx, user_id, amount, Utc::now()))
            .await?;
        info!(user_id, amount, new_balance = bal.balance, "💰 Balance credited");
        Ok(bal)
    }

    pub async fn debit(&self, user_id: i64, amount: f64) -> LedgerResult<Balance> {
        let bal = self
            .store
            .write(|tx| debit(tx, user_id, amount, Utc::now()))
            .await?;
        info!(user_id, amount, new_balance = bal.balance, "Balance debited");
        Ok(bal)
    }

    pub async fn move_to_trading(&self, user_id: i64, amount: f64) -> LedgerResult<Balance> {
        let bal = self
            .store
            .write(|tx| move_to_trading(tx, user_id, amount, Utc::now()))
            .await?;
        info!(user_id, amount, "Transferred to trading balance");
        Ok(bal)
    }

    pub async fn move_to_main(&self, user_id: i64, amount: f64) -> LedgerResult<Balance> {
        let bal = self
            .store
            .write(|tx| move_to_main(tx, user_id, amount, Utc::now()))
            .await?;
        info!(user_id, amount, "Transferred to main balance");
        Ok(bal)
    }

    pub async fn freeze(&self, user_id: i64, amount: f64) -> LedgerResult<Balance> {
        let bal = self
            .store
            .write(|tx| freeze(tx, user_id, amount, Utc::now()))
            .await?;
        info!(user_id, amount, "🧊 Funds frozen");
        Ok(bal)
    }

    pub async fn unfreeze(&self, user_id: i64, amount: f64) -> LedgerResult<Balance> {
        let bal = self
            .store
            .write(|tx| unfreeze(tx, user_id, amount, Utc::now()))
            .await?;
        info!(user_id, amount, "Funds unfrozen");
        Ok(bal)
    }

    pub async fn unfreeze_all(&self, user_id: i64) -> LedgerResult<(f64, Balance)> {
        let (amount, bal) = self
            .store
            .write(|tx| unfreeze_all(tx, user_id, Utc::now()))
            .await?;
        info!(user_id, amount, "Unfroze entire frozen balance");
        Ok((amount, bal))
    }

    pub async fn credit_earned(&self, user_id: i64, amount: f64) -> LedgerResult<Balance> {
        let rate = self.bonus_rate;
        let bal = self
            .store
            .write(|tx| credit_earned(tx, user_id, amount, None, rate, Utc::now()))
            .await?;
        info!(user_id, amount, earned = bal.earned_balance, "Earned balance credited");
        Ok(bal)
    }
}
