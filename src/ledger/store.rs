//! Ledger Store
//!
//! Durable record of users, balance compartments, signals, investments and the
//! append-only transaction/profit history, backed by a single SQLite file.
//!
//! Every mutation runs through [`LedgerStore::write`], which wraps the closure
//! in one `BEGIN IMMEDIATE` transaction: `Ok` commits, `Err` rolls back. The
//! write connection sits behind an async mutex, so writers are serialized and
//! two requests for the same user can never interleave a read-modify-write.
//! A file-backed store also opens a read-only connection; under WAL it sees
//! the last committed state without waiting for an open write.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{LedgerError, LedgerResult};

/// Tolerance for float comparisons on balance preconditions.
pub const AMOUNT_EPSILON: f64 = 1e-9;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        platform_key INTEGER UNIQUE NOT NULL,
        username TEXT,
        first_name TEXT,
        last_name TEXT,
        language_code TEXT NOT NULL DEFAULT 'en',
        photo_url TEXT,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS balances (
        user_id INTEGER PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
        balance REAL NOT NULL DEFAULT 0.0 CHECK (balance >= 0.0),
        trade_balance REAL NOT NULL DEFAULT 0.0 CHECK (trade_balance >= 0.0),
        frozen_balance REAL NOT NULL DEFAULT 0.0 CHECK (frozen_balance >= 0.0),
        earned_balance REAL NOT NULL DEFAULT 0.0 CHECK (earned_balance >= 0.0),
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS transactions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        amount REAL NOT NULL,
        kind TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS signals (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        join_until INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        burn_chance REAL NOT NULL,
        profit_percent REAL NOT NULL,
        is_successful INTEGER,
        resolved_at INTEGER,
        created_at INTEGER NOT NULL,
        CHECK (expires_at > join_until)
    );

    CREATE TABLE IF NOT EXISTS signal_investments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        signal_id INTEGER NOT NULL REFERENCES signals(id) ON DELETE CASCADE,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        amount REAL NOT NULL CHECK (amount > 0.0),
        profit REAL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS profits (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        signal_id INTEGER REFERENCES signals(id) ON DELETE SET NULL,
        amount REAL NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS referrals (
        user_id INTEGER PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
        invite_code TEXT UNIQUE NOT NULL,
        invited_count INTEGER NOT NULL DEFAULT 0,
        referred_by INTEGER REFERENCES users(id),
        linked_at INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_transactions_user ON transactions(user_id, created_at DESC);
    CREATE INDEX IF NOT EXISTS idx_profits_user ON profits(user_id, created_at DESC);
    CREATE INDEX IF NOT EXISTS idx_signals_due ON signals(expires_at) WHERE is_successful IS NULL;
    CREATE INDEX IF NOT EXISTS idx_signals_join ON signals(join_until);
    CREATE INDEX IF NOT EXISTS idx_investments_signal ON signal_investments(signal_id);
    CREATE INDEX IF NOT EXISTS idx_investments_user ON signal_investments(user_id);
    CREATE INDEX IF NOT EXISTS idx_referrals_referred_by ON referrals(referred_by);
";

/// One user's four balance compartments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub user_id: i64,
    pub balance: f64,
    pub trade_balance: f64,
    pub frozen_balance: f64,
    pub earned_balance: f64,
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    /// Sum of the spendable, trading and frozen compartments.
    pub fn holdings(&self) -> f64 {
        self.balance + self.trade_balance + self.frozen_balance
    }
}

/// Audit tag for a transaction row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    BalanceUpdate,
    TradeBalanceUpdate,
    Freeze,
    Unfreeze,
    SignalLoss,
    SignalRefund,
    Profit,
    ReferralBonus,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::BalanceUpdate => "balance_update",
            TransactionKind::TradeBalanceUpdate => "trade_balance_update",
            TransactionKind::Freeze => "freeze",
            TransactionKind::Unfreeze => "unfreeze",
            TransactionKind::SignalLoss => "signal_loss",
            TransactionKind::SignalRefund => "signal_refund",
            TransactionKind::Profit => "profit",
            TransactionKind::ReferralBonus => "referral_bonus",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: i64,
    pub user_id: i64,
    pub amount: f64,
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitRecord {
    pub id: i64,
    pub user_id: i64,
    pub signal_id: Option<i64>,
    pub amount: f64,
    pub created_at: DateTime<Utc>,
}

/// Shared handle to the ledger database.
#[derive(Clone)]
pub struct LedgerStore {
    writer: Arc<Mutex<Connection>>,
    /// `None` for in-memory stores, which cannot be shared across connections.
    reader: Option<Arc<Mutex<Connection>>>,
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl LedgerStore {
    pub fn open(db_path: &str) -> LedgerResult<Self> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mut store = Self::init(conn)?;

        let reader = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        reader.busy_timeout(BUSY_TIMEOUT)?;
        store.reader = Some(Arc::new(Mutex::new(reader)));

        info!("📒 Ledger store opened at: {}", db_path);
        Ok(store)
    }

    pub fn open_in_memory() -> LedgerResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> LedgerResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            writer: Arc::new(Mutex::new(conn)),
            reader: None,
        })
    }

    /// Run `f` inside one immediate transaction. Any error rolls back every
    /// statement `f` executed.
    pub async fn write<T, F>(&self, f: F) -> LedgerResult<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> LedgerResult<T>,
    {
        let mut conn = self.writer.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run a read-only query against the last committed state.
    pub async fn read<T, F>(&self, f: F) -> LedgerResult<T>
    where
        F: FnOnce(&Connection) -> LedgerResult<T>,
    {
        let conn = match &self.reader {
            Some(reader) => reader.lock().await,
            None => self.writer.lock().await,
        };
        f(&conn)
    }

    /// Flush the WAL into the main file. Called once at shutdown.
    pub async fn checkpoint(&self) -> LedgerResult<()> {
        let conn = self.writer.lock().await;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        debug!("ledger WAL checkpointed");
        Ok(())
    }
}

/// Run `f` inside a nested savepoint: its effects are kept on `Ok` and
/// discarded on `Err`, without touching the enclosing transaction.
pub fn with_savepoint<T, F>(conn: &Connection, name: &str, f: F) -> LedgerResult<T>
where
    F: FnOnce(&Connection) -> LedgerResult<T>,
{
    conn.execute_batch(&format!("SAVEPOINT {name};"))?;
    match f(conn) {
        Ok(out) => {
            conn.execute_batch(&format!("RELEASE {name};"))?;
            Ok(out)
        }
        Err(e) => {
            conn.execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name};"))?;
            Err(e)
        }
    }
}

pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

fn balance_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Balance> {
    Ok(Balance {
        user_id: row.get(0)?,
        balance: row.get(1)?,
        trade_balance: row.get(2)?,
        frozen_balance: row.get(3)?,
        earned_balance: row.get(4)?,
        updated_at: from_millis(row.get(5)?),
    })
}

pub fn insert_balance(conn: &Connection, user_id: i64, now: DateTime<Utc>) -> LedgerResult<()> {
    conn.execute(
        "INSERT INTO balances (user_id, updated_at) VALUES (?1, ?2)",
        params![user_id, to_millis(now)],
    )?;
    Ok(())
}

pub fn find_balance(conn: &Connection, user_id: i64) -> LedgerResult<Option<Balance>> {
    let mut stmt = conn.prepare_cached(
        "SELECT user_id, balance, trade_balance, frozen_balance, earned_balance, updated_at
         FROM balances WHERE user_id = ?1",
    )?;
    Ok(stmt.query_row([user_id], balance_from_row).optional()?)
}

pub fn load_balance(conn: &Connection, user_id: i64) -> LedgerResult<Balance> {
    find_balance(conn, user_id)?
        .ok_or_else(|| LedgerError::not_found(format!("Balance for user {}", user_id)))
}

pub fn save_balance(conn: &Connection, balance: &Balance) -> LedgerResult<()> {
    let updated = conn.execute(
        "UPDATE balances SET balance = ?1, trade_balance = ?2, frozen_balance = ?3,
             earned_balance = ?4, updated_at = ?5
         WHERE user_id = ?6",
        params![
            balance.balance,
            balance.trade_balance,
            balance.frozen_balance,
            balance.earned_balance,
            to_millis(balance.updated_at),
            balance.user_id,
        ],
    )?;
    if updated == 0 {
        return Err(LedgerError::not_found(format!(
            "Balance for user {}",
            balance.user_id
        )));
    }
    Ok(())
}

pub fn record_transaction(
    conn: &Connection,
    user_id: i64,
    amount: f64,
    kind: TransactionKind,
    now: DateTime<Utc>,
) -> LedgerResult<()> {
    conn.execute(
        "INSERT INTO transactions (user_id, amount, kind, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![user_id, amount, kind.as_str(), to_millis(now)],
    )?;
    Ok(())
}

pub fn record_profit(
    conn: &Connection,
    user_id: i64,
    signal_id: Option<i64>,
    amount: f64,
    now: DateTime<Utc>,
) -> LedgerResult<()> {
    conn.execute(
        "INSERT INTO profits (user_id, signal_id, amount, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![user_id, signal_id, amount, to_millis(now)],
    )?;
    Ok(())
}

pub fn list_transactions(conn: &Connection, user_id: i64) -> LedgerResult<Vec<TransactionRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, user_id, amount, kind, created_at FROM transactions
         WHERE user_id = ?1 ORDER BY created_at DESC, id DESC",
    )?;
    let rows = stmt
        .query_map([user_id], |row| {
            Ok(TransactionRecord {
                id: row.get(0)?,
                user_id: row.get(1)?,
                amount: row.get(2)?,
                kind: row.get(3)?,
                created_at: from_millis(row.get(4)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_profits(conn: &Connection, user_id: i64) -> LedgerResult<Vec<ProfitRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, user_id, signal_id, amount, created_at FROM profits
         WHERE user_id = ?1 ORDER BY created_at DESC, id DESC",
    )?;
    let rows = stmt
        .query_map([user_id], |row| {
            Ok(ProfitRecord {
                id: row.get(0)?,
                user_id: row.get(1)?,
                signal_id: row.get(2)?,
                amount: row.get(3)?,
                created_at: from_millis(row.get(4)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
