//! Signal Registry
//!
//! Creates and queries time-boxed signals and the investments users commit to
//! them. All timestamps are UTC; a signal is joinable strictly before
//! `join_until` and becomes due for settlement once `expires_at` has passed.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::balances;
use crate::ledger::store::{from_millis, to_millis, LedgerStore};

/// Ceiling for either window: ten years.
pub const MAX_WINDOW_SECS: i64 = 10 * 365 * 24 * 60 * 60;

pub const STATIC_SIGNAL_PREFIX: &str = "Static signal";

/// Longest active period a static signal runs past its lead time.
pub const STATIC_MAX_WORK_SECS: i64 = 17 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Custom,
    Random,
    Static,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Custom => "custom",
            SignalKind::Random => "random",
            SignalKind::Static => "static",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "custom" => Some(SignalKind::Custom),
            "random" => Some(SignalKind::Random),
            "static" => Some(SignalKind::Static),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: i64,
    pub name: String,
    pub kind: SignalKind,
    pub join_until: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Probability of loss.
    pub burn_chance: f64,
    /// Payout multiplier on success, >= 1.0.
    pub profit_percent: f64,
    /// `None` until settled.
    pub is_successful: Option<bool>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Signal {
    pub fn is_joinable_at(&self, now: DateTime<Utc>) -> bool {
        now < self.join_until
    }

    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.is_successful.is_none() && self.expires_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalParams {
    pub name: String,
    pub join_window_secs: i64,
    pub active_window_secs: i64,
    pub burn_chance: f64,
    pub profit_percent: f64,
}

impl SignalParams {
    pub fn validate(&self) -> LedgerResult<()> {
        if self.name.trim().is_empty() {
            return Err(LedgerError::invalid("signal name required"));
        }
        for (label, secs) in [
            ("join window", self.join_window_secs),
            ("active window", self.active_window_secs),
        ] {
            if secs <= 0 {
                return Err(LedgerError::invalid(format!("{} must be > 0", label)));
            }
            if secs > MAX_WINDOW_SECS {
                return Err(LedgerError::invalid(format!(
                    "{} exceeds the 10-year maximum",
                    label
                )));
            }
        }
        if !(self.burn_chance.is_finite() && (0.0..=1.0).contains(&self.burn_chance)) {
            return Err(LedgerError::invalid("burn_chance must be within [0, 1]"));
        }
        if !(self.profit_percent.is_finite() && self.profit_percent >= 1.0) {
            return Err(LedgerError::invalid("profit_percent must be >= 1.0"));
        }
        Ok(())
    }

    /// System-randomized parameters: 1-10 min to join, 10-60 min active,
    /// 1-10% burn chance, 1-20% profit.
    pub fn random<R: Rng + ?Sized>(rng: &mut R, name: impl Into<String>) -> Self {
        let profit_percent = (rng.gen_range(1.01..=1.20_f64) * 100.0).round() / 100.0;
        Self {
            name: name.into(),
            join_window_secs: rng.gen_range(60..=600),
            active_window_secs: rng.gen_range(600..=3600),
            burn_chance: rng.gen_range(0.01..=0.10),
            profit_percent,
        }
    }

    /// Parameters for slot `index` (0-based) of the static batch.
    pub fn static_slot<R: Rng + ?Sized>(rng: &mut R, index: usize, spec: &StaticBatchSpec) -> Self {
        let work_minutes: i64 = rng.gen_range(10..=STATIC_MAX_WORK_SECS / 60);
        Self {
            name: format!("{} {}", STATIC_SIGNAL_PREFIX, index + 1),
            join_window_secs: spec.lead_secs + spec.join_secs,
            active_window_secs: spec.lead_secs + work_minutes * 60,
            burn_chance: rng.gen_range(0.10..=0.80),
            profit_percent: rng.gen_range(1.01..=1.04),
        }
    }
}

/// Shape of the static batch seeded at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticBatchSpec {
    pub count: usize,
    pub join_secs: i64,
    pub lead_secs: i64,
}

impl Default for StaticBatchSpec {
    fn default() -> Self {
        Self {
            count: 9,
            join_secs: 30 * 60,
            lead_secs: 6 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalInvestment {
    pub id: i64,
    pub signal_id: i64,
    pub user_id: i64,
    pub amount: f64,
    /// `None` until the signal settles; negative when the stake was lost.
    pub profit: Option<f64>,
    pub created_at: DateTime<Utc>,
}

const SIGNAL_COLUMNS: &str =
    "id, name, kind, join_until, expires_at, burn_chance, profit_percent, is_successful, resolved_at";

fn signal_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Signal> {
    let kind: String = row.get(2)?;
    Ok(Signal {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: SignalKind::parse(&kind).unwrap_or(SignalKind::Custom),
        join_until: from_millis(row.get(3)?),
        expires_at: from_millis(row.get(4)?),
        burn_chance: row.get(5)?,
        profit_percent: row.get(6)?,
        is_successful: row.get::<_, Option<i64>>(7)?.map(|v| v != 0),
        resolved_at: row.get::<_, Option<i64>>(8)?.map(from_millis),
    })
}

fn investment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SignalInvestment> {
    Ok(SignalInvestment {
        id: row.get(0)?,
        signal_id: row.get(1)?,
        user_id: row.get(2)?,
        amount: row.get(3)?,
        profit: row.get(4)?,
        created_at: from_millis(row.get(5)?),
    })
}

pub fn insert_signal(
    conn: &Connection,
    kind: SignalKind,
    params: &SignalParams,
    now: DateTime<Utc>,
) -> LedgerResult<Signal> {
    params.validate()?;
    let join_until = now + Duration::seconds(params.join_window_secs);
    let expires_at = join_until + Duration::seconds(params.active_window_secs);

    conn.execute(
        "INSERT INTO signals (name, kind, join_until, expires_at, burn_chance, profit_percent, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            params.name,
            kind.as_str(),
            to_millis(join_until),
            to_millis(expires_at),
            params.burn_chance,
            params.profit_percent,
            to_millis(now),
        ],
    )?;

    load_signal(conn, conn.last_insert_rowid())
}

pub fn find_signal(conn: &Connection, signal_id: i64) -> LedgerResult<Option<Signal>> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {SIGNAL_COLUMNS} FROM signals WHERE id = ?1"))?;
    Ok(stmt.query_row([signal_id], signal_from_row).optional()?)
}

pub fn load_signal(conn: &Connection, signal_id: i64) -> LedgerResult<Signal> {
    find_signal(conn, signal_id)?
        .ok_or_else(|| LedgerError::not_found(format!("Signal {}", signal_id)))
}

/// Signals still open for joining, regardless of resolution state.
pub fn list_active(conn: &Connection, now: DateTime<Utc>) -> LedgerResult<Vec<Signal>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {SIGNAL_COLUMNS} FROM signals WHERE join_until > ?1 ORDER BY join_until ASC, id ASC"
    ))?;
    let rows = stmt
        .query_map([to_millis(now)], signal_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Expired and unresolved: the settlement scheduler's only discovery query.
pub fn list_due_for_settlement(conn: &Connection, now: DateTime<Utc>) -> LedgerResult<Vec<Signal>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {SIGNAL_COLUMNS} FROM signals
         WHERE expires_at <= ?1 AND is_successful IS NULL ORDER BY expires_at ASC, id ASC"
    ))?;
    let rows = stmt
        .query_map([to_millis(now)], signal_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Commit `amount` of the user's trading balance to a signal. The freeze and
/// the investment row are written by the caller's transaction together.
pub fn join(
    conn: &Connection,
    user_id: i64,
    signal_id: i64,
    amount: f64,
    now: DateTime<Utc>,
) -> LedgerResult<SignalInvestment> {
    balances::validate_amount(amount)?;
    let signal = load_signal(conn, signal_id)?;
    if !signal.is_joinable_at(now) {
        return Err(LedgerError::SignalNotJoinable(signal_id));
    }

    balances::freeze_from_trading(conn, user_id, amount, now)?;

    conn.execute(
        "INSERT INTO signal_investments (signal_id, user_id, amount, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![signal_id, user_id, amount, to_millis(now)],
    )?;

    Ok(SignalInvestment {
        id: conn.last_insert_rowid(),
        signal_id,
        user_id,
        amount,
        profit: None,
        created_at: from_millis(to_millis(now)),
    })
}

pub fn investments_for_signal(conn: &Connection, signal_id: i64) -> LedgerResult<Vec<SignalInvestment>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, signal_id, user_id, amount, profit, created_at
         FROM signal_investments WHERE signal_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map([signal_id], investment_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn investments_for_user(conn: &Connection, user_id: i64) -> LedgerResult<Vec<SignalInvestment>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, signal_id, user_id, amount, profit, created_at
         FROM signal_investments WHERE user_id = ?1 ORDER BY created_at DESC, id DESC",
    )?;
    let rows = stmt
        .query_map([user_id], investment_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn count_static(conn: &Connection) -> LedgerResult<usize> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM signals WHERE kind = 'static'",
        [],
        |row| row.get(0),
    )?;
    Ok(n as usize)
}

/// Drop every previously seeded static signal and insert `batch` in its place.
/// Principal still frozen in an unresolved static signal goes back to the
/// investor's trading balance first. Returns the new signals and the number
/// of investments refunded.
pub fn replace_static_batch(
    conn: &Connection,
    batch: &[SignalParams],
    now: DateTime<Utc>,
) -> LedgerResult<(Vec<Signal>, usize)> {
    let prefix = format!("{}%", STATIC_SIGNAL_PREFIX);

    let open: Vec<(i64, f64)> = {
        let mut stmt = conn.prepare_cached(
            "SELECT i.user_id, i.amount FROM signal_investments i
             JOIN signals s ON s.id = i.signal_id
             WHERE s.kind = 'static' AND s.name LIKE ?1
               AND s.is_successful IS NULL AND i.profit IS NULL",
        )?;
        let rows = stmt
            .query_map([&prefix], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    for (user_id, amount) in &open {
        balances::refund_frozen(conn, *user_id, *amount, now)?;
    }

    conn.execute(
        "DELETE FROM signals WHERE kind = 'static' AND name LIKE ?1",
        [&prefix],
    )?;

    let signals = batch
        .iter()
        .map(|p| insert_signal(conn, SignalKind::Static, p, now))
        .collect::<LedgerResult<Vec<_>>>()?;
    Ok((signals, open.len()))
}

/// Async front for the registry, one transaction per call.
#[derive(Clone)]
pub struct SignalRegistry {
    store: LedgerStore,
    rng: Arc<Mutex<ChaCha8Rng>>,
    static_spec: StaticBatchSpec,
}

impl SignalRegistry {
    pub fn new(store: LedgerStore, static_spec: StaticBatchSpec) -> Self {
        Self::with_rng(store, static_spec, ChaCha8Rng::from_entropy())
    }

    pub fn with_rng(store: LedgerStore, static_spec: StaticBatchSpec, rng: ChaCha8Rng) -> Self {
        Self {
            store,
            rng: Arc::new(Mutex::new(rng)),
            static_spec,
        }
    }

    pub async fn create_signal(&self, params: SignalParams) -> LedgerResult<Signal> {
        self.insert(SignalKind::Custom, params).await
    }

    pub async fn create_random_signal(&self, name: &str) -> LedgerResult<Signal> {
        let params = SignalParams::random(&mut *self.rng.lock(), name);
        self.insert(SignalKind::Random, params).await
    }

    async fn insert(&self, kind: SignalKind, params: SignalParams) -> LedgerResult<Signal> {
        params.validate()?;
        let signal = self
            .store
            .write(|tx| insert_signal(tx, kind, &params, Utc::now()))
            .await?;
        info!(
            signal_id = signal.id,
            kind = kind.as_str(),
            join_until = %signal.join_until,
            expires_at = %signal.expires_at,
            burn_chance = signal.burn_chance,
            profit_percent = signal.profit_percent,
            "📡 Signal created: {}",
            signal.name
        );
        Ok(signal)
    }

    pub async fn get(&self, signal_id: i64) -> LedgerResult<Signal> {
        self.store.read(|c| load_signal(c, signal_id)).await
    }

    pub async fn list_active(&self, now: DateTime<Utc>) -> LedgerResult<Vec<Signal>> {
        self.store.read(|c| list_active(c, now)).await
    }

    pub async fn list_due_for_settlement(&self, now: DateTime<Utc>) -> LedgerResult<Vec<Signal>> {
        self.store.read(|c| list_due_for_settlement(c, now)).await
    }

    pub async fn join_signal(&self, user_id: i64, signal_id: i64, amount: f64) -> LedgerResult<SignalInvestment> {
        self.join_signal_at(user_id, signal_id, amount, Utc::now()).await
    }

    pub async fn join_signal_at(
        &self,
        user_id: i64,
        signal_id: i64,
        amount: f64,
        now: DateTime<Utc>,
    ) -> LedgerResult<SignalInvestment> {
        match self
            .store
            .write(|tx| join(tx, user_id, signal_id, amount, now))
            .await
        {
            Ok(inv) => {
                info!(user_id, signal_id, amount, "User joined signal, funds frozen");
                Ok(inv)
            }
            Err(e) => {
                warn!(user_id, signal_id, amount, "Join rejected: {}", e);
                Err(e)
            }
        }
    }

    pub async fn investments_for_user(&self, user_id: i64) -> LedgerResult<Vec<SignalInvestment>> {
        self.store.read(|c| investments_for_user(c, user_id)).await
    }

    /// Replace the static batch with freshly randomized signals.
    pub async fn seed_static_batch(&self) -> LedgerResult<Vec<Signal>> {
        let batch: Vec<SignalParams> = {
            let mut rng = self.rng.lock();
            (0..self.static_spec.count)
                .map(|i| SignalParams::static_slot(&mut *rng, i, &self.static_spec))
                .collect()
        };

        let (signals, refunded) = self
            .store
            .write(|tx| replace_static_batch(tx, &batch, Utc::now()))
            .await?;

        if refunded > 0 {
            warn!(refunded, "Refunded open investments in replaced static signals");
        }
        for s in &signals {
            info!(
                signal_id = s.id,
                burn_chance = s.burn_chance,
                profit_percent = s.profit_percent,
                "Seeded {}",
                s.name
            );
        }
        info!("✅ {} static signals seeded", signals.len());
        Ok(signals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::store;

    fn params(join: i64, active: i64) -> SignalParams {
        SignalParams {
            name: "test".to_string(),
            join_window_secs: join,
            active_window_secs: active,
            burn_chance: 0.1,
            profit_percent: 1.1,
        }
    }

    async fn store_with_trader(trade: f64) -> LedgerStore {
        let store = LedgerStore::open_in_memory().unwrap();
        store
            .write(|tx| {
                tx.execute(
                    "INSERT INTO users (id, platform_key, created_at) VALUES (1, 100, 0)",
                    [],
                )?;
                store::insert_balance(tx, 1, Utc::now())?;
                tx.execute(
                    "UPDATE balances SET trade_balance = ?1 WHERE user_id = 1",
                    [trade],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        store
    }

    fn registry(store: &LedgerStore) -> SignalRegistry {
        SignalRegistry::with_rng(
            store.clone(),
            StaticBatchSpec::default(),
            ChaCha8Rng::seed_from_u64(7),
        )
    }

    #[test]
    fn test_param_validation() {
        assert!(params(60, 600).validate().is_ok());
        assert!(params(0, 600).validate().is_err());
        assert!(params(60, -1).validate().is_err());
        assert!(params(MAX_WINDOW_SECS + 1, 600).validate().is_err());
        assert!(params(60, MAX_WINDOW_SECS + 1).validate().is_err());

        let mut p = params(60, 600);
        p.profit_percent = 0.99;
        assert!(p.validate().is_err());
        p.profit_percent = 1.0;
        p.burn_chance = 1.5;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_random_params_are_valid() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..200 {
            let p = SignalParams::random(&mut rng, "r");
            p.validate().unwrap();
            assert!((60..=600).contains(&p.join_window_secs));
            assert!((600..=3600).contains(&p.active_window_secs));
            assert!(p.burn_chance <= 0.10);
        }
        let spec = StaticBatchSpec::default();
        for i in 0..9 {
            let p = SignalParams::static_slot(&mut rng, i, &spec);
            p.validate().unwrap();
            assert!(p.name.starts_with(STATIC_SIGNAL_PREFIX));
        }
    }

    #[tokio::test]
    async fn test_windows_and_queries() {
        let store = LedgerStore::open_in_memory().unwrap();
        let now = Utc::now();
        let sig = store
            .write(|tx| insert_signal(tx, SignalKind::Custom, &params(60, 600), now))
            .await
            .unwrap();
        assert_eq!(sig.join_until, from_millis(to_millis(now + Duration::seconds(60))));
        assert_eq!(sig.expires_at, sig.join_until + Duration::seconds(600));
        assert!(sig.expires_at > sig.join_until);

        let active = store.read(|c| list_active(c, now)).await.unwrap();
        assert_eq!(active.len(), 1);
        let later = now + Duration::seconds(61);
        assert!(store.read(|c| list_active(c, later)).await.unwrap().is_empty());

        assert!(store.read(|c| list_due_for_settlement(c, later)).await.unwrap().is_empty());
        let expired = now + Duration::seconds(660);
        let due = store.read(|c| list_due_for_settlement(c, expired)).await.unwrap();
        assert_eq!(due.len(), 1);
        assert!(due[0].is_due_at(expired));
    }

    #[tokio::test]
    async fn test_join_freezes_trading_funds() {
        let store = store_with_trader(100.0).await;
        let reg = registry(&store);
        let sig = reg.create_signal(params(60, 600)).await.unwrap();

        let inv = reg.join_signal(1, sig.id, 60.0).await.unwrap();
        assert_eq!(inv.amount, 60.0);
        assert_eq!(inv.profit, None);

        let bal = store.read(|c| store::load_balance(c, 1)).await.unwrap();
        assert_eq!(bal.trade_balance, 40.0);
        assert_eq!(bal.frozen_balance, 60.0);

        let invs = reg.investments_for_user(1).await.unwrap();
        assert_eq!(invs.len(), 1);
    }

    #[tokio::test]
    async fn test_join_after_window_rejected() {
        let store = store_with_trader(100.0).await;
        let reg = registry(&store);
        let sig = reg.create_signal(params(60, 600)).await.unwrap();

        for offset in [0, 1, 3600] {
            let at = sig.join_until + Duration::seconds(offset);
            let err = reg.join_signal_at(1, sig.id, 10.0, at).await.unwrap_err();
            assert_eq!(err, LedgerError::SignalNotJoinable(sig.id));
        }
        let bal = store.read(|c| store::load_balance(c, 1)).await.unwrap();
        assert_eq!(bal.trade_balance, 100.0);
    }

    #[tokio::test]
    async fn test_join_insufficient_trading_balance_leaves_no_row() {
        let store = store_with_trader(10.0).await;
        let reg = registry(&store);
        let sig = reg.create_signal(params(60, 600)).await.unwrap();

        let err = reg.join_signal(1, sig.id, 60.0).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert!(reg.investments_for_user(1).await.unwrap().is_empty());

        let err = reg.join_signal(1, 999, 1.0).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_static_seed_is_idempotent() {
        let store = store_with_trader(50.0).await;
        let reg = registry(&store);

        let first = reg.seed_static_batch().await.unwrap();
        assert_eq!(first.len(), 9);
        reg.join_signal(1, first[0].id, 20.0).await.unwrap();

        let second = reg.seed_static_batch().await.unwrap();
        assert_eq!(second.len(), 9);
        assert_eq!(store.read(count_static).await.unwrap(), 9);

        // The open stake in the replaced signal was handed back.
        let bal = store.read(|c| store::load_balance(c, 1)).await.unwrap();
        assert_eq!(bal.frozen_balance, 0.0);
        assert_eq!(bal.trade_balance, 50.0);
        assert!(reg.investments_for_user(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_static_seed_keeps_other_signals() {
        let store = LedgerStore::open_in_memory().unwrap();
        let reg = registry(&store);
        let custom = reg.create_signal(params(60, 600)).await.unwrap();
        reg.seed_static_batch().await.unwrap();
        reg.seed_static_batch().await.unwrap();
        assert!(reg.get(custom.id).await.is_ok());
    }
}
