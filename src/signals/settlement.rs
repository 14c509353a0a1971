//! Settlement Scheduler
//!
//! Periodically resolves every expired, unresolved signal. Each signal is
//! settled in its own transaction guarded by
//! `UPDATE signals ... WHERE is_successful IS NULL`, so a signal whose outcome
//! was already written (by an earlier tick or a concurrent cycle) is skipped
//! and no investment is ever paid twice.
//!
//! Outcome on success, per investment:
//! - principal frozen -> trading
//! - `amount * (profit_percent - 1)` credited to trading
//! - the same profit added to earned and main balance, then the referral bonus
//!
//! On failure the principal is burned from frozen.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rusqlite::{params, Connection};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::LedgerResult;
use crate::ledger::balances;
use crate::ledger::store::{self, to_millis, LedgerStore, AMOUNT_EPSILON};
use crate::signals::registry::{self, Signal};

/// Source of signal outcomes. `burn_chance` is the probability of loss.
pub trait OutcomeSource: Send + Sync {
    fn draw_success(&self, burn_chance: f64) -> bool;
}

/// Bernoulli draw from a ChaCha stream.
pub struct RandomOutcome {
    rng: Mutex<ChaCha8Rng>,
}

impl RandomOutcome {
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::from_entropy()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }
}

impl OutcomeSource for RandomOutcome {
    fn draw_success(&self, burn_chance: f64) -> bool {
        let roll: f64 = self.rng.lock().gen();
        roll >= burn_chance.clamp(0.0, 1.0)
    }
}

/// Always the same outcome. Used by tests and dry runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedOutcome(pub bool);

impl OutcomeSource for FixedOutcome {
    fn draw_success(&self, _burn_chance: f64) -> bool {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub interval: Duration,
    pub referral_bonus_rate: f64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            referral_bonus_rate: 0.01,
        }
    }
}

/// Result of settling one signal.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementReport {
    pub signal_id: i64,
    pub success: bool,
    pub investments: usize,
    /// Sum of realized profit (negative for burned principal).
    pub net_profit: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub settled: Vec<SettlementReport>,
    /// Already resolved by someone else between discovery and settlement.
    pub skipped: usize,
    pub failed: usize,
}

/// Write the outcome and every investment effect for one signal. Returns
/// `None` when the signal was already resolved.
pub fn settle_in_tx(
    conn: &Connection,
    signal: &Signal,
    success: bool,
    bonus_rate: f64,
    now: DateTime<Utc>,
) -> LedgerResult<Option<SettlementReport>> {
    let claimed = conn.execute(
        "UPDATE signals SET is_successful = ?1, resolved_at = ?2
         WHERE id = ?3 AND is_successful IS NULL",
        params![success as i64, to_millis(now), signal.id],
    )?;
    if claimed == 0 {
        return Ok(None);
    }

    let investments = registry::investments_for_signal(conn, signal.id)?;
    let mut net_profit = 0.0;
    let mut count = 0;

    for inv in investments.iter().filter(|i| i.profit.is_none()) {
        let profit = if success {
            let profit = inv.amount * (signal.profit_percent - 1.0);
            balances::release_stake(conn, inv.user_id, inv.amount, now)?;
            if profit > AMOUNT_EPSILON {
                balances::credit_trading(conn, inv.user_id, profit, now)?;
                balances::credit_earned(conn, inv.user_id, profit, Some(signal.id), bonus_rate, now)?;
            }
            profit
        } else {
            balances::burn_frozen(conn, inv.user_id, inv.amount, now)?;
            store::record_profit(conn, inv.user_id, Some(signal.id), -inv.amount, now)?;
            -inv.amount
        };

        conn.execute(
            "UPDATE signal_investments SET profit = ?1 WHERE id = ?2",
            params![profit, inv.id],
        )?;
        net_profit += profit;
        count += 1;
    }

    Ok(Some(SettlementReport {
        signal_id: signal.id,
        success,
        investments: count,
        net_profit,
    }))
}

pub struct SettlementScheduler {
    store: LedgerStore,
    outcomes: Arc<dyn OutcomeSource>,
    config: SettlementConfig,
}

impl SettlementScheduler {
    pub fn new(store: LedgerStore, outcomes: Arc<dyn OutcomeSource>, config: SettlementConfig) -> Self {
        Self {
            store,
            outcomes,
            config,
        }
    }

    /// Settle one signal. The outcome is drawn before the transaction opens.
    pub async fn settle_signal(&self, signal: &Signal, now: DateTime<Utc>) -> LedgerResult<Option<SettlementReport>> {
        let success = self.outcomes.draw_success(signal.burn_chance);
        let rate = self.config.referral_bonus_rate;
        self.store
            .write(|tx| settle_in_tx(tx, signal, success, rate, now))
            .await
    }

    /// One pass over everything due at `now`.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> LedgerResult<CycleReport> {
        self.run_cycle_until(now, None).await
    }

    async fn run_cycle_until(
        &self,
        now: DateTime<Utc>,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> LedgerResult<CycleReport> {
        let span = info_span!("settlement_cycle", cycle_id = %Uuid::new_v4());
        self.cycle_body(now, shutdown).instrument(span).await
    }

    async fn cycle_body(
        &self,
        now: DateTime<Utc>,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> LedgerResult<CycleReport> {
        let due = self
            .store
            .read(|c| registry::list_due_for_settlement(c, now))
            .await?;
        if due.is_empty() {
            debug!("No signals due");
            return Ok(CycleReport::default());
        }
        info!("⏰ {} signal(s) due for settlement", due.len());

        let mut report = CycleReport::default();
        for signal in &due {
            if shutdown.map(|rx| *rx.borrow()).unwrap_or(false) {
                info!("Shutdown requested, leaving remaining signals for next start");
                break;
            }
            match self.settle_signal(signal, now).await {
                Ok(Some(r)) => {
                    info!(
                        signal_id = r.signal_id,
                        success = r.success,
                        investments = r.investments,
                        net_profit = r.net_profit,
                        "{} Settled {}",
                        if r.success { "✅" } else { "🔥" },
                        signal.name
                    );
                    report.settled.push(r);
                }
                Ok(None) => {
                    debug!(signal_id = signal.id, "Already resolved, skipping");
                    report.skipped += 1;
                }
                Err(e) => {
                    // Rolled back; the signal stays unresolved for the next tick.
                    error!(signal_id = signal.id, transient = e.is_transient(), "Settlement failed: {}", e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Run cycles on a fixed interval until `shutdown` flips to `true`.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "🚀 Settlement scheduler started (every {}s)",
                self.config.interval.as_secs()
            );
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                if let Err(e) = self.run_cycle_until(Utc::now(), Some(&shutdown)).await {
                    warn!("Settlement cycle aborted: {}", e);
                }
                if *shutdown.borrow() {
                    break;
                }
            }
            info!("🛑 Settlement scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use crate::ledger::referrals;
    use crate::signals::registry::{SignalKind, SignalParams};
    use chrono::Duration as ChronoDuration;

    async fn seed_user(store: &LedgerStore, id: i64, trade: f64) {
        store
            .write(|tx| {
                tx.execute(
                    "INSERT INTO users (id, platform_key, created_at) VALUES (?1, ?2, 0)",
                    params![id, 1000 + id],
                )?;
                store::insert_balance(tx, id, Utc::now())?;
                referrals::insert_record(tx, id, 1000 + id)?;
                tx.execute(
                    "UPDATE balances SET trade_balance = ?1 WHERE user_id = ?2",
                    params![trade, id],
                )?;
                Ok(())
            })
            .await
            .unwrap();
    }

    async fn joined_signal(store: &LedgerStore, user_id: i64, amount: f64) -> (Signal, DateTime<Utc>) {
        let now = Utc::now();
        let params = SignalParams {
            name: "s".to_string(),
            join_window_secs: 60,
            active_window_secs: 600,
            burn_chance: 0.5,
            profit_percent: 1.1,
        };
        let signal = store
            .write(|tx| {
                let s = registry::insert_signal(tx, SignalKind::Custom, &params, now)?;
                registry::join(tx, user_id, s.id, amount, now)?;
                Ok(s)
            })
            .await
            .unwrap();
        let due_at = signal.expires_at + ChronoDuration::seconds(1);
        (signal, due_at)
    }

    fn scheduler(store: &LedgerStore, success: bool) -> SettlementScheduler {
        SettlementScheduler::new(
            store.clone(),
            Arc::new(FixedOutcome(success)),
            SettlementConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_successful_settlement() {
        let store = LedgerStore::open_in_memory().unwrap();
        seed_user(&store, 1, 100.0).await;
        let (signal, due_at) = joined_signal(&store, 1, 60.0).await;

        let report = scheduler(&store, true).run_cycle(due_at).await.unwrap();
        assert_eq!(report.settled.len(), 1);
        assert!((report.settled[0].net_profit - 6.0).abs() < 1e-9);

        let bal = store.read(|c| store::load_balance(c, 1)).await.unwrap();
        assert!((bal.earned_balance - 6.0).abs() < 1e-9);
        assert!((bal.balance - 6.0).abs() < 1e-9);
        assert_eq!(bal.frozen_balance, 0.0);
        assert!((bal.trade_balance - 106.0).abs() < 1e-9);

        let invs = store
            .read(|c| registry::investments_for_signal(c, signal.id))
            .await
            .unwrap();
        assert!((invs[0].profit.unwrap() - 6.0).abs() < 1e-9);

        let resolved = store.read(|c| registry::load_signal(c, signal.id)).await.unwrap();
        assert_eq!(resolved.is_successful, Some(true));
        assert!(resolved.resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_settlement_burns_principal() {
        let store = LedgerStore::open_in_memory().unwrap();
        seed_user(&store, 1, 100.0).await;
        let (signal, due_at) = joined_signal(&store, 1, 60.0).await;

        scheduler(&store, false).run_cycle(due_at).await.unwrap();

        let bal = store.read(|c| store::load_balance(c, 1)).await.unwrap();
        assert_eq!(bal.frozen_balance, 0.0);
        assert_eq!(bal.trade_balance, 40.0);
        assert_eq!(bal.earned_balance, 0.0);

        let invs = store
            .read(|c| registry::investments_for_signal(c, signal.id))
            .await
            .unwrap();
        assert_eq!(invs[0].profit, Some(-60.0));
    }

    #[tokio::test]
    async fn test_not_due_before_expiry() {
        let store = LedgerStore::open_in_memory().unwrap();
        seed_user(&store, 1, 100.0).await;
        let (signal, _) = joined_signal(&store, 1, 60.0).await;

        let report = scheduler(&store, true)
            .run_cycle(signal.expires_at - ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert!(report.settled.is_empty());
        let bal = store.read(|c| store::load_balance(c, 1)).await.unwrap();
        assert_eq!(bal.frozen_balance, 60.0);
    }

    #[tokio::test]
    async fn test_settles_exactly_once() {
        let store = LedgerStore::open_in_memory().unwrap();
        seed_user(&store, 1, 100.0).await;
        let (signal, due_at) = joined_signal(&store, 1, 60.0).await;

        let a = scheduler(&store, true);
        let b = scheduler(&store, true);
        let (ra, rb) = tokio::join!(a.run_cycle(due_at), b.run_cycle(due_at));
        let settled = ra.unwrap().settled.len() + rb.unwrap().settled.len();
        assert_eq!(settled, 1);

        // A stale copy of the signal is a no-op too.
        assert_eq!(a.settle_signal(&signal, due_at).await.unwrap(), None);

        let bal = store.read(|c| store::load_balance(c, 1)).await.unwrap();
        assert!((bal.earned_balance - 6.0).abs() < 1e-9);
        assert!((bal.trade_balance - 106.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_referral_bonus_on_settlement() {
        let store = LedgerStore::open_in_memory().unwrap();
        seed_user(&store, 1, 0.0).await; // inviter A
        seed_user(&store, 2, 100.0).await; // invitee B
        store
            .write(|tx| referrals::link(tx, 2, 1, Utc::now()))
            .await
            .unwrap();

        let (_, due_at) = joined_signal(&store, 2, 60.0).await;
        scheduler(&store, true).run_cycle(due_at).await.unwrap();

        let a = store.read(|c| store::load_balance(c, 1)).await.unwrap();
        assert!((a.balance - 0.06).abs() < 1e-9);
        assert_eq!(a.earned_balance, 0.0);
    }

    #[tokio::test]
    async fn test_failure_rolls_back_whole_signal() {
        let store = LedgerStore::open_in_memory().unwrap();
        seed_user(&store, 1, 100.0).await;
        let (signal, due_at) = joined_signal(&store, 1, 60.0).await;

        // Drain the frozen compartment behind the registry's back.
        store
            .write(|tx| {
                tx.execute("UPDATE balances SET frozen_balance = 0 WHERE user_id = 1", [])?;
                Ok(())
            })
            .await
            .unwrap();

        let report = scheduler(&store, true).run_cycle(due_at).await.unwrap();
        assert_eq!(report.failed, 1);
        let s = store.read(|c| registry::load_signal(c, signal.id)).await.unwrap();
        assert_eq!(s.is_successful, None);

        let err = scheduler(&store, true).settle_signal(&signal, due_at).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
    }

    #[tokio::test]
    async fn test_failing_signal_does_not_block_others() {
        let store = LedgerStore::open_in_memory().unwrap();
        seed_user(&store, 1, 100.0).await;
        seed_user(&store, 2, 100.0).await;
        let (broken, due_a) = joined_signal(&store, 1, 60.0).await;
        let (healthy, due_b) = joined_signal(&store, 2, 60.0).await;
        store
            .write(|tx| {
                tx.execute("UPDATE balances SET frozen_balance = 0 WHERE user_id = 1", [])?;
                Ok(())
            })
            .await
            .unwrap();

        let report = scheduler(&store, true).run_cycle(due_a.max(due_b)).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.settled.len(), 1);
        assert_eq!(report.settled[0].signal_id, healthy.id);

        let paid = store.read(|c| store::load_balance(c, 2)).await.unwrap();
        assert!((paid.trade_balance - 106.0).abs() < 1e-9);
        assert_eq!(paid.frozen_balance, 0.0);
        let s = store.read(|c| registry::load_signal(c, broken.id)).await.unwrap();
        assert_eq!(s.is_successful, None);
    }

    #[tokio::test]
    async fn test_unfreeze_all_cannot_take_open_stakes() {
        let store = LedgerStore::open_in_memory().unwrap();
        seed_user(&store, 1, 100.0).await;
        seed_user(&store, 2, 100.0).await;
        let now = Utc::now();
        let params = SignalParams {
            name: "shared".to_string(),
            join_window_secs: 60,
            active_window_secs: 600,
            burn_chance: 0.5,
            profit_percent: 1.1,
        };
        let signal = store
            .write(|tx| {
                let s = registry::insert_signal(tx, SignalKind::Custom, &params, now)?;
                registry::join(tx, 1, s.id, 60.0, now)?;
                registry::join(tx, 2, s.id, 60.0, now)?;
                Ok(s)
            })
            .await
            .unwrap();

        let err = store
            .write(|tx| balances::unfreeze_all(tx, 1, Utc::now()))
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::NoFrozenFunds);

        let report = scheduler(&store, true)
            .run_cycle(signal.expires_at + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(report.settled[0].investments, 2);
        for user_id in [1, 2] {
            let bal = store.read(|c| store::load_balance(c, user_id)).await.unwrap();
            assert_eq!(bal.frozen_balance, 0.0);
            assert!((bal.trade_balance - 106.0).abs() < 1e-9);
        }
    }

    /// Requests shutdown as soon as the first outcome is drawn.
    struct StopAfterFirstDraw(watch::Sender<bool>);

    impl OutcomeSource for StopAfterFirstDraw {
        fn draw_success(&self, _burn_chance: f64) -> bool {
            self.0.send_replace(true);
            true
        }
    }

    #[tokio::test]
    async fn test_shutdown_mid_cycle_leaves_queue_untouched() {
        let store = LedgerStore::open_in_memory().unwrap();
        seed_user(&store, 1, 200.0).await;
        let past = Utc::now() - ChronoDuration::hours(1);
        let params = SignalParams {
            name: "queued".to_string(),
            join_window_secs: 60,
            active_window_secs: 600,
            burn_chance: 0.5,
            profit_percent: 1.1,
        };
        let ids = store
            .write(|tx| {
                let mut ids = Vec::new();
                for _ in 0..3 {
                    let s = registry::insert_signal(tx, SignalKind::Custom, &params, past)?;
                    registry::join(tx, 1, s.id, 40.0, past)?;
                    ids.push(s.id);
                }
                Ok(ids)
            })
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = SettlementScheduler::new(
            store.clone(),
            Arc::new(StopAfterFirstDraw(tx)),
            SettlementConfig {
                interval: Duration::from_millis(10),
                ..Default::default()
            },
        )
        .spawn(rx);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        let mut resolved = 0;
        for id in &ids {
            let signal = store.read(|c| registry::load_signal(c, *id)).await.unwrap();
            let invs = store
                .read(|c| registry::investments_for_signal(c, *id))
                .await
                .unwrap();
            match signal.is_successful {
                Some(_) => {
                    resolved += 1;
                    assert!(invs.iter().all(|i| i.profit.is_some()));
                }
                None => assert!(invs.iter().all(|i| i.profit.is_none())),
            }
        }
        assert_eq!(resolved, 1);

        let bal = store.read(|c| store::load_balance(c, 1)).await.unwrap();
        assert_eq!(bal.frozen_balance, 80.0);
        assert!((bal.trade_balance - 124.0).abs() < 1e-9);
    }

    #[test]
    fn test_random_outcome_extremes() {
        let src = RandomOutcome::seeded(3);
        for _ in 0..100 {
            assert!(src.draw_success(0.0));
            assert!(!src.draw_success(1.0));
        }
    }

    #[tokio::test]
    async fn test_spawned_scheduler_stops_on_shutdown() {
        let store = LedgerStore::open_in_memory().unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = SettlementScheduler::new(
            store,
            Arc::new(FixedOutcome(true)),
            SettlementConfig {
                interval: Duration::from_millis(10),
                ..Default::default()
            },
        )
        .spawn(rx);

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
