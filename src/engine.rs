//! Ledger Engine
//!
//! Explicitly constructed owner of the store handle. Exposes the user-facing
//! operations keyed by the external platform key and hands out the settlement
//! scheduler sharing the same store. Open at startup, `close` at shutdown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::{
    referrals, store, Balance, BalanceOps, LedgerStore, ProfitRecord, ReferralRecord, ReferralTree,
    TransactionRecord,
};
use crate::signals::{
    OutcomeSource, SettlementScheduler, Signal, SignalInvestment, SignalParams, SignalRegistry,
};
use crate::users::{self, User, UserLookup, UserProfile};

/// Balance compartments as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceView {
    pub platform_key: i64,
    pub balance: f64,
    pub trade_balance: f64,
    pub frozen_balance: f64,
    pub earned_balance: f64,
    pub updated_at: DateTime<Utc>,
}

impl BalanceView {
    fn new(platform_key: i64, b: Balance) -> Self {
        Self {
            platform_key,
            balance: b.balance,
            trade_balance: b.trade_balance,
            frozen_balance: b.frozen_balance,
            earned_balance: b.earned_balance,
            updated_at: b.updated_at,
        }
    }
}

pub struct LedgerEngine {
    store: LedgerStore,
    balances: BalanceOps,
    registry: SignalRegistry,
    config: LedgerConfig,
}

impl LedgerEngine {
    pub fn open(config: LedgerConfig) -> LedgerResult<Self> {
        let store = LedgerStore::open(&config.db_path)?;
        Ok(Self::with_store(store, config))
    }

    pub fn open_in_memory(config: LedgerConfig) -> LedgerResult<Self> {
        Ok(Self::with_store(LedgerStore::open_in_memory()?, config))
    }

    pub fn with_store(store: LedgerStore, config: LedgerConfig) -> Self {
        let registry = SignalRegistry::new(store.clone(), config.static_batch());
        Self::with_registry(store, registry, config)
    }

    /// Use a caller-built registry, e.g. one with a seeded RNG.
    pub fn with_registry(store: LedgerStore, registry: SignalRegistry, config: LedgerConfig) -> Self {
        Self {
            balances: BalanceOps::new(store.clone(), config.referral_bonus_rate),
            store,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    async fn user_id(&self, platform_key: i64) -> LedgerResult<i64> {
        self.store
            .read(|c| users::require(c, platform_key))
            .await
            .map(|u| u.id)
    }

    // ==================== Users ====================

    pub async fn register_user(&self, profile: UserProfile) -> LedgerResult<(User, bool)> {
        self.store
            .write(|tx| users::register(tx, &profile, Utc::now()))
            .await
    }

    pub async fn find_user(&self, platform_key: i64) -> LedgerResult<UserLookup> {
        self.store.read(|c| users::find_by_key(c, platform_key)).await
    }

    // ==================== Balances ====================

    pub async fn get_balance(&self, platform_key: i64) -> LedgerResult<BalanceView> {
        let id = self.user_id(platform_key).await?;
        let bal = self.balances.get(id).await?;
        Ok(BalanceView::new(platform_key, bal))
    }

    pub async fn deposit(&self, platform_key: i64, amount: f64) -> LedgerResult<BalanceView> {
        let id = self.user_id(platform_key).await?;
        let bal = self.balances.credit(id, amount).await?;
        Ok(BalanceView::new(platform_key, bal))
    }

    pub async fn withdraw(&self, platform_key: i64, amount: f64) -> LedgerResult<BalanceView> {
        let id = self.user_id(platform_key).await?;
        let bal = self.balances.debit(id, amount).await?;
        Ok(BalanceView::new(platform_key, bal))
    }

    pub async fn transfer_to_trading(&self, platform_key: i64, amount: f64) -> LedgerResult<BalanceView> {
        let id = self.user_id(platform_key).await?;
        let bal = self.balances.move_to_trading(id, amount).await?;
        Ok(BalanceView::new(platform_key, bal))
    }

    pub async fn transfer_to_main(&self, platform_key: i64, amount: f64) -> LedgerResult<BalanceView> {
        let id = self.user_id(platform_key).await?;
        let bal = self.balances.move_to_main(id, amount).await?;
        Ok(BalanceView::new(platform_key, bal))
    }

    /// Generic freeze from the main balance.
    pub async fn freeze(&self, platform_key: i64, amount: f64) -> LedgerResult<BalanceView> {
        let id = self.user_id(platform_key).await?;
        let bal = self.balances.freeze(id, amount).await?;
        Ok(BalanceView::new(platform_key, bal))
    }

    pub async fn unfreeze(&self, platform_key: i64, amount: f64) -> LedgerResult<BalanceView> {
        let id = self.user_id(platform_key).await?;
        let bal = self.balances.unfreeze(id, amount).await?;
        Ok(BalanceView::new(platform_key, bal))
    }

    /// Returns the amount moved back to trading.
    pub async fn unfreeze_all(&self, platform_key: i64) -> LedgerResult<(f64, BalanceView)> {
        let id = self.user_id(platform_key).await?;
        let (amount, bal) = self.balances.unfreeze_all(id).await?;
        Ok((amount, BalanceView::new(platform_key, bal)))
    }

    /// Credit earned profit outside of settlement (manual adjustments).
    pub async fn credit_earned(&self, platform_key: i64, amount: f64) -> LedgerResult<BalanceView> {
        let id = self.user_id(platform_key).await?;
        let bal = self.balances.credit_earned(id, amount).await?;
        Ok(BalanceView::new(platform_key, bal))
    }

    pub async fn list_transactions(&self, platform_key: i64) -> LedgerResult<Vec<TransactionRecord>> {
        self.store
            .read(|c| {
                let user = users::require(c, platform_key)?;
                store::list_transactions(c, user.id)
            })
            .await
    }

    pub async fn list_profits(&self, platform_key: i64) -> LedgerResult<Vec<ProfitRecord>> {
        self.store
            .read(|c| {
                let user = users::require(c, platform_key)?;
                store::list_profits(c, user.id)
            })
            .await
    }

    // ==================== Signals ====================

    pub async fn create_random_signal(&self, name: Option<String>) -> LedgerResult<Signal> {
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| "Random signal".to_string());
        self.registry.create_random_signal(&name).await
    }

    pub async fn create_custom_signal(&self, params: SignalParams) -> LedgerResult<Signal> {
        self.registry.create_signal(params).await
    }

    pub async fn get_signal(&self, signal_id: i64) -> LedgerResult<Signal> {
        self.registry.get(signal_id).await
    }

    pub async fn list_active_signals(&self) -> LedgerResult<Vec<Signal>> {
        self.registry.list_active(Utc::now()).await
    }

    pub async fn join_signal(&self, platform_key: i64, signal_id: i64, amount: f64) -> LedgerResult<SignalInvestment> {
        let id = self.user_id(platform_key).await?;
        self.registry.join_signal(id, signal_id, amount).await
    }

    pub async fn list_investments(&self, platform_key: i64) -> LedgerResult<Vec<SignalInvestment>> {
        let id = self.user_id(platform_key).await?;
        self.registry.investments_for_user(id).await
    }

    /// Replace the static batch, bounded by the configured timeout.
    pub async fn seed_static_signals(&self) -> LedgerResult<Vec<Signal>> {
        let timeout = self.config.static_seed_timeout();
        match tokio::time::timeout(timeout, self.registry.seed_static_batch()).await {
            Ok(result) => result,
            Err(_) => {
                error!("Static signal seeding timed out after {:?}", timeout);
                Err(LedgerError::Store(format!(
                    "static signal seeding timed out after {}s",
                    timeout.as_secs()
                )))
            }
        }
    }

    pub fn settlement_scheduler(&self, outcomes: Arc<dyn OutcomeSource>) -> SettlementScheduler {
        SettlementScheduler::new(self.store.clone(), outcomes, self.config.settlement())
    }

    // ==================== Referrals ====================

    /// Link `invitee_key` under `inviter_key`. Set once, never changed.
    pub async fn create_referral(&self, invitee_key: i64, inviter_key: i64) -> LedgerResult<ReferralRecord> {
        self.store
            .write(|tx| {
                let invitee = users::require(tx, invitee_key)?;
                let inviter = users::require(tx, inviter_key)?;
                referrals::link(tx, invitee.id, inviter.id, Utc::now())
            })
            .await
    }

    pub async fn get_referral(&self, platform_key: i64) -> LedgerResult<ReferralRecord> {
        self.store
            .read(|c| {
                let user = users::require(c, platform_key)?;
                referrals::find_record(c, user.id)?
                    .ok_or_else(|| LedgerError::not_found(format!("Referral record for {}", platform_key)))
            })
            .await
    }

    pub async fn referral_tree(&self, platform_key: i64) -> LedgerResult<ReferralTree> {
        let (depth, nodes) = (
            self.config.referral_tree_max_depth,
            self.config.referral_tree_max_nodes,
        );
        self.store
            .read(|c| {
                let user = users::require(c, platform_key)?;
                referrals::tree(c, user.id, depth, nodes)
            })
            .await
    }

    // ==================== Lifecycle ====================

    pub async fn close(&self) -> LedgerResult<()> {
        self.store.checkpoint().await?;
        info!("📒 Ledger closed");
        Ok(())
    }
}
