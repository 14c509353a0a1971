//! Ledger service configuration
//!
//! Layered: defaults, then an optional TOML file, then `LEDGER_*` environment
//! variables. Command-line flags are applied last by the binary.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::signals::{SettlementConfig, StaticBatchSpec, MAX_WINDOW_SECS, STATIC_MAX_WORK_SECS};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// SQLite file backing the ledger
    pub db_path: String,
    /// HTTP listen address
    pub bind_addr: String,
    /// Seconds between settlement cycles
    pub settle_interval_secs: u64,
    /// Share of an invitee's cumulative earnings paid to the inviter
    pub referral_bonus_rate: f64,
    /// Size of the static batch seeded at startup
    pub static_signal_count: usize,
    /// Startup fails if seeding takes longer than this
    pub static_seed_timeout_secs: u64,
    /// Static signal join window after the lead time
    pub static_join_secs: i64,
    /// Lead time before a static signal's windows start counting
    pub static_lead_secs: i64,
    pub referral_tree_max_depth: usize,
    pub referral_tree_max_nodes: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            db_path: "signal_ledger.db".to_string(),
            bind_addr: "0.0.0.0:3000".to_string(),
            settle_interval_secs: 60,
            referral_bonus_rate: 0.01,
            static_signal_count: 9,
            static_seed_timeout_secs: 30,
            static_join_secs: 30 * 60,
            static_lead_secs: 6 * 60 * 60,
            referral_tree_max_depth: 16,
            referral_tree_max_nodes: 1000,
        }
    }
}

impl LedgerConfig {
    /// Defaults, overlaid by `path` (if given) and then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_toml_file(p)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Override fields from `LEDGER_*` variables. Unparseable values are ignored.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("LEDGER_DB_PATH") {
            if !v.trim().is_empty() {
                self.db_path = v;
            }
        }
        if let Ok(v) = std::env::var("LEDGER_BIND_ADDR") {
            if !v.trim().is_empty() {
                self.bind_addr = v;
            }
        }
        if let Ok(v) = std::env::var("LEDGER_SETTLE_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.settle_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("LEDGER_REFERRAL_BONUS_RATE") {
            if let Ok(r) = v.parse() {
                self.referral_bonus_rate = r;
            }
        }
        if let Ok(v) = std::env::var("LEDGER_STATIC_SIGNAL_COUNT") {
            if let Ok(n) = v.parse() {
                self.static_signal_count = n;
            }
        }
        if let Ok(v) = std::env::var("LEDGER_STATIC_SEED_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.static_seed_timeout_secs = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            bail!("db_path must not be empty");
        }
        if self.settle_interval_secs == 0 {
            bail!("settle_interval_secs must be > 0");
        }
        if !(self.referral_bonus_rate.is_finite() && (0.0..=1.0).contains(&self.referral_bonus_rate)) {
            bail!("referral_bonus_rate must be within [0, 1]");
        }
        if self.static_signal_count == 0 {
            bail!("static_signal_count must be > 0");
        }
        if self.static_seed_timeout_secs == 0 {
            bail!("static_seed_timeout_secs must be > 0");
        }
        if self.static_join_secs <= 0 || self.static_lead_secs < 0 {
            bail!("static signal windows must be positive");
        }
        let join_window = self.static_lead_secs.checked_add(self.static_join_secs);
        let active_window = self.static_lead_secs.checked_add(STATIC_MAX_WORK_SECS);
        for window in [join_window, active_window] {
            match window {
                Some(secs) if secs <= MAX_WINDOW_SECS => {}
                _ => bail!("static signal windows exceed the 10-year maximum"),
            }
        }
        if self.referral_tree_max_depth == 0 || self.referral_tree_max_nodes == 0 {
            bail!("referral tree bounds must be > 0");
        }
        Ok(())
    }

    pub fn settle_interval(&self) -> Duration {
        Duration::from_secs(self.settle_interval_secs)
    }

    pub fn static_seed_timeout(&self) -> Duration {
        Duration::from_secs(self.static_seed_timeout_secs)
    }

    pub fn static_batch(&self) -> StaticBatchSpec {
        StaticBatchSpec {
            count: self.static_signal_count,
            join_secs: self.static_join_secs,
            lead_secs: self.static_lead_secs,
        }
    }

    pub fn settlement(&self) -> SettlementConfig {
        SettlementConfig {
            interval: self.settle_interval(),
            referral_bonus_rate: self.referral_bonus_rate,
        }
    }
}
