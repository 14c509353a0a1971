//! Signal Ledger
//!
//! Multi-compartment user balances, time-boxed investment signals, periodic
//! exactly-once settlement and single-level referral bonuses over one SQLite
//! ledger. The binary wires [`engine::LedgerEngine`] to an HTTP surface and the
//! settlement scheduler; tests drive the engine directly.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod signals;
pub mod users;

pub use config::LedgerConfig;
pub use engine::{BalanceView, LedgerEngine};
pub use error::{LedgerError, LedgerResult};
