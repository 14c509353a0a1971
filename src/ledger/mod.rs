//! Ledger Module - Balances, History & Referrals
//!
//! - `store`: SQLite-backed ledger store and row types
//! - `balances`: atomic balance-compartment mutations
//! - `referrals`: invite edges and referral bonus propagation

pub mod balances;
pub mod referrals;
pub mod store;

pub use balances::BalanceOps;
pub use referrals::{ReferralBonus, ReferralRecord, ReferralTree, ReferralTreeEntry};
pub use store::{
    Balance, LedgerStore, ProfitRecord, TransactionKind, TransactionRecord, AMOUNT_EPSILON,
};
