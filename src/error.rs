//! Ledger error taxonomy
//!
//! Caller errors (`InvalidParameter`, `InsufficientFunds`, ...) are surfaced
//! as-is. Storage failures collapse into `Store`, which the settlement loop
//! treats as transient and retries on the next tick.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerError {
    /// User, balance, signal or referral row absent.
    NotFound(String),
    /// A debit/freeze precondition failed.
    InsufficientFunds { needed: f64, available: f64 },
    /// Non-positive amount, malformed window, out-of-range probability.
    InvalidParameter(String),
    /// Join attempted at or after the signal's `join_until`.
    SignalNotJoinable(i64),
    /// `unfreeze_all` with nothing frozen outside open signal stakes.
    NoFrozenFunds,
    /// Invitee already has an inviter.
    AlreadyLinked,
    /// Storage unavailable or failed mid-transaction.
    Store(String),
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

impl LedgerError {
    pub fn not_found(what: impl Into<String>) -> Self {
        LedgerError::NotFound(what.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        LedgerError::InvalidParameter(msg.into())
    }

    /// Whether a retry on a later tick could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Store(_))
    }
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(what) => write!(f, "{} not found", what),
            Self::InsufficientFunds { needed, available } => write!(
                f,
                "Insufficient funds: needed {:.6}, available {:.6}",
                needed, available
            ),
            Self::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            Self::SignalNotJoinable(id) => write!(f, "Signal {} is not available for joining", id),
            Self::NoFrozenFunds => write!(f, "No frozen balance to unfreeze"),
            Self::AlreadyLinked => write!(f, "User already has an inviter"),
            Self::Store(msg) => write!(f, "Ledger store error: {}", msg),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => LedgerError::NotFound("row".to_string()),
            other => LedgerError::Store(other.to_string()),
        }
    }
}
