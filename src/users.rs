//! User Registration & Lookup
//!
//! Users are keyed externally by a stable numeric platform key (the chat
//! platform's user id). Registration also opens the user's balance row and
//! referral row so the ledger never meets a user without them.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::{referrals, store};
use crate::ledger::store::{from_millis, to_millis};

/// Profile fields supplied by the front-end at registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    pub platform_key: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub language_code: Option<String>,
    #[serde(default)]
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub platform_key: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language_code: String,
    pub photo_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UserLookup {
    Found(User),
    NotFound,
}

impl UserLookup {
    pub fn into_result(self, platform_key: i64) -> LedgerResult<User> {
        match self {
            UserLookup::Found(user) => Ok(user),
            UserLookup::NotFound => Err(LedgerError::not_found(format!("User {}", platform_key))),
        }
    }
}

pub fn find_by_key(conn: &Connection, platform_key: i64) -> LedgerResult<UserLookup> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, platform_key, username, first_name, last_name, language_code, photo_url, created_at
         FROM users WHERE platform_key = ?1",
    )?;
    let user = stmt
        .query_row([platform_key], |row| {
            Ok(User {
                id: row.get(0)?,
                platform_key: row.get(1)?,
                username: row.get(2)?,
                first_name: row.get(3)?,
                last_name: row.get(4)?,
                language_code: row.get(5)?,
                photo_url: row.get(6)?,
                created_at: from_millis(row.get(7)?),
            })
        })
        .optional()?;

    Ok(match user {
        Some(user) => UserLookup::Found(user),
        None => UserLookup::NotFound,
    })
}

pub fn require(conn: &Connection, platform_key: i64) -> LedgerResult<User> {
    find_by_key(conn, platform_key)?.into_result(platform_key)
}

/// Register a user, or return the existing one unchanged. The bool is `true`
/// when a new user was created.
pub fn register(conn: &Connection, profile: &UserProfile, now: DateTime<Utc>) -> LedgerResult<(User, bool)> {
    if let UserLookup::Found(existing) = find_by_key(conn, profile.platform_key)? {
        return Ok((existing, false));
    }

    let language_code = profile
        .language_code
        .clone()
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| "en".to_string());

    conn.execute(
        "INSERT INTO users (platform_key, username, first_name, last_name, language_code, photo_url, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            profile.platform_key,
            profile.username,
            profile.first_name,
            profile.last_name,
            language_code,
            profile.photo_url,
            to_millis(now),
        ],
    )?;
    let id = conn.last_insert_rowid();

    store::insert_balance(conn, id, now)?;
    referrals::insert_record(conn, id, profile.platform_key)?;

    info!(
        user_id = id,
        platform_key = profile.platform_key,
        "✅ Registered user"
    );

    let user = require(conn, profile.platform_key)?;
    Ok((user, true))
}
