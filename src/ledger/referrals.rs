//! Referral edges and bonus propagation
//!
//! Each user has one referral row: their own invite code, how many users they
//! invited, and (at most once, immutably) who invited them. The invite graph
//! is kept acyclic at link time.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info};

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::balances;
use crate::ledger::store::{self, to_millis, TransactionKind};

/// Upper bound on inviter-chain walks; far above any real chain.
const MAX_CHAIN_WALK: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralRecord {
    pub user_id: i64,
    pub invite_code: String,
    pub invited_count: i64,
    pub referred_by: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralBonus {
    pub inviter_id: i64,
    pub invitee_id: i64,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralTreeEntry {
    pub user_id: i64,
    pub platform_key: i64,
    pub referred_by: i64,
    pub depth: usize,
    pub invited_count: i64,
}

/// Invitees of one user, breadth first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralTree {
    pub root: ReferralRecord,
    pub invitees: Vec<ReferralTreeEntry>,
    /// A depth or node bound cut the walk short.
    pub truncated: bool,
}

pub fn invite_code(user_id: i64, platform_key: i64) -> String {
    format!("ref-{}-{}", user_id, platform_key)
}

pub fn insert_record(conn: &Connection, user_id: i64, platform_key: i64) -> LedgerResult<ReferralRecord> {
    let code = invite_code(user_id, platform_key);
    conn.execute(
        "INSERT INTO referrals (user_id, invite_code, invited_count) VALUES (?1, ?2, 0)",
        params![user_id, code],
    )?;
    Ok(ReferralRecord {
        user_id,
        invite_code: code,
        invited_count: 0,
        referred_by: None,
    })
}

pub fn find_record(conn: &Connection, user_id: i64) -> LedgerResult<Option<ReferralRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT user_id, invite_code, invited_count, referred_by FROM referrals WHERE user_id = ?1",
    )?;
    let rec = stmt
        .query_row([user_id], |row| {
            Ok(ReferralRecord {
                user_id: row.get(0)?,
                invite_code: row.get(1)?,
                invited_count: row.get(2)?,
                referred_by: row.get(3)?,
            })
        })
        .optional()?;
    Ok(rec)
}

fn load_record(conn: &Connection, user_id: i64) -> LedgerResult<ReferralRecord> {
    find_record(conn, user_id)?
        .ok_or_else(|| LedgerError::not_found(format!("Referral record for user {}", user_id)))
}

pub fn inviter_of(conn: &Connection, user_id: i64) -> LedgerResult<Option<i64>> {
    Ok(find_record(conn, user_id)?.and_then(|r| r.referred_by))
}

/// Record that `inviter_id` invited `invitee_id`.
pub fn link(
    conn: &Connection,
    invitee_id: i64,
    inviter_id: i64,
    now: DateTime<Utc>,
) -> LedgerResult<ReferralRecord> {
    if invitee_id == inviter_id {
        return Err(LedgerError::invalid("a user cannot invite themselves"));
    }

    let invitee = load_record(conn, invitee_id)?;
    load_record(conn, inviter_id)?;
    if invitee.referred_by.is_some() {
        return Err(LedgerError::AlreadyLinked);
    }

    // Walk the inviter's own chain upward; meeting the invitee means a cycle.
    let mut cursor = inviter_of(conn, inviter_id)?;
    let mut steps = 0usize;
    while let Some(ancestor) = cursor {
        if ancestor == invitee_id {
            return Err(LedgerError::invalid(format!(
                "user {} is already an upstream inviter of {}",
                invitee_id, inviter_id
            )));
        }
        steps += 1;
        if steps > MAX_CHAIN_WALK {
            return Err(LedgerError::invalid("referral chain too deep"));
        }
        cursor = inviter_of(conn, ancestor)?;
    }

    conn.execute(
        "UPDATE referrals SET referred_by = ?1, linked_at = ?2 WHERE user_id = ?3",
        params![inviter_id, to_millis(now), invitee_id],
    )?;
    conn.execute(
        "UPDATE referrals SET invited_count = invited_count + 1 WHERE user_id = ?1",
        [inviter_id],
    )?;

    info!(invitee_id, inviter_id, "🤝 Referral linked");
    load_record(conn, invitee_id)
}

/// Pay the invitee's inviter `rate` times the invitee's *cumulative* earned
/// balance. Single level: the inviter's own inviter gets nothing.
pub fn propagate_bonus(
    conn: &Connection,
    invitee_id: i64,
    rate: f64,
    now: DateTime<Utc>,
) -> LedgerResult<Option<ReferralBonus>> {
    let Some(inviter_id) = inviter_of(conn, invitee_id)? else {
        debug!(user_id = invitee_id, "No inviter, referral bonus skipped");
        return Ok(None);
    };

    let earned = store::load_balance(conn, invitee_id)?.earned_balance;
    let amount = earned * rate;
    if !(amount > 0.0) {
        return Ok(None);
    }

    balances::credit_as(conn, inviter_id, amount, TransactionKind::ReferralBonus, now)?;
    info!(inviter_id, invitee_id, amount, "🎁 Referral bonus credited");

    Ok(Some(ReferralBonus {
        inviter_id,
        invitee_id,
        amount,
    }))
}

/// Breadth-first walk of everyone below `root_id`, bounded by depth and node count.
pub fn tree(
    conn: &Connection,
    root_id: i64,
    max_depth: usize,
    max_nodes: usize,
) -> LedgerResult<ReferralTree> {
    let root = load_record(conn, root_id)?;
    let mut stmt = conn.prepare_cached(
        "SELECT r.user_id, u.platform_key, r.invited_count
         FROM referrals r JOIN users u ON u.id = r.user_id
         WHERE r.referred_by = ?1 ORDER BY r.user_id ASC",
    )?;

    let mut invitees = Vec::new();
    let mut truncated = false;
    let mut seen: HashSet<i64> = HashSet::from([root_id]);
    let mut queue: VecDeque<(i64, usize)> = VecDeque::from([(root_id, 0)]);

    'walk: while let Some((parent, depth)) = queue.pop_front() {
        let children = stmt
            .query_map([parent], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        if children.is_empty() {
            continue;
        }
        if depth >= max_depth {
            truncated = true;
            continue;
        }

        for (user_id, platform_key, invited_count) in children {
            if !seen.insert(user_id) {
                continue;
            }
            if invitees.len() >= max_nodes {
                truncated = true;
                break 'walk;
            }
            invitees.push(ReferralTreeEntry {
                user_id,
                platform_key,
                referred_by: parent,
                depth: depth + 1,
                invited_count,
            });
            queue.push_back((user_id, depth + 1));
        }
    }

    Ok(ReferralTree {
        root,
        invitees,
        truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::store::LedgerStore;

    async fn store_with_users(n: i64) -> LedgerStore {
        let store = LedgerStore::open_in_memory().unwrap();
        store
            .write(|tx| {
                for id in 1..=n {
                    tx.execute(
                        "INSERT INTO users (id, platform_key, created_at) VALUES (?1, ?2, 0)",
                        params![id, id * 10],
                    )?;
                    store::insert_balance(tx, id, Utc::now())?;
                    insert_record(tx, id, id * 10)?;
                }
                Ok(())
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_link_sets_inviter_once() {
        let store = store_with_users(3).await;
        let rec = store.write(|tx| link(tx, 2, 1, Utc::now())).await.unwrap();
        assert_eq!(rec.referred_by, Some(1));

        let err = store.write(|tx| link(tx, 2, 3, Utc::now())).await.unwrap_err();
        assert_eq!(err, LedgerError::AlreadyLinked);

        let inviter = store.read(|c| load_record(c, 1)).await.unwrap();
        assert_eq!(inviter.invited_count, 1);
        assert_eq!(inviter.invite_code, "ref-1-10");
    }

    #[tokio::test]
    async fn test_link_rejects_self_and_cycles() {
        let store = store_with_users(3).await;
        let err = store.write(|tx| link(tx, 1, 1, Utc::now())).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidParameter(_)));

        // 1 invites 2, 2 invites 3; 3 inviting 1 would close the loop.
        store.write(|tx| link(tx, 2, 1, Utc::now())).await.unwrap();
        store.write(|tx| link(tx, 3, 2, Utc::now())).await.unwrap();
        let err = store.write(|tx| link(tx, 1, 3, Utc::now())).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidParameter(_)));
        assert_eq!(store.read(|c| inviter_of(c, 1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_link_unknown_user() {
        let store = store_with_users(1).await;
        let err = store.write(|tx| link(tx, 1, 99, Utc::now())).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_bonus_uses_cumulative_earned_balance() {
        let store = store_with_users(3).await;
        store.write(|tx| link(tx, 2, 1, Utc::now())).await.unwrap();
        store.write(|tx| link(tx, 3, 2, Utc::now())).await.unwrap();

        store
            .write(|tx| {
                balances::credit_earned(tx, 2, 6.0, None, 0.01, Utc::now())?;
                balances::credit_earned(tx, 2, 4.0, None, 0.01, Utc::now())
            })
            .await
            .unwrap();

        // 1% of 6 after the first payout, then 1% of 10 after the second.
        let inviter = store.read(|c| store::load_balance(c, 1)).await.unwrap();
        assert!((inviter.balance - 0.16).abs() < 1e-9);
        assert_eq!(inviter.earned_balance, 0.0);

        // Bonuses only flow upward: user 3 sits below 2 and receives nothing.
        let grandchild = store.read(|c| store::load_balance(c, 3)).await.unwrap();
        assert_eq!(grandchild.balance, 0.0);
    }

    #[tokio::test]
    async fn test_missing_inviter_balance_does_not_undo_earned_credit() {
        let store = store_with_users(2).await;
        store.write(|tx| link(tx, 2, 1, Utc::now())).await.unwrap();
        store
            .write(|tx| {
                tx.execute("DELETE FROM balances WHERE user_id = 1", [])?;
                Ok(())
            })
            .await
            .unwrap();

        let bal = store
            .write(|tx| balances::credit_earned(tx, 2, 5.0, None, 0.01, Utc::now()))
            .await
            .unwrap();
        assert_eq!(bal.earned_balance, 5.0);
        assert_eq!(bal.balance, 5.0);
    }

    #[tokio::test]
    async fn test_tree_is_bounded() {
        let store = store_with_users(6).await;
        // 1 -> 2 -> 3 -> 4, and 1 -> 5, 1 -> 6
        for (invitee, inviter) in [(2, 1), (3, 2), (4, 3), (5, 1), (6, 1)] {
            store
                .write(move |tx| link(tx, invitee, inviter, Utc::now()))
                .await
                .unwrap();
        }

        let full = store.read(|c| tree(c, 1, 16, 1000)).await.unwrap();
        assert_eq!(full.invitees.len(), 5);
        assert!(!full.truncated);
        assert_eq!(full.root.invited_count, 3);

        let shallow = store.read(|c| tree(c, 1, 1, 1000)).await.unwrap();
        assert_eq!(shallow.invitees.len(), 3);
        assert!(shallow.invitees.iter().all(|e| e.depth == 1));
        assert!(shallow.truncated);

        let capped = store.read(|c| tree(c, 1, 16, 2)).await.unwrap();
        assert_eq!(capped.invitees.len(), 2);
        assert!(capped.truncated);
    }
}
