// =============================================================================
// Distributed lock — short-lived exclusive reservations in system_config
// =============================================================================
//
// Keyed `{purpose}_{symbol}_{side}` (optionally `_stage{n}`), bound to a
// holder identity of the form `{hostname}:{pid}` with a 30-second lease.
//
//   try_acquire — no row: insert; same holder: refresh; live foreign holder:
//                 contention (Ok(false), not an error); stale holder: preempt
//                 with a warning.
//   release     — delete only when the holder matches.
//
// Both the partial-TP executor and the reversal monitor obtain their locks
// and the recent-close guard through this one primitive.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::{debug, warn};

use crate::error::StoreResult;
use crate::store::Store;
use crate::types::Side;

/// Lease duration before a lock may be preempted.
pub const LOCK_LEASE_SECS: i64 = 30;

/// Window for the recent-close duplicate-execution guard.
pub const RECENT_CLOSE_WINDOW_SECS: i64 = 30;

/// The holder identity for this process.
pub fn holder_identity() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    format!("{host}:{}", std::process::id())
}

/// Key for a staged partial-TP execution.
pub fn partial_tp_key(symbol: &str, side: Side, stage: u8) -> String {
    format!("partial_tp_{symbol}_{side}_stage{stage}")
}

/// Key for a reversal protective close.
pub fn reversal_close_key(symbol: &str, side: Side) -> String {
    format!("reversal_close_{symbol}_{side}")
}

impl Store {
    /// Attempt to take the lock. `Ok(true)` means the caller holds it.
    /// Contention is a normal outcome, not an error.
    pub fn try_acquire_lock(&self, key: &str, holder: &str) -> StoreResult<bool> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        let now = Utc::now();

        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT value, updated_at FROM system_config WHERE key = ?1",
                params![key],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        let acquired = match existing {
            None => {
                tx.execute(
                    "INSERT INTO system_config (key, value, updated_at) VALUES (?1, ?2, ?3)",
                    params![key, holder, now.to_rfc3339()],
                )?;
                true
            }
            Some((current_holder, updated_at)) if current_holder == holder => {
                // Re-entrant refresh of our own lease.
                tx.execute(
                    "UPDATE system_config SET updated_at = ?2 WHERE key = ?1",
                    params![key, now.to_rfc3339()],
                )?;
                debug!(key, holder, previous = %updated_at, "lock lease refreshed");
                true
            }
            Some((current_holder, updated_at)) => {
                let age_ok = DateTime::parse_from_rfc3339(&updated_at)
                    .map(|t| now.signed_duration_since(t.with_timezone(&Utc)))
                    .map(|age| age < Duration::seconds(LOCK_LEASE_SECS))
                    .unwrap_or(false);

                if age_ok {
                    debug!(key, holder, current_holder = %current_holder, "lock contention — skipping");
                    false
                } else {
                    warn!(
                        key,
                        stale_holder = %current_holder,
                        new_holder = holder,
                        "pre-empting stale lock past its lease"
                    );
                    tx.execute(
                        "UPDATE system_config SET value = ?2, updated_at = ?3 WHERE key = ?1",
                        params![key, holder, now.to_rfc3339()],
                    )?;
                    true
                }
            }
        };

        tx.commit()?;
        Ok(acquired)
    }

    /// Release the lock; a no-op when the holder does not match.
    pub fn release_lock(&self, key: &str, holder: &str) -> StoreResult<()> {
        let conn = self.lock_conn();
        let deleted = conn.execute(
            "DELETE FROM system_config WHERE key = ?1 AND value = ?2",
            params![key, holder],
        )?;
        if deleted == 0 {
            debug!(key, holder, "release found no matching lock (already gone or preempted)");
        }
        Ok(())
    }

    /// Release every lock held by `holder` (graceful-shutdown path).
    pub fn release_all_locks(&self, holder: &str) -> StoreResult<u32> {
        let conn = self.lock_conn();
        let deleted = conn.execute(
            "DELETE FROM system_config WHERE value = ?1",
            params![holder],
        )?;
        Ok(deleted as u32)
    }

    /// Duplicate-execution guard: has this `(symbol, side)` pair seen a close
    /// event within the window whose reason matches one of `reasons`?
    pub fn has_recent_close(
        &self,
        symbol: &str,
        side: Side,
        window_secs: i64,
        reasons: &[&str],
    ) -> StoreResult<bool> {
        let conn = self.lock_conn();
        let cutoff = (Utc::now() - Duration::seconds(window_secs)).to_rfc3339();

        let mut stmt = conn.prepare(
            "SELECT close_reason FROM position_close_events
             WHERE symbol = ?1 AND side = ?2 AND created_at >= ?3",
        )?;
        let recent: Vec<String> = stmt
            .query_map(params![symbol, side.to_string(), cutoff], |r| r.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(recent
            .iter()
            .any(|reason| reasons.is_empty() || reasons.iter().any(|m| reason.contains(m))))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::records::CloseEvent;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn acquire_release_cycle() {
        let s = store();
        let key = partial_tp_key("ETH", Side::Long, 1);

        assert!(s.try_acquire_lock(&key, "host:1").unwrap());
        // A different holder is refused while the lease is live.
        assert!(!s.try_acquire_lock(&key, "host:2").unwrap());
        // The owner can refresh.
        assert!(s.try_acquire_lock(&key, "host:1").unwrap());

        s.release_lock(&key, "host:1").unwrap();
        assert!(s.try_acquire_lock(&key, "host:2").unwrap());
    }

    #[test]
    fn release_requires_matching_holder() {
        let s = store();
        let key = reversal_close_key("ETH", Side::Long);
        assert!(s.try_acquire_lock(&key, "host:1").unwrap());

        // Wrong holder cannot release.
        s.release_lock(&key, "host:2").unwrap();
        assert!(!s.try_acquire_lock(&key, "host:2").unwrap());
    }

    #[test]
    fn stale_lock_is_preempted() {
        let s = store();
        let key = partial_tp_key("ETH", Side::Long, 2);
        assert!(s.try_acquire_lock(&key, "host:1").unwrap());

        // Age the lease artificially past 30 s.
        {
            let conn = s.lock_conn();
            let stale = (Utc::now() - Duration::seconds(LOCK_LEASE_SECS + 5)).to_rfc3339();
            conn.execute(
                "UPDATE system_config SET updated_at = ?2 WHERE key = ?1",
                params![key, stale],
            )
            .unwrap();
        }

        assert!(s.try_acquire_lock(&key, "host:2").unwrap());
    }

    #[test]
    fn release_all_for_holder() {
        let s = store();
        assert!(s.try_acquire_lock("a", "host:1").unwrap());
        assert!(s.try_acquire_lock("b", "host:1").unwrap());
        assert!(s.try_acquire_lock("c", "host:2").unwrap());

        assert_eq!(s.release_all_locks("host:1").unwrap(), 2);
        assert!(s.try_acquire_lock("a", "host:3").unwrap());
        assert!(!s.try_acquire_lock("c", "host:3").unwrap());
    }

    #[test]
    fn recent_close_guard_matches_reason() {
        let s = store();
        s.insert_close_event(&CloseEvent {
            id: 0,
            symbol: "ETH".into(),
            side: Side::Long,
            close_reason: "partial_close_stage1".into(),
            trigger_type: "market".into(),
            close_price: 3048.0,
            entry_price: 3000.0,
            quantity: 0.66,
            leverage: 8.0,
            pnl: 31.68,
            pnl_percent: 1.6,
            fee: 0.5,
            position_order_id: "entry-ETH".into(),
            trigger_order_id: None,
            created_at: Utc::now(),
            processed: false,
        })
        .unwrap();

        assert!(s
            .has_recent_close("ETH", Side::Long, 30, &["partial_close", "reversal"])
            .unwrap());
        // A non-matching reason filter sees nothing.
        assert!(!s.has_recent_close("ETH", Side::Long, 30, &["liquidation"]).unwrap());
        // The other side is unaffected.
        assert!(!s
            .has_recent_close("ETH", Side::Short, 30, &["partial_close"])
            .unwrap());
    }

    #[test]
    fn recent_close_guard_respects_window() {
        let s = store();
        let old = Utc::now() - Duration::seconds(120);
        s.insert_close_event(&CloseEvent {
            id: 0,
            symbol: "ETH".into(),
            side: Side::Long,
            close_reason: "partial_close_stage1".into(),
            trigger_type: "market".into(),
            close_price: 3048.0,
            entry_price: 3000.0,
            quantity: 0.66,
            leverage: 8.0,
            pnl: 31.68,
            pnl_percent: 1.6,
            fee: 0.5,
            position_order_id: "entry-ETH".into(),
            trigger_order_id: None,
            created_at: old,
            processed: false,
        })
        .unwrap();

        assert!(!s.has_recent_close("ETH", Side::Long, 30, &["partial_close"]).unwrap());
        assert!(s.has_recent_close("ETH", Side::Long, 300, &["partial_close"]).unwrap());
    }

    #[test]
    fn holder_identity_includes_pid() {
        let id = holder_identity();
        assert!(id.contains(':'));
        assert!(id.ends_with(&std::process::id().to_string()));
    }
}
