use super::{get_opt_ts, ts, PaymentStore, RepairStateRow};
use crate::error::PayResult;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};

impl PaymentStore {
    // ── Pull-repair leases ──────────────────────────────────────────

    /// Take the per-connection repair lease unless someone else holds an
    /// unexpired one. Expired leases are reclaimed.
    pub fn try_acquire_repair_lease(
        &self,
        connection_id: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> PayResult<bool> {
        self.immediate(|| {
            self.conn.execute(
                "DELETE FROM repair_lease WHERE connection_id = ?1 AND expires_at <= ?2",
                params![connection_id, ts(now)],
            )?;
            let inserted = self.conn.execute(
                "INSERT INTO repair_lease (connection_id, holder, acquired_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (connection_id) DO NOTHING",
                params![connection_id, holder, ts(now), ts(now + ttl)],
            )?;
            Ok(inserted == 1)
        })
    }

    pub fn release_repair_lease(&self, connection_id: &str, holder: &str) -> PayResult<()> {
        self.conn.execute(
            "DELETE FROM repair_lease WHERE connection_id = ?1 AND holder = ?2",
            params![connection_id, holder],
        )?;
        Ok(())
    }

    pub fn repair_lease_holder(&self, connection_id: &str) -> PayResult<Option<String>> {
        let holder = self
            .conn
            .query_row(
                "SELECT holder FROM repair_lease WHERE connection_id = ?1",
                params![connection_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(holder)
    }

    // ── Pull-repair backoff state ───────────────────────────────────

    pub fn repair_state(&self, connection_id: &str) -> PayResult<Option<RepairStateRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT connection_id, consecutive_failures, next_attempt_at, last_success_at,
                        last_error
                 FROM connection_repair_state WHERE connection_id = ?1",
                params![connection_id],
                |row| {
                    Ok(RepairStateRow {
                        connection_id: row.get(0)?,
                        consecutive_failures: row.get(1)?,
                        next_attempt_at: get_opt_ts(row, 2)?,
                        last_success_at: get_opt_ts(row, 3)?,
                        last_error: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn record_repair_success(&self, connection_id: &str, at: DateTime<Utc>) -> PayResult<()> {
        self.conn.execute(
            "INSERT INTO connection_repair_state
                 (connection_id, consecutive_failures, next_attempt_at, last_success_at, last_error)
             VALUES (?1, 0, NULL, ?2, NULL)
             ON CONFLICT (connection_id) DO UPDATE SET
                 consecutive_failures = 0,
                 next_attempt_at = NULL,
                 last_success_at = excluded.last_success_at,
                 last_error = NULL",
            params![connection_id, ts(at)],
        )?;
        Ok(())
    }

    /// Count one more consecutive failure and schedule the next attempt.
    /// Returns the new failure count.
    pub fn record_repair_failure(
        &self,
        connection_id: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> PayResult<u32> {
        self.conn.execute(
            "INSERT INTO connection_repair_state
                 (connection_id, consecutive_failures, next_attempt_at, last_error)
             VALUES (?1, 1, ?2, ?3)
             ON CONFLICT (connection_id) DO UPDATE SET
                 consecutive_failures = consecutive_failures + 1,
                 next_attempt_at = excluded.next_attempt_at,
                 last_error = excluded.last_error",
            params![connection_id, ts(next_attempt_at), error],
        )?;
        let failures = self.conn.query_row(
            "SELECT consecutive_failures FROM connection_repair_state WHERE connection_id = ?1",
            params![connection_id],
            |row| row.get(0),
        )?;
        Ok(failures)
    }
}
