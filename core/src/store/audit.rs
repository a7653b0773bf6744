use super::{get_ts, ts, AuditLogEntry, PaymentStore};
use crate::{
    error::PayResult,
    event::{AuditEvent, AuditSink},
};
use chrono::{DateTime, Utc};
use rusqlite::params;

impl PaymentStore {
    // ── Audit trail ─────────────────────────────────────────────────

    pub fn write_audit(&self, at: DateTime<Utc>, event: &AuditEvent) -> PayResult<i64> {
        let payload = serde_json::to_string(event)?;
        self.conn.execute(
            "INSERT INTO audit_log (occurred_at, category, event_type, subject, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                ts(at),
                event.category(),
                event.event_type(),
                event.subject(),
                payload,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Entries in insertion order, optionally filtered by dotted event type.
    pub fn audit_log(&self, event_type: Option<&str>) -> PayResult<Vec<AuditLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, occurred_at, category, event_type, subject, payload
             FROM audit_log
             WHERE ?1 IS NULL OR event_type = ?1
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![event_type], |row| {
                Ok(AuditLogEntry {
                    id: Some(row.get(0)?),
                    occurred_at: get_ts(row, 1)?,
                    category: row.get(2)?,
                    event_type: row.get(3)?,
                    subject: row.get(4)?,
                    payload: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Decoded events of one type, in insertion order.
    pub fn audit_events(&self, event_type: &str) -> PayResult<Vec<AuditEvent>> {
        self.audit_log(Some(event_type))?
            .iter()
            .map(|entry| serde_json::from_str(&entry.payload).map_err(Into::into))
            .collect()
    }
}

impl AuditSink for PaymentStore {
    fn record(&self, at: DateTime<Utc>, event: &AuditEvent) -> PayResult<()> {
        self.write_audit(at, event).map(|_| ())
    }
}
